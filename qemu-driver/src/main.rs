use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use common::telemtry::{get_subscriber, init_subscriber};
use qemu_driver::configuration::get_configuration;
use qemu_driver::context::persist;
use qemu_driver::types::{BootConfig, SandboxInfo};
use qemu_driver::{QemuContext, QemuDriver};

#[derive(Parser, Debug)]
#[clap(
    name = "qemu-driver",
    about = "Inspect and control QEMU processes managed by the qemu driver",
    rename_all = "kebab-case",
    rename_all_env = "screaming-snake"
)]
pub struct Args {
    /// Log filter used when RUST_LOG is unset
    #[clap(long, env, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Locate QEMU and report host capabilities
    Probe,
    /// Validate a persisted record and check that its QEMU is still alive
    Check(RecordArgs),
    /// Pause the guest
    Pause(RecordArgs),
    /// Resume the guest
    Resume(RecordArgs),
    /// Save the VM state to a file
    Save {
        #[clap(flatten)]
        record: RecordArgs,
        /// Destination of the migration stream
        path: PathBuf,
    },
    /// Ask QEMU to quit, killing it if that fails
    Shutdown(RecordArgs),
}

#[derive(clap::Args, Debug)]
struct RecordArgs {
    /// JSON record written from a context dump
    #[clap(long)]
    record: PathBuf,
}

async fn driver() -> anyhow::Result<Arc<QemuDriver>> {
    let settings = get_configuration().context("Failed to read configuration")?;
    let driver = QemuDriver::init(settings)
        .await
        .context("qemu executable not found")?;
    Ok(Arc::new(driver))
}

/// Load the context described by `record` and attach to its QEMU.
async fn attach(driver: &Arc<QemuDriver>, record: &Path) -> anyhow::Result<Arc<QemuContext>> {
    let persisted = persist::read(record)
        .with_context(|| format!("Failed to read record {}", record.display()))?;
    let parsed = persist::PersistedRecord::parse(&persisted)?;

    let id = record
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vm".into());
    let home_dir = parsed
        .qmp_sock
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let (hub, _) = mpsc::channel(1);
    let sandbox = SandboxInfo {
        id,
        home_dir,
        boot: BootConfig::default(),
        hub,
    };

    let ctx = driver.load_context(sandbox, &persisted)?;
    ctx.associate().await?;
    Ok(ctx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let subscriber = get_subscriber("qemu-driver".into(), args.log_level.clone(), std::io::stdout);
    init_subscriber(subscriber);

    let driver = driver().await?;

    match args.command {
        Cmd::Probe => {
            println!("executable: {}", driver.executable().display());
            println!("vm socket: {}", driver.supports_vm_socket());
            println!("lazy mode: {}", driver.supports_lazy_mode());
        }
        Cmd::Check(RecordArgs { record }) => {
            let persisted = persist::read(&record)?;
            let ctx = driver.load_context(
                SandboxInfo {
                    id: "check".into(),
                    home_dir: PathBuf::new(),
                    boot: BootConfig::default(),
                    hub: mpsc::channel(1).0,
                },
                &persisted,
            )?;
            println!(
                "qemu {} is alive, qmp socket {}",
                ctx.pid().unwrap_or_default(),
                ctx.qmp_sock().display()
            );
            ctx.close().await;
        }
        Cmd::Pause(RecordArgs { record }) => {
            let ctx = attach(&driver, &record).await?;
            let result = ctx.pause(true).await;
            ctx.close().await;
            result?;
            info!("guest paused");
        }
        Cmd::Resume(RecordArgs { record }) => {
            let ctx = attach(&driver, &record).await?;
            let result = ctx.pause(false).await;
            ctx.close().await;
            result?;
            info!("guest resumed");
        }
        Cmd::Save { record, path } => {
            let ctx = attach(&driver, &record.record).await?;
            let result = ctx.save(&path).await;
            ctx.close().await;
            result?;
            info!("vm state saved to {}", path.display());
        }
        Cmd::Shutdown(RecordArgs { record }) => {
            let ctx = attach(&driver, &record).await?;
            ctx.shutdown().await;
            ctx.close().await;
            info!("shutdown requested");
        }
    }

    Ok(())
}
