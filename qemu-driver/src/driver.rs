//! Host-wide QEMU driver.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::configuration::DriverSettings;
use crate::context::QemuContext;
use crate::context::persist::PersistedRecord;
use crate::errors::DriverError;
use crate::log_file::QemuLog;
use crate::network::{HostNetwork, NetworkBackend};
use crate::process;
use crate::types::SandboxInfo;

pub const QEMU_DRIVER_NAME: &str = "qemu";

pub struct QemuDriver {
    executable: PathBuf,
    has_vsock: bool,
    settings: DriverSettings,
    network: Arc<dyn NetworkBackend>,
}

impl std::fmt::Debug for QemuDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QemuDriver")
            .field("executable", &self.executable)
            .field("has_vsock", &self.has_vsock)
            .finish_non_exhaustive()
    }
}

/// Resolve `executable` against `PATH` unless it already names a file.
fn lookup_executable(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 {
        return executable.is_file().then(|| executable.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(executable))
        .find(|candidate| candidate.is_file())
}

impl QemuDriver {
    /// Locate QEMU and probe host capabilities. Returns `None` when the
    /// executable cannot be found.
    pub async fn init(settings: DriverSettings) -> Option<Self> {
        let executable = match lookup_executable(&settings.qemu_executable) {
            Some(path) => path,
            None => {
                warn!(
                    "qemu executable {} not found",
                    settings.qemu_executable.display()
                );
                return None;
            }
        };

        // Best effort: vsock is only offered when the module loads
        let has_vsock = match Command::new("/sbin/modprobe")
            .arg("vhost_vsock")
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                debug!("modprobe vhost_vsock failed: {}", e);
                false
            }
        };

        info!(
            "QemuDriver initialized: executable={}, vsock={}",
            executable.display(),
            has_vsock
        );
        Some(Self::new(executable, has_vsock, settings))
    }

    pub fn new(executable: impl Into<PathBuf>, has_vsock: bool, settings: DriverSettings) -> Self {
        Self {
            executable: executable.into(),
            has_vsock,
            settings,
            network: Arc::new(HostNetwork::new()),
        }
    }

    /// Replace the host networking collaborator.
    pub fn with_network(mut self, network: Arc<dyn NetworkBackend>) -> Self {
        self.network = network;
        self
    }

    pub fn name(&self) -> &'static str {
        QEMU_DRIVER_NAME
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub(crate) fn network(&self) -> &Arc<dyn NetworkBackend> {
        &self.network
    }

    pub fn supports_lazy_mode(&self) -> bool {
        false
    }

    pub fn supports_vm_socket(&self) -> bool {
        self.has_vsock
    }

    /// Context for a freshly created VM.
    pub fn init_context(self: &Arc<Self>, sandbox: SandboxInfo) -> Arc<QemuContext> {
        let log = QemuLog::create(&self.settings.log_dir, &sandbox.id);
        let qmp_sock = sandbox.home_dir.join(crate::context::QMP_SOCK_NAME);
        Arc::new(QemuContext::new(self.clone(), sandbox, qmp_sock, log, None))
    }

    /// Context for a VM whose QEMU survived a control-plane restart.
    ///
    /// The record must carry this driver's tag and well-formed fields, and its
    /// pid must still denote the QEMU serving the recorded socket.
    pub fn load_context(
        self: &Arc<Self>,
        sandbox: SandboxInfo,
        persisted: &Map<String, Value>,
    ) -> Result<Arc<QemuContext>, DriverError> {
        let record = PersistedRecord::parse(persisted)?;

        process::check_alive(record.pid).map_err(|source| DriverError::ProcessGone {
            pid: record.pid,
            source,
        })?;
        if !process::is_same_process(record.pid, &record.qmp_sock) {
            return Err(DriverError::ProcessMismatch {
                pid: record.pid,
                socket: record.qmp_sock,
            });
        }

        info!(
            vm_id = %sandbox.id,
            pid = record.pid,
            "re-attaching to qemu at {}",
            record.qmp_sock.display()
        );
        let log = QemuLog::reopen(record.log);
        Ok(Arc::new(QemuContext::new(
            self.clone(),
            sandbox,
            record.qmp_sock,
            log,
            Some(record.pid as u32),
        )))
    }
}
