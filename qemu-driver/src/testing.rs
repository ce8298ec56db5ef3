//! Test doubles: an in-process QMP server and a host network that never
//! touches the host.

use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::configuration::{DriverSettings, QmpSettings, SupervisorSettings};
use crate::context::{QMP_SOCK_NAME, QemuContext};
use crate::driver::QemuDriver;
use crate::network::NetworkBackend;
use crate::process::is_same_process;
use crate::types::{BootConfig, HostNicResource, SandboxInfo, VmEvent};

/// QMP server on `<dir>/qmp.sock`. Records every command after the
/// capabilities handshake and fails those named in `failing`.
pub(crate) struct FakeQmp {
    pub socket: PathBuf,
    received: Arc<Mutex<Vec<Value>>>,
    task: JoinHandle<()>,
}

impl FakeQmp {
    pub async fn start(dir: &Path, failing: &[&str]) -> Self {
        let socket = dir.join(QMP_SOCK_NAME);
        let listener = UnixListener::bind(&socket).unwrap();
        let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(listener, failing, received.clone()));
        Self {
            socket,
            received,
            task,
        }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.received()
            .iter()
            .map(|c| c["execute"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

impl Drop for FakeQmp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(listener: UnixListener, failing: Vec<String>, received: Arc<Mutex<Vec<Value>>>) {
    while let Ok((stream, _)) = listener.accept().await {
        let (read, mut write) = stream.into_split();
        let greeting = json!({"QMP": {"version": {"qemu": {"major": 8, "minor": 2, "micro": 0}}, "capabilities": []}});
        if write
            .write_all(format!("{}\r\n", greeting).as_bytes())
            .await
            .is_err()
        {
            continue;
        }

        let mut lines = BufReader::new(read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let execute = request["execute"].as_str().unwrap_or_default().to_string();
            let id = request.get("id").cloned().unwrap_or(Value::Null);
            if execute != "qmp_capabilities" {
                received.lock().unwrap().push(request.clone());
            }

            let mut out = String::new();
            if execute == "stop" {
                // Events may precede the reply they relate to
                let event = json!({"event": "STOP", "timestamp": {"seconds": 0, "microseconds": 0}});
                out.push_str(&format!("{}\r\n", event));
            }
            let reply = if failing.contains(&execute) {
                json!({"error": {"class": "GenericError", "desc": format!("{} failed", execute)}, "id": id})
            } else {
                json!({"return": {}, "id": id})
            };
            out.push_str(&format!("{}\r\n", reply));
            if write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    }
}

/// Network backend that hands out `/dev/null` descriptors and counts calls.
#[derive(Debug, Default)]
pub(crate) struct MockNetwork {
    pub fail_acquire: bool,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

#[async_trait]
impl NetworkBackend for MockNetwork {
    async fn acquire_tap(
        &self,
        device: &str,
        _bridge: &str,
        _options: &str,
    ) -> std::io::Result<OwnedFd> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if self.fail_acquire {
            return Err(std::io::Error::other(format!("tap {} unavailable", device)));
        }
        Ok(OwnedFd::from(std::fs::File::open("/dev/null")?))
    }

    async fn acquire_vhost_user_port(
        &self,
        device: &str,
        _bridge: &str,
        home_dir: &Path,
        _options: &str,
    ) -> std::io::Result<PathBuf> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        if self.fail_acquire {
            return Err(std::io::Error::other(format!("port {} unavailable", device)));
        }
        Ok(home_dir.join(device))
    }

    fn release(&self, resource: HostNicResource) {
        self.released.fetch_add(1, Ordering::SeqCst);
        drop(resource);
    }
}

pub(crate) fn test_settings(dir: &Path) -> DriverSettings {
    DriverSettings {
        qemu_executable: PathBuf::from("/bin/false"),
        log_dir: dir.join("logs"),
        qmp: QmpSettings {
            connect_retries: 20,
            retry_interval_ms: 10,
            ..QmpSettings::default()
        },
        supervisor: SupervisorSettings {
            poll_interval_ms: 20,
        },
    }
}

/// Driver plus a sandbox whose home directory is `dir`.
pub(crate) fn test_driver(
    dir: &Path,
    boot: BootConfig,
) -> (Arc<QemuDriver>, SandboxInfo, mpsc::Receiver<VmEvent>) {
    let driver = Arc::new(QemuDriver::new("/bin/false", false, test_settings(dir)));
    let (hub, events) = mpsc::channel(16);
    let sandbox = SandboxInfo {
        id: "vm-test".into(),
        home_dir: dir.to_path_buf(),
        boot,
        hub,
    };
    (driver, sandbox, events)
}

pub(crate) struct TestVm {
    pub ctx: Arc<QemuContext>,
    pub fake: FakeQmp,
    pub network: Arc<MockNetwork>,
    pub _events: mpsc::Receiver<VmEvent>,
    dir: tempfile::TempDir,
}

impl TestVm {
    pub fn home(&self) -> &Path {
        self.dir.path()
    }
}

/// Context talking to a [`FakeQmp`] with only the QMP handler running.
pub(crate) async fn test_vm(boot: BootConfig, failing: &[&str], network: MockNetwork) -> TestVm {
    let dir = tempfile::tempdir().unwrap();
    let fake = FakeQmp::start(dir.path(), failing).await;
    let network = Arc::new(network);

    let driver = Arc::new(
        QemuDriver::new("/bin/false", false, test_settings(dir.path()))
            .with_network(network.clone()),
    );
    let (hub, events) = mpsc::channel(16);
    let ctx = driver.init_context(SandboxInfo {
        id: "vm-test".into(),
        home_dir: dir.path().to_path_buf(),
        boot,
        hub,
    });
    ctx.start_qmp_handler().await.unwrap();

    TestVm {
        ctx,
        fake,
        network,
        _events: events,
        dir,
    }
}

/// A stand-in QEMU whose command line names `qmp_sock`, so it passes the
/// recycled-pid check. Returns only once the new command line is visible in
/// `/proc`.
pub(crate) fn sleeper_for(qmp_sock: &Path) -> std::process::Child {
    let child = std::process::Command::new("sh")
        .arg("-c")
        .arg("sleep 30; true")
        .arg(qmp_sock)
        .spawn()
        .unwrap();

    let pid = child.id() as i32;
    for _ in 0..200 {
        if is_same_process(pid, qmp_sock) {
            return child;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("stand-in qemu {} never showed {} in its cmdline", pid, qmp_sock.display());
}

/// Executable script that records its arguments in `<dir>/qemu.args` and then
/// sleeps, for exercising `launch` without QEMU.
pub(crate) fn fake_qemu(dir: &Path) -> PathBuf {
    let script = dir.join("fake-qemu");
    let args = dir.join("qemu.args");
    std::fs::write(
        &script,
        format!("#!/bin/sh\necho \"$@\" > {}\nexec sleep 30\n", args.display()),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    script
}
