//! QEMU process supervision and the watchdog path.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::log_file::QemuLog;
use crate::types::VmEvent;

/// Out-of-band signals handled by the supervisor task, independent of the
/// QMP queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogSignal {
    /// Force-terminate QEMU.
    Kill,
    /// Stop supervising; used by `close`.
    Quit,
}

/// Liveness probe: signal 0 to `pid`.
pub fn check_alive(pid: i32) -> Result<(), Errno> {
    if pid <= 0 {
        return Err(Errno::ESRCH);
    }
    kill(Pid::from_raw(pid), None)
}

/// Whether `pid` is the QEMU serving `qmp_sock`, judged by its command line.
/// Guards against a recycled pid.
pub fn is_same_process(pid: i32, qmp_sock: &Path) -> bool {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read(format!("/proc/{}/cmdline", pid)) {
            Ok(cmdline) => {
                let cmdline = String::from_utf8_lossy(&cmdline);
                cmdline.contains(&*qmp_sock.to_string_lossy())
            }
            Err(_) => false,
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = qmp_sock;
        check_alive(pid).is_ok()
    }
}

pub fn kill_process(pid: i32) -> Result<(), Errno> {
    kill(Pid::from_raw(pid), Signal::SIGKILL)
}

pub(crate) fn read_pid_file(path: &Path) -> std::io::Result<i32> {
    let content = std::fs::read_to_string(path)?;
    content.trim().parse::<i32>().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bad pid file {}: {}", path.display(), e),
        )
    })
}

pub(crate) fn write_pid_file(path: &Path, pid: u32) -> std::io::Result<()> {
    std::fs::write(path, format!("{}\n", pid))
}

/// The process a supervisor watches: our own child after launch, or a bare
/// pid after re-attach.
#[derive(Debug)]
pub(crate) enum Supervised {
    Child(Child),
    Pid(i32),
}

pub(crate) struct Supervisor {
    pub vm_id: String,
    pub poll_interval: Duration,
    pub hub: mpsc::Sender<VmEvent>,
    pub log: Arc<Mutex<QemuLog>>,
}

impl Supervisor {
    /// Wait for QEMU to exit while serving watchdog signals.
    ///
    /// Returns once the process is gone, on `Quit`, or when every watchdog
    /// sender has been dropped. `VmExit` goes to the hub only when the
    /// process actually exited.
    pub async fn run(self, process: Supervised, mut wdt: mpsc::Receiver<WatchdogSignal>) {
        let exited = match process {
            Supervised::Child(child) => self.watch_child(child, &mut wdt).await,
            Supervised::Pid(pid) => self.watch_pid(pid, &mut wdt).await,
        };

        if !exited {
            debug!(vm_id = %self.vm_id, "supervisor stopped, qemu left running");
            return;
        }

        match self.log.lock().await.tail().await {
            Ok(output) if !output.is_empty() => {
                info!(vm_id = %self.vm_id, "qemu output before exit:\n{}", output.trim_end())
            }
            Ok(_) => {}
            Err(e) => debug!(vm_id = %self.vm_id, "cannot read qemu log: {}", e),
        }
        if let Err(e) = self.hub.try_send(VmEvent::VmExit) {
            warn!(vm_id = %self.vm_id, "cannot report qemu exit: {}", e);
        }
    }

    async fn watch_child(&self, mut child: Child, wdt: &mut mpsc::Receiver<WatchdogSignal>) -> bool {
        let mut wdt_open = true;
        loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => info!(vm_id = %self.vm_id, "qemu exited with {}", status),
                        Err(e) => warn!(vm_id = %self.vm_id, "waiting for qemu failed: {}", e),
                    }
                    return true;
                }
                signal = wdt.recv(), if wdt_open => match signal {
                    Some(WatchdogSignal::Kill) => {
                        info!(vm_id = %self.vm_id, "watchdog: killing qemu");
                        if let Err(e) = child.start_kill() {
                            warn!(vm_id = %self.vm_id, "kill qemu failed: {}", e);
                        }
                    }
                    Some(WatchdogSignal::Quit) => return false,
                    None => wdt_open = false,
                },
            }
        }
    }

    async fn watch_pid(&self, pid: i32, wdt: &mut mpsc::Receiver<WatchdogSignal>) -> bool {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = check_alive(pid) {
                        info!(vm_id = %self.vm_id, pid, "qemu is gone: {}", e);
                        return true;
                    }
                }
                signal = wdt.recv() => match signal {
                    Some(WatchdogSignal::Kill) => {
                        info!(vm_id = %self.vm_id, pid, "watchdog: killing qemu");
                        if let Err(e) = kill_process(pid) {
                            warn!(vm_id = %self.vm_id, pid, "kill qemu failed: {}", e);
                        }
                    }
                    Some(WatchdogSignal::Quit) | None => return false,
                },
            }
        }
    }
}
