//! Per-VM driver context.
//!
//! A [`QemuContext`] binds one VM to one QEMU process. It owns two bounded
//! queues: the QMP queue, read only by the QMP handler task, and the watchdog
//! queue, read only by the supervisor task. Every public operation enqueues a
//! session and waits on a private result slot; nothing but those two tasks
//! touches the socket or the process.

mod devices;
pub mod persist;
mod scaling;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::{QEMU_DRIVER_NAME, QemuDriver};
use crate::errors::DriverError;
use crate::log_file::{QemuLog, QemuLogFile};
use crate::process::{self, Supervised, Supervisor, WatchdogSignal};
use crate::qmp::{
    QmpCommand, QmpError, QmpHandlerConfig, QmpInteraction, QmpSession, qmp_handler,
};
use crate::types::{SandboxInfo, VmStats};

pub use devices::rbd_filename;
use persist::PersistedRecord;

pub const QMP_SOCK_NAME: &str = "qmp.sock";
pub const QEMU_PID_FILE: &str = "qemu.pid";

struct Receivers {
    qmp: mpsc::Receiver<QmpInteraction>,
    wdt: mpsc::Receiver<WatchdogSignal>,
}

#[derive(Default)]
struct Tasks {
    handles: Vec<JoinHandle<()>>,
    qmp_done: Option<oneshot::Receiver<()>>,
}

pub struct QemuContext {
    driver: Arc<QemuDriver>,
    sandbox: SandboxInfo,
    qmp_sock: PathBuf,
    pid_file: PathBuf,
    log: Arc<Mutex<QemuLog>>,
    cpus: Arc<AtomicU32>,
    /// Written once by launch/associate (or load), read-only afterwards.
    process: OnceLock<u32>,
    qmp: mpsc::Sender<QmpInteraction>,
    wdt: mpsc::Sender<WatchdogSignal>,
    /// Queue ends handed to the tasks on start; `None` once started.
    receivers: Mutex<Option<Receivers>>,
    closed: RwLock<bool>,
    tasks: Mutex<Tasks>,
}

impl QemuContext {
    pub(crate) fn new(
        driver: Arc<QemuDriver>,
        sandbox: SandboxInfo,
        qmp_sock: PathBuf,
        log: QemuLog,
        pid: Option<u32>,
    ) -> Self {
        let settings = &driver.settings().qmp;
        let (qmp, qmp_rx) = mpsc::channel(settings.queue_capacity);
        let (wdt, wdt_rx) = mpsc::channel(settings.watchdog_capacity);

        let process = OnceLock::new();
        if let Some(pid) = pid {
            let _ = process.set(pid);
        }

        Self {
            pid_file: sandbox.home_dir.join(QEMU_PID_FILE),
            cpus: Arc::new(AtomicU32::new(sandbox.boot.cpus)),
            driver,
            sandbox,
            qmp_sock,
            log: Arc::new(Mutex::new(log)),
            process,
            qmp,
            wdt,
            receivers: Mutex::new(Some(Receivers {
                qmp: qmp_rx,
                wdt: wdt_rx,
            })),
            closed: RwLock::new(false),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    pub fn vm_id(&self) -> &str {
        &self.sandbox.id
    }

    pub fn qmp_sock(&self) -> &Path {
        &self.qmp_sock
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.get().copied()
    }

    pub fn cpus(&self) -> u32 {
        self.cpus.load(Ordering::SeqCst)
    }

    pub async fn log_info(&self) -> QemuLogFile {
        self.log.lock().await.info().clone()
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.read().await
    }

    async fn take_receivers(&self) -> Result<Receivers, DriverError> {
        self.receivers
            .lock()
            .await
            .take()
            .ok_or(DriverError::AlreadyStarted)
    }

    /// Start QEMU with `args`, then hand control to the QMP handler.
    ///
    /// The QMP socket option is added here; everything else about the
    /// machine comes from the caller.
    ///
    /// The queue ends are only handed to the tasks once QEMU is running, so a
    /// failed spawn leaves the context ready for another attempt.
    pub async fn launch(&self, args: Vec<OsString>) -> Result<(), DriverError> {
        let mut unstarted = self.receivers.lock().await;
        if unstarted.is_none() {
            return Err(DriverError::AlreadyStarted);
        }

        // Remove stale socket from a previous run
        if self.qmp_sock.exists() {
            let _ = tokio::fs::remove_file(&self.qmp_sock).await;
        }

        let (stdout, stderr) = self.log.lock().await.stdio().map_err(DriverError::Spawn)?;

        let mut qmp_arg = OsString::from("unix:");
        qmp_arg.push(&self.qmp_sock);
        qmp_arg.push(",server,nowait");

        debug!(vm_id = %self.vm_id(), "spawning {} with {:?}", self.driver.executable().display(), args);
        let child = Command::new(self.driver.executable())
            .arg("-qmp")
            .arg(qmp_arg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(DriverError::Spawn)?;

        let pid = child.id().ok_or_else(|| {
            DriverError::Spawn(std::io::Error::other("qemu exited right after spawn"))
        })?;
        let receivers = unstarted.take().ok_or(DriverError::AlreadyStarted)?;
        drop(unstarted);
        info!(vm_id = %self.vm_id(), pid, "qemu process started");

        if let Err(e) = process::write_pid_file(&self.pid_file, pid) {
            warn!(vm_id = %self.vm_id(), "failed to write pid file: {}", e);
        }
        let _ = self.process.set(pid);

        self.spawn_supervisor(Supervised::Child(child), receivers.wdt)
            .await;
        self.spawn_qmp_handler(receivers.qmp).await;
        Ok(())
    }

    /// Re-attach to an already running QEMU, identified by the recorded pid
    /// or, failing that, the pid file in the VM home directory.
    pub async fn associate(&self) -> Result<(), DriverError> {
        let pid = match self.process.get() {
            Some(pid) => *pid as i32,
            None => process::read_pid_file(&self.pid_file)?,
        };
        process::check_alive(pid).map_err(|source| DriverError::ProcessGone { pid, source })?;
        let _ = self.process.set(pid as u32);

        let receivers = self.take_receivers().await?;
        info!(vm_id = %self.vm_id(), pid, "associated with running qemu");

        self.spawn_supervisor(Supervised::Pid(pid), receivers.wdt)
            .await;
        self.spawn_qmp_handler(receivers.qmp).await;
        Ok(())
    }

    async fn spawn_supervisor(&self, process: Supervised, wdt: mpsc::Receiver<WatchdogSignal>) {
        let supervisor = Supervisor {
            vm_id: self.sandbox.id.clone(),
            poll_interval: self.driver.settings().supervisor.poll_interval(),
            hub: self.sandbox.hub.clone(),
            log: self.log.clone(),
        };
        let handle = tokio::spawn(supervisor.run(process, wdt));
        self.tasks.lock().await.handles.push(handle);
    }

    async fn spawn_qmp_handler(&self, queue: mpsc::Receiver<QmpInteraction>) {
        let settings = &self.driver.settings().qmp;
        let config = QmpHandlerConfig {
            connect_retries: settings.connect_retries,
            retry_interval: settings.retry_interval(),
        };
        let (done_tx, done_rx) = oneshot::channel();
        let handle = tokio::spawn(qmp_handler(
            self.sandbox.id.clone(),
            self.qmp_sock.clone(),
            queue,
            done_tx,
            config,
        ));

        let mut tasks = self.tasks.lock().await;
        tasks.handles.push(handle);
        tasks.qmp_done = Some(done_rx);
    }

    /// Start only the QMP handler against an externally provided socket.
    #[cfg(test)]
    pub(crate) async fn start_qmp_handler(&self) -> Result<(), DriverError> {
        let receivers = self.take_receivers().await?;
        self.spawn_qmp_handler(receivers.qmp).await;
        Ok(())
    }

    /// Enqueue a session. Sending to a closed context is a caller bug: the
    /// session is dropped and its result slot observes the abort.
    pub(crate) async fn qmp_send(&self, session: QmpSession) {
        let closed = self.closed.read().await;
        if *closed {
            error!(vm_id = %self.vm_id(), ?session, "cannot send QMP session to closed sandbox");
            return;
        }
        debug!(vm_id = %self.vm_id(), ?session, "send QMP session");
        if self.qmp.send(QmpInteraction::Session(session)).await.is_err() {
            error!(vm_id = %self.vm_id(), "QMP handler is gone, session dropped");
        }
    }

    /// Run `commands` as one session and wait for its result.
    pub(crate) async fn execute(&self, commands: Vec<QmpCommand>) -> Result<(), DriverError> {
        self.execute_then(commands, |_| {}).await
    }

    /// Like [`execute`](Self::execute), running `hook` on the handler task
    /// before the result is handed back.
    pub(crate) async fn execute_then<F>(
        &self,
        commands: Vec<QmpCommand>,
        hook: F,
    ) -> Result<(), DriverError>
    where
        F: FnOnce(&Result<(), QmpError>) + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.qmp_send(QmpSession::new(commands, move |result| {
            hook(&result);
            let _ = tx.send(result);
        }))
        .await;

        rx.await.map_err(|_| DriverError::SessionAborted)??;
        Ok(())
    }

    /// Ask QEMU to quit. If the request fails the watchdog kills it instead.
    pub async fn shutdown(&self) {
        let wdt = self.wdt.clone();
        let vm_id = self.sandbox.id.clone();
        self.qmp_send(QmpSession::new(
            vec![QmpCommand::new("quit")],
            move |result| {
                if let Err(e) = result {
                    warn!(vm_id = %vm_id, "qmp quit failed, killing qemu: {}", e);
                    let _ = wdt.try_send(WatchdogSignal::Kill);
                }
            },
        ))
        .await;
    }

    /// Force-terminate QEMU through the watchdog, bypassing the QMP queue.
    ///
    /// Not gated on the closed flag: a `close` stuck behind a wedged QMP
    /// queue can still be unblocked by killing QEMU. Calling it after `close`
    /// finished is harmless.
    pub fn kill(&self) {
        match self.wdt.try_send(WatchdogSignal::Kill) {
            Ok(()) => debug!(vm_id = %self.vm_id(), "kill signal sent"),
            Err(TrySendError::Closed(_)) => {
                info!(vm_id = %self.vm_id(), "kill qemu, but channel has already been closed")
            }
            Err(TrySendError::Full(_)) => {
                warn!(vm_id = %self.vm_id(), "watchdog queue full, kill already pending")
            }
        }
    }

    /// Serialize what a restarted control plane needs to re-attach.
    pub async fn dump(&self) -> Result<Map<String, Value>, DriverError> {
        let pid = self.process.get().ok_or(DriverError::NoProcess)?;
        PersistedRecord {
            hypervisor: QEMU_DRIVER_NAME.to_string(),
            qmp_sock: self.qmp_sock.clone(),
            log: self.log_info().await,
            pid: *pid as i32,
        }
        .to_map()
    }

    pub fn stats(&self) -> Result<Option<VmStats>, DriverError> {
        Ok(None)
    }

    /// Tear the context down: stop both tasks and wait for them.
    ///
    /// Sessions already queued are served before the handler sees `Quit`.
    /// Later sends are dropped. Only the first call does anything.
    pub async fn close(&self) {
        {
            let mut closed = self.closed.write().await;
            if *closed {
                debug!(vm_id = %self.vm_id(), "context already closed");
                return;
            }
            *closed = true;
        }

        // Never started: dropping the queues aborts whatever is still queued
        let never_started = self.receivers.lock().await.take().is_some();
        if !never_started {
            if self.qmp.send(QmpInteraction::Quit).await.is_err() {
                debug!(vm_id = %self.vm_id(), "QMP handler already exited");
            }
            if self.wdt.send(WatchdogSignal::Quit).await.is_err() {
                debug!(vm_id = %self.vm_id(), "supervisor already exited");
            }
        }

        let (done, handles) = {
            let mut tasks = self.tasks.lock().await;
            (tasks.qmp_done.take(), std::mem::take(&mut tasks.handles))
        };
        if let Some(done) = done {
            let _ = done.await;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(vm_id = %self.vm_id(), "driver task failed: {}", e);
            }
        }

        self.log.lock().await.close();
        info!(vm_id = %self.vm_id(), "qemu context closed");
    }
}
