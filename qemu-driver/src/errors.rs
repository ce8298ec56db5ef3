use std::path::PathBuf;

use thiserror::Error;

use crate::qmp::QmpError;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid persist info: {0}")]
    InvalidRecord(String),

    #[error("signal 0 on qemu process({pid}) failed: {source}")]
    ProcessGone { pid: i32, source: nix::errno::Errno },

    #[error("can not serialize qemu context: no process running")]
    NoProcess,

    #[error("can't reduce cpus number from {current} to {requested}")]
    InvalidCpuCount { current: u32, requested: u32 },

    #[error("memory size of {size_mb} MiB does not fit in bytes")]
    InvalidMemorySize { size_mb: u64 },

    #[error("QMP error: {0}")]
    Qmp(#[from] QmpError),

    #[error("failed to spawn qemu: {0}")]
    Spawn(std::io::Error),

    #[error("process {pid} is not the qemu serving {}", .socket.display())]
    ProcessMismatch { pid: i32, socket: PathBuf },

    #[error("qemu context already started")]
    AlreadyStarted,

    #[error("session aborted before a result was delivered")]
    SessionAborted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
