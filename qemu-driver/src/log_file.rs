//! QEMU output log sink.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{error, warn};

/// Persisted position of a QEMU log file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuLogFile {
    pub name: PathBuf,
    pub offset: i64,
}

/// Open log sink: the persisted position plus the write handle given to the
/// QEMU process.
#[derive(Debug)]
pub struct QemuLog {
    info: QemuLogFile,
    file: Option<File>,
}

impl QemuLog {
    /// Create (truncating) `<dir>/<vm_id>.log`. Failures are logged; the sink
    /// is then left without a handle.
    pub fn create(dir: &Path, vm_id: &str) -> Self {
        let name = dir.join(format!("{}.log", vm_id));
        if let Err(e) = std::fs::create_dir_all(dir) {
            error!("create qemu log dir {} failed: {}", dir.display(), e);
        }
        let file = match File::create(&name) {
            Ok(f) => Some(f),
            Err(e) => {
                error!("create qemu log file {} failed: {}", name.display(), e);
                None
            }
        };
        Self {
            info: QemuLogFile { name, offset: 0 },
            file,
        }
    }

    /// Reopen a sink recorded by a previous control plane.
    pub fn reopen(info: QemuLogFile) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(&info.name) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!("reopen qemu log file {} failed: {}", info.name.display(), e);
                None
            }
        };
        Self { info, file }
    }

    pub fn info(&self) -> &QemuLogFile {
        &self.info
    }

    /// Stdout and stderr handles for a spawned QEMU process.
    pub fn stdio(&self) -> std::io::Result<(Stdio, Stdio)> {
        match &self.file {
            Some(f) => Ok((Stdio::from(f.try_clone()?), Stdio::from(f.try_clone()?))),
            None => Ok((Stdio::null(), Stdio::null())),
        }
    }

    /// Read everything written since the recorded offset and advance it.
    pub async fn tail(&mut self) -> std::io::Result<String> {
        let mut file = tokio::fs::File::open(&self.info.name).await?;
        let len = file.metadata().await?.len() as i64;
        if len < self.info.offset {
            // truncated underneath us
            self.info.offset = 0;
        }
        file.seek(std::io::SeekFrom::Start(self.info.offset as u64))
            .await?;
        let mut buf = Vec::new();
        let read = file.read_to_end(&mut buf).await?;
        self.info.offset += read as i64;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn create_makes_directory_and_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("qemu");
        let log = QemuLog::create(&log_dir, "vm-abc");
        assert!(log.is_open());
        assert_eq!(log.info().name, log_dir.join("vm-abc.log"));
        assert_eq!(log.info().offset, 0);
        assert_eq!(std::fs::metadata(&log.info().name).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn tail_returns_only_new_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = QemuLog::create(dir.path(), "vm-tail");
        let mut writer = OpenOptions::new()
            .append(true)
            .open(&log.info().name)
            .unwrap();

        writer.write_all(b"qemu: booting\n").unwrap();
        assert_eq!(log.tail().await.unwrap(), "qemu: booting\n");
        assert_eq!(log.info().offset, 14);

        writer.write_all(b"qemu: terminating\n").unwrap();
        assert_eq!(log.tail().await.unwrap(), "qemu: terminating\n");
        assert_eq!(log.tail().await.unwrap(), "");
    }

    #[test]
    fn reopen_keeps_recorded_offset() {
        let dir = tempfile::tempdir().unwrap();
        let info = QemuLogFile {
            name: dir.path().join("vm-old.log"),
            offset: 128,
        };
        let mut log = QemuLog::reopen(info.clone());
        assert!(log.is_open());
        assert_eq!(log.info(), &info);
        log.close();
        assert!(!log.is_open());
    }
}
