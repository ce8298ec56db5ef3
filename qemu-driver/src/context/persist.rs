//! Re-attach record of a running QEMU.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::driver::QEMU_DRIVER_NAME;
use crate::errors::DriverError;
use crate::log_file::QemuLogFile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub hypervisor: String,
    #[serde(rename = "qmpSock")]
    pub qmp_sock: PathBuf,
    pub log: QemuLogFile,
    pub pid: i32,
}

fn invalid(message: impl Into<String>) -> DriverError {
    DriverError::InvalidRecord(message.into())
}

impl PersistedRecord {
    /// Validate a record field by field. The driver tag is checked before
    /// anything else is looked at.
    pub fn parse(persisted: &Map<String, Value>) -> Result<Self, DriverError> {
        match persisted.get("hypervisor") {
            Some(Value::String(tag)) if tag == QEMU_DRIVER_NAME => {}
            _ => return Err(invalid("wrong driver type in persist info")),
        }

        let qmp_sock = match persisted.get("qmpSock") {
            None => return Err(invalid("cannot read the qmp socket info from persist info")),
            Some(Value::String(sock)) => PathBuf::from(sock),
            Some(_) => return Err(invalid("wrong sock name type in persist info")),
        };

        let pid = match persisted.get("pid") {
            None => return Err(invalid("cannot read the pid info from persist info")),
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .and_then(|pid| i32::try_from(pid).ok())
                .ok_or_else(|| invalid(format!("pid {} out of range in persist info", n)))?,
            Some(_) => return Err(invalid("wrong pid field type in persist info")),
        };

        let log = match persisted.get("log") {
            None => {
                return Err(invalid(
                    "cannot read the qemu log filename info from persist info",
                ));
            }
            Some(log) => serde_json::from_value::<QemuLogFile>(log.clone()).map_err(|e| {
                invalid(format!(
                    "wrong qemu log filename type in persist info: {}",
                    e
                ))
            })?,
        };

        Ok(Self {
            hypervisor: QEMU_DRIVER_NAME.to_string(),
            qmp_sock,
            log,
            pid,
        })
    }

    pub fn to_map(&self) -> Result<Map<String, Value>, DriverError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(invalid("record did not serialize to an object")),
        }
    }
}

/// Store a dumped record as JSON.
pub fn save(path: &Path, record: &Map<String, Value>) -> Result<(), DriverError> {
    let bytes = serde_json::to_vec_pretty(record)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Read back a record written by [`save`]. Contents are validated on load.
pub fn read(path: &Path) -> Result<Map<String, Value>, DriverError> {
    let bytes = std::fs::read(path)?;
    match serde_json::from_slice(&bytes)? {
        Value::Object(map) => Ok(map),
        _ => Err(invalid(format!("{} does not hold a record", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Map<String, Value> {
        match json!({
            "hypervisor": "qemu",
            "qmpSock": "/run/vm-1/qmp.sock",
            "log": { "name": "/var/log/hyper/qemu/vm-1.log", "offset": 17 },
            "pid": 4242,
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn message(err: DriverError) -> String {
        match err {
            DriverError::InvalidRecord(message) => message,
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn well_formed_record_is_parsed() {
        let parsed = PersistedRecord::parse(&record()).unwrap();
        assert_eq!(parsed.qmp_sock, PathBuf::from("/run/vm-1/qmp.sock"));
        assert_eq!(parsed.log.offset, 17);
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.to_map().unwrap(), record());
    }

    #[test]
    fn wrong_driver_is_rejected_before_other_fields() {
        let mut persisted = Map::new();
        persisted.insert("hypervisor".into(), json!("kvmtool"));
        persisted.insert("pid".into(), json!("garbage"));
        assert_eq!(
            message(PersistedRecord::parse(&persisted).unwrap_err()),
            "wrong driver type in persist info"
        );

        persisted.remove("hypervisor");
        assert!(PersistedRecord::parse(&persisted).is_err());
    }

    #[test]
    fn malformed_fields_are_reported() {
        let mut persisted = record();
        persisted.insert("qmpSock".into(), json!(3));
        assert_eq!(
            message(PersistedRecord::parse(&persisted).unwrap_err()),
            "wrong sock name type in persist info"
        );

        let mut persisted = record();
        persisted.remove("pid");
        assert_eq!(
            message(PersistedRecord::parse(&persisted).unwrap_err()),
            "cannot read the pid info from persist info"
        );

        let mut persisted = record();
        persisted.insert("pid".into(), json!("4242"));
        assert_eq!(
            message(PersistedRecord::parse(&persisted).unwrap_err()),
            "wrong pid field type in persist info"
        );

        let mut persisted = record();
        persisted.insert("log".into(), json!("vm-1.log"));
        assert!(message(PersistedRecord::parse(&persisted).unwrap_err())
            .starts_with("wrong qemu log filename type in persist info"));
    }

    #[test]
    fn float_pids_from_older_records_are_accepted() {
        let mut persisted = record();
        persisted.insert("pid".into(), json!(4242.0));
        assert_eq!(PersistedRecord::parse(&persisted).unwrap().pid, 4242);
    }

    #[test]
    fn record_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vm-1.json");
        save(&path, &record()).unwrap();
        assert_eq!(read(&path).unwrap(), record());

        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(read(&path), Err(DriverError::InvalidRecord(_))));
    }
}
