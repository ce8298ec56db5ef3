//! QEMU Machine Protocol plumbing.
//!
//! Every VM owns exactly one [`handler::qmp_handler`] task. Callers never touch
//! the control socket directly: they build a [`QmpSession`] (an ordered batch
//! of commands plus a completion callback) and enqueue it as a
//! [`QmpInteraction`]. The handler serves sessions strictly in arrival order
//! over a single connection, so commands of different sessions never
//! interleave on the wire.

mod connection;
mod handler;
pub mod sessions;

use std::fmt;
use std::os::fd::RawFd;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use connection::QmpConnection;
pub(crate) use handler::{QmpHandlerConfig, qmp_handler};

#[derive(Debug, Error)]
pub enum QmpError {
    #[error("QMP IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed QMP message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{class}: {desc}")]
    Command { class: String, desc: String },

    #[error("QMP handshake failed: {0}")]
    Handshake(String),

    #[error("QMP connection closed")]
    Disconnected,

    #[error("QMP socket {0} not available")]
    ConnectTimeout(PathBuf),
}

impl QmpError {
    /// Whether the connection that produced this error can still be used.
    pub fn is_connection_error(&self) -> bool {
        !matches!(self, QmpError::Command { .. })
    }
}

/// A single QMP command as written on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Map<String, Value>>,
    /// Descriptors passed alongside the command as `SCM_RIGHTS` data.
    #[serde(skip)]
    pub fds: Vec<RawFd>,
}

impl QmpCommand {
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
            fds: Vec::new(),
        }
    }

    /// Build a command from a JSON object of arguments. Non-object values are
    /// ignored.
    pub fn with_arguments(execute: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => Some(map),
            _ => None,
        };
        Self {
            execute: execute.into(),
            arguments,
            fds: Vec::new(),
        }
    }

    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fds.push(fd);
        self
    }

    pub fn argument(&self, key: &str) -> Option<&Value> {
        self.arguments.as_ref().and_then(|args| args.get(key))
    }
}

type Respond = Box<dyn FnOnce(Result<(), QmpError>) + Send + 'static>;

/// An ordered batch of commands sharing one completion callback.
///
/// The callback fires exactly once: with the first command error, or with
/// `Ok(())` after the last command was acknowledged. Commands after a failed
/// one are never sent.
pub struct QmpSession {
    pub commands: Vec<QmpCommand>,
    respond: Respond,
}

impl QmpSession {
    pub fn new<F>(commands: Vec<QmpCommand>, respond: F) -> Self
    where
        F: FnOnce(Result<(), QmpError>) + Send + 'static,
    {
        Self {
            commands,
            respond: Box::new(respond),
        }
    }

    pub fn respond(self, result: Result<(), QmpError>) {
        (self.respond)(result)
    }
}

impl fmt::Debug for QmpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.commands.iter().map(|c| c.execute.as_str()).collect();
        f.debug_struct("QmpSession")
            .field("commands", &names)
            .finish_non_exhaustive()
    }
}

/// Payload of the per-VM command queue.
#[derive(Debug)]
pub enum QmpInteraction {
    Session(QmpSession),
    Quit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_serializes_without_empty_arguments() {
        let stop = QmpCommand::new("stop");
        assert_eq!(serde_json::to_value(&stop).unwrap(), json!({"execute": "stop"}));
    }

    #[test]
    fn command_never_serializes_fds() {
        let getfd = QmpCommand::with_arguments("getfd", json!({"fdname": "fdeth0"})).with_fd(7);
        assert_eq!(
            serde_json::to_value(&getfd).unwrap(),
            json!({"execute": "getfd", "arguments": {"fdname": "fdeth0"}})
        );
        assert_eq!(getfd.fds, vec![7]);
    }

    #[test]
    fn command_errors_keep_the_connection() {
        let err = QmpError::Command {
            class: "GenericError".into(),
            desc: "boom".into(),
        };
        assert!(!err.is_connection_error());
        assert!(QmpError::Disconnected.is_connection_error());
    }

    #[test]
    fn session_responds_once_with_the_given_result() {
        let (tx, rx) = std::sync::mpsc::channel();
        let session = QmpSession::new(vec![QmpCommand::new("cont")], move |r| {
            tx.send(r.is_ok()).unwrap();
        });
        session.respond(Ok(()));
        assert!(rx.recv().unwrap());
        assert!(rx.recv().is_err());
    }
}
