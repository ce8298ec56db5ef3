use std::io::IoSlice;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Interest};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

use super::{QmpCommand, QmpError};

#[derive(Serialize)]
struct Request<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Map<String, Value>>,
    id: u64,
}

/// One negotiated connection to a QMP socket.
///
/// Replies are correlated to commands through the protocol `id` field;
/// asynchronous events and uncorrelated replies are skipped.
pub struct QmpConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    next_id: u64,
    line: String,
}

impl QmpConnection {
    pub async fn connect(path: &Path) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path).await?;
        Self::negotiate(stream).await
    }

    /// Connect, retrying while the socket is not yet accepting connections.
    pub async fn connect_with_retry(
        path: &Path,
        retries: u32,
        interval: Duration,
    ) -> Result<Self, QmpError> {
        let mut attempt = 0;
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Self::negotiate(stream).await,
                Err(e) if attempt < retries => {
                    attempt += 1;
                    debug!(socket = %path.display(), attempt, "QMP socket not ready: {}", e);
                    tokio::time::sleep(interval).await;
                }
                Err(e) => {
                    warn!(socket = %path.display(), "QMP connect failed: {}", e);
                    return Err(QmpError::ConnectTimeout(path.to_path_buf()));
                }
            }
        }
    }

    async fn negotiate(stream: UnixStream) -> Result<Self, QmpError> {
        let (read, write) = stream.into_split();
        let mut conn = Self {
            reader: BufReader::new(read),
            writer: write,
            next_id: 0,
            line: String::new(),
        };

        let greeting = conn.read_message().await?;
        if greeting.get("QMP").is_none() {
            return Err(QmpError::Handshake(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }
        debug!("QMP greeting: {}", greeting);

        conn.execute(&QmpCommand::new("qmp_capabilities"))
            .await
            .map_err(|e| QmpError::Handshake(e.to_string()))?;
        Ok(conn)
    }

    /// Send one command and wait for its correlated reply.
    pub async fn execute(&mut self, command: &QmpCommand) -> Result<Value, QmpError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut payload = serde_json::to_vec(&Request {
            execute: &command.execute,
            arguments: command.arguments.as_ref(),
            id,
        })?;
        payload.push(b'\n');

        if command.fds.is_empty() {
            self.writer.write_all(&payload).await?;
        } else {
            self.send_with_fds(&payload, &command.fds).await?;
        }

        loop {
            let message = self.read_message().await?;
            if let Some(event) = message.get("event") {
                debug!(event = %event, "QMP event");
                continue;
            }
            if message.get("id").and_then(Value::as_u64) != Some(id) {
                debug!("discarding uncorrelated QMP reply: {}", message);
                continue;
            }
            if let Some(error) = message.get("error") {
                return Err(QmpError::Command {
                    class: error
                        .get("class")
                        .and_then(Value::as_str)
                        .unwrap_or("GenericError")
                        .to_string(),
                    desc: error
                        .get("desc")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
            return Ok(message.get("return").cloned().unwrap_or(Value::Null));
        }
    }

    pub async fn close(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            debug!("QMP connection shutdown: {}", e);
        }
    }

    async fn read_message(&mut self) -> Result<Value, QmpError> {
        loop {
            self.line.clear();
            if self.reader.read_line(&mut self.line).await? == 0 {
                return Err(QmpError::Disconnected);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(serde_json::from_str(trimmed)?);
        }
    }

    /// Write `payload` with `fds` attached as ancillary data. The descriptors
    /// ride on the first chunk only.
    async fn send_with_fds(&mut self, payload: &[u8], fds: &[RawFd]) -> Result<(), QmpError> {
        let written = {
            let stream: &UnixStream = self.writer.as_ref();
            loop {
                stream.writable().await?;
                let sent = stream.try_io(Interest::WRITABLE, || {
                    let iov = [IoSlice::new(payload)];
                    let cmsgs = [ControlMessage::ScmRights(fds)];
                    sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)
                        .map_err(std::io::Error::from)
                });
                match sent {
                    Ok(n) => break n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if written < payload.len() {
            self.writer.write_all(&payload[written..]).await?;
        }
        Ok(())
    }
}
