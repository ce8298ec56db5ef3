use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{QmpCommand, QmpConnection, QmpError, QmpInteraction};

#[derive(Debug, Clone)]
pub(crate) struct QmpHandlerConfig {
    pub connect_retries: u32,
    pub retry_interval: Duration,
}

/// Main loop of the per-VM QMP task.
///
/// Sessions are served one at a time in queue order. The connection is opened
/// lazily and reused; once it has been lost, each later session gets a single
/// reconnect attempt so callers fail fast instead of stalling. The loop ends on
/// [`QmpInteraction::Quit`] or when every sender is gone, and `done` is
/// signalled on the way out.
pub(crate) async fn qmp_handler(
    vm_id: String,
    socket: PathBuf,
    mut queue: mpsc::Receiver<QmpInteraction>,
    done: oneshot::Sender<()>,
    config: QmpHandlerConfig,
) {
    info!(vm_id = %vm_id, socket = %socket.display(), "QMP handler started");

    let mut conn: Option<QmpConnection> = None;
    let mut connected_once = false;

    while let Some(interaction) = queue.recv().await {
        let session = match interaction {
            QmpInteraction::Quit => {
                info!(vm_id = %vm_id, "QMP handler received quit");
                break;
            }
            QmpInteraction::Session(session) => session,
        };
        debug!(vm_id = %vm_id, ?session, "QMP session dequeued");

        if conn.is_none() {
            let retries = if connected_once {
                0
            } else {
                config.connect_retries
            };
            match QmpConnection::connect_with_retry(&socket, retries, config.retry_interval).await
            {
                Ok(c) => {
                    connected_once = true;
                    conn = Some(c);
                }
                Err(e) => {
                    warn!(vm_id = %vm_id, "QMP connection unavailable: {}", e);
                    session.respond(Err(e));
                    continue;
                }
            }
        }
        let Some(c) = conn.as_mut() else {
            session.respond(Err(QmpError::Disconnected));
            continue;
        };

        let result = run_commands(&vm_id, c, &session.commands).await;
        if let Err(e) = &result
            && e.is_connection_error()
        {
            warn!(vm_id = %vm_id, "QMP connection lost: {}", e);
            conn = None;
        }
        debug!(vm_id = %vm_id, ok = result.is_ok(), "QMP session complete");
        session.respond(result);
    }

    if let Some(c) = conn.take() {
        c.close().await;
    }
    info!(vm_id = %vm_id, "QMP handler exited");
    let _ = done.send(());
}

async fn run_commands(
    vm_id: &str,
    conn: &mut QmpConnection,
    commands: &[QmpCommand],
) -> Result<(), QmpError> {
    for command in commands {
        if let Err(e) = conn.execute(command).await {
            warn!(vm_id = %vm_id, command = %command.execute, "QMP command failed: {}", e);
            return Err(e);
        }
    }
    Ok(())
}
