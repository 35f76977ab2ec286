use russh::{Channel, ChannelMsg};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tauri::{AppHandle, Emitter};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Why a PTY reader/writer task stopped. Fed back to the owning Connection
/// actor so it can tell an actor-initiated teardown (close, reopen) apart
/// from the remote end going away underneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtyExitReason {
    Requested,
    RemoteClosed,
}

/// Escape a path for use in shell commands
fn shell_escape(s: &str) -> String {
    // Wrap in single quotes and escape any single quotes in the string
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("Channel error: {0}")]
    ChannelError(String),
    #[error("Invalid PTY dimensions: {cols}x{rows}")]
    InvalidDimensions { cols: u32, rows: u32 },
    #[error("Terminal is detached")]
    Detached,
}

/// Terminal output event payload
#[derive(Clone, serde::Serialize)]
pub struct TerminalOutputEvent {
    pub terminal_id: String,
    pub data: Vec<u8>,
}

/// Represents an active PTY session. One `PtySession` is owned by exactly one
/// Connection actor; the raw russh `Channel` lives inside the reader/writer
/// task spawned by `new`, never shared.
pub struct PtySession {
    pub terminal_id: String,
    pub connection_id: String,
    cmd_tx: mpsc::Sender<PtyCommand>,
    cached_cols: u32,
    cached_rows: u32,
    requested_close: Arc<AtomicBool>,
}

enum PtyCommand {
    Write(Vec<u8>),
    Resize {
        cols: u32,
        rows: u32,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    Close,
}

impl PtySession {
    /// Create a new PTY session. `cols`/`rows` must be the dimensions the PTY
    /// was actually opened with (the caller has already called `request_pty`).
    pub fn new(
        terminal_id: String,
        connection_id: String,
        mut channel: Channel<russh::client::Msg>,
        app: AppHandle,
        cols: u32,
        rows: u32,
        working_dir: Option<String>,
        startup_command: Option<String>,
        exit_tx: mpsc::Sender<(String, PtyExitReason)>,
    ) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<PtyCommand>(100);
        let requested_close = Arc::new(AtomicBool::new(false));
        let task_requested_close = requested_close.clone();

        let term_id = terminal_id.clone();

        // Spawn a task to own the channel end-to-end: reading PTY output,
        // writing keystrokes, and applying confirmed window-change resizes.
        // (use Tauri's runtime for cross-platform consistency).
        tauri::async_runtime::spawn(async move {
            if working_dir.is_some() || startup_command.is_some() {
                tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            }

            if let Some(dir) = working_dir {
                let line = format!("cd {}\n", shell_escape(&dir));
                if let Err(e) = channel.data(line.as_bytes()).await {
                    log::error!("Failed to send working dir change: {}", e);
                }
            }

            if let Some(cmd) = startup_command {
                let line = format!("{}\n", cmd);
                if let Err(e) = channel.data(line.as_bytes()).await {
                    log::error!("Failed to send startup command: {}", e);
                }
            }

            loop {
                tokio::select! {
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { data }) => {
                                let event = TerminalOutputEvent {
                                    terminal_id: term_id.clone(),
                                    data: data.to_vec(),
                                };
                                if let Err(e) = app.emit("terminal_output", event) {
                                    log::error!("Failed to emit terminal output: {}", e);
                                }
                            }
                            Some(ChannelMsg::ExtendedData { data, .. }) => {
                                let event = TerminalOutputEvent {
                                    terminal_id: term_id.clone(),
                                    data: data.to_vec(),
                                };
                                if let Err(e) = app.emit("terminal_output", event) {
                                    log::error!("Failed to emit terminal output: {}", e);
                                }
                            }
                            Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                                log::info!("PTY channel closed: {}", term_id);
                                break;
                            }
                            None => {
                                log::info!("PTY channel stream ended: {}", term_id);
                                break;
                            }
                            _ => {}
                        }
                    }
                    cmd = cmd_rx.recv() => {
                        match cmd {
                            Some(PtyCommand::Write(data)) => {
                                if let Err(e) = channel.data(data.as_slice()).await {
                                    log::error!("Error writing to PTY: {}", e);
                                    break;
                                }
                            }
                            Some(PtyCommand::Resize { cols, rows, respond_to }) => {
                                let result = channel
                                    .window_change(cols, rows, 0, 0)
                                    .await
                                    .map_err(|e| PtyError::ChannelError(e.to_string()));
                                let _ = respond_to.send(result);
                            }
                            Some(PtyCommand::Close) | None => {
                                task_requested_close.store(true, Ordering::SeqCst);
                                let _ = channel.close().await;
                                break;
                            }
                        }
                    },
                }
            }

            let reason = if task_requested_close.load(Ordering::SeqCst) {
                PtyExitReason::Requested
            } else {
                PtyExitReason::RemoteClosed
            };
            let _ = exit_tx.send((term_id.clone(), reason)).await;

            let _ = app.emit(
                "terminal_closed",
                TerminalClosedEvent {
                    terminal_id: term_id,
                },
            );
        });

        Self {
            terminal_id,
            connection_id,
            cmd_tx,
            cached_cols: cols,
            cached_rows: rows,
            requested_close,
        }
    }

    /// Write data to the PTY
    pub async fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        self.cmd_tx
            .send(PtyCommand::Write(data.to_vec()))
            .await
            .map_err(|_| PtyError::Detached)?;
        Ok(())
    }

    /// Resize the PTY. Rejects degenerate dimensions without touching the
    /// channel; only updates the cached dimensions once the server has
    /// confirmed the window-change request.
    pub async fn resize(&mut self, cols: u32, rows: u32) -> Result<(), PtyError> {
        if cols < 2 || rows < 1 {
            return Err(PtyError::InvalidDimensions { cols, rows });
        }

        let (respond_to, response) = oneshot::channel();
        self.cmd_tx
            .send(PtyCommand::Resize {
                cols,
                rows,
                respond_to,
            })
            .await
            .map_err(|_| PtyError::Detached)?;

        response.await.map_err(|_| PtyError::Detached)??;

        self.cached_cols = cols;
        self.cached_rows = rows;
        Ok(())
    }

    pub fn cached_dimensions(&self) -> (u32, u32) {
        (self.cached_cols, self.cached_rows)
    }

    /// Close the PTY session
    pub async fn close(&mut self) -> Result<(), PtyError> {
        self.requested_close.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(PtyCommand::Close).await;
        Ok(())
    }
}

impl Drop for PtySession {
    /// Dropping a `PtySession` without calling `close` first (e.g. the actor
    /// discarding the record to reopen the terminal) is still an actor-driven
    /// teardown, not the remote end going away. Mark it so a stray exit
    /// notification racing the reader task's shutdown isn't mistaken for a
    /// transport loss.
    fn drop(&mut self) {
        self.requested_close.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct TerminalClosedEvent {
    terminal_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_escape_wraps_in_single_quotes() {
        assert_eq!(shell_escape("/home/user"), "'/home/user'");
    }

    #[test]
    fn shell_escape_handles_embedded_quotes() {
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }

    #[test]
    fn exit_reason_distinguishes_requested_from_remote() {
        assert_ne!(PtyExitReason::Requested, PtyExitReason::RemoteClosed);
    }
}
