use crate::ssh::auth::AuthMethod;
use crate::ssh::client::{SshConnection, SshError};
use crate::ssh::conflict::{ConflictCheck, ConflictTracker};
use crate::ssh::pty::{PtyError, PtyExitReason, PtySession};
use crate::trace::{emit_trace, TraceEvent};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tauri::{AppHandle, Emitter};
use tokio::sync::{mpsc, oneshot};

pub struct ConnectionActorHandle {
    pub tx: mpsc::Sender<ConnectionRequest>,
    pub task: tauri::async_runtime::JoinHandle<()>,
}

pub enum ConnectionRequest {
    GetHomeDir {
        respond_to: oneshot::Sender<Result<String, SshError>>,
    },
    ListDir {
        path: String,
        respond_to: oneshot::Sender<Result<Vec<crate::ssh::sftp::SftpEntry>, SshError>>,
    },
    ReadFileWithStat {
        path: String,
        respond_to: oneshot::Sender<Result<(String, crate::ssh::sftp::SftpStat), SshError>>,
    },
    ReadFile {
        path: String,
        respond_to: oneshot::Sender<Result<String, SshError>>,
    },
    WriteFile {
        path: String,
        content: String,
        force: bool,
        respond_to: oneshot::Sender<Result<crate::ssh::sftp::SftpStat, SshError>>,
    },
    Stat {
        path: String,
        respond_to: oneshot::Sender<Result<crate::ssh::sftp::SftpStat, SshError>>,
    },
    CreateFile {
        path: String,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    CreateDir {
        path: String,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    Delete {
        path: String,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    Rename {
        old_path: String,
        new_path: String,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    CreatePty {
        terminal_id: String,
        cols: u32,
        rows: u32,
        working_dir: Option<String>,
        startup_command: Option<String>,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    ReopenTerminal {
        terminal_id: String,
        cols: u32,
        rows: u32,
        working_dir: Option<String>,
        startup_command: Option<String>,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    WriteTerminal {
        terminal_id: String,
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    ResizeTerminal {
        terminal_id: String,
        cols: u32,
        rows: u32,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    CloseTerminal {
        terminal_id: String,
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    /// Preempts any pending reconnect backoff and forces an immediate attempt.
    /// Also accepted while `Connected`, in which case the live transport is
    /// torn down and a fresh one is dialed right away.
    ManualReconnect {
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<Result<(), SshError>>,
    },
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionStatusEvent {
    connection_id: String,
    status: String,
    detail: Option<String>,
    attempt: Option<u32>,
}

const LIST_DIR_TIMEOUT: Duration = Duration::from_secs(45);
const READ_FILE_TIMEOUT: Duration = Duration::from_secs(60);
const READ_FILE_WITH_STAT_TIMEOUT: Duration = Duration::from_secs(75);
const WRITE_FILE_TIMEOUT: Duration = Duration::from_secs(60);
const STAT_TIMEOUT: Duration = Duration::from_secs(30);
const MUTATION_TIMEOUT: Duration = Duration::from_secs(30);
const PTY_TIMEOUT: Duration = Duration::from_secs(20);

const DIR_CACHE_TTL: Duration = Duration::from_secs(10);
const DIR_CACHE_MAX_ENTRIES: usize = 128;

/// `delay_ms = min(30_000, 300 * 2^min(8, attempt-1))`, per the reconnect policy.
fn backoff_delay(attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let exp = (attempt - 1).min(8);
    let delay_ms = 300u64.saturating_mul(1u64 << exp);
    Duration::from_millis(delay_ms.min(30_000))
}

enum ConnectedExit {
    UserDisconnect,
    MailboxClosed,
    Fatal(String),
}

/// Parameters needed to redial the transport; cloned into the task so the
/// Reconnect Supervisor phase never needs to ask anyone else for them.
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMethod,
}

struct TerminalRecord {
    session: PtySession,
    cols: u32,
    rows: u32,
    working_dir: Option<String>,
    startup_command: Option<String>,
}

pub fn spawn_connection_actor(
    app: AppHandle,
    connection_id: String,
    connection: SshConnection,
    params: ConnectParams,
) -> ConnectionActorHandle {
    let (tx, mut rx) = mpsc::channel::<ConnectionRequest>(64);
    // One-shot-per-terminal transport-closed signal: the PTY reader task uses
    // this to tell the actor a channel died without the actor having asked
    // for it, so loss is detected without an in-flight SFTP request (§4.1).
    let (pty_exit_tx, mut pty_exit_rx) = mpsc::channel::<(String, PtyExitReason)>(64);

    let task = tauri::async_runtime::spawn(async move {
        let mut dir_cache = DirectoryCache::new(DIR_CACHE_TTL, DIR_CACHE_MAX_ENTRIES);
        let mut conflicts = ConflictTracker::new();
        let mut terminals: HashMap<String, TerminalRecord> = HashMap::new();
        let mut connection = connection;

        emit_trace(&app, TraceEvent::new("actor", "loop_start", &format!("Actor loop starting for {}", connection_id)));

        let _ = app.emit(
            "connection_status_changed",
            ConnectionStatusEvent {
                connection_id: connection_id.clone(),
                status: "connected".to_string(),
                detail: None,
                attempt: None,
            },
        );

        let mut final_reason: Option<String> = None;

        'phases: loop {
            let exit = run_connected(
                &app,
                &connection_id,
                &mut connection,
                &mut rx,
                &mut pty_exit_rx,
                &pty_exit_tx,
                &mut dir_cache,
                &mut conflicts,
                &mut terminals,
            )
            .await;

            match exit {
                ConnectedExit::UserDisconnect => {
                    final_reason = Some("User requested disconnect".to_string());
                    break 'phases;
                }
                ConnectedExit::MailboxClosed => {
                    final_reason = Some("Channel closed (all senders dropped)".to_string());
                    break 'phases;
                }
                ConnectedExit::Fatal(reason) => {
                    emit_trace(&app, TraceEvent::new("actor", "transport_lost", &reason).error());

                    // §4.4: only worth reconnecting if something is still
                    // attached. An abandoned connection with no live
                    // terminals goes straight to `disconnected` instead of
                    // looping the backoff forever.
                    if terminals.is_empty() {
                        final_reason = Some(reason);
                        break 'phases;
                    }

                    let _ = app.emit(
                        "connection_status_changed",
                        ConnectionStatusEvent {
                            connection_id: connection_id.clone(),
                            status: "disconnected".to_string(),
                            detail: Some(reason),
                            attempt: None,
                        },
                    );

                    match run_reconnecting(&app, &connection_id, &params, &mut rx).await {
                        ReconnectExit::Reconnected(new_connection) => {
                            connection = new_connection;
                            reopen_all_terminals(
                                &app,
                                &connection_id,
                                &mut connection,
                                &mut terminals,
                                &pty_exit_tx,
                            )
                            .await;
                            let _ = app.emit(
                                "connection_status_changed",
                                ConnectionStatusEvent {
                                    connection_id: connection_id.clone(),
                                    status: "connected".to_string(),
                                    detail: None,
                                    attempt: None,
                                },
                            );
                        }
                        ReconnectExit::GaveUp(reason) => {
                            final_reason = Some(reason);
                            break 'phases;
                        }
                    }
                }
            }
        }

        emit_trace(&app, TraceEvent::new("actor", "loop_exit", &format!("Actor loop exiting: {:?}", final_reason)));

        let _ = app.emit(
            "connection_status_changed",
            ConnectionStatusEvent {
                connection_id,
                status: "disconnected".to_string(),
                detail: final_reason,
                attempt: None,
            },
        );
    });

    ConnectionActorHandle { tx, task }
}

/// Serves requests while the transport is believed healthy. Returns once the
/// mailbox is explicitly told to disconnect, drained of senders, or a fatal
/// transport error is observed.
async fn run_connected(
    app: &AppHandle,
    connection_id: &str,
    connection: &mut SshConnection,
    rx: &mut mpsc::Receiver<ConnectionRequest>,
    pty_exit_rx: &mut mpsc::Receiver<(String, PtyExitReason)>,
    pty_exit_tx: &mpsc::Sender<(String, PtyExitReason)>,
    dir_cache: &mut DirectoryCache,
    conflicts: &mut ConflictTracker,
    terminals: &mut HashMap<String, TerminalRecord>,
) -> ConnectedExit {
    let mut request_count = 0u64;

    loop {
        let request = tokio::select! {
            maybe_request = rx.recv() => match maybe_request {
                Some(request) => request,
                None => return ConnectedExit::MailboxClosed,
            },
            Some((terminal_id, reason)) = pty_exit_rx.recv() => {
                if reason == PtyExitReason::Requested {
                    continue;
                }
                // The reader task stopped without the actor asking it to.
                // A single terminal's remote shell exiting looks identical
                // to the transport dying underneath it, so probe the
                // transport before treating this as fatal (§4.1).
                if terminals.remove(&terminal_id).is_none() {
                    continue;
                }
                emit_trace(
                    app,
                    TraceEvent::new(
                        "actor",
                        "pty_unexpected_close",
                        &format!("Terminal {} closed without request; probing transport", terminal_id),
                    ),
                );
                let probe = with_timeout(STAT_TIMEOUT, connection.get_home_dir()).await;
                let mut probe_fatal = None;
                note_fatal(&probe, &mut probe_fatal);
                if let Some(reason) = probe_fatal {
                    return ConnectedExit::Fatal(reason);
                }
                continue;
            }
        };

        request_count += 1;
        let mut fatal: Option<String> = None;

        match request {
            ConnectionRequest::GetHomeDir { respond_to } => {
                let result = with_timeout(STAT_TIMEOUT, connection.get_home_dir()).await;
                note_fatal(&result, &mut fatal);
                let _ = respond_to.send(result);
            }
            ConnectionRequest::ListDir { path, respond_to } => {
                let cache_key = normalize_dir_path(&path);
                if let Some(cached) = dir_cache.get(&cache_key) {
                    let _ = respond_to.send(Ok(cached));
                    continue;
                }
                let result = with_timeout(LIST_DIR_TIMEOUT, connection.list_dir(&path)).await;
                note_fatal(&result, &mut fatal);
                if let Ok(entries) = &result {
                    dir_cache.put(cache_key, entries.clone());
                }
                let _ = respond_to.send(result);
            }
            ConnectionRequest::ReadFileWithStat { path, respond_to } => {
                let result = with_timeout(
                    READ_FILE_WITH_STAT_TIMEOUT,
                    connection.read_file_with_stat(&path),
                )
                .await;
                note_fatal(&result, &mut fatal);
                if let Ok((_, stat)) = &result {
                    conflicts.remember(&path, stat);
                }
                let _ = respond_to.send(result);
            }
            ConnectionRequest::ReadFile { path, respond_to } => {
                let result = with_timeout(READ_FILE_TIMEOUT, connection.read_file(&path)).await;
                note_fatal(&result, &mut fatal);
                let _ = respond_to.send(result);
            }
            ConnectionRequest::WriteFile {
                path,
                content,
                force,
                respond_to,
            } => {
                let result = write_file_checked(connection, conflicts, &path, &content, force).await;
                note_fatal(&result, &mut fatal);
                if result.is_ok() {
                    dir_cache.invalidate_parent_of_path(&path);
                }
                let _ = respond_to.send(result);
            }
            ConnectionRequest::Stat { path, respond_to } => {
                let result = with_timeout(STAT_TIMEOUT, connection.stat(&path)).await;
                note_fatal(&result, &mut fatal);
                let _ = respond_to.send(result);
            }
            ConnectionRequest::CreateFile { path, respond_to } => {
                let result = with_timeout(MUTATION_TIMEOUT, connection.create_file(&path)).await;
                note_fatal(&result, &mut fatal);
                if result.is_ok() {
                    dir_cache.invalidate_parent_of_path(&path);
                }
                let _ = respond_to.send(result);
            }
            ConnectionRequest::CreateDir { path, respond_to } => {
                let result = with_timeout(MUTATION_TIMEOUT, connection.create_dir(&path)).await;
                note_fatal(&result, &mut fatal);
                if result.is_ok() {
                    dir_cache.invalidate_parent_of_path(&path);
                }
                let _ = respond_to.send(result);
            }
            ConnectionRequest::Delete { path, respond_to } => {
                let result = with_timeout(MUTATION_TIMEOUT, connection.delete(&path)).await;
                note_fatal(&result, &mut fatal);
                if result.is_ok() {
                    conflicts.forget(&path);
                    dir_cache.invalidate_path_and_parent(&path);
                }
                let _ = respond_to.send(result);
            }
            ConnectionRequest::Rename {
                old_path,
                new_path,
                respond_to,
            } => {
                let result =
                    with_timeout(MUTATION_TIMEOUT, connection.rename(&old_path, &new_path)).await;
                note_fatal(&result, &mut fatal);
                if result.is_ok() {
                    conflicts.rename(&old_path, &new_path);
                    dir_cache.invalidate_parent_of_path(&old_path);
                    dir_cache.invalidate_parent_of_path(&new_path);
                }
                let _ = respond_to.send(result);
            }
            ConnectionRequest::CreatePty {
                terminal_id,
                cols,
                rows,
                working_dir,
                startup_command,
                respond_to,
            } => {
                let result = if terminals.contains_key(&terminal_id) {
                    Err(SshError::InvalidArgument(format!(
                        "terminal {} already exists on this connection",
                        terminal_id
                    )))
                } else {
                    create_pty(
                        app,
                        connection_id,
                        connection,
                        terminals,
                        pty_exit_tx,
                        terminal_id,
                        cols,
                        rows,
                        working_dir,
                        startup_command,
                    )
                    .await
                };
                note_fatal(&result, &mut fatal);
                let _ = respond_to.send(result);
            }
            ConnectionRequest::ReopenTerminal {
                terminal_id,
                cols,
                rows,
                working_dir,
                startup_command,
                respond_to,
            } => {
                terminals.remove(&terminal_id);
                let result = create_pty(
                    app,
                    connection_id,
                    connection,
                    terminals,
                    pty_exit_tx,
                    terminal_id,
                    cols,
                    rows,
                    working_dir,
                    startup_command,
                )
                .await;
                note_fatal(&result, &mut fatal);
                let _ = respond_to.send(result);
            }
            ConnectionRequest::WriteTerminal {
                terminal_id,
                data,
                respond_to,
            } => {
                let result = match terminals.get_mut(&terminal_id) {
                    Some(record) => record
                        .session
                        .write(&data)
                        .await
                        .map_err(pty_error_to_ssh_error),
                    None => Err(SshError::TerminalDetached(terminal_id.clone())),
                };
                let _ = respond_to.send(result);
            }
            ConnectionRequest::ResizeTerminal {
                terminal_id,
                cols,
                rows,
                respond_to,
            } => {
                let result = match terminals.get_mut(&terminal_id) {
                    Some(record) => match record.session.resize(cols, rows).await {
                        Ok(()) => {
                            record.cols = cols;
                            record.rows = rows;
                            Ok(())
                        }
                        Err(e) => Err(pty_error_to_ssh_error(e)),
                    },
                    None => Err(SshError::TerminalDetached(terminal_id.clone())),
                };
                let _ = respond_to.send(result);
            }
            ConnectionRequest::CloseTerminal {
                terminal_id,
                respond_to,
            } => {
                let result = match terminals.remove(&terminal_id) {
                    Some(mut record) => record.session.close().await.map_err(pty_error_to_ssh_error),
                    None => Ok(()),
                };
                let _ = respond_to.send(result);
            }
            ConnectionRequest::ManualReconnect { respond_to } => {
                emit_trace(app, TraceEvent::new("actor", "manual_reconnect", "Manual reconnect requested while connected"));
                let _ = connection.disconnect().await;
                let _ = respond_to.send(Err(SshError::TransportDown));
                fatal = Some("Manual reconnect requested".to_string());
            }
            ConnectionRequest::Disconnect { respond_to } => {
                let result = connection.disconnect().await;
                let _ = respond_to.send(result);
                return ConnectedExit::UserDisconnect;
            }
        }

        if let Some(reason) = fatal {
            emit_trace(
                app,
                TraceEvent::new("actor", "breaking", &format!("Breaking due to: {}", reason)).error(),
            );
            return ConnectedExit::Fatal(reason);
        }

        let _ = request_count;
    }
}

enum ReconnectExit {
    Reconnected(SshConnection),
    GaveUp(String),
}

/// Drives the reconnect backoff. While reconnecting, most mailbox requests
/// fail fast with `TransportDown`/`TerminalDetached`; only `ManualReconnect`
/// and `Disconnect` get special handling.
async fn run_reconnecting(
    app: &AppHandle,
    connection_id: &str,
    params: &ConnectParams,
    rx: &mut mpsc::Receiver<ConnectionRequest>,
) -> ReconnectExit {
    let mut attempt: u32 = 1;

    loop {
        let delay = backoff_delay(attempt);
        emit_trace(
            app,
            TraceEvent::new(
                "actor",
                "reconnect_wait",
                &format!("Waiting {:?} before reconnect attempt {}", delay, attempt),
            ),
        );

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        let mut preempted = false;
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                maybe_request = rx.recv() => {
                    match maybe_request {
                        Some(ConnectionRequest::ManualReconnect { respond_to }) => {
                            let _ = respond_to.send(Ok(()));
                            preempted = true;
                            break;
                        }
                        Some(ConnectionRequest::Disconnect { respond_to }) => {
                            let _ = respond_to.send(Ok(()));
                            return ReconnectExit::GaveUp("User requested disconnect".to_string());
                        }
                        Some(other) => fast_fail(other),
                        None => return ReconnectExit::GaveUp("Channel closed (all senders dropped)".to_string()),
                    }
                }
            }
        }
        let _ = preempted;

        emit_trace(
            app,
            TraceEvent::new("actor", "reconnect_attempt", &format!("Reconnect attempt {}", attempt)),
        );

        match SshConnection::connect(&params.host, params.port, &params.username, params.auth.clone(), app)
            .await
        {
            Ok(new_connection) => {
                emit_trace(app, TraceEvent::new("actor", "reconnected", &format!("Reconnected for {}", connection_id)));
                return ReconnectExit::Reconnected(new_connection);
            }
            Err(e) => {
                // §6's event contract only has `connected`/`disconnected`; the
                // single `disconnected` emitted at reconnect entry already
                // covers this phase, so failed attempts stay in the trace
                // log and don't re-emit `connection_status_changed`.
                emit_trace(
                    app,
                    TraceEvent::new("actor", "reconnect_failed", &format!("Reconnect attempt {} failed: {}", attempt, e)).error(),
                );
                attempt += 1;
            }
        }
    }
}

/// Fails a mailbox request immediately while the transport is down (I6).
fn fast_fail(request: ConnectionRequest) {
    match request {
        ConnectionRequest::GetHomeDir { respond_to } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::ListDir { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::ReadFileWithStat { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::ReadFile { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::WriteFile { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::Stat { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::CreateFile { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::CreateDir { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::Delete { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::Rename { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::CreatePty { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::ReopenTerminal { respond_to, .. } => {
            let _ = respond_to.send(Err(SshError::TransportDown));
        }
        ConnectionRequest::WriteTerminal {
            terminal_id,
            respond_to,
            ..
        } => {
            let _ = respond_to.send(Err(SshError::TerminalDetached(terminal_id)));
        }
        ConnectionRequest::ResizeTerminal {
            terminal_id,
            respond_to,
            ..
        } => {
            let _ = respond_to.send(Err(SshError::TerminalDetached(terminal_id)));
        }
        ConnectionRequest::CloseTerminal { respond_to, .. } => {
            let _ = respond_to.send(Ok(()));
        }
        ConnectionRequest::ManualReconnect { respond_to } => {
            let _ = respond_to.send(Ok(()));
        }
        ConnectionRequest::Disconnect { respond_to } => {
            let _ = respond_to.send(Ok(()));
        }
    }
}

async fn reopen_all_terminals(
    app: &AppHandle,
    connection_id: &str,
    connection: &mut SshConnection,
    terminals: &mut HashMap<String, TerminalRecord>,
    pty_exit_tx: &mpsc::Sender<(String, PtyExitReason)>,
) {
    let ids: Vec<String> = terminals.keys().cloned().collect();
    for terminal_id in ids {
        let (cols, rows, working_dir, startup_command) = {
            let record = terminals.get(&terminal_id).unwrap();
            (
                record.cols,
                record.rows,
                record.working_dir.clone(),
                record.startup_command.clone(),
            )
        };
        terminals.remove(&terminal_id);
        if let Err(e) = create_pty(
            app,
            connection_id,
            connection,
            terminals,
            pty_exit_tx,
            terminal_id.clone(),
            cols,
            rows,
            working_dir,
            startup_command,
        )
        .await
        {
            emit_trace(
                app,
                TraceEvent::new(
                    "actor",
                    "reopen_terminal_failed",
                    &format!("Failed to reopen terminal {} after reconnect: {}", terminal_id, e),
                )
                .error(),
            );
        }
    }
}

async fn create_pty(
    app: &AppHandle,
    connection_id: &str,
    connection: &mut SshConnection,
    terminals: &mut HashMap<String, TerminalRecord>,
    pty_exit_tx: &mpsc::Sender<(String, PtyExitReason)>,
    terminal_id: String,
    cols: u32,
    rows: u32,
    working_dir: Option<String>,
    startup_command: Option<String>,
) -> Result<(), SshError> {
    let session_fut = connection.create_pty_session(
        terminal_id.clone(),
        connection_id.to_string(),
        app.clone(),
        cols,
        rows,
        working_dir.clone(),
        startup_command.clone(),
        pty_exit_tx.clone(),
    );
    let session = match tokio::time::timeout(PTY_TIMEOUT, session_fut).await {
        Ok(r) => r?,
        Err(_) => return Err(SshError::ChannelError("PTY request timed out".to_string())),
    };
    terminals.insert(
        terminal_id,
        TerminalRecord {
            session,
            cols,
            rows,
            working_dir,
            startup_command,
        },
    );
    Ok(())
}

/// The three-step write contract from the remote-mtime conflict detection
/// design: stat (missing -> error), compare against what was last observed
/// for this path, then write and remember the new stat. `force` skips step 2.
async fn write_file_checked(
    connection: &mut SshConnection,
    conflicts: &mut ConflictTracker,
    path: &str,
    content: &str,
    force: bool,
) -> Result<crate::ssh::sftp::SftpStat, SshError> {
    if !force {
        match with_timeout(STAT_TIMEOUT, connection.stat(path)).await {
            Ok(current) => {
                if matches!(conflicts.check(path, &current), ConflictCheck::Conflict) {
                    return Err(SshError::Conflict(path.to_string()));
                }
            }
            Err(SshError::PathMissing(_)) => {
                return Err(SshError::WriteTargetMissing(path.to_string()));
            }
            Err(e) => return Err(e),
        }
    }

    with_timeout(WRITE_FILE_TIMEOUT, connection.write_file(path, content)).await?;

    let stat = with_timeout(STAT_TIMEOUT, connection.stat(path)).await?;
    conflicts.remember(path, &stat);
    Ok(stat)
}

async fn with_timeout<T>(
    duration: Duration,
    fut: impl std::future::Future<Output = Result<T, SshError>>,
) -> Result<T, SshError> {
    match tokio::time::timeout(duration, fut).await {
        Ok(r) => r,
        Err(_) => Err(SshError::SftpTimeout),
    }
}

fn note_fatal<T>(result: &Result<T, SshError>, fatal: &mut Option<String>) {
    if let Err(e) = result {
        if is_fatal_connection_error(e) {
            *fatal = Some(e.to_string());
        }
    }
}

fn pty_error_to_ssh_error(error: PtyError) -> SshError {
    match error {
        PtyError::InvalidDimensions { cols, rows } => {
            SshError::InvalidArgument(format!("cols={} rows={}", cols, rows))
        }
        PtyError::Detached => SshError::TerminalDetached("pty task gone".to_string()),
        PtyError::ChannelError(detail) => SshError::ChannelError(detail),
    }
}

fn is_fatal_connection_error(error: &SshError) -> bool {
    match error {
        SshError::DnsLookupFailed { .. } => true,
        SshError::TcpConnectFailed { .. } => true,
        SshError::TcpConnectTimeout { .. } => true,
        SshError::HandshakeFailed { .. } => true,
        SshError::HandshakeJoinAborted { .. } => true,
        SshError::HostKeyUntrusted { .. } => true,
        SshError::HostKeyMismatch { .. } => true,
        SshError::ConnectionFailed(_) => true,
        SshError::AuthenticationFailed(_) => true,
        SshError::SftpUnavailable(_) => true,
        SshError::ChannelError(_) => true,
        SshError::IoError(_) => true,
        // Timeouts and SFTP-level issues may be transient; caller can retry.
        SshError::SftpTimeout
        | SshError::SftpSessionClosed
        | SshError::SftpProtocol(_)
        | SshError::PathMissing(_)
        | SshError::PermissionDenied(_)
        | SshError::TransportDown
        | SshError::TerminalDetached(_)
        | SshError::InvalidArgument(_)
        | SshError::Conflict(_)
        | SshError::WriteTargetMissing(_)
        | SshError::AlreadyExists(_) => false,
    }
}

struct DirectoryCache {
    ttl: Duration,
    max_entries: usize,
    entries: HashMap<String, (Instant, Vec<crate::ssh::sftp::SftpEntry>)>,
}

impl DirectoryCache {
    fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, path: &str) -> Option<Vec<crate::ssh::sftp::SftpEntry>> {
        let now = Instant::now();
        match self.entries.get(path) {
            Some((created_at, entries)) if now.duration_since(*created_at) <= self.ttl => {
                Some(entries.clone())
            }
            Some(_) => {
                self.entries.remove(path);
                None
            }
            None => None,
        }
    }

    fn put(&mut self, path: String, entries: Vec<crate::ssh::sftp::SftpEntry>) {
        self.entries.insert(path, (Instant::now(), entries));
        self.evict_if_needed();
    }

    fn invalidate(&mut self, path: &str) {
        self.entries.remove(path);
    }

    fn invalidate_parent_of_path(&mut self, path: &str) {
        if let Some(parent) = parent_dir(path) {
            self.invalidate(&parent);
        }
    }

    fn invalidate_path_and_parent(&mut self, path: &str) {
        let normalized = normalize_dir_path(path);
        self.invalidate(&normalized);
        self.invalidate_parent_of_path(path);
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.max_entries {
            if let Some((oldest_key, _)) = self
                .entries
                .iter()
                .min_by_key(|(_, (created_at, _))| *created_at)
                .map(|(k, v)| (k.clone(), v.0))
            {
                self.entries.remove(&oldest_key);
            } else {
                break;
            }
        }
    }
}

fn normalize_dir_path(path: &str) -> String {
    if path == "/" {
        return "/".to_string();
    }
    path.trim_end_matches('/').to_string()
}

fn parent_dir(path: &str) -> Option<String> {
    let normalized = normalize_dir_path(path);
    if normalized == "/" {
        return None;
    }
    let mut parts = normalized.split('/').filter(|p| !p.is_empty()).collect::<Vec<_>>();
    parts.pop();
    if parts.is_empty() {
        Some("/".to_string())
    } else {
        Some(format!("/{}", parts.join("/")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(300));
        assert_eq!(backoff_delay(2), Duration::from_millis(600));
        assert_eq!(backoff_delay(3), Duration::from_millis(1200));
        assert_eq!(backoff_delay(9), Duration::from_millis(300 * 256));
        assert_eq!(backoff_delay(10), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(100), Duration::from_millis(30_000));
    }

    #[test]
    fn dir_cache_round_trips_within_ttl() {
        let mut cache = DirectoryCache::new(Duration::from_secs(60), 10);
        cache.put("/tmp".to_string(), vec![]);
        assert!(cache.get("/tmp").is_some());
    }

    #[test]
    fn dir_cache_evicts_oldest_when_over_capacity() {
        let mut cache = DirectoryCache::new(Duration::from_secs(60), 2);
        cache.put("/a".to_string(), vec![]);
        cache.put("/b".to_string(), vec![]);
        cache.put("/c".to_string(), vec![]);
        assert_eq!(cache.entries.len(), 2);
    }

    #[test]
    fn normalize_dir_path_strips_trailing_slash() {
        assert_eq!(normalize_dir_path("/home/user/"), "/home/user");
        assert_eq!(normalize_dir_path("/"), "/");
    }

    #[test]
    fn parent_dir_walks_up_one_level() {
        assert_eq!(parent_dir("/home/user/file.txt"), Some("/home/user".to_string()));
        assert_eq!(parent_dir("/home"), Some("/".to_string()));
        assert_eq!(parent_dir("/"), None);
    }

    #[test]
    fn non_fatal_errors_do_not_trigger_reconnect() {
        assert!(!is_fatal_connection_error(&SshError::SftpTimeout));
        assert!(!is_fatal_connection_error(&SshError::TransportDown));
        assert!(!is_fatal_connection_error(&SshError::Conflict("x".to_string())));
    }

    #[test]
    fn fatal_errors_trigger_reconnect() {
        assert!(is_fatal_connection_error(&SshError::ChannelError("closed".to_string())));
        assert!(is_fatal_connection_error(&SshError::SftpUnavailable("no sftp".to_string())));
    }
}
