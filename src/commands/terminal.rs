use crate::ipc_error::IpcError;
use crate::ssh::actor::ConnectionRequest;
use crate::ssh::client::SshError;
use crate::state::AppState;
use serde_json::json;
use std::sync::Arc;
use tauri::State;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use uuid::Uuid;

fn map_term_error(e: SshError, context: serde_json::Value) -> IpcError {
    IpcError::new(e.ipc_code(), e.to_string())
        .with_raw(e.to_string())
        .with_context(context)
}

/// Create a new terminal session. `term_id` is honored if caller-supplied
/// (duplicate within the connection is refused, I2); otherwise a fresh UUID
/// is generated. `working_dir` and `startup_command` are independent: a
/// `cd` is issued before any startup command if `working_dir` is present.
#[tauri::command]
pub async fn terminal_create(
    state: State<'_, Arc<Mutex<AppState>>>,
    conn_id: String,
    term_id: Option<String>,
    working_dir: Option<String>,
    startup_command: Option<String>,
    initial_cols: u32,
    initial_rows: u32,
) -> Result<String, IpcError> {
    let terminal_id = term_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    let tx = {
        let app_state = state.lock().await;
        app_state
            .get_connection_sender(&conn_id)
            .ok_or_else(|| IpcError::new("connection_not_found", "Connection not found"))?
    };

    let (respond_to, rx) = oneshot::channel();
    tx.send(ConnectionRequest::CreatePty {
        terminal_id: terminal_id.clone(),
        cols: initial_cols,
        rows: initial_rows,
        working_dir: working_dir.clone(),
        startup_command: startup_command.clone(),
        respond_to,
    })
    .await
    .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?;

    rx.await
        .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?
        .map_err(|e| {
            map_term_error(
                e,
                json!({ "terminalId": terminal_id, "workingDir": working_dir }),
            )
        })?;

    let mut app_state = state.lock().await;
    app_state.register_terminal(terminal_id.clone(), conn_id);

    log::info!("Terminal session created: {}", terminal_id);

    Ok(terminal_id)
}

/// Reopen a previously-created terminal under the same `term_id`, e.g. after
/// the frontend restored a session that outlived a prior process. Replays
/// `workingDir`/`startupCommand` exactly as `terminal_create` would.
#[tauri::command]
pub async fn terminal_reopen(
    state: State<'_, Arc<Mutex<AppState>>>,
    conn_id: String,
    term_id: String,
    working_dir: Option<String>,
    startup_command: Option<String>,
    initial_cols: u32,
    initial_rows: u32,
) -> Result<(), IpcError> {
    let tx = {
        let app_state = state.lock().await;
        app_state
            .get_connection_sender(&conn_id)
            .ok_or_else(|| IpcError::new("connection_not_found", "Connection not found"))?
    };

    let (respond_to, rx) = oneshot::channel();
    tx.send(ConnectionRequest::ReopenTerminal {
        terminal_id: term_id.clone(),
        cols: initial_cols,
        rows: initial_rows,
        working_dir: working_dir.clone(),
        startup_command,
        respond_to,
    })
    .await
    .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?;

    rx.await
        .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?
        .map_err(|e| {
            map_term_error(
                e,
                json!({ "terminalId": term_id, "workingDir": working_dir }),
            )
        })?;

    let mut app_state = state.lock().await;
    app_state.register_terminal(term_id.clone(), conn_id);

    log::info!("Terminal session reopened: {}", term_id);

    Ok(())
}

/// Write data to a terminal
#[tauri::command]
pub async fn terminal_write(
    state: State<'_, Arc<Mutex<AppState>>>,
    term_id: String,
    data: Vec<u8>,
) -> Result<(), IpcError> {
    let tx = {
        let app_state = state.lock().await;
        app_state
            .get_terminal_sender(&term_id)
            .ok_or_else(|| IpcError::new("terminal_not_found", "Terminal not found"))?
    };

    let (respond_to, rx) = oneshot::channel();
    tx.send(ConnectionRequest::WriteTerminal {
        terminal_id: term_id.clone(),
        data,
        respond_to,
    })
    .await
    .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?;

    rx.await
        .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?
        .map_err(|e| map_term_error(e, json!({ "terminalId": term_id })))
}

/// Resize a terminal. Rejects degenerate dimensions with `invalid_argument`.
#[tauri::command]
pub async fn terminal_resize(
    state: State<'_, Arc<Mutex<AppState>>>,
    term_id: String,
    cols: u32,
    rows: u32,
) -> Result<(), IpcError> {
    let tx = {
        let app_state = state.lock().await;
        app_state
            .get_terminal_sender(&term_id)
            .ok_or_else(|| IpcError::new("terminal_not_found", "Terminal not found"))?
    };

    let (respond_to, rx) = oneshot::channel();
    tx.send(ConnectionRequest::ResizeTerminal {
        terminal_id: term_id.clone(),
        cols,
        rows,
        respond_to,
    })
    .await
    .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?;

    rx.await
        .map_err(|_| IpcError::new("connection_closed", "Connection is closed"))?
        .map_err(|e| map_term_error(e, json!({ "terminalId": term_id, "cols": cols, "rows": rows })))
}

/// Close a terminal session
#[tauri::command]
pub async fn terminal_close(
    state: State<'_, Arc<Mutex<AppState>>>,
    term_id: String,
) -> Result<(), IpcError> {
    let tx = {
        let mut app_state = state.lock().await;
        let tx = app_state.get_terminal_sender(&term_id);
        app_state.remove_terminal(&term_id);
        tx
    };

    let Some(tx) = tx else {
        return Ok(());
    };

    let (respond_to, rx) = oneshot::channel();
    if tx
        .send(ConnectionRequest::CloseTerminal {
            terminal_id: term_id.clone(),
            respond_to,
        })
        .await
        .is_err()
    {
        // Connection's mailbox is already gone; the terminal is as closed as
        // it'll ever be.
        return Ok(());
    }

    match rx.await {
        Ok(result) => result.map_err(|e| map_term_error(e, json!({ "terminalId": term_id }))),
        Err(_) => Ok(()),
    }?;

    log::info!("Terminal session closed: {}", term_id);
    Ok(())
}
