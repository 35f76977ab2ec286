#![allow(dead_code)]
use crate::ssh::actor::{ConnectionActorHandle, ConnectionRequest};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Application state holding active connections.
///
/// Terminals are owned by the Connection actor that created them (I2); this
/// state only keeps a `terminal_id -> connection_id` index so that IPC
/// commands taking a bare `termId` can find the right actor mailbox.
pub struct AppState {
    /// Active SSH connections keyed by connection ID
    pub connections: HashMap<String, ConnectionActorHandle>,
    /// Which connection owns each live terminal
    pub terminal_owners: HashMap<String, String>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            terminal_owners: HashMap::new(),
        }
    }

    pub fn add_connection(&mut self, id: String, handle: ConnectionActorHandle) {
        self.connections.insert(id, handle);
    }

    #[allow(dead_code)]
    pub fn get_connection(&self, id: &str) -> Option<&ConnectionActorHandle> {
        self.connections.get(id)
    }

    pub fn get_connection_sender(&self, id: &str) -> Option<mpsc::Sender<ConnectionRequest>> {
        self.connections.get(id).map(|h| h.tx.clone())
    }

    pub fn remove_connection(&mut self, id: &str) -> Option<ConnectionActorHandle> {
        self.terminal_owners.retain(|_, owner| owner != id);
        self.connections.remove(id)
    }

    pub fn register_terminal(&mut self, terminal_id: String, connection_id: String) {
        self.terminal_owners.insert(terminal_id, connection_id);
    }

    pub fn terminal_exists(&self, terminal_id: &str) -> bool {
        self.terminal_owners.contains_key(terminal_id)
    }

    /// Resolve a bare `termId` to the mailbox of the connection that owns it.
    pub fn get_terminal_sender(&self, terminal_id: &str) -> Option<mpsc::Sender<ConnectionRequest>> {
        let connection_id = self.terminal_owners.get(terminal_id)?;
        self.get_connection_sender(connection_id)
    }

    pub fn remove_terminal(&mut self, terminal_id: &str) -> Option<String> {
        self.terminal_owners.remove(terminal_id)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
