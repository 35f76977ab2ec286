pub mod actor;
pub mod auth;
pub mod client;
pub mod conflict;
pub mod known_hosts;
pub mod pty;
pub mod sftp;
