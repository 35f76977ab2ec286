pub mod connection;
pub mod debug;
pub mod filesystem;
pub mod terminal;
