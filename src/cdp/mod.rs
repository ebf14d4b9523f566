//! Minimal Chrome DevTools Protocol client

pub mod connection;
pub mod transport;
pub mod types;

pub use connection::{wait_for_event, Connection, Session};
pub use transport::{CdpEvent, Transport};
