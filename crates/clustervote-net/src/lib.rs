//! # Clustervote Net
//!
//! TLS transport, wire framing, and the connection manager that together
//! turn the [`clustervote_core::Controller`]'s abstract peer handles into
//! real mutually-authenticated TCP connections.

pub mod connection;
pub mod peer;
pub mod tls;
pub mod wire;

pub use connection::{common_name, ConnectionManager};
pub use tls::TlsMaterial;
