//! # Clustervote Common
//!
//! Shared identity, error, configuration, and quorum-math primitives for
//! the clustervote leader-election cluster.
//!
//! ## Core Types
//!
//! - [`Identity`]: content-addressed peer id, `sha256(certificate.tbs)`
//! - [`ClusterConfig`]: membership roster loaded from a PEM certificate bundle
//! - [`ClusterError`]: unified error taxonomy
//! - [`quorum::threshold`]: strict-majority quorum math

pub mod config;
pub mod error;
pub mod identity;
pub mod quorum;

pub use config::ClusterConfig;
pub use error::{ClusterError, Result};
pub use identity::Identity;
