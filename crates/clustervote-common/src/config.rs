//! Membership configuration: loading the certificate roster and selecting
//! this node's own identity from it.
//!
//! The membership file is a concatenation of PEM `CERTIFICATE` blocks.
//! Order defines an index; a node selects itself by 0-based index. Each
//! member's certificate Subject CommonName is, by convention, also the
//! `host:port` address that [`clustervote-net`]'s connection manager dials
//! peers at.

use std::path::Path;
use tracing::warn;

use crate::error::{ClusterError, Result};
use crate::identity::Identity;

/// The fully resolved membership for this process: our own identity plus
/// every other member's.
pub struct ClusterConfig {
    self_identity: Identity,
    peers: Vec<Identity>,
}

impl ClusterConfig {
    /// Load a certificate bundle from `certs_path`, drop any certificate
    /// that fails to parse or whose self-signature does not verify
    /// (logged, non-fatal), and select `self` as the certificate at
    /// `self_index` among the survivors.
    ///
    /// Fails fatally (`ClusterError::Config`) if the file cannot be read,
    /// contains no valid certificates, or `self_index` is out of range.
    pub fn load(certs_path: &Path, self_index: usize) -> Result<Self> {
        let buf = std::fs::read(certs_path)
            .map_err(|e| ClusterError::Config(format!("failed to open certs file: {e}")))?;

        let identities = Self::parse_roster(&buf);

        if identities.is_empty() {
            return Err(ClusterError::Config(
                "no valid certificates found in membership file".into(),
            ));
        }

        if self_index >= identities.len() {
            return Err(ClusterError::Config(format!(
                "--id {self_index} out of range (roster has {} members)",
                identities.len()
            )));
        }

        let mut identities = identities;
        let self_identity = identities.remove(self_index);

        Ok(Self {
            self_identity,
            peers: identities,
        })
    }

    fn parse_roster(buf: &[u8]) -> Vec<Identity> {
        let mut identities = Vec::new();
        let mut reader = buf;

        loop {
            let item = match rustls_pemfile::read_one(&mut reader) {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    warn!("stopping PEM scan after decode error: {e}");
                    break;
                }
            };

            let der = match item {
                rustls_pemfile::Item::X509Certificate(der) => der,
                _ => continue,
            };

            match Identity::derive(der.as_ref()) {
                Ok(identity) => identities.push(identity),
                Err(e) => warn!("dropping certificate: {e}"),
            }
        }

        identities
    }

    /// This node's own identity.
    pub fn self_identity(&self) -> &Identity {
        &self.self_identity
    }

    /// All other configured members (`members \ {self}`).
    pub fn peers(&self) -> &[Identity] {
        &self.peers
    }

    /// Total membership count `N` (self included).
    pub fn member_count(&self) -> usize {
        self.peers.len() + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_bundle_yields_no_identities() {
        assert!(ClusterConfig::parse_roster(b"").is_empty());
    }

    #[test]
    fn garbage_bundle_yields_no_identities() {
        assert!(ClusterConfig::parse_roster(b"not a pem file at all").is_empty());
    }
}
