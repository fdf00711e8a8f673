//! Content-addressed peer identity.
//!
//! An [`Identity`] is derived purely from a certificate's to-be-signed
//! (TBS) region, so it is stable across re-signing and independent of
//! serial number or issue time. Two peers presenting the same certificate
//! are the same peer.

use sha2::{Digest, Sha256};
use std::fmt;
use x509_parser::prelude::*;

use crate::error::{ClusterError, Result};

/// A content-addressed peer identity: the lowercase hex SHA-256 of a
/// certificate's TBS (to-be-signed) body, plus the raw certificate bytes.
#[derive(Clone)]
pub struct Identity {
    id: String,
    certificate: Vec<u8>,
}

impl Identity {
    /// Derive an `Identity` from a DER-encoded X.509 certificate, after
    /// checking that the certificate is self-signed.
    ///
    /// Certificates that fail to parse or whose self-signature does not
    /// verify are rejected with [`ClusterError::Certificate`] — the caller
    /// (configuration loading) is responsible for logging and dropping
    /// these, not treating them as fatal.
    pub fn derive(certificate_der: &[u8]) -> Result<Self> {
        let (_, cert) =
            X509Certificate::from_der(certificate_der).map_err(|e| ClusterError::Certificate {
                reason: format!("parse failure: {e}"),
            })?;

        cert.verify_signature(None).map_err(|e| ClusterError::Certificate {
            reason: format!("bad self-signature: {e}"),
        })?;

        let tbs_raw: &[u8] = cert.tbs_certificate.as_ref();
        let digest = Sha256::digest(tbs_raw);
        let id = hex::encode(digest);

        Ok(Self {
            id,
            certificate: certificate_der.to_vec(),
        })
    }

    /// The 64-hex-char stable identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The raw DER-encoded certificate this identity was derived from.
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity").field("id", &self.id).finish()
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Identity {}

impl std::hash::Hash for Identity {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_der_is_rejected_not_panicking() {
        let err = Identity::derive(b"not a certificate").unwrap_err();
        assert!(matches!(err, ClusterError::Certificate { .. }));
    }
}
