//! Certificate revocation records
//!
//! The operator and agent authenticate each other over TLS. The handshake
//! itself happens elsewhere; this module only identifies certificates by a
//! content fingerprint and keeps the set of revoked ones.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use tracing::info;

/// SHA-256 over a certificate's DER encoding
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of an encoded certificate
    #[must_use]
    pub fn of(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, 64 characters
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form produced by [`Fingerprint::to_hex`]
    ///
    /// Returns `None` unless `s` is exactly 64 hex digits.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

/// A certificate that must no longer be trusted
#[derive(Clone, Serialize)]
pub struct RevokedCertificate {
    #[serde(skip)]
    certificate: Bytes,
    fingerprint: Fingerprint,
    reason: String,
}

impl RevokedCertificate {
    /// Record `der` as revoked for `reason`
    pub fn new(der: impl Into<Bytes>, reason: impl Into<String>) -> Self {
        let certificate = der.into();
        let fingerprint = Fingerprint::of(&certificate);
        Self {
            certificate,
            fingerprint,
            reason: reason.into(),
        }
    }

    /// Content hash of the encoded certificate
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Why the certificate was revoked; descriptive only
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The DER-encoded certificate
    #[must_use]
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }
}

impl fmt::Display for RevokedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reason={}", self.reason)
    }
}

impl fmt::Debug for RevokedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevokedCertificate")
            .field("fingerprint", &self.fingerprint)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

/// Append-only set of revoked certificates keyed by fingerprint
///
/// Cheap to clone; clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct RevocationList {
    entries: Arc<DashMap<Fingerprint, Arc<RevokedCertificate>>>,
}

impl RevocationList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a revocation record
    ///
    /// A certificate revoked twice keeps its first record. Returns `true`
    /// if the record was added.
    pub fn revoke(&self, revoked: RevokedCertificate) -> bool {
        let fingerprint = revoked.fingerprint();
        let mut added = false;
        self.entries.entry(fingerprint).or_insert_with(|| {
            added = true;
            Arc::new(revoked)
        });
        if added {
            info!(%fingerprint, "Certificate revoked");
        }
        added
    }

    /// Whether the certificate `der` has been revoked
    #[must_use]
    pub fn is_revoked(&self, der: &[u8]) -> bool {
        self.entries.contains_key(&Fingerprint::of(der))
    }

    /// The record for `fingerprint`, if revoked
    #[must_use]
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<RevokedCertificate>> {
        self.entries.get(fingerprint).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_sha256_of_der() {
        // SHA-256("abc")
        let fp = Fingerprint::of(b"abc");
        assert_eq!(
            fp.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert!(Fingerprint::from_hex("abcd").is_none());
    }

    #[test]
    fn test_revoked_certificate_accessors() {
        let revoked = RevokedCertificate::new(b"cert-der".to_vec(), "key compromise");
        assert_eq!(revoked.reason(), "key compromise");
        assert_eq!(revoked.certificate(), b"cert-der");
        assert_eq!(revoked.fingerprint(), Fingerprint::of(b"cert-der"));
        assert_eq!(revoked.to_string(), "Reason=key compromise");
    }

    #[test]
    fn test_revocation_list_is_append_only() {
        let list = RevocationList::new();
        assert!(list.is_empty());

        assert!(list.revoke(RevokedCertificate::new(b"one".to_vec(), "first")));
        assert!(!list.revoke(RevokedCertificate::new(b"one".to_vec(), "second")));
        assert!(list.revoke(RevokedCertificate::new(b"two".to_vec(), "other")));

        assert_eq!(list.len(), 2);
        assert!(list.is_revoked(b"one"));
        assert!(!list.is_revoked(b"three"));
        let record = list.get(&Fingerprint::of(b"one")).unwrap();
        assert_eq!(record.reason(), "first");
    }

    #[test]
    fn test_serializes_hex_fingerprint() {
        let revoked = RevokedCertificate::new(b"abc".to_vec(), "superseded");
        let json = serde_json::to_value(&revoked).unwrap();
        assert_eq!(json["reason"], "superseded");
        assert_eq!(json["fingerprint"].as_str().unwrap().len(), 64);
        assert!(json.get("certificate").is_none());
    }
}
