use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable key of a request document: hex of the first 16 bytes of the
/// SHA-256 of its trimmed source. The same source always gets the same key,
/// in every task of a job and across jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn for_source(source: &str) -> Self {
        let digest = Sha256::digest(source.trim().as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_surrounding_whitespace() {
        let a = DocumentKey::for_source("reports/acme-10k.pdf");
        let b = DocumentKey::for_source("  reports/acme-10k.pdf\n");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, DocumentKey::for_source("reports/other.pdf"));
    }
}
