//! Keyring capability. Key management itself lives outside the engine; this
//! module only describes how keys are requested and keeps key domains apart.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::path::{Path, PathBuf};

use memory_kernel_provenance_core::{canonical, ProvenanceError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KeyDomain {
    Anchor,
    Ledger,
    Evidence,
}

impl KeyDomain {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anchor => "anchor",
            Self::Ledger => "ledger",
            Self::Evidence => "evidence",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key_id: String,
    pub domain: KeyDomain,
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// # Errors
    /// Returns [`ProvenanceError::Configuration`] for an empty key or key id.
    pub fn new(key_id: &str, domain: KeyDomain, bytes: Vec<u8>) -> Result<Self, ProvenanceError> {
        if key_id.trim().is_empty() || bytes.is_empty() {
            return Err(ProvenanceError::Configuration(format!(
                "{} key MUST have a key id and non-empty material",
                domain.as_str()
            )));
        }
        Ok(Self {
            key_id: key_id.to_string(),
            domain,
            bytes,
        })
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Debug for KeyMaterial {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("key_id", &self.key_id)
            .field("domain", &self.domain)
            .field("bytes", &"<redacted>")
            .finish()
    }
}

pub trait Keyring: Send + Sync {
    /// # Errors
    /// Returns [`ProvenanceError::NotFound`] when the domain has no key.
    fn key(&self, domain: KeyDomain) -> Result<KeyMaterial, ProvenanceError>;
}

/// In-memory keyring for embedding hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyring {
    keys: BTreeMap<KeyDomain, KeyMaterial>,
}

impl StaticKeyring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_key(mut self, key: KeyMaterial) -> Self {
        self.keys.insert(key.domain, key);
        self
    }
}

impl Keyring for StaticKeyring {
    fn key(&self, domain: KeyDomain) -> Result<KeyMaterial, ProvenanceError> {
        self.keys
            .get(&domain)
            .cloned()
            .ok_or_else(|| ProvenanceError::NotFound(format!("no {} key", domain.as_str())))
    }
}

/// Reads `<domain>.key` files holding hex key material.
#[derive(Debug, Clone)]
pub struct FileKeyring {
    dir: PathBuf,
}

impl FileKeyring {
    #[must_use]
    pub fn from_dir(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl Keyring for FileKeyring {
    fn key(&self, domain: KeyDomain) -> Result<KeyMaterial, ProvenanceError> {
        let path = self.dir.join(format!("{}.key", domain.as_str()));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProvenanceError::NotFound(format!(
                    "no {} key at {}",
                    domain.as_str(),
                    path.display()
                )))
            }
            Err(err) => {
                return Err(ProvenanceError::Configuration(format!(
                    "failed to read key file {}: {err}",
                    path.display()
                )))
            }
        };

        let bytes = hex::decode(raw.trim()).map_err(|err| {
            ProvenanceError::Configuration(format!(
                "key file {} is not hex: {err}",
                path.display()
            ))
        })?;
        let fingerprint = canonical::hash_bytes(&bytes);
        KeyMaterial::new(
            &format!("{}:{}", domain.as_str(), &fingerprint[..16]),
            domain,
            bytes,
        )
    }
}

/// Fetches the `wanted` key and checks it shares neither id nor material with
/// any other domain the keyring knows about.
///
/// # Errors
/// Returns [`ProvenanceError::Configuration`] when the key is missing, tagged
/// with the wrong domain, or reused across domains.
pub fn disjoint_key(keyring: &dyn Keyring, wanted: KeyDomain) -> Result<KeyMaterial, ProvenanceError> {
    let key = keyring.key(wanted).map_err(|err| {
        ProvenanceError::Configuration(format!("{} key unavailable: {err}", wanted.as_str()))
    })?;
    if key.domain != wanted {
        return Err(ProvenanceError::Configuration(format!(
            "keyring returned a {} key for the {} domain",
            key.domain.as_str(),
            wanted.as_str()
        )));
    }

    for other in [KeyDomain::Anchor, KeyDomain::Ledger, KeyDomain::Evidence] {
        if other == wanted {
            continue;
        }
        match keyring.key(other) {
            Ok(other_key) => {
                if other_key.key_id == key.key_id || other_key.bytes == key.bytes {
                    return Err(ProvenanceError::Configuration(format!(
                        "{} key MUST be disjoint from the {} key",
                        wanted.as_str(),
                        other.as_str()
                    )));
                }
            }
            Err(ProvenanceError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn disjoint_keys_are_accepted() {
        let keyring = StaticKeyring::new()
            .with_key(must_ok(KeyMaterial::new("anchor-1", KeyDomain::Anchor, vec![1; 32])))
            .with_key(must_ok(KeyMaterial::new("ledger-1", KeyDomain::Ledger, vec![2; 32])));
        let key = must_ok(disjoint_key(&keyring, KeyDomain::Anchor));
        assert_eq!(key.key_id, "anchor-1");
        assert!(format!("{key:?}").contains("<redacted>"));
    }

    #[test]
    fn reused_material_is_rejected() {
        let keyring = StaticKeyring::new()
            .with_key(must_ok(KeyMaterial::new("anchor-1", KeyDomain::Anchor, vec![7; 32])))
            .with_key(must_ok(KeyMaterial::new("evidence-1", KeyDomain::Evidence, vec![7; 32])));
        assert!(matches!(
            disjoint_key(&keyring, KeyDomain::Anchor),
            Err(ProvenanceError::Configuration(_))
        ));
    }

    #[test]
    fn missing_key_is_a_configuration_error() {
        assert!(matches!(
            disjoint_key(&StaticKeyring::new(), KeyDomain::Anchor),
            Err(ProvenanceError::Configuration(_))
        ));
    }

    #[test]
    fn file_keyring_reads_hex_keys() {
        let dir = must_ok(tempfile::tempdir());
        must_ok(std::fs::write(dir.path().join("anchor.key"), format!("{}\n", "ab".repeat(32))));
        let keyring = FileKeyring::from_dir(dir.path());

        let key = must_ok(keyring.key(KeyDomain::Anchor));
        assert_eq!(key.bytes(), vec![0xab; 32].as_slice());
        assert!(key.key_id.starts_with("anchor:"));
        assert!(matches!(
            keyring.key(KeyDomain::Ledger),
            Err(ProvenanceError::NotFound(_))
        ));
    }
}
