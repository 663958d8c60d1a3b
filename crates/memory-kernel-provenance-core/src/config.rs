use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{canonical, ProvenanceError};

/// Stream carrying evidence seal markers. Always fsynced per entry.
pub const SEAL_STREAM: &str = "evidence.seal";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityTier {
    Critical,
    Bulk,
}

impl DurabilityTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Bulk => "bulk",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct JournalPolicy {
    pub default_tier: DurabilityTier,
    #[serde(default)]
    pub critical_streams: Vec<String>,
    pub bulk_fsync_max_entries: u32,
    pub bulk_fsync_max_interval_ms: u64,
}

impl JournalPolicy {
    #[must_use]
    pub fn tier_for(&self, stream_id: &str) -> DurabilityTier {
        if stream_id == SEAL_STREAM || self.critical_streams.iter().any(|name| name == stream_id) {
            DurabilityTier::Critical
        } else {
            self.default_tier
        }
    }

    #[must_use]
    pub fn bulk_interval(&self) -> Duration {
        Duration::from_millis(self.bulk_fsync_max_interval_ms)
    }
}

/// Seal cadence: every `every_entries` ledger entries or every
/// `every_minutes`, whichever comes first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AnchorPolicy {
    pub every_entries: u64,
    pub every_minutes: u64,
}

impl AnchorPolicy {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.every_minutes.saturating_mul(60))
    }
}

/// The hashed part of the configuration, recorded as `policy_hash` on every
/// ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    pub journal: JournalPolicy,
    pub anchor: AnchorPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    pub write_failure_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub data_dir: PathBuf,
    pub anchor_dir: PathBuf,
    pub policy: PolicyConfig,
    pub health: HealthConfig,
}

impl EngineConfig {
    /// # Errors
    /// Returns [`ProvenanceError::Configuration`] when the JSON is malformed or
    /// fails [`EngineConfig::validate`].
    pub fn from_json(raw: &str) -> Result<Self, ProvenanceError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| ProvenanceError::Configuration(format!("invalid config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Configuration`] when the file cannot be read
    /// or its content is invalid.
    pub fn from_path(path: &Path) -> Result<Self, ProvenanceError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            ProvenanceError::Configuration(format!(
                "failed to read config at {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json(&raw)
    }

    /// # Errors
    /// Returns [`ProvenanceError::Configuration`] for empty paths, overlapping
    /// trust domains, zero cadences, or blank stream names.
    pub fn validate(&self) -> Result<(), ProvenanceError> {
        if self.data_dir.as_os_str().is_empty() || self.anchor_dir.as_os_str().is_empty() {
            return Err(ProvenanceError::Configuration(
                "data_dir and anchor_dir MUST both be set".to_string(),
            ));
        }
        let data_dir = normalize_path(&self.data_dir);
        let anchor_dir = normalize_path(&self.anchor_dir);
        if anchor_dir.starts_with(&data_dir) || data_dir.starts_with(&anchor_dir) {
            return Err(ProvenanceError::Configuration(
                "anchor_dir MUST NOT overlap data_dir; anchors live in a separate trust domain"
                    .to_string(),
            ));
        }

        let journal = &self.policy.journal;
        if journal.bulk_fsync_max_entries == 0 || journal.bulk_fsync_max_interval_ms == 0 {
            return Err(ProvenanceError::Configuration(
                "bulk fsync cadence MUST be positive for both entries and interval".to_string(),
            ));
        }
        if journal
            .critical_streams
            .iter()
            .any(|name| name.trim().is_empty())
        {
            return Err(ProvenanceError::Configuration(
                "critical_streams MUST NOT contain blank names".to_string(),
            ));
        }

        let anchor = &self.policy.anchor;
        if anchor.every_entries == 0 || anchor.every_minutes == 0 {
            return Err(ProvenanceError::Configuration(
                "anchor cadence MUST be positive for both entries and minutes".to_string(),
            ));
        }

        if self.health.write_failure_threshold == 0 {
            return Err(ProvenanceError::Configuration(
                "write_failure_threshold MUST be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// # Errors
    /// Returns [`ProvenanceError::Encoding`] if the policy cannot be canonicalized.
    pub fn policy_hash(&self) -> Result<String, ProvenanceError> {
        Ok(canonical::hash_serializable(&self.policy)?)
    }

    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.data_dir.join("journal.jsonl")
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.jsonl")
    }

    #[must_use]
    pub fn evidence_db_path(&self) -> PathBuf {
        self.data_dir.join("evidence.sqlite3")
    }

    #[must_use]
    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically. Symlinks are
/// not followed; the directories may not exist yet.
fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
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

    fn fixture_json() -> String {
        r#"{
            "data_dir": "/var/lib/mk/data",
            "anchor_dir": "/var/lib/mk-anchor",
            "policy": {
                "journal": {
                    "default_tier": "bulk",
                    "critical_streams": ["capture.audio"],
                    "bulk_fsync_max_entries": 64,
                    "bulk_fsync_max_interval_ms": 250
                },
                "anchor": { "every_entries": 32, "every_minutes": 5 }
            },
            "health": { "write_failure_threshold": 3 }
        }"#
        .to_string()
    }

    #[test]
    fn parses_and_validates_fixture() {
        let config = must_ok(EngineConfig::from_json(&fixture_json()));
        assert_eq!(config.policy.anchor.interval(), Duration::from_secs(300));
        assert_eq!(
            config.policy.journal.tier_for("capture.audio"),
            DurabilityTier::Critical
        );
        assert_eq!(
            config.policy.journal.tier_for("capture.screen"),
            DurabilityTier::Bulk
        );
        assert_eq!(
            config.policy.journal.tier_for(SEAL_STREAM),
            DurabilityTier::Critical
        );
        assert_eq!(config.ledger_path(), PathBuf::from("/var/lib/mk/data/ledger.jsonl"));
    }

    #[test]
    fn overlapping_trust_domains_are_rejected() {
        let raw = fixture_json().replace("/var/lib/mk-anchor", "/var/lib/mk/data/anchors");
        assert!(matches!(
            EngineConfig::from_json(&raw),
            Err(ProvenanceError::Configuration(_))
        ));
    }

    #[test]
    fn overlap_is_detected_through_dot_segments() {
        let raw = fixture_json()
            .replace("/var/lib/mk/data", "/var/lib/mk/y/../data")
            .replace("/var/lib/mk-anchor", "/var/lib/mk/./data/anchors");
        assert!(matches!(
            EngineConfig::from_json(&raw),
            Err(ProvenanceError::Configuration(_))
        ));

        let raw = fixture_json().replace("/var/lib/mk-anchor", "/var/lib/mk/data/../anchors");
        assert!(EngineConfig::from_json(&raw).is_ok());

        let mut relative = must_ok(EngineConfig::from_json(&fixture_json()));
        relative.data_dir = PathBuf::from("state/data");
        relative.anchor_dir = PathBuf::from("./state/data/../data/anchors");
        assert!(relative.validate().is_err());
    }

    #[test]
    fn zero_cadences_are_rejected() {
        let raw = fixture_json().replace("\"every_entries\": 32", "\"every_entries\": 0");
        assert!(EngineConfig::from_json(&raw).is_err());

        let raw = fixture_json().replace(
            "\"bulk_fsync_max_interval_ms\": 250",
            "\"bulk_fsync_max_interval_ms\": 0",
        );
        assert!(EngineConfig::from_json(&raw).is_err());
    }

    #[test]
    fn missing_cadence_has_no_silent_default() {
        let raw = fixture_json().replace("\"every_minutes\": 5", "\"unused\": 5");
        assert!(matches!(
            EngineConfig::from_json(&raw),
            Err(ProvenanceError::Configuration(_))
        ));
    }

    #[test]
    fn policy_hash_tracks_policy_changes() {
        let config = must_ok(EngineConfig::from_json(&fixture_json()));
        let mut changed = config.clone();
        changed.policy.anchor.every_entries = 33;
        assert_ne!(must_ok(config.policy_hash()), must_ok(changed.policy_hash()));

        let mut moved = config.clone();
        moved.data_dir = PathBuf::from("/elsewhere");
        assert_eq!(must_ok(config.policy_hash()), must_ok(moved.policy_hash()));
    }
}
