//! Periodic tamper-evidence anchors.
//!
//! An anchor is an HMAC over the ledger head, written into a directory that
//! lives outside the data directory. Rewriting the ledger without the anchor
//! key leaves every existing anchor failing [`AnchorService::check`].

use std::fs;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use memory_kernel_provenance_core::{
    canonical, now_utc, AnchorPolicy, AnchorRecord, LedgerHead, ProvenanceError, SCHEMA_VERSION,
};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::Sha256;
use time::{Duration, OffsetDateTime};

use crate::fsutil::write_atomic;
use crate::keyring::{disjoint_key, KeyDomain, KeyMaterial, Keyring};
use crate::ledger::LedgerReader;

type HmacSha256 = Hmac<Sha256>;

const ANCHOR_PREFIX: &str = "anchor-";
const ANCHOR_SUFFIX: &str = ".json";

struct AnchorState {
    last_sealed_entry_id: u64,
    /// Wall-clock time of the newest anchor, so the minute cadence survives
    /// restarts. Before any anchor exists this is the open time.
    last_sealed_at: OffsetDateTime,
}

pub struct AnchorService {
    dir: PathBuf,
    policy: AnchorPolicy,
    key: KeyMaterial,
    state: Mutex<AnchorState>,
}

impl AnchorService {
    /// Binds the service to `dir` with the anchor-domain key.
    ///
    /// An unreachable directory is tolerated here; it surfaces as
    /// [`ProvenanceError::AnchorUnavailable`] on the first seal.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Configuration`] when the anchor key is
    /// missing or shared with another key domain.
    pub fn open(dir: &Path, policy: AnchorPolicy, keyring: &dyn Keyring) -> Result<Self, ProvenanceError> {
        let key = disjoint_key(keyring, KeyDomain::Anchor)?;

        if let Err(err) = fs::create_dir_all(dir) {
            tracing::warn!(dir = %dir.display(), error = %err, "anchor directory unavailable at open");
        }

        let service = Self {
            dir: dir.to_path_buf(),
            policy,
            key,
            state: Mutex::new(AnchorState {
                last_sealed_entry_id: 0,
                last_sealed_at: now_utc(),
            }),
        };

        match service.latest_readable() {
            Ok(Some(anchor)) => {
                let mut state = service.state.lock();
                state.last_sealed_entry_id = anchor.ledger_head_entry_id;
                state.last_sealed_at = anchor.ts_utc;
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(dir = %dir.display(), error = %err, "could not read prior anchors"),
        }

        Ok(service)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key.key_id
    }

    /// Signs the current ledger head and persists it as the next anchor. The
    /// whole chain must verify first; a broken chain is never signed.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::ChainBreak`] when the chain does not verify,
    /// [`ProvenanceError::Validation`] for an empty ledger and
    /// [`ProvenanceError::AnchorUnavailable`] when the anchor directory cannot
    /// be read or written.
    pub fn seal(&self, ledger: &LedgerReader) -> Result<AnchorRecord, ProvenanceError> {
        let mut state = self.state.lock();
        self.seal_locked(&mut state, ledger)
    }

    /// Seals when `every_entries` entries accumulated since the last anchor,
    /// or when `every_minutes` elapsed and the head moved.
    ///
    /// # Errors
    /// Same as [`AnchorService::seal`].
    pub fn seal_if_due(&self, ledger: &LedgerReader) -> Result<Option<AnchorRecord>, ProvenanceError> {
        let Some(head) = ledger.head()? else {
            return Ok(None);
        };

        let mut state = self.state.lock();
        let pending = head.entry_id.saturating_sub(state.last_sealed_entry_id);
        let interval = Duration::try_from(self.policy.interval()).unwrap_or(Duration::MAX);
        let due = pending >= self.policy.every_entries
            || (pending > 0 && now_utc() - state.last_sealed_at >= interval);
        if !due {
            return Ok(None);
        }
        self.seal_locked(&mut state, ledger).map(Some)
    }

    fn seal_locked(
        &self,
        state: &mut AnchorState,
        ledger: &LedgerReader,
    ) -> Result<AnchorRecord, ProvenanceError> {
        let chain = ledger.verify_to_head()?;
        if !chain.ok {
            let entry_id = chain.first_bad_entry.unwrap_or_default();
            tracing::error!(entry_id, "refusing to anchor a ledger whose chain is broken");
            return Err(ProvenanceError::ChainBreak {
                entry_id,
                details: chain.details.unwrap_or_default(),
            });
        }
        let Some(LedgerHead {
            entry_id,
            entry_hash,
        }) = chain.head
        else {
            return Err(ProvenanceError::Validation(
                "cannot seal an anchor over an empty ledger".to_string(),
            ));
        };

        let anchor_seq = self.sequences()?.last().map_or(1, |seq| seq + 1);
        let ts_utc = now_utc();
        let mut anchor = AnchorRecord {
            anchor_seq,
            ts_utc,
            ledger_head_entry_id: entry_id,
            ledger_head_hash: entry_hash,
            key_id: self.key.key_id.clone(),
            signature: String::new(),
            schema_version: SCHEMA_VERSION,
        };
        anchor.signature = hex::encode(self.mac(&anchor)?.finalize().into_bytes());

        let mut bytes = canonical::encode_serializable(&anchor)?;
        bytes.push(b'\n');
        let path = self.anchor_path(anchor_seq);
        write_atomic(&path, &bytes).map_err(|err| {
            tracing::warn!(path = %path.display(), error = %err, "anchor write failed");
            ProvenanceError::AnchorUnavailable(format!("{}: {err}", path.display()))
        })?;

        state.last_sealed_entry_id = entry_id;
        state.last_sealed_at = ts_utc;
        tracing::info!(
            anchor_seq,
            ledger_head_entry_id = entry_id,
            key_id = %anchor.key_id,
            "anchor sealed"
        );
        Ok(anchor)
    }

    /// Highest-numbered anchor.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::AnchorUnavailable`] when the directory
    /// cannot be listed and [`ProvenanceError::AnchorMismatch`] when that
    /// anchor file is unreadable.
    pub fn latest(&self) -> Result<Option<AnchorRecord>, ProvenanceError> {
        match self.sequences()?.last() {
            Some(seq) => self.get(*seq),
            None => Ok(None),
        }
    }

    /// Newest anchor that still parses; unreadable files are logged and
    /// passed over.
    fn latest_readable(&self) -> Result<Option<AnchorRecord>, ProvenanceError> {
        for seq in self.sequences()?.into_iter().rev() {
            match self.get(seq) {
                Ok(Some(anchor)) => return Ok(Some(anchor)),
                Ok(None) => {}
                Err(ProvenanceError::AnchorMismatch { anchor_seq, details }) => {
                    tracing::error!(anchor_seq, details = %details, "skipping unreadable anchor");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// # Errors
    /// Same as [`AnchorService::latest`].
    pub fn get(&self, anchor_seq: u64) -> Result<Option<AnchorRecord>, ProvenanceError> {
        let path = self.anchor_path(anchor_seq);
        match fs::read(&path) {
            Ok(bytes) => parse_anchor(anchor_seq, &bytes).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(ProvenanceError::AnchorUnavailable(format!(
                "{}: {err}",
                path.display()
            ))),
        }
    }

    /// Every anchor in sequence order.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::AnchorUnavailable`] when the directory
    /// cannot be listed and [`ProvenanceError::AnchorMismatch`] naming the
    /// first unreadable anchor file.
    pub fn list(&self) -> Result<Vec<AnchorRecord>, ProvenanceError> {
        let sequences = self.sequences()?;
        let mut anchors = Vec::with_capacity(sequences.len());
        for seq in sequences {
            if let Some(anchor) = self.get(seq)? {
                anchors.push(anchor);
            }
        }
        Ok(anchors)
    }

    /// Anchor sequence numbers present on disk, from file names alone.
    fn sequences(&self) -> Result<Vec<u64>, ProvenanceError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                return Err(ProvenanceError::AnchorUnavailable(format!(
                    "{}: {err}",
                    self.dir.display()
                )))
            }
        };

        let mut sequences = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| {
                ProvenanceError::AnchorUnavailable(format!("{}: {err}", self.dir.display()))
            })?;
            if let Some(seq) = parse_anchor_file_name(&entry.file_name().to_string_lossy()) {
                sequences.push(seq);
            }
        }
        sequences.sort_unstable();
        Ok(sequences)
    }

    /// Checks the signature, the anchored hash, and that the anchored entry is
    /// still an ancestor of the current head.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::AnchorMismatch`] naming the failed check, or
    /// [`ProvenanceError::Write`] when the ledger cannot be read.
    pub fn check(&self, anchor: &AnchorRecord, ledger: &LedgerReader) -> Result<(), ProvenanceError> {
        let result = self.check_inner(anchor, ledger);
        if let Err(ProvenanceError::AnchorMismatch { anchor_seq, details }) = &result {
            tracing::error!(anchor_seq, details = %details, "anchor verification failed");
        }
        result
    }

    fn check_inner(&self, anchor: &AnchorRecord, ledger: &LedgerReader) -> Result<(), ProvenanceError> {
        let mismatch = |details: &str| ProvenanceError::AnchorMismatch {
            anchor_seq: anchor.anchor_seq,
            details: details.to_string(),
        };

        if anchor.key_id != self.key.key_id {
            return Err(mismatch("anchor was signed with an unknown key"));
        }
        let signature =
            hex::decode(&anchor.signature).map_err(|_| mismatch("signature is not hex"))?;
        self.mac(anchor)?
            .verify_slice(&signature)
            .map_err(|_| mismatch("signature does not recompute"))?;

        let entry = match ledger.entry(anchor.ledger_head_entry_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Err(mismatch("anchored ledger entry no longer exists")),
            Err(ProvenanceError::ChainBreak { details, .. }) => {
                return Err(mismatch(&format!("anchored ledger entry unreadable: {details}")))
            }
            Err(err) => return Err(err),
        };
        if entry.entry_hash != anchor.ledger_head_hash {
            return Err(mismatch("anchored hash differs from the stored entry hash"));
        }
        if !ledger.is_ancestor(&anchor.ledger_head_hash)? {
            return Err(mismatch("anchored entry is not reachable from the current head"));
        }
        Ok(())
    }

    /// `check` collapsed to a boolean for read APIs.
    ///
    /// # Errors
    /// Only I/O failures on the ledger are returned.
    pub fn verify(&self, anchor: &AnchorRecord, ledger: &LedgerReader) -> Result<bool, ProvenanceError> {
        match self.check(anchor, ledger) {
            Ok(()) => Ok(true),
            Err(ProvenanceError::AnchorMismatch { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn mac(&self, anchor: &AnchorRecord) -> Result<HmacSha256, ProvenanceError> {
        let mut value = canonical::to_value(anchor)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        let payload = canonical::encode(&value)?;

        let mut mac = HmacSha256::new_from_slice(self.key.bytes())
            .map_err(|err| ProvenanceError::Configuration(format!("invalid anchor key: {err}")))?;
        mac.update(&payload);
        Ok(mac)
    }

    fn anchor_path(&self, anchor_seq: u64) -> PathBuf {
        self.dir
            .join(format!("{ANCHOR_PREFIX}{anchor_seq:012}{ANCHOR_SUFFIX}"))
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_seal(&self, by: Duration) {
        self.state.lock().last_sealed_at -= by;
    }
}

fn parse_anchor_file_name(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(ANCHOR_PREFIX)?.strip_suffix(ANCHOR_SUFFIX)?;
    if digits.len() != 12 || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn parse_anchor(anchor_seq: u64, bytes: &[u8]) -> Result<AnchorRecord, ProvenanceError> {
    let anchor: AnchorRecord =
        serde_json::from_slice(bytes).map_err(|err| ProvenanceError::AnchorMismatch {
            anchor_seq,
            details: format!("unreadable anchor file: {err}"),
        })?;
    if anchor.anchor_seq != anchor_seq {
        return Err(ProvenanceError::AnchorMismatch {
            anchor_seq,
            details: format!("file holds anchor_seq {}", anchor.anchor_seq),
        });
    }
    Ok(anchor)
}
