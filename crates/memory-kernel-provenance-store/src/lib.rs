//! Durable side of the evidence and provenance engine: journal, hash-chained
//! ledger, evidence store, anchors, startup reconciliation and citation
//! resolution, wired together by [`ProvenanceEngine`].

#![allow(clippy::module_name_repetitions)]

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use memory_kernel_provenance_core::{
    AnchorRecord, Citation, DerivationEdge, DerivedRecord, EngineConfig, EvidenceRecord,
    JournalKind, LedgerEntry, LedgerStage, ProvenanceError, RecordReceipt, Resolution, RunId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub mod anchor;
pub mod citation;
pub mod evidence;
mod fsutil;
pub mod journal;
pub mod keyring;
pub mod ledger;
pub mod reconcile;

pub use anchor::AnchorService;
pub use citation::CitationResolver;
pub use evidence::{
    EvidenceCatalog, EvidenceStore, QuarantinedRecord, RecordBody, RecordSource, SealMarker,
    StoreCounts, StoredRecord,
};
pub use journal::{read_journal, JournalWriter};
pub use keyring::{FileKeyring, KeyDomain, KeyMaterial, Keyring, StaticKeyring};
pub use ledger::{ChainReport, LedgerReader, LedgerWriter, Transition};
pub use reconcile::{QuarantinedWrite, ReconcileState, Reconciler, RecoveryReport, StateTransition};

use crate::fsutil::io_write_error;

/// Journal stream for engine start/stop notes.
pub const LIFECYCLE_STREAM: &str = "engine.lifecycle";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct Health {
    pub consecutive_write_failures: u32,
    pub degraded: bool,
    pub anchor_unavailable: bool,
    /// First bad ledger entry once the chain failed verification. Anchoring
    /// stays suspended for the rest of the run.
    pub chain_break_at: Option<u64>,
}

struct HealthMonitor {
    threshold: u32,
    state: Mutex<Health>,
}

impl HealthMonitor {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            state: Mutex::new(Health::default()),
        }
    }

    fn snapshot(&self) -> Health {
        *self.state.lock()
    }

    /// Counts consecutive durability failures; caller-local errors pass through
    /// without touching the counter.
    fn observe<T>(&self, result: Result<T, ProvenanceError>) -> Result<T, ProvenanceError> {
        let mut health = self.state.lock();
        match &result {
            Ok(_) => {
                if health.degraded {
                    tracing::info!("write path recovered; health restored");
                }
                health.consecutive_write_failures = 0;
                health.degraded = false;
            }
            Err(err) if err.is_write_failure() => {
                health.consecutive_write_failures = health.consecutive_write_failures.saturating_add(1);
                if !health.degraded && health.consecutive_write_failures >= self.threshold {
                    health.degraded = true;
                    tracing::error!(
                        consecutive_write_failures = health.consecutive_write_failures,
                        error = %err,
                        "engine degraded after repeated write failures"
                    );
                }
            }
            Err(_) => {}
        }
        result
    }

    fn set_anchor_unavailable(&self, unavailable: bool) {
        self.state.lock().anchor_unavailable = unavailable;
    }

    fn flag_chain_break(&self, entry_id: u64, details: &str) {
        let mut health = self.state.lock();
        if health.chain_break_at.is_none() {
            tracing::error!(
                first_bad_entry = entry_id,
                details = %details,
                "ledger chain broken; anchoring suspended until it is repaired"
            );
            health.chain_break_at = Some(entry_id);
        }
    }
}

/// One running instance of the engine. Every method takes `&self`; share it
/// across producer threads behind an `Arc`.
pub struct ProvenanceEngine {
    config: EngineConfig,
    journal: Arc<JournalWriter>,
    ledger: Arc<LedgerWriter>,
    store: EvidenceStore,
    anchor: AnchorService,
    health: HealthMonitor,
}

impl ProvenanceEngine {
    /// Opens every component, reconciles interrupted writes, then records
    /// `system.start`. No write is accepted before reconciliation finishes.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Configuration`] for an invalid config or
    /// missing anchor key, and [`ProvenanceError::Write`] or
    /// [`ProvenanceError::Storage`] when a component cannot be opened or the
    /// reconciler cannot finish.
    pub fn open(
        config: EngineConfig,
        keyring: &dyn Keyring,
    ) -> Result<(Self, RecoveryReport), ProvenanceError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).map_err(|err| io_write_error(&config.data_dir, &err))?;

        let run_id = RunId::new();
        let policy_hash = config.policy_hash()?;
        let journal = Arc::new(JournalWriter::open(
            &config.journal_path(),
            run_id,
            config.policy.journal.clone(),
        )?);
        let ledger = Arc::new(LedgerWriter::open(&config.ledger_path(), run_id, &policy_hash)?);
        let store = EvidenceStore::open(
            &config.evidence_db_path(),
            &config.media_dir(),
            Arc::clone(&journal),
            Arc::clone(&ledger),
        )?;
        let anchor = AnchorService::open(&config.anchor_dir, config.policy.anchor, keyring)?;

        let report = Reconciler::new(&store, &journal, &ledger).run()?;

        let start = ledger.append(
            Transition::new(LedgerStage::SystemStart)
                .annotate("run_id", run_id.to_string())
                .annotate("crash_detected", report.crash_detected.to_string())
                .annotate("replayed", report.replayed.len().to_string())
                .annotate("quarantined", report.quarantined.len().to_string()),
        )?;
        journal.append(
            LIFECYCLE_STREAM,
            JournalKind::RunStarted,
            json!({
                "run_id": run_id.to_string(),
                "ledger_entry_id": start.entry_id,
                "policy_hash": policy_hash,
                "crash_detected": report.crash_detected,
            }),
        )?;

        let engine = Self {
            health: HealthMonitor::new(config.health.write_failure_threshold),
            config,
            journal,
            ledger,
            store,
            anchor,
        };
        if !report.chain_ok {
            engine
                .health
                .flag_chain_break(report.first_bad_entry.unwrap_or_default(), "found at startup");
        }
        engine.seal_if_due();

        tracing::info!(
            run_id = %run_id,
            entry_id = start.entry_id,
            data_dir = %engine.config.data_dir.display(),
            "provenance engine opened"
        );
        Ok((engine, report))
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.ledger.run_id()
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn journal(&self) -> &JournalWriter {
        &self.journal
    }

    #[must_use]
    pub fn ledger(&self) -> &LedgerWriter {
        &self.ledger
    }

    #[must_use]
    pub fn anchor(&self) -> &AnchorService {
        &self.anchor
    }

    #[must_use]
    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    #[must_use]
    pub fn health(&self) -> Health {
        self.health.snapshot()
    }

    /// # Errors
    /// See [`EvidenceStore::put_evidence`].
    pub fn submit_evidence(
        &self,
        record: &EvidenceRecord,
        payload: &[u8],
    ) -> Result<RecordReceipt, ProvenanceError> {
        let receipt = self.health.observe(self.store.put_evidence(record, payload))?;
        self.seal_if_due();
        Ok(receipt)
    }

    /// # Errors
    /// See [`EvidenceStore::put_derived`].
    pub fn submit_derived(
        &self,
        record: &DerivedRecord,
        parent_edges: &[DerivationEdge],
        payload: &[u8],
    ) -> Result<RecordReceipt, ProvenanceError> {
        let receipt = self
            .health
            .observe(self.store.put_derived(record, parent_edges, payload))?;
        self.seal_if_due();
        Ok(receipt)
    }

    /// Records a transition owned by a caller outside the engine, such as a
    /// query or an egress. Lifecycle, capture and recovery stages are written
    /// only by the engine itself.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Validation`] for an engine-owned stage or a
    /// malformed hash, and [`ProvenanceError::Write`] when the append fails.
    pub fn record_transition(
        &self,
        stage: LedgerStage,
        inputs: &[String],
        outputs: &[String],
        annotations: &BTreeMap<String, String>,
    ) -> Result<LedgerEntry, ProvenanceError> {
        if !stage.is_external() {
            return Err(ProvenanceError::Validation(format!(
                "stage {} MUST NOT be recorded by callers",
                stage.as_str()
            )));
        }
        let mut transition = Transition::new(stage);
        for hash in inputs {
            transition = transition.input(hash.clone());
        }
        for hash in outputs {
            transition = transition.output(hash.clone());
        }
        for (key, value) in annotations {
            transition = transition.annotate(key, value.clone());
        }
        let entry = self.health.observe(self.ledger.append(transition))?;
        self.seal_if_due();
        Ok(entry)
    }

    /// Seals an anchor over the current head regardless of cadence.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::ChainBreak`] while the chain is known to be
    /// broken; otherwise see [`AnchorService::seal`].
    pub fn seal_anchor(&self) -> Result<AnchorRecord, ProvenanceError> {
        if let Some(entry_id) = self.health.snapshot().chain_break_at {
            return Err(ProvenanceError::ChainBreak {
                entry_id,
                details: "anchoring is suspended while the ledger chain is broken".to_string(),
            });
        }
        let sealed = self.anchor.seal(self.ledger.reader());
        match &sealed {
            Err(ProvenanceError::ChainBreak { entry_id, details }) => {
                self.health.flag_chain_break(*entry_id, details);
            }
            other => self
                .health
                .set_anchor_unavailable(matches!(other, Err(ProvenanceError::AnchorUnavailable(_)))),
        }
        sealed
    }

    /// Time-driven housekeeping for a host timer: syncs bulk journal entries
    /// whose interval elapsed and seals an anchor when the minute cadence is
    /// due. Returns the anchor if one was sealed.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when the journal sync fails. Anchor
    /// failures are flagged in [`Health`] instead.
    pub fn tick(&self) -> Result<Option<AnchorRecord>, ProvenanceError> {
        self.health.observe(self.journal.flush_if_due())?;
        Ok(self.seal_if_due())
    }

    #[must_use]
    pub fn resolve_citation(&self, citation: &Citation) -> Resolution {
        CitationResolver::new(&self.store, self.ledger.reader(), Some(&self.anchor)).resolve(citation)
    }

    /// Appends `system.stop` and flushes the journal. Without it the next
    /// open reports a crash.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] when the stop entry or the final
    /// flush cannot be made durable.
    pub fn shutdown(self) -> Result<LedgerEntry, ProvenanceError> {
        let run_id = self.run_id();
        let stop = self.ledger.append(
            Transition::new(LedgerStage::SystemStop).annotate("run_id", run_id.to_string()),
        )?;
        self.journal.append(
            LIFECYCLE_STREAM,
            JournalKind::RunStopped,
            json!({
                "run_id": run_id.to_string(),
                "ledger_entry_id": stop.entry_id,
            }),
        )?;
        self.journal.flush()?;
        tracing::info!(run_id = %run_id, entry_id = stop.entry_id, "provenance engine stopped");
        Ok(stop)
    }

    fn seal_if_due(&self) -> Option<AnchorRecord> {
        if self.health.snapshot().chain_break_at.is_some() {
            return None;
        }
        match self.anchor.seal_if_due(self.ledger.reader()) {
            Ok(sealed) => {
                self.health.set_anchor_unavailable(false);
                sealed
            }
            Err(ProvenanceError::ChainBreak { entry_id, details }) => {
                self.health.flag_chain_break(entry_id, &details);
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "anchor seal skipped");
                self.health.set_anchor_unavailable(true);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_kernel_provenance_core::{
        canonical, AnchorPolicy, DurabilityTier, HealthConfig, JournalPolicy, PolicyConfig,
    };

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn config(root: &std::path::Path) -> EngineConfig {
        EngineConfig {
            data_dir: root.join("data"),
            anchor_dir: root.join("anchors"),
            policy: PolicyConfig {
                journal: JournalPolicy {
                    default_tier: DurabilityTier::Bulk,
                    critical_streams: Vec::new(),
                    bulk_fsync_max_entries: 8,
                    bulk_fsync_max_interval_ms: 250,
                },
                anchor: AnchorPolicy {
                    every_entries: 1_000,
                    every_minutes: 60,
                },
            },
            health: HealthConfig {
                write_failure_threshold: 2,
            },
        }
    }

    fn keyring() -> StaticKeyring {
        StaticKeyring::new().with_key(must_ok(KeyMaterial::new(
            "anchor-engine-test",
            KeyDomain::Anchor,
            vec![9; 32],
        )))
    }

    #[test]
    fn health_degrades_after_threshold_and_resets_on_success() {
        let monitor = HealthMonitor::new(2);
        let write = || -> Result<(), ProvenanceError> {
            Err(ProvenanceError::Write {
                target: "journal.jsonl".to_string(),
                message: "disk full".to_string(),
            })
        };

        assert!(monitor.observe(write()).is_err());
        assert!(!monitor.snapshot().degraded);
        assert!(monitor
            .observe::<()>(Err(ProvenanceError::Validation("bad".to_string())))
            .is_err());
        assert_eq!(monitor.snapshot().consecutive_write_failures, 1);
        assert!(monitor.observe(write()).is_err());
        assert!(monitor.snapshot().degraded);

        assert!(monitor.observe(Ok(())).is_ok());
        assert_eq!(monitor.snapshot(), Health::default());
    }

    #[test]
    fn engine_rejects_engine_owned_stages() {
        let root = must_ok(tempfile::tempdir());
        let (engine, report) = must_ok(ProvenanceEngine::open(config(root.path()), &keyring()));
        assert!(!report.crash_detected);

        let err = engine.record_transition(
            LedgerStage::SystemStop,
            &[],
            &[],
            &BTreeMap::new(),
        );
        assert!(matches!(err, Err(ProvenanceError::Validation(_))));

        let query = must_ok(engine.record_transition(
            LedgerStage::QueryExecuted,
            &[canonical::hash_bytes(b"question")],
            &[canonical::hash_bytes(b"answer")],
            &BTreeMap::from([("query_id".to_string(), "q-1".to_string())]),
        ));
        assert_eq!(query.annotation("query_id"), Some("q-1"));
        assert_eq!(query.entry_id, 2);
        must_ok(engine.shutdown());
    }

    #[test]
    fn tick_seals_once_the_minute_cadence_elapses() {
        let root = must_ok(tempfile::tempdir());
        let (engine, _) = must_ok(ProvenanceEngine::open(config(root.path()), &keyring()));
        must_ok(engine.record_transition(
            LedgerStage::QueryExecuted,
            &[],
            &[canonical::hash_bytes(b"answer")],
            &BTreeMap::new(),
        ));
        assert!(must_ok(engine.tick()).is_none());
        assert!(must_ok(engine.anchor().latest()).is_none());

        engine.anchor().backdate_last_seal(time::Duration::minutes(61));
        let Some(sealed) = must_ok(engine.tick()) else {
            panic!("tick MUST seal once the interval has elapsed");
        };
        assert_eq!(Some(sealed.ledger_head_entry_id), engine.ledger().head().map(|head| head.entry_id));
        assert!(must_ok(engine.tick()).is_none());
        assert_eq!(engine.health(), Health::default());
        must_ok(engine.shutdown());
    }

    #[test]
    fn open_records_start_and_shutdown_records_stop() {
        let root = must_ok(tempfile::tempdir());
        let (engine, _) = must_ok(ProvenanceEngine::open(config(root.path()), &keyring()));
        let started = engine.ledger().head();
        assert_eq!(started.map(|head| head.entry_id), Some(1));
        let stop = must_ok(engine.shutdown());
        assert_eq!(stop.stage, LedgerStage::SystemStop);

        let (engine, report) = must_ok(ProvenanceEngine::open(config(root.path()), &keyring()));
        assert!(!report.crash_detected);
        assert!(report.chain_ok);
        let lifecycle: Vec<JournalKind> = must_ok(engine.journal().read_entries())
            .into_iter()
            .filter(|entry| entry.stream_id == LIFECYCLE_STREAM)
            .map(|entry| entry.kind)
            .collect();
        assert_eq!(
            lifecycle,
            vec![
                JournalKind::RunStarted,
                JournalKind::RunStopped,
                JournalKind::RunStarted
            ]
        );
    }
}
