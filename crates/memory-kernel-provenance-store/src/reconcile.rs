//! Startup reconciliation: crash detection and resolution of staged writes.
//!
//! Every record write journals `record_staged` before anything else and a
//! terminal marker when it ends. A staged marker without a terminal marker is
//! an interrupted write. Each one moves `staged -> replay_commit` when every
//! admission check still holds, or `staged -> quarantine` otherwise. Terminal
//! markers are written for both, so a second run finds nothing to do.

use std::collections::HashSet;

use memory_kernel_provenance_core::{
    canonical, DerivationEdge, JournalKind, LedgerStage, ProvenanceError, QuarantineReason, RunId,
    StagedRecord, SEAL_STREAM,
};
use serde::{Deserialize, Serialize};

use crate::evidence::{EvidenceStore, RecordSource, SealMarker};
use crate::journal::JournalWriter;
use crate::ledger::{LedgerWriter, Transition};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Staged,
    ReplayCommit,
    Quarantine,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StateTransition {
    pub record_id: String,
    pub from: ReconcileState,
    pub to: ReconcileState,
    pub ledger_entry_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuarantinedWrite {
    pub record_id: String,
    pub reason: QuarantineReason,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecoveryReport {
    pub contract_version: String,
    pub run_id: RunId,
    pub chain_ok: bool,
    pub first_bad_entry: Option<u64>,
    pub crash_detected: bool,
    pub replayed: Vec<String>,
    pub quarantined: Vec<QuarantinedWrite>,
    /// Records whose row already matched; only the missing marker was written.
    pub healed: Vec<String>,
    pub transitions: Vec<StateTransition>,
}

impl RecoveryReport {
    fn new(run_id: RunId) -> Self {
        Self {
            contract_version: "recovery_report.v1".to_string(),
            run_id,
            chain_ok: true,
            first_bad_entry: None,
            crash_detected: false,
            replayed: Vec::new(),
            quarantined: Vec::new(),
            healed: Vec::new(),
            transitions: Vec::new(),
        }
    }
}

enum Decision {
    Replayed(u64),
    Quarantine(QuarantineReason),
}

pub struct Reconciler<'a> {
    store: &'a EvidenceStore,
    journal: &'a JournalWriter,
    ledger: &'a LedgerWriter,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub fn new(store: &'a EvidenceStore, journal: &'a JournalWriter, ledger: &'a LedgerWriter) -> Self {
        Self {
            store,
            journal,
            ledger,
        }
    }

    /// Runs crash detection and the staged scan. Must complete before the
    /// engine accepts writes.
    ///
    /// # Errors
    /// Returns [`ProvenanceError::Write`] or [`ProvenanceError::Storage`] when
    /// a durable step fails. Integrity findings are reported, not returned.
    pub fn run(&self) -> Result<RecoveryReport, ProvenanceError> {
        let mut report = RecoveryReport::new(self.ledger.run_id());

        let chain = self.ledger.verify_chain(..)?;
        report.chain_ok = chain.ok;
        report.first_bad_entry = chain.first_bad_entry;

        report.crash_detected = self.detect_crash()?;
        self.scan_staged(&mut report)?;

        tracing::info!(
            run_id = %report.run_id,
            chain_ok = report.chain_ok,
            crash_detected = report.crash_detected,
            replayed = report.replayed.len(),
            quarantined = report.quarantined.len(),
            healed = report.healed.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    fn detect_crash(&self) -> Result<bool, ProvenanceError> {
        let Some(last) = self.ledger.reader().last_entry()? else {
            return Ok(false);
        };
        if last.stage == LedgerStage::SystemStop || last.run_id == self.ledger.run_id() {
            return Ok(false);
        }

        let entry = self.ledger.append(
            Transition::new(LedgerStage::SystemCrashDetected)
                .input(last.entry_hash.clone())
                .annotate("prior_run_id", last.run_id.to_string())
                .annotate("last_entry_id", last.entry_id.to_string()),
        )?;
        tracing::warn!(
            prior_run_id = %last.run_id,
            last_entry_id = last.entry_id,
            entry_id = entry.entry_id,
            "previous run ended without system.stop"
        );
        Ok(true)
    }

    fn scan_staged(&self, report: &mut RecoveryReport) -> Result<(), ProvenanceError> {
        let mut staged: Vec<SealMarker> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut closed: HashSet<(String, String)> = HashSet::new();

        for entry in self.journal.read_entries()? {
            if entry.stream_id != SEAL_STREAM {
                continue;
            }
            let marker = match SealMarker::from_entry(&entry) {
                Ok(marker) => marker,
                Err(err) => {
                    tracing::warn!(sequence = entry.sequence, error = %err, "skipping unreadable seal marker");
                    continue;
                }
            };
            let key = (marker.record_id.clone(), marker.record_hash.clone());
            if entry.kind == JournalKind::RecordStaged {
                if seen.insert(key) {
                    staged.push(marker);
                }
            } else if entry.kind.is_terminal_marker() {
                closed.insert(key);
            }
        }

        for marker in staged {
            if closed.contains(&(marker.record_id.clone(), marker.record_hash.clone())) {
                continue;
            }
            self.resolve(&marker, report)?;
        }
        Ok(())
    }

    fn resolve(&self, marker: &SealMarker, report: &mut RecoveryReport) -> Result<(), ProvenanceError> {
        if let Some(stored) = self.store.lookup(&marker.record_id)? {
            if stored.record_hash == marker.record_hash {
                let healed = SealMarker::new(&marker.record_id, &marker.record_hash)
                    .with_ledger_entry(stored.ledger_entry_id);
                self.store.mark(JournalKind::RecordCommitted, &healed)?;
                report.healed.push(marker.record_id.clone());
                return Ok(());
            }
        }
        if let Some(existing) = self
            .store
            .quarantine_entry(&marker.record_id, &marker.record_hash)?
        {
            let healed = SealMarker::new(&marker.record_id, &marker.record_hash)
                .with_ledger_entry(existing.ledger_entry_id)
                .with_reason(existing.reason.as_str());
            self.store.mark(JournalKind::RecordQuarantined, &healed)?;
            report.healed.push(marker.record_id.clone());
            return Ok(());
        }

        match self.decide(marker)? {
            Decision::Replayed(entry_id) => {
                let committed = SealMarker::new(&marker.record_id, &marker.record_hash)
                    .with_ledger_entry(entry_id);
                self.store.mark(JournalKind::RecordCommitted, &committed)?;
                tracing::info!(record_id = %marker.record_id, entry_id, "staged record replayed");
                report.replayed.push(marker.record_id.clone());
                report.transitions.push(StateTransition {
                    record_id: marker.record_id.clone(),
                    from: ReconcileState::Staged,
                    to: ReconcileState::ReplayCommit,
                    ledger_entry_id: entry_id,
                });
            }
            Decision::Quarantine(reason) => {
                let entry = self.store.quarantine(marker, reason)?;
                let quarantined = SealMarker::new(&marker.record_id, &marker.record_hash)
                    .with_ledger_entry(entry.entry_id)
                    .with_reason(reason.as_str());
                self.store.mark(JournalKind::RecordQuarantined, &quarantined)?;
                report.quarantined.push(QuarantinedWrite {
                    record_id: marker.record_id.clone(),
                    reason,
                });
                report.transitions.push(StateTransition {
                    record_id: marker.record_id.clone(),
                    from: ReconcileState::Staged,
                    to: ReconcileState::Quarantine,
                    ledger_entry_id: entry.entry_id,
                });
            }
        }
        Ok(())
    }

    fn decide(&self, marker: &SealMarker) -> Result<Decision, ProvenanceError> {
        let Ok(staged) = marker.staged_record() else {
            return Ok(Decision::Quarantine(QuarantineReason::InvalidRecord));
        };
        if staged.record_id() != marker.record_id {
            return Ok(Decision::Quarantine(QuarantineReason::InvalidRecord));
        }
        if let Err(err) = validate_staged(&staged) {
            return Ok(Decision::Quarantine(QuarantineReason::from_admission_error(&err)));
        }
        match staged.record_hash() {
            Ok(recomputed) if recomputed == marker.record_hash => {}
            Ok(_) => return Ok(Decision::Quarantine(QuarantineReason::MetadataHashMismatch)),
            Err(_) => return Ok(Decision::Quarantine(QuarantineReason::InvalidRecord)),
        }

        let Some(payload) = self.store.load_payload(staged.content_hash())? else {
            return Ok(Decision::Quarantine(QuarantineReason::MediaMissing));
        };
        if canonical::hash_bytes(&payload) != staged.content_hash() {
            return Ok(Decision::Quarantine(QuarantineReason::MediaHashMismatch));
        }
        let payload_len = u64::try_from(payload.len()).unwrap_or(u64::MAX);

        match self.store.commit_staged(
            &staged,
            &marker.record_hash,
            payload_len,
            LedgerStage::RecoveryCompleted,
        ) {
            Ok(entry) => Ok(Decision::Replayed(entry.entry_id)),
            Err(failure) if failure.error.is_write_failure() => Err(failure.error),
            Err(failure) => Ok(Decision::Quarantine(
                QuarantineReason::from_admission_error(&failure.error),
            )),
        }
    }
}

fn validate_staged(staged: &StagedRecord) -> Result<(), ProvenanceError> {
    match staged {
        StagedRecord::Evidence { record } => record.validate(),
        StagedRecord::Derived { record, edges } => {
            record.validate()?;
            edges.iter().try_for_each(DerivationEdge::validate)
        }
    }
}
