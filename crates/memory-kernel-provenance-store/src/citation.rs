//! Citation re-verification. Every check reads from disk and no outcome is
//! reported as an error. Chain verification reuses the reader's verified
//! prefix while those bytes are unchanged.

use memory_kernel_provenance_core::{
    canonical, Citation, ProvenanceError, Resolution, ResolutionDetail, SpanRef,
};

use crate::anchor::AnchorService;
use crate::evidence::{RecordBody, RecordSource, StoredRecord};
use crate::ledger::LedgerReader;

/// Upper bound on `parent_evidence_id` hops when looking for root evidence.
const MAX_LINEAGE_DEPTH: usize = 64;

pub struct CitationResolver<'a, S: RecordSource + ?Sized> {
    records: &'a S,
    ledger: &'a LedgerReader,
    anchors: Option<&'a AnchorService>,
}

impl<'a, S: RecordSource + ?Sized> CitationResolver<'a, S> {
    /// Without an anchor service every citation resolves to
    /// [`ResolutionDetail::AnchorUncovered`].
    #[must_use]
    pub fn new(records: &'a S, ledger: &'a LedgerReader, anchors: Option<&'a AnchorService>) -> Self {
        Self {
            records,
            ledger,
            anchors,
        }
    }

    #[must_use]
    pub fn resolve(&self, citation: &Citation) -> Resolution {
        let resolution = self.resolve_inner(citation);
        if !resolution.ok {
            tracing::debug!(
                evidence_id = %citation.evidence_id,
                detail = resolution.detail.as_str(),
                reason = resolution.reason.as_deref().unwrap_or_default(),
                "citation did not verify"
            );
        }
        resolution
    }

    fn resolve_inner(&self, citation: &Citation) -> Resolution {
        let stored = match self.records.lookup(&citation.evidence_id) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                return Resolution::failed(
                    ResolutionDetail::NotFound,
                    format!("record {} is not committed", citation.evidence_id),
                )
            }
            Err(err) => {
                return Resolution::failed(ResolutionDetail::NotFound, format!("lookup failed: {err}"))
            }
        };

        let payload_len = match self.check_hashes(citation, &stored) {
            Ok(len) => len,
            Err(resolution) => return resolution,
        };
        if let Err(resolution) = self.check_span(&citation.span_ref, &stored, payload_len) {
            return resolution;
        }
        if let Err(resolution) = self.check_ledger(citation, &stored) {
            return resolution;
        }
        if let Err(resolution) = self.check_anchor(citation) {
            return resolution;
        }
        Resolution::verified()
    }

    fn check_hashes(&self, citation: &Citation, stored: &StoredRecord) -> Result<u64, Resolution> {
        let content_hash = stored.record.content_hash();
        if citation.evidence_hash != content_hash {
            return Err(Resolution::failed(
                ResolutionDetail::HashMismatch,
                "cited hash differs from the stored content hash",
            ));
        }
        match stored.record.record_hash() {
            Ok(recomputed) if recomputed == stored.record_hash => {}
            Ok(_) => {
                return Err(Resolution::failed(
                    ResolutionDetail::HashMismatch,
                    "stored metadata no longer hashes to its record_hash",
                ))
            }
            Err(err) => return Err(Resolution::failed(ResolutionDetail::HashMismatch, err.to_string())),
        }

        let payload = match self.records.load_payload(content_hash) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                return Err(Resolution::failed(
                    ResolutionDetail::HashMismatch,
                    "media is missing",
                ))
            }
            Err(err) => {
                return Err(Resolution::failed(
                    ResolutionDetail::HashMismatch,
                    format!("media unreadable: {err}"),
                ))
            }
        };
        if canonical::hash_bytes(&payload) != content_hash {
            return Err(Resolution::failed(
                ResolutionDetail::HashMismatch,
                "media bytes no longer hash to the content hash",
            ));
        }
        Ok(u64::try_from(payload.len()).unwrap_or(u64::MAX))
    }

    fn check_span(&self, span: &SpanRef, stored: &StoredRecord, payload_len: u64) -> Result<(), Resolution> {
        let out_of_range = |reason: String| Resolution::failed(ResolutionDetail::SpanOutOfRange, reason);
        span.validate().map_err(|err| out_of_range(err.to_string()))?;

        let duration_ms = match span {
            SpanRef::TimeMs { .. } => self.root_duration_ms(stored).map_err(out_of_range)?,
            SpanRef::Whole | SpanRef::Bytes { .. } => 0,
        };
        if !span.fits(payload_len, duration_ms) {
            return Err(out_of_range(format!(
                "span {span:?} exceeds payload of {payload_len} bytes / {duration_ms} ms"
            )));
        }
        Ok(())
    }

    /// Duration of the evidence at the root of `stored`'s lineage.
    fn root_duration_ms(&self, stored: &StoredRecord) -> Result<u64, String> {
        let mut current = stored.record.clone();
        for _ in 0..MAX_LINEAGE_DEPTH {
            match current {
                RecordBody::Evidence(record) => return Ok(record.duration_ms()),
                RecordBody::Derived(record) => {
                    current = match self.records.lookup(&record.parent_evidence_id) {
                        Ok(Some(parent)) => parent.record,
                        Ok(None) => {
                            return Err(format!(
                                "root evidence {} is not committed",
                                record.parent_evidence_id
                            ))
                        }
                        Err(err) => return Err(err.to_string()),
                    };
                }
            }
        }
        Err("lineage too deep to reach root evidence".to_string())
    }

    fn check_ledger(&self, citation: &Citation, stored: &StoredRecord) -> Result<(), Resolution> {
        let entry = match self.ledger.entry(citation.ledger_entry_ref) {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                return Err(Resolution::failed(
                    ResolutionDetail::NotFound,
                    format!("ledger entry {} does not exist", citation.ledger_entry_ref),
                ))
            }
            Err(ProvenanceError::ChainBreak { entry_id, details }) => {
                return Err(Resolution::failed(
                    ResolutionDetail::ChainBreak,
                    format!("entry {entry_id}: {details}"),
                ))
            }
            Err(err) => return Err(Resolution::failed(ResolutionDetail::NotFound, err.to_string())),
        };

        match self.ledger.verify_to_head() {
            Ok(report) if report.ok => {}
            Ok(report) => {
                return Err(Resolution::failed(
                    ResolutionDetail::ChainBreak,
                    format!(
                        "first bad entry {}: {}",
                        report.first_bad_entry.unwrap_or_default(),
                        report.details.unwrap_or_default()
                    ),
                ))
            }
            Err(err) => return Err(Resolution::failed(ResolutionDetail::ChainBreak, err.to_string())),
        }

        if !entry.references(&stored.record_hash) {
            return Err(Resolution::failed(
                ResolutionDetail::HashMismatch,
                format!(
                    "ledger entry {} does not reference the record hash",
                    entry.entry_id
                ),
            ));
        }
        Ok(())
    }

    fn check_anchor(&self, citation: &Citation) -> Result<(), Resolution> {
        let uncovered = |reason: String| Resolution::failed(ResolutionDetail::AnchorUncovered, reason);
        let Some(anchors) = self.anchors else {
            return Err(uncovered("anchor domain is not configured".to_string()));
        };

        let anchor = match citation.anchor_ref {
            Some(seq) => anchors.get(seq),
            None => anchors.latest(),
        };
        let anchor = match anchor {
            Ok(Some(anchor)) => anchor,
            Ok(None) => return Err(uncovered("no anchor has been sealed".to_string())),
            Err(err) => return Err(uncovered(err.to_string())),
        };

        anchors
            .check(&anchor, self.ledger)
            .map_err(|err| uncovered(err.to_string()))?;
        if anchor.ledger_head_entry_id < citation.ledger_entry_ref {
            return Err(uncovered(format!(
                "anchor {} covers entries up to {}",
                anchor.anchor_seq, anchor.ledger_head_entry_id
            )));
        }
        Ok(())
    }
}
