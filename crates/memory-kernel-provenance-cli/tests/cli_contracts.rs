#![allow(clippy::single_match_else)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use memory_kernel_provenance_core::{
    canonical, parse_rfc3339_utc, AnchorPolicy, DurabilityTier, EngineConfig, EvidenceRecord,
    EvidenceType, HealthConfig, JournalPolicy, PolicyConfig, RecordReceipt, SCHEMA_VERSION,
};
use memory_kernel_provenance_store::{FileKeyring, ProvenanceEngine};
use serde_json::{json, Value};

struct Seeded {
    _root: tempfile::TempDir,
    config_path: PathBuf,
    keys_dir: PathBuf,
    ledger_path: PathBuf,
    receipt: RecordReceipt,
}

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_mk-provenance") {
        Ok(value) => PathBuf::from(value),
        Err(_) => Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/mk-provenance"),
    }
}

fn seed() -> Seeded {
    let root = must_ok(tempfile::tempdir());
    let keys_dir = root.path().join("keys");
    must_ok(std::fs::create_dir_all(&keys_dir));
    must_ok(std::fs::write(keys_dir.join("anchor.key"), "4b".repeat(32)));

    let config = EngineConfig {
        data_dir: root.path().join("data"),
        anchor_dir: root.path().join("anchors"),
        policy: PolicyConfig {
            journal: JournalPolicy {
                default_tier: DurabilityTier::Bulk,
                critical_streams: Vec::new(),
                bulk_fsync_max_entries: 32,
                bulk_fsync_max_interval_ms: 500,
            },
            anchor: AnchorPolicy {
                every_entries: 100,
                every_minutes: 10,
            },
        },
        health: HealthConfig {
            write_failure_threshold: 3,
        },
    };
    let config_path = root.path().join("engine.json");
    must_ok(std::fs::write(&config_path, must_ok(serde_json::to_string_pretty(&config))));

    let keyring = FileKeyring::from_dir(&keys_dir);
    let (engine, _) = must_ok(ProvenanceEngine::open(config.clone(), &keyring));
    let payload = b"frame-bytes";
    let record = EvidenceRecord {
        evidence_id: "ev-cli-1".to_string(),
        run_id: engine.run_id(),
        evidence_type: EvidenceType::ScreenFrame,
        ts_start_utc: must_ok(parse_rfc3339_utc("2026-02-07T09:30:00Z")),
        ts_end_utc: must_ok(parse_rfc3339_utc("2026-02-07T09:30:02Z")),
        content_hash: canonical::hash_bytes(payload),
        locator: "screen://display-1/ev-cli-1".to_string(),
        schema_version: SCHEMA_VERSION,
    };
    let receipt = must_ok(engine.submit_evidence(&record, payload));
    must_ok(engine.seal_anchor());
    must_ok(engine.shutdown());

    Seeded {
        ledger_path: config.ledger_path(),
        _root: root,
        config_path,
        keys_dir,
        receipt,
    }
}

fn run(seeded: &Seeded, with_keys: bool, args: &[&str]) -> Output {
    let mut command = Command::new(binary_path());
    command.arg("--config").arg(&seeded.config_path);
    if with_keys {
        command.arg("--keys").arg(&seeded.keys_dir);
    }
    command.args(args);
    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run mk-provenance {args:?}: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn citation_json(receipt: &RecordReceipt) -> String {
    json!({
        "evidence_id": receipt.record_id,
        "evidence_hash": receipt.content_hash,
        "span_ref": { "kind": "bytes", "start": 0, "end": 5 },
        "ledger_entry_ref": receipt.ledger_entry_id,
    })
    .to_string()
}

#[test]
fn help_lists_expected_subcommands() {
    let output = match Command::new(binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["doctor", "ledger", "anchor", "journal", "resolve"] {
        assert!(stdout.contains(required), "help output missing `{required}`");
    }
}

#[test]
fn ledger_head_and_verify_report_the_full_chain() {
    let seeded = seed();
    let head = run(&seeded, false, &["ledger", "head"]);
    assert!(head.status.success());
    let head = stdout_json(&head);
    // system.start, capture, system.stop
    assert_eq!(head["head"]["entry_id"], json!(3));

    let verify = run(&seeded, false, &["ledger", "verify"]);
    assert!(verify.status.success());
    let report = stdout_json(&verify);
    assert_eq!(report["contract_version"], json!("chain_report.v1"));
    assert_eq!(report["ok"], json!(true));
    assert_eq!(report["checked"], json!(3));
}

#[test]
fn tampered_ledger_fails_verify_with_first_bad_entry() {
    let seeded = seed();
    let raw = must_ok(std::fs::read_to_string(&seeded.ledger_path));
    let tampered = raw.replacen("\"system.start\"", "\"system.stop\"", 1);
    assert_ne!(raw, tampered);
    must_ok(std::fs::write(&seeded.ledger_path, tampered));

    let verify = run(&seeded, false, &["ledger", "verify"]);
    assert!(!verify.status.success());
    let report = stdout_json(&verify);
    assert_eq!(report["ok"], json!(false));
    assert_eq!(report["first_bad_entry"], json!(1));

    let resolved = stdout_json(&run(
        &seeded,
        true,
        &["resolve", "--citation-json", &citation_json(&seeded.receipt)],
    ));
    assert_eq!(resolved["detail"], json!("chain_break"));
}

#[test]
fn anchor_verify_accepts_the_sealed_anchor_and_requires_keys() {
    let seeded = seed();
    let verified = run(&seeded, true, &["anchor", "verify"]);
    assert!(verified.status.success());
    let body = stdout_json(&verified);
    assert_eq!(body["anchor_seq"], json!(1));
    assert_eq!(body["verified"], json!(true));

    let without_keys = run(&seeded, false, &["anchor", "latest"]);
    assert!(!without_keys.status.success());
    assert!(String::from_utf8_lossy(&without_keys.stderr).contains("--keys"));
}

#[test]
fn resolve_verifies_with_keys_and_is_uncovered_without() {
    let seeded = seed();
    let citation = citation_json(&seeded.receipt);

    let with_keys = stdout_json(&run(&seeded, true, &["resolve", "--citation-json", &citation]));
    assert_eq!(with_keys["ok"], json!(true));
    assert_eq!(with_keys["detail"], json!("verified"));

    let without_keys = stdout_json(&run(&seeded, false, &["resolve", "--citation-json", &citation]));
    assert_eq!(without_keys["ok"], json!(false));
    assert_eq!(without_keys["detail"], json!("anchor_uncovered"));
}

#[test]
fn journal_tail_filters_by_stream() {
    let seeded = seed();
    let output = run(
        &seeded,
        false,
        &["journal", "tail", "--stream", "evidence.seal", "--limit", "2"],
    );
    assert!(output.status.success());
    let entries = stdout_json(&output);
    let Some(entries) = entries.as_array() else {
        panic!("journal tail MUST print an array");
    };
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["kind"], json!("media_staged"));
    assert_eq!(entries[1]["kind"], json!("record_committed"));
    assert!(entries.iter().all(|entry| entry["stream_id"] == json!("evidence.seal")));
}

#[test]
fn doctor_summarizes_chain_anchor_and_store() {
    let seeded = seed();
    let output = run(&seeded, true, &["doctor"]);
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["contract_version"], json!("doctor.v1"));
    assert_eq!(report["chain"]["ok"], json!(true));
    assert_eq!(report["anchor"]["status"], json!("verified"));
    assert_eq!(report["store"]["evidence"], json!(1));
    assert_eq!(report["quarantined"], json!([]));
    assert_eq!(report["recovery"]["ledger_entry_id"], json!(1));
    assert_eq!(report["recovery"]["crash_detected"], json!(false));
    assert_eq!(report["recovery"]["replayed"], json!(0));
}

#[test]
fn doctor_reports_a_crash_found_by_the_last_startup() {
    let seeded = seed();
    let config = must_ok(EngineConfig::from_path(&seeded.config_path));
    let keyring = FileKeyring::from_dir(&seeded.keys_dir);
    {
        // no shutdown: the next open finds the run unfinished
        let (_engine, _) = must_ok(ProvenanceEngine::open(config.clone(), &keyring));
    }
    let (engine, recovered) = must_ok(ProvenanceEngine::open(config, &keyring));
    assert!(recovered.crash_detected);
    let run_id = engine.run_id().to_string();
    must_ok(engine.shutdown());

    let report = stdout_json(&run(&seeded, false, &["doctor"]));
    assert_eq!(report["anchor"]["status"], json!("skipped"));
    assert_eq!(report["recovery"]["crash_detected"], json!(true));
    assert_eq!(report["recovery"]["replayed"], json!(0));
    assert_eq!(report["recovery"]["run_id"], json!(run_id));
}

#[test]
fn missing_config_is_reported_on_stderr() {
    let output = match Command::new(binary_path())
        .args(["--config", "/nonexistent/engine.json", "ledger", "head"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run command: {err}"),
    };
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to load config"));
}
