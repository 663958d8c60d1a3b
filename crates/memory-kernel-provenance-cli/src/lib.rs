//! Read-mostly operator surface for an engine data directory.
//!
//! Every command prints one pretty JSON document on stdout; logs go to stderr.
//! No command appends to the ledger or journal. `anchor seal` is the only
//! command that writes, and it writes into the anchor directory.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use memory_kernel_provenance_core::{Citation, EngineConfig, JournalEntry, LedgerEntry, LedgerStage};
use memory_kernel_provenance_store::{
    read_journal, AnchorService, CitationResolver, EvidenceCatalog, FileKeyring, LedgerReader,
};
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mk-provenance")]
#[command(about = "Evidence and provenance engine inspection CLI")]
pub struct Cli {
    /// Engine configuration JSON.
    #[arg(long)]
    config: PathBuf,

    /// Directory holding `<domain>.key` files. Anchor checks need it.
    #[arg(long)]
    keys: Option<PathBuf>,

    #[arg(long, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Checks config, chain, anchors and store in one pass.
    Doctor,
    Ledger {
        #[command(subcommand)]
        command: LedgerCommand,
    },
    Anchor {
        #[command(subcommand)]
        command: AnchorCommand,
    },
    Journal {
        #[command(subcommand)]
        command: JournalCommand,
    },
    /// Re-verifies one citation.
    Resolve(ResolveArgs),
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    Head,
    Verify(VerifyArgs),
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(long)]
    from: Option<u64>,
    #[arg(long)]
    to: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum AnchorCommand {
    Latest,
    Verify(AnchorVerifyArgs),
    Seal,
}

#[derive(Debug, Args)]
pub struct AnchorVerifyArgs {
    /// Defaults to the latest anchor.
    #[arg(long)]
    seq: Option<u64>,
}

#[derive(Debug, Subcommand)]
pub enum JournalCommand {
    Tail(TailArgs),
}

#[derive(Debug, Args)]
pub struct TailArgs {
    #[arg(long)]
    stream: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

#[derive(Debug, Args)]
pub struct ResolveArgs {
    #[arg(long)]
    citation_json: String,
}

/// Installs a stderr subscriber. An unparsable level falls back to `warn`.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

/// Executes a parsed command.
///
/// # Errors
/// Returns an error when the config cannot be loaded, a file cannot be read,
/// or a verification command finds a broken chain or an invalid anchor.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = EngineConfig::from_path(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    tracing::debug!(
        config = %cli.config.display(),
        data_dir = %config.data_dir.display(),
        "engine config loaded"
    );
    let ledger = LedgerReader::new(&config.ledger_path());

    match cli.command {
        Command::Doctor => run_doctor(&config, &ledger, cli.keys.as_deref()),
        Command::Ledger { command } => run_ledger(command, &ledger),
        Command::Anchor { command } => {
            let anchors = open_anchors(&config, cli.keys.as_deref())?;
            run_anchor(command, &anchors, &ledger)
        }
        Command::Journal {
            command: JournalCommand::Tail(args),
        } => run_journal_tail(&config.journal_path(), &args),
        Command::Resolve(args) => {
            let citation: Citation = serde_json::from_str(&args.citation_json)
                .context("citation-json MUST be a citation object")?;
            let catalog = EvidenceCatalog::open(&config.evidence_db_path(), &config.media_dir())?;
            let anchors = cli
                .keys
                .as_deref()
                .map(|keys| open_anchors(&config, Some(keys)))
                .transpose()?;
            let resolution =
                CitationResolver::new(&catalog, &ledger, anchors.as_ref()).resolve(&citation);
            print_json(&resolution)
        }
    }
}

fn open_anchors(config: &EngineConfig, keys: Option<&Path>) -> Result<AnchorService> {
    let keys = keys.ok_or_else(|| anyhow!("--keys is required for anchor operations"))?;
    let keyring = FileKeyring::from_dir(keys);
    AnchorService::open(&config.anchor_dir, config.policy.anchor, &keyring)
        .context("failed to open anchor service")
}

fn run_ledger(command: LedgerCommand, ledger: &LedgerReader) -> Result<()> {
    match command {
        LedgerCommand::Head => {
            let head = ledger.head()?;
            print_json(&json!({ "head": head }))
        }
        LedgerCommand::Verify(args) => {
            let from = args.from.unwrap_or(1);
            let report = match args.to {
                Some(to) => ledger.verify_chain(from..=to)?,
                None => ledger.verify_chain(from..)?,
            };
            print_json(&report)?;
            if !report.ok {
                bail!(
                    "ledger chain broken at entry {}",
                    report.first_bad_entry.unwrap_or_default()
                );
            }
            Ok(())
        }
    }
}

fn run_anchor(command: AnchorCommand, anchors: &AnchorService, ledger: &LedgerReader) -> Result<()> {
    match command {
        AnchorCommand::Latest => {
            let latest = anchors.latest()?;
            print_json(&json!({ "anchor": latest }))
        }
        AnchorCommand::Verify(args) => {
            let anchor = match args.seq {
                Some(seq) => anchors.get(seq)?,
                None => anchors.latest()?,
            }
            .ok_or_else(|| anyhow!("no anchor to verify"))?;
            let outcome = anchors.check(&anchor, ledger);
            print_json(&json!({
                "anchor_seq": anchor.anchor_seq,
                "ledger_head_entry_id": anchor.ledger_head_entry_id,
                "verified": outcome.is_ok(),
                "details": outcome.as_ref().err().map(ToString::to_string),
            }))?;
            outcome.with_context(|| format!("anchor {} failed verification", anchor.anchor_seq))
        }
        AnchorCommand::Seal => {
            let sealed = anchors.seal(ledger)?;
            print_json(&sealed)
        }
    }
}

fn run_journal_tail(path: &Path, args: &TailArgs) -> Result<()> {
    let entries: Vec<JournalEntry> = read_journal(path)?
        .into_iter()
        .filter(|entry| match args.stream.as_deref() {
            Some(stream) => entry.stream_id == stream,
            None => true,
        })
        .collect();
    let skip = entries.len().saturating_sub(args.limit);
    let tail: Vec<&JournalEntry> = entries.iter().skip(skip).collect();
    print_json(&tail)
}

fn run_doctor(config: &EngineConfig, ledger: &LedgerReader, keys: Option<&Path>) -> Result<()> {
    let chain = ledger.verify_chain(..)?;
    let catalog = EvidenceCatalog::open(&config.evidence_db_path(), &config.media_dir())?;
    let counts = catalog.counts()?;
    let quarantined = catalog.list_quarantined()?;
    let recovery = ledger
        .last_of_stage(LedgerStage::SystemStart)?
        .map_or(Value::Null, |start| recovery_summary(&start));

    let anchor = match keys {
        Some(keys) => {
            let anchors = open_anchors(config, Some(keys))?;
            match anchors.latest() {
                Ok(Some(latest)) => {
                    let check = anchors.check(&latest, ledger);
                    json!({
                        "status": if check.is_ok() { "verified" } else { "mismatch" },
                        "latest": latest,
                        "details": check.err().map(|err| err.to_string()),
                    })
                }
                Ok(None) => json!({ "status": "none" }),
                Err(err) => json!({ "status": "unavailable", "details": err.to_string() }),
            }
        }
        None => json!({ "status": "skipped" }),
    };

    print_json(&json!({
        "contract_version": "doctor.v1",
        "policy_hash": config.policy_hash()?,
        "chain": chain,
        "anchor": anchor,
        "store": counts,
        "quarantined": quarantined,
        "recovery": recovery,
    }))
}

/// What the most recent startup reconciliation found, as recorded on its
/// `system.start` entry.
fn recovery_summary(start: &LedgerEntry) -> Value {
    let count = |key: &str| {
        start
            .annotation(key)
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or_default()
    };
    json!({
        "run_id": start.annotation("run_id"),
        "ledger_entry_id": start.entry_id,
        "crash_detected": start.annotation("crash_detected") == Some("true"),
        "replayed": count("replayed"),
        "quarantined": count("quarantined"),
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
