//! seckernel CLI entry point.
//!
//! One-shot inspection commands: MAC checks, domain and hint derivation,
//! derivation checks and offline verification of a persisted audit chain.
//! `start` runs the kernel host (audit writer and key rotation scheduler)
//! until Ctrl-C.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, error, info};
use zeroize::Zeroizing;

use seckernel::audit::chain::{verify_envelopes, AuditEnvelope, VerifyOptions, AUDIT_STORE};
use seckernel::audit::sink::NullSink;
use seckernel::config::{config_dir, load_config, KernelConfig};
use seckernel::crypto::domain::domain_of;
use seckernel::crypto::InMemoryKeyring;
use seckernel::crypto::envelope::access_hint;
use seckernel::flow::derivation_permitted;
use seckernel::mac::{MacEngine, Operation};
use seckernel::policy::AuditPolicy;
use seckernel::store::{DurableStore, SqliteStore};
use seckernel::{Lattice, SecurityKernel, SecurityLabel};

/// seckernel: multi-level security kernel tooling.
#[derive(Parser)]
#[command(name = "seckernel", version, about)]
struct Cli {
    /// Config file (defaults to ~/.seckernel/seckernel.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// MAC operation for `check`.
#[derive(Clone, Copy, ValueEnum)]
enum OpArg {
    /// No Read Up.
    Read,
    /// No Write Down.
    Write,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Decide whether SUBJECT may read or write OBJECT. Exits 1 on denial.
    Check {
        /// Subject label, `level[:COMP,...]`.
        subject: String,
        /// Object label, `level[:COMP,...]`.
        object: String,
        /// Operation to check.
        #[arg(long, value_enum, default_value = "read")]
        op: OpArg,
    },
    /// Print the crypto domain for a label.
    Domain {
        /// Label, `level[:COMP,...]`.
        label: String,
    },
    /// Print the daily access hint for a label.
    Hint {
        /// Label, `level[:COMP,...]`.
        label: String,
        /// UTC day, `YYYY-MM-DD` (defaults to today).
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Check a derivation. Exits 1 on a flow violation.
    Derive {
        /// Source labels.
        #[arg(long = "source", required = true)]
        sources: Vec<String>,
        /// Derived label.
        #[arg(long)]
        derived: String,
    },
    /// Verify a persisted audit chain. Exits 1 when broken.
    VerifyAudit {
        /// SQLite database holding the chain.
        #[arg(long)]
        db: PathBuf,
        /// Base64 audit signing key. Required when the chain is signed.
        #[arg(long)]
        public_key: Option<String>,
        /// Accept unsigned envelopes.
        #[arg(long)]
        allow_unsigned: bool,
    },
    /// Run the kernel host until Ctrl-C. Requires `[audit] db_path`.
    Start {
        /// File holding the hex-encoded 32-byte master key.
        #[arg(long)]
        master_key_file: PathBuf,
        /// Directory for daily-rotated JSON logs (defaults to ~/.seckernel/logs).
        #[arg(long)]
        logs_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = match &cli.command {
        Command::Start { logs_dir, .. } => {
            let logs_dir = match logs_dir {
                Some(dir) => dir.clone(),
                None => config_dir()?.join("logs"),
            };
            Some(seckernel::logging::init_production(&logs_dir)?)
        }
        _ => {
            seckernel::logging::init_cli();
            None
        }
    };
    let config = resolve_config(cli.config.as_deref())?;
    let lattice = Arc::new(
        config
            .build_lattice()
            .context("invalid [lattice] configuration")?,
    );

    match cli.command {
        Command::Check { subject, object, op } => handle_check(lattice, &subject, &object, op),
        Command::Domain { label } => {
            println!("{}", domain_of(&parse_label(&label)?));
            Ok(ExitCode::SUCCESS)
        }
        Command::Hint { label, date } => handle_hint(&lattice, &label, date),
        Command::Derive { sources, derived } => handle_derive(&lattice, &sources, &derived),
        Command::VerifyAudit {
            db,
            public_key,
            allow_unsigned,
        } => handle_verify(&db, public_key.as_deref(), allow_unsigned).await,
        Command::Start {
            master_key_file, ..
        } => handle_start(config, &master_key_file).await,
    }
}

fn resolve_config(path: Option<&Path>) -> anyhow::Result<KernelConfig> {
    if let Some(path) = path {
        return load_config(path);
    }
    let default_path = config_dir()
        .map(|d| d.join("seckernel.toml"))
        .ok()
        .filter(|p| p.is_file());
    match default_path {
        Some(path) => {
            debug!(path = %path.display(), "using default config");
            load_config(&path)
        }
        None => Ok(KernelConfig::default()),
    }
}

fn parse_label(text: &str) -> anyhow::Result<SecurityLabel> {
    text.parse()
        .with_context(|| format!("invalid label {text:?}"))
}

fn handle_check(lattice: Arc<Lattice>, subject: &str, object: &str, op: OpArg) -> anyhow::Result<ExitCode> {
    let subject = parse_label(subject)?;
    let object = parse_label(object)?;
    let engine = MacEngine::new(lattice, 0, Arc::new(NullSink), AuditPolicy::default());
    let operation = match op {
        OpArg::Read => Operation::Read,
        OpArg::Write => Operation::Write,
    };
    let decision = engine.decide(operation, &subject, &object);
    println!("{}", serde_json::to_string(&decision)?);
    Ok(if decision.allowed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn handle_hint(lattice: &Lattice, label: &str, date: Option<NaiveDate>) -> anyhow::Result<ExitCode> {
    let label = parse_label(label)?;
    let at = match date {
        Some(day) => {
            let midnight = day
                .and_hms_opt(0, 0, 0)
                .context("invalid date")?;
            Utc.from_utc_datetime(&midnight)
        }
        None => Utc::now(),
    };
    let hint = access_hint(lattice, &label, at)
        .with_context(|| format!("unknown classification {:?}", label.classification))?;
    println!("{hint}");
    Ok(ExitCode::SUCCESS)
}

fn handle_derive(lattice: &Lattice, sources: &[String], derived: &str) -> anyhow::Result<ExitCode> {
    let sources = sources
        .iter()
        .map(|s| parse_label(s))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let derived = parse_label(derived)?;
    if derivation_permitted(lattice, &sources, &derived) {
        println!("permitted");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("flow violation");
        Ok(ExitCode::FAILURE)
    }
}

async fn handle_verify(
    db: &Path,
    public_key: Option<&str>,
    allow_unsigned: bool,
) -> anyhow::Result<ExitCode> {
    if !db.is_file() {
        anyhow::bail!("audit database {} does not exist", db.display());
    }
    let store = SqliteStore::open(db)
        .await
        .with_context(|| format!("failed to open {}", db.display()))?;
    let envelopes = store
        .list(AUDIT_STORE)
        .await?
        .into_iter()
        .map(|(key, record)| {
            serde_json::from_value::<AuditEnvelope>(record)
                .with_context(|| format!("malformed audit record {key}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    if public_key.is_none() && envelopes.iter().any(|e| e.signed) {
        anyhow::bail!("audit chain is signed; pass --public-key with the audit signing key");
    }

    let verification = verify_envelopes(
        &envelopes,
        &VerifyOptions {
            trusted_key: public_key,
            allow_unsigned,
            gaps: &[],
        },
    );
    println!("{}", serde_json::to_string(&verification)?);
    Ok(if verification.valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn handle_start(config: KernelConfig, master_key_file: &Path) -> anyhow::Result<ExitCode> {
    if config.audit.db_path.is_none() {
        anyhow::bail!("[audit] db_path must be set to run the kernel host");
    }
    let keyring = Arc::new(read_master_key(master_key_file)?);
    let kernel = SecurityKernel::open(config, keyring, None)
        .await
        .context("failed to open kernel")?;
    kernel.start();
    info!(
        key_version = kernel.lifecycle().active_version(),
        "kernel host running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, initiating graceful shutdown");
    kernel.shutdown().await;

    let verification = kernel.verify_chain().await?;
    if verification.valid {
        info!(checked = verification.checked, "audit chain verified");
        Ok(ExitCode::SUCCESS)
    } else {
        error!(broken_at = ?verification.broken_at, "audit chain verification failed");
        Ok(ExitCode::FAILURE)
    }
}

fn read_master_key(path: &Path) -> anyhow::Result<InMemoryKeyring> {
    let text = Zeroizing::new(
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read master key {}", path.display()))?,
    );
    let bytes = Zeroizing::new(hex::decode(text.trim()).context("master key is not hex")?);
    let master: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("master key must be 32 bytes"))?;
    Ok(InMemoryKeyring::new(master))
}
