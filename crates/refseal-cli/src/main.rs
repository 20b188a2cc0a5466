//! Refseal CLI - Command-line interface for the refseal trust engine
//!
//! Thin glue: each subcommand maps to one engine operation. Exit code 0
//! means the operation (or verification) succeeded; nonzero means it was
//! rejected or errored, with the error kind reported on stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use refseal_core::{Deadline, Error, ObjectId, Repository};
use refseal_verify::{verify_network, NetworkOptions, VerificationEngine, Verdict};

mod commands;

use commands::{
    KeyCommands, KeyringCommands, PolicyCommands, RslCommands, SnapshotCommands, TrustCommands,
};

#[derive(Parser)]
#[command(name = "refseal")]
#[command(about = "Trust and policy verification for version-controlled references", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the repository to operate on
    #[arg(long, global = true, default_value = ".")]
    repository: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Root-of-trust operations
    #[command(subcommand)]
    Trust(TrustCommands),

    /// Policy document operations
    #[command(subcommand)]
    Policy(PolicyCommands),

    /// Reference state log operations
    #[command(subcommand)]
    Rsl(RslCommands),

    /// Verify a reference against the applicable policy
    VerifyRef {
        /// Reference name (e.g. `main` or `refs/heads/main`)
        ref_name: String,

        /// Verify the full recorded history, not just the latest entry
        #[arg(short = 'f', long)]
        full: bool,
    },

    /// Verify a snapshot's signature against trusted principals
    VerifyCommit {
        /// Snapshot object ID (hex)
        id: String,
    },

    /// Verify every registered network repository from this controller
    VerifyNetwork {
        /// Timeout in seconds for reaching network repositories
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Snapshot helpers (create signed content states for references)
    #[command(subcommand)]
    Snapshot(SnapshotCommands),

    /// Key file helpers
    #[command(subcommand)]
    Key(KeyCommands),

    /// Fingerprint keyring operations
    #[command(subcommand)]
    Keyring(KeyringCommands),

    /// Show or set repository configuration
    Config {
        /// Set the default signing key path
        #[arg(long)]
        signing_key: Option<PathBuf>,

        /// Set the acting author name
        #[arg(long)]
        author_name: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refseal=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("refseal: {} (kind: {})", e, e.kind());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode, Error> {
    match cli.command {
        Commands::Trust(cmd) => {
            commands::handle_trust(&open_or_init_repo(&cli.repository, &cmd)?, cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Policy(cmd) => {
            commands::handle_policy(&Repository::open(&cli.repository)?, cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rsl(cmd) => {
            commands::handle_rsl(&Repository::open(&cli.repository)?, cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::VerifyRef { ref_name, full } => {
            let repo = Repository::open(&cli.repository)?;
            let engine = VerificationEngine::new(&repo)?;
            let verdict = if full {
                engine.verify_reference_full(&ref_name)?
            } else {
                engine.verify_reference(&ref_name, None)?
            };
            Ok(report_verdict(&verdict))
        }
        Commands::VerifyCommit { id } => {
            let repo = Repository::open(&cli.repository)?;
            let id = ObjectId::from_hex(&id)
                .map_err(|e| Error::Validation(format!("invalid snapshot id: {}", e)))?;
            let verdict = VerificationEngine::new(&repo)?.verify_snapshot(id)?;
            Ok(report_verdict(&verdict))
        }
        Commands::VerifyNetwork { timeout_secs } => {
            let repo = Repository::open(&cli.repository)?;
            let opts = NetworkOptions {
                deadline: deadline_from(timeout_secs),
            };
            let verdict = verify_network(&repo, &opts)?;
            for member in &verdict.members {
                let status = if member.accepted() { "ok" } else { "FAILED" };
                println!("{}: {}", member.repository, status);
                if let Some(error) = &member.error {
                    println!("  error: {}", error);
                }
                for v in &member.verdicts {
                    print_verdict_line(v);
                }
            }
            if verdict.accepted() {
                println!("✓ network verification passed");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!(
                    "refseal: network verification failed in: {}",
                    verdict.failed_members().join(", ")
                );
                Ok(ExitCode::FAILURE)
            }
        }
        Commands::Snapshot(cmd) => {
            commands::handle_snapshot(&Repository::open(&cli.repository)?, cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Key(cmd) => {
            commands::handle_key(cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Keyring(cmd) => {
            commands::handle_keyring(&Repository::open(&cli.repository)?, cmd)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config {
            signing_key,
            author_name,
        } => {
            let repo = Repository::open(&cli.repository)?;
            let mut config = repo.config()?;
            if signing_key.is_none() && author_name.is_none() {
                println!(
                    "signing_key: {}",
                    config
                        .signing_key
                        .as_ref()
                        .map_or("unset".to_string(), |p| p.display().to_string())
                );
                println!(
                    "author_name: {}",
                    config.author_name.as_deref().unwrap_or("unset")
                );
            } else {
                if let Some(path) = signing_key {
                    config.signing_key = Some(path);
                }
                if let Some(name) = author_name {
                    config.author_name = Some(name);
                }
                repo.save_config(&config)?;
                println!("✓ configuration updated");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// `trust init` bootstraps the state directory; everything else opens it
fn open_or_init_repo(path: &PathBuf, cmd: &TrustCommands) -> Result<Repository, Error> {
    match cmd {
        TrustCommands::Init { .. } => Repository::init(path),
        _ => Repository::open(path),
    }
}

fn report_verdict(verdict: &Verdict) -> ExitCode {
    print_verdict_line(verdict);
    if verdict.accepted {
        ExitCode::SUCCESS
    } else {
        if let Some(rule) = &verdict.violated_rule {
            eprintln!("refseal: violated rule '{}' (kind: trust)", rule);
        } else {
            eprintln!(
                "refseal: {} (kind: trust)",
                verdict.reason.as_deref().unwrap_or("rejected")
            );
        }
        ExitCode::FAILURE
    }
}

fn print_verdict_line(verdict: &Verdict) {
    if verdict.accepted {
        println!("✓ {} accepted", verdict.ref_name);
        for satisfied in &verdict.satisfied {
            println!(
                "  rule '{}' satisfied by [{}]",
                satisfied.rule,
                satisfied.principals.join(", ")
            );
        }
    } else {
        println!(
            "✗ {} rejected: {}",
            verdict.ref_name,
            verdict.reason.as_deref().unwrap_or("unspecified")
        );
    }
}

fn deadline_from(timeout_secs: Option<u64>) -> Deadline {
    match timeout_secs {
        Some(secs) => Deadline::after(Duration::from_secs(secs)),
        None => Deadline::none(),
    }
}
