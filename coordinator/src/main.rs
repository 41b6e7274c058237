//! Run lifecycle coordinator CLI.
//!
//! Tracks runs under `<root>/runs/*.json`, mirrors mutations into
//! `<root>/audit.jsonl`, and reads per-root settings from
//! `<root>/coordinator.toml`.

use std::path::PathBuf;

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand, ValueEnum};

use coordinator::claim::{self, ClaimError};
use coordinator::exit_codes;
use coordinator::intake::{self, IntakeRequest};
use coordinator::io::audit::AuditLog;
use coordinator::io::config::load_config;
use coordinator::io::executor::ShellCheckRunner;
use coordinator::io::store::RunStore;
use coordinator::recorder::{self, ManualVerdict, RecordError, VerifyOutcome};
use coordinator::logging;
use coordinator::transition::{self, ApplyError};

#[derive(Parser)]
#[command(
    name = "coordinator",
    version,
    about = "Run lifecycle engine: states, verification, and claims"
)]
struct Cli {
    /// Coordination root directory.
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a new run in state `proposed`.
    Intake {
        id: String,
        /// Path to the plan document this run executes.
        plan: PathBuf,
        #[arg(long)]
        initiative: Option<String>,
        /// File the run is expected to touch (repeatable).
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        priority: Option<u32>,
        /// Run id this run depends on (repeatable, advisory).
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },
    /// List all runs with their current state.
    List,
    /// Print one run record as JSON.
    Show { id: String },
    /// Apply a lifecycle transition.
    Transition {
        id: String,
        /// Target state: exact (`verifying/failed`), parent (`active`), or
        /// wildcard (`active/*`).
        target: String,
        #[arg(long, default_value = "cli")]
        actor: String,
        #[arg(long)]
        reason: Option<String>,
        /// Bypass edge and claim validation. Loudly audited.
        #[arg(long)]
        force: bool,
    },
    /// Take an exclusive time-bounded claim on a run.
    Claim {
        id: String,
        #[arg(long)]
        agent: String,
        /// Lease duration in minutes; defaults to the configured TTL.
        #[arg(long)]
        ttl_mins: Option<i64>,
        /// Override an existing holder or file-overlap conflicts.
        #[arg(long)]
        force: bool,
    },
    /// Release a run's claim (idempotent).
    Release { id: String },
    /// Release expired claims across all runs.
    Gc {
        /// Report what would be released without mutating anything.
        #[arg(long)]
        dry_run: bool,
    },
    /// Verification: execute checks and record outcomes.
    #[command(subcommand)]
    Verify(VerifyCommand),
}

#[derive(Subcommand)]
enum VerifyCommand {
    /// Execute the plan's automated checks and append ledger events.
    Run {
        id: String,
        #[arg(long, default_value = "cli")]
        actor: String,
        /// Working directory for check commands; defaults to the root.
        #[arg(long)]
        workdir: Option<PathBuf>,
    },
    /// Record overall verification success.
    Pass {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
        /// Pass despite pending manual checks. Flagged in the audit trail.
        #[arg(long)]
        skip_manual: bool,
    },
    /// Record overall verification failure with a structured issue.
    Fail {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
        /// Description of what went wrong.
        #[arg(long)]
        issue: String,
    },
    /// Record a verdict for one manual check.
    Manual {
        id: String,
        check: String,
        verdict: VerdictArg,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long, default_value = "cli")]
        by: String,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VerdictArg {
    Pass,
    Fail,
}

impl From<VerdictArg> for ManualVerdict {
    fn from(arg: VerdictArg) -> Self {
        match arg {
            VerdictArg::Pass => ManualVerdict::Pass,
            VerdictArg::Fail => ManualVerdict::Fail,
        }
    }
}

struct CliError {
    code: i32,
    message: String,
}

impl From<coordinator::io::store::StoreError> for CliError {
    fn from(err: coordinator::io::store::StoreError) -> Self {
        Self {
            code: exit_codes::INVALID,
            message: err.to_string(),
        }
    }
}

impl From<ApplyError> for CliError {
    fn from(err: ApplyError) -> Self {
        let code = match err {
            ApplyError::NotClaimHolder { .. } => exit_codes::BLOCKED,
            _ => exit_codes::INVALID,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl From<ClaimError> for CliError {
    fn from(err: ClaimError) -> Self {
        let code = match err {
            ClaimError::AlreadyClaimed { .. } => exit_codes::BLOCKED,
            ClaimError::Conflicts { .. } => exit_codes::CONFLICT,
            ClaimError::Store(_) => exit_codes::INVALID,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl From<RecordError> for CliError {
    fn from(err: RecordError) -> Self {
        let code = match err {
            RecordError::NotClaimHolder { .. } | RecordError::ManualPending { .. } => {
                exit_codes::BLOCKED
            }
            _ => exit_codes::INVALID,
        };
        Self {
            code,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            code: exit_codes::INVALID,
            message: format!("{err:#}"),
        }
    }
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("{}", err.message);
        std::process::exit(err.code);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let store = RunStore::new(&cli.root);
    let audit = AuditLog::new(&cli.root);
    let config = load_config(&cli.root.join("coordinator.toml"))?;
    let now = Utc::now();

    match cli.command {
        Command::Intake {
            id,
            plan,
            initiative,
            files,
            priority,
            depends_on,
        } => {
            let run = intake::intake(
                &store,
                &audit,
                IntakeRequest {
                    id,
                    plan_path: plan,
                    initiative,
                    files_touched: files,
                    priority,
                    depends_on,
                },
                now,
            )?;
            println!("{} {}", run.id, run.state);
        }
        Command::List => {
            for run in store.list()? {
                let claim_note = match run.active_claim_at(now) {
                    Some(claim) => format!(" [claimed by {}]", claim.claimed_by),
                    None => String::new(),
                };
                println!("{} {}{}", run.id, run.state, claim_note);
            }
        }
        Command::Show { id } => {
            let run = store.load(&id)?;
            let payload = serde_json::to_string_pretty(&run)
                .map_err(|err| anyhow::Error::from(err).context("serialize run"))?;
            println!("{payload}");
        }
        Command::Transition {
            id,
            target,
            actor,
            reason,
            force,
        } => {
            let outcome = if force {
                transition::force_transition(
                    &store,
                    &audit,
                    &id,
                    &target,
                    &actor,
                    reason.as_deref(),
                    now,
                )?
            } else {
                transition::apply_transition(
                    &store,
                    &audit,
                    &id,
                    &target,
                    &actor,
                    reason.as_deref(),
                    now,
                )?
            };
            println!("{} {} -> {}", outcome.run.id, outcome.from, outcome.to);
        }
        Command::Claim {
            id,
            agent,
            ttl_mins,
            force,
        } => {
            let ttl = TimeDelta::minutes(
                ttl_mins.unwrap_or_else(|| config.claim_ttl_mins.try_into().unwrap_or(30)),
            );
            let outcome = claim::claim(&store, &audit, &id, &agent, ttl, force, now)?;
            println!("{id} claimed by {agent} until {}", outcome.claim.claim_expires);
            if let Some(holder) = outcome.overrode_holder {
                println!("overrode holder: {holder}");
            }
            for conflict in outcome.overrode_conflicts {
                println!("overrode conflict: {conflict}");
            }
        }
        Command::Release { id } => {
            let released = claim::release(&store, &audit, &id, now)?;
            println!("{id} {}", if released { "released" } else { "not claimed" });
        }
        Command::Gc { dry_run } => {
            let report = claim::gc(&store, &audit, now, dry_run)?;
            let verb = if report.dry_run { "would release" } else { "released" };
            for expired in &report.expired {
                println!(
                    "{verb} {} (held by {}, expired {})",
                    expired.run_id, expired.claimed_by, expired.claim_expires
                );
            }
            println!("{} expired claim(s)", report.expired.len());
        }
        Command::Verify(verify) => {
            let outcome = match verify {
                VerifyCommand::Run { id, actor, workdir } => {
                    let runner = ShellCheckRunner::new(config.check_output_limit_bytes);
                    let workdir = workdir.unwrap_or_else(|| cli.root.clone());
                    recorder::run_checks(
                        &store,
                        &audit,
                        &runner,
                        &id,
                        &actor,
                        &workdir,
                        config.check_timeout(),
                        now,
                    )?
                }
                VerifyCommand::Pass {
                    id,
                    by,
                    skip_manual,
                } => recorder::record_pass(&store, &audit, &id, &by, skip_manual, now)?,
                VerifyCommand::Fail { id, by, issue } => {
                    recorder::record_fail(&store, &audit, &id, &by, &issue, now)?
                }
                VerifyCommand::Manual {
                    id,
                    check,
                    verdict,
                    reason,
                    by,
                } => recorder::record_manual(
                    &store,
                    &audit,
                    &id,
                    &check,
                    verdict.into(),
                    reason.as_deref(),
                    &by,
                    now,
                )?,
            };
            print_verify_outcome(&outcome);
        }
    }
    Ok(())
}

fn print_verify_outcome(outcome: &VerifyOutcome) {
    println!("{} {}", outcome.run_id, outcome.state);
    for check in &outcome.derived.checks {
        println!("  {} [{}] {:?}", check.name, check.kind, check.status);
    }
    println!("overall: {:?}{}", outcome.derived.overall, if outcome.flagged { " (flagged)" } else { "" });
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
}
