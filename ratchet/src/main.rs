//! Ratchet CLI: drive Red/Green TDD cycles through a resumable,
//! checkpointed graph.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use ratchet::core::ids::RunId;
use ratchet::graph::{RunOutcome, StepEvent, StepReport};
use ratchet::io::paths::init_workspace;
use ratchet::{exit_codes, logging, session};

#[derive(Parser)]
#[command(
    name = "ratchet",
    version,
    about = "Resumable Red/Green TDD cycle runner"
)]
struct Cli {
    /// Workspace root (a git repository).
    #[arg(short = 'C', long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.ratchet/` with a default config.
    Init {
        /// Rewrite the config if `.ratchet/` already exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Start a run from a plan (resumes if the run already has a checkpoint).
    Start {
        run_id: String,
        /// TOML plan with the specification and requirements.
        #[arg(long)]
        plan: PathBuf,
    },
    /// Continue a run from its last checkpoint.
    Resume { run_id: String },
    /// Print a run's checkpoint summary as JSON.
    Status { run_id: String },
    /// Delete a run's checkpoint.
    Clear { run_id: String },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::for_error(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            let paths = init_workspace(&cli.root, force)?;
            println!("initialized {}", paths.ratchet_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Start { run_id, plan } => {
            let run_id = RunId::new(run_id)?;
            let outcome = session::start(&cli.root, &run_id, &plan, print_step)?;
            report_outcome(&run_id, &outcome)
        }
        Command::Resume { run_id } => {
            let run_id = RunId::new(run_id)?;
            let outcome = session::resume(&cli.root, &run_id, print_step)?;
            report_outcome(&run_id, &outcome)
        }
        Command::Status { run_id } => {
            let run_id = RunId::new(run_id)?;
            let status = session::status(&cli.root, &run_id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(exit_codes::OK)
        }
        Command::Clear { run_id } => {
            let run_id = RunId::new(run_id)?;
            if session::clear(&cli.root, &run_id)? {
                println!("cleared {run_id}");
            } else {
                println!("no checkpoint for {run_id}");
            }
            Ok(exit_codes::OK)
        }
    }
}

fn print_step(report: &StepReport) {
    let ms = report.duration.as_millis();
    match &report.event {
        StepEvent::Advanced { next } => {
            println!("[{}] {} -> {next} ({ms} ms)", report.seq, report.node);
        }
        StepEvent::Terminated => println!("[{}] {} done ({ms} ms)", report.seq, report.node),
        StepEvent::Aborted { kind } => {
            println!("[{}] {} aborted: {kind} ({ms} ms)", report.seq, report.node);
        }
    }
}

fn report_outcome(run_id: &RunId, outcome: &RunOutcome) -> Result<i32> {
    match outcome {
        RunOutcome::Terminated { result } => {
            println!("{}", serde_json::to_string_pretty(result)?);
        }
        RunOutcome::Aborted { error } => {
            eprintln!("run {run_id} aborted: {error}");
            eprintln!("checkpoint kept; fix the cause and run `ratchet resume {run_id}`");
        }
    }
    Ok(exit_codes::for_outcome(outcome))
}
