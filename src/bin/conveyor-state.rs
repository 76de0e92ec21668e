//! Inspect and repair a Conveyor job state file.
//!
//! Usage:
//!   conveyor-state show --file ./job-state.json
//!   conveyor-state metrics nightly-report --file ./job-state.json
//!   conveyor-state recover --file ./job-state.json --mark-failed

use clap::{Parser, Subcommand};
use conveyor::{
    ConveyorConfig, ExecutionStatus, JobState, JobStateManager, LoggingConfig, StateConfig,
    init_logging,
};
use std::{path::PathBuf, process};

#[derive(Parser)]
#[command(name = "conveyor-state")]
#[command(about = "Inspect and repair Conveyor job state files")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(
        short,
        long,
        global = true,
        help = "State file to read (defaults to the configured state file)",
        value_name = "PATH"
    )]
    file: Option<PathBuf>,

    #[arg(
        short,
        long,
        global = true,
        help = "Conveyor TOML configuration file",
        value_name = "PATH"
    )]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "List every job in the state file")]
    Show,

    #[command(about = "Show execution metrics for one job")]
    Metrics {
        #[arg(help = "Job id")]
        job_id: String,
    },

    #[command(about = "List executions interrupted by a crash")]
    Recover {
        #[arg(long, help = "Mark interrupted executions as failed and save the file")]
        mark_failed: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {}", e);
            process::exit(1);
        }
    };

    let logging = LoggingConfig {
        level: if cli.verbose { "debug" } else { "warn" }.to_string(),
        ..config.logging.clone()
    };
    if let Err(e) = init_logging(&logging) {
        eprintln!("⚠️  {}", e);
    }

    let state = StateConfig {
        auto_persist: false,
        ..config.state
    };
    let result = match cli.command {
        Command::Show => show(state).await,
        Command::Metrics { job_id } => metrics(state, &job_id).await,
        Command::Recover { mark_failed } => recover(state, mark_failed).await,
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {}", e);
        process::exit(1);
    }
}

fn load_config(cli: &Cli) -> conveyor::Result<ConveyorConfig> {
    let mut config = match &cli.config {
        Some(path) => ConveyorConfig::from_file(path)?,
        None => ConveyorConfig::from_env()?,
    };
    if let Some(file) = &cli.file {
        config.state.state_file = file.clone();
    }
    Ok(config)
}

async fn open(state: StateConfig) -> conveyor::Result<JobStateManager> {
    if !state.state_file.exists() {
        return Err(conveyor::ConveyorError::State {
            message: format!("state file {} does not exist", state.state_file.display()),
        });
    }
    let manager = JobStateManager::new(state);
    manager.load_state().await?;
    Ok(manager)
}

fn last_status(state: &JobState) -> String {
    state
        .last_execution
        .as_ref()
        .map(|record| record.status.to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn show(state: StateConfig) -> conveyor::Result<()> {
    let path = state.state_file.clone();
    let manager = open(state).await?;
    let states = manager.get_all_states().await;

    println!("📄 {}", path.display());
    println!();
    if states.is_empty() {
        println!("No jobs recorded.");
        return Ok(());
    }

    println!(
        "{:<24} {:<24} {:>7} {:>6} {:>6} {:>7} {:<10} {}",
        "JOB", "NAME", "ENABLED", "RUNS", "FAILS", "STREAK", "LAST", "NEXT RUN"
    );
    for job in &states {
        println!(
            "{:<24} {:<24} {:>7} {:>6} {:>6} {:>7} {:<10} {}",
            job.job_id,
            job.name,
            if job.enabled { "yes" } else { "no" },
            job.execution_count,
            job.failure_count,
            job.consecutive_failures,
            last_status(job),
            job.next_run
                .map(|next| next.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    println!();
    println!("{} job(s)", states.len());
    Ok(())
}

async fn metrics(state: StateConfig, job_id: &str) -> conveyor::Result<()> {
    let manager = open(state).await?;
    let job = manager
        .get_state(job_id)
        .await
        .ok_or_else(|| conveyor::ConveyorError::JobNotFound {
            id: job_id.to_string(),
        })?;

    let finished = job.execution_count;
    let succeeded = finished.saturating_sub(job.failure_count);
    let rate = |count: u64| {
        if finished == 0 {
            0.0
        } else {
            count as f64 / finished as f64 * 100.0
        }
    };

    println!("📊 {} ({})", job.job_id, job.name);
    println!("Executions:           {}", finished);
    println!("Succeeded:            {} ({:.1}%)", succeeded, rate(succeeded));
    println!("Failed:               {} ({:.1}%)", job.failure_count, rate(job.failure_count));
    println!("Consecutive failures: {}", job.consecutive_failures);
    if let Some(last) = &job.last_execution {
        println!(
            "Last execution:       {} {} at {}{}",
            last.execution_id,
            last.status,
            last.start_time.to_rfc3339(),
            last.duration
                .map(|ms| format!(" ({} ms)", ms))
                .unwrap_or_default()
        );
        if let Some(error) = &last.error {
            println!("Last error:           {}", error);
        }
    }
    Ok(())
}

async fn recover(state: StateConfig, mark_failed: bool) -> conveyor::Result<()> {
    let manager = open(state).await?;
    let interrupted = manager.running_executions().await;

    if interrupted.is_empty() {
        println!("✅ No interrupted executions.");
        return Ok(());
    }

    println!("⚠️  {} interrupted execution(s):", interrupted.len());
    for record in &interrupted {
        println!(
            "  {} / {} started {}",
            record.job_id,
            record.execution_id,
            record.start_time.to_rfc3339()
        );
    }

    if !mark_failed {
        println!();
        println!("💡 Run again with --mark-failed to close them as failed.");
        return Ok(());
    }

    for record in &interrupted {
        manager
            .end_execution(
                &record.execution_id,
                ExecutionStatus::Failed,
                Some("interrupted: process stopped while running".to_string()),
            )
            .await?;
    }
    manager.persist_state().await?;
    println!("✅ Marked {} execution(s) as failed.", interrupted.len());
    Ok(())
}
