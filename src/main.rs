// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! codecrew CLI.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tokio_util::sync::CancellationToken;

use codecrew::config::Config;
use codecrew::session::{SessionEventKind, SessionManager};
use codecrew::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "codecrew", version, about = "A team of coding agents for one task")]
struct Cli {
    /// Repository to operate on (defaults to the current directory).
    #[arg(long, global = true)]
    repo: Option<PathBuf>,

    /// Agent binary to spawn in app-server mode.
    #[arg(long, global = true)]
    agent_bin: Option<PathBuf>,

    /// Maximum number of concurrently running tasks.
    #[arg(long, global = true)]
    max_parallel: Option<usize>,

    /// Verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose a task, execute the graph, and merge the results.
    Run {
        /// The task to carry out.
        task: String,
    },
    /// Decompose a task and print the planned graph without executing it.
    Plan {
        /// The task to analyse.
        task: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let telemetry = if cli.verbose {
        TelemetryConfig::development()
    } else {
        TelemetryConfig::default()
    };
    init_telemetry(&telemetry);

    let repo = match &cli.repo {
        Some(repo) => repo.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = Config::load(&repo)?;
    if let Some(agent_bin) = cli.agent_bin {
        config.agent_bin = agent_bin;
    }
    if let Some(max_parallel) = cli.max_parallel {
        config.max_parallel = max_parallel;
    }
    config.repo_path = repo;

    let manager = SessionManager::new(config);
    let cancel = CancellationToken::new();

    match cli.command {
        Commands::Run { task } => run(&manager, &task, &cancel).await,
        Commands::Plan { task } => plan(&manager, &task, &cancel).await,
    }
}

async fn run(
    manager: &SessionManager,
    task: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let session = manager.create(task).await;
    println!("{} {}", "session".bold(), session.id);

    // Print task lifecycle events as they happen.
    let mut events = session.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let task_id = event.task_id.as_deref().unwrap_or("-");
            match event.kind {
                SessionEventKind::TaskStarted => {
                    println!("  {} {}", "started".cyan(), task_id);
                }
                SessionEventKind::TaskCompleted => {
                    println!("  {} {}", "completed".green(), task_id);
                }
                SessionEventKind::TaskFailed => {
                    let reason = event.data.as_deref().unwrap_or("unknown");
                    println!("  {} {} ({reason})", "failed".red(), task_id);
                }
                _ => {}
            }
        }
    });

    session.decompose(cancel).await?;
    let tasks = session.dag.tasks().await;
    println!("{} {} sub-tasks", "decomposed".bold(), tasks.len());

    session.execute(cancel).await?;
    session.merge(cancel).await?;
    printer.abort();

    println!("{}", "merged".green().bold());
    Ok(())
}

async fn plan(
    manager: &SessionManager,
    task: &str,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let session = manager.create(task).await;
    session.decompose(cancel).await?;

    let tasks = session.dag.topological_order().await?;
    println!("{} ({} sub-tasks)", "plan".bold(), tasks.len());
    for task in tasks {
        let deps = if task.depends_on.is_empty() {
            String::new()
        } else {
            format!("  <- {}", task.depends_on.join(", ")).dimmed().to_string()
        };
        println!("  {} {}{deps}", task.id.cyan(), task.title);
    }
    Ok(())
}
