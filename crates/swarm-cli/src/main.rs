mod config;
mod stub_provider;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use swarm_core::queue::Decomposition;
use swarm_core::types::{ModelId, WorkerSpec};
use swarm_core::{Event, EventBus, SwarmOrchestrator, SwarmOutcome};

use stub_provider::StubProvider;

#[derive(Parser)]
#[command(name = "swarm", about = "DAG-aware orchestrator for fleets of LLM coding agents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default swarm config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Validate a plan file (decomposition JSON) without running it
    Validate {
        /// Path to a JSON-encoded decomposition
        plan: PathBuf,
    },
    /// Run a plan to completion against stub providers
    Run {
        /// Path to a JSON-encoded decomposition
        plan: PathBuf,
        /// Path to a JSON-encoded worker list; defaults to one stub
        /// worker per subtask type found in the plan
        #[arg(long)]
        workers: Option<PathBuf>,
        /// Maximum concurrently dispatched tasks
        #[arg(long, default_value_t = 4)]
        max_concurrency: usize,
    },
}

fn load_decomposition(path: &PathBuf) -> Result<Decomposition> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read plan file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse plan file {}", path.display()))
}

fn load_workers(path: &PathBuf) -> Result<Vec<WorkerSpec>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read worker file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse worker file {}", path.display()))
}

/// A generalist worker covering every subtask type seen in the plan,
/// used when no `--workers` file is supplied.
fn default_workers(decomposition: &Decomposition) -> Vec<WorkerSpec> {
    let capabilities: std::collections::BTreeSet<_> = decomposition.subtasks.iter().map(|s| s.task_type).collect();
    vec![WorkerSpec::new("generalist", "stub-model", capabilities)]
}

async fn cmd_run(plan: PathBuf, workers: Option<PathBuf>, max_concurrency: usize) -> Result<()> {
    let swarm_config = config::load_or_default()?;
    let decomposition = load_decomposition(&plan)?;
    let workers = match workers {
        Some(path) => load_workers(&path)?,
        None => default_workers(&decomposition),
    };

    let mut providers: HashMap<ModelId, Arc<dyn swarm_core::provider::Provider>> = HashMap::new();
    for worker in &workers {
        providers.entry(worker.model.clone()).or_insert_with(|| Arc::new(StubProvider::new(worker.model.clone())));
    }

    let events = EventBus::new(swarm_config.event_bus_capacity);
    let mut subscriber = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = subscriber.recv().await {
            log_event(&event);
        }
    });

    let mut orchestrator = SwarmOrchestrator::new(swarm_config, decomposition, workers, providers, None, events, max_concurrency)
        .await
        .context("failed to build swarm orchestrator")?;

    match orchestrator.run().await? {
        SwarmOutcome::Completed => println!("swarm run complete."),
        SwarmOutcome::BudgetExceeded => println!("swarm run stopped: budget exceeded."),
        SwarmOutcome::Interrupted => println!("swarm run interrupted."),
    }

    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::TaskDispatched { task_id, model, wave } => {
            tracing::info!(%task_id, %model, wave, "dispatched");
        }
        Event::TaskCompleted { task_id } => {
            tracing::info!(%task_id, "completed");
        }
        Event::TaskFailed { task_id, failure_mode } => {
            tracing::warn!(%task_id, ?failure_mode, "failed");
        }
        Event::WaveStart { wave } => {
            tracing::info!(wave, "wave start");
        }
        Event::WaveComplete { wave } => {
            tracing::info!(wave, "wave complete");
        }
        Event::BudgetWarning { percent_used, reason } => {
            tracing::warn!(percent_used, reason, "budget warning");
        }
        Event::BudgetExceeded { reason } => {
            tracing::error!(reason, "budget exceeded");
        }
        Event::DoomLoopDetected { task_id, global, .. } => {
            tracing::warn!(%task_id, global, "doom loop detected");
        }
        Event::SwarmComplete => {
            tracing::info!("swarm complete");
        }
        _ => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { force } => {
            let path = config::write_default(force)?;
            println!("config written to {}", path.display());
        }
        Commands::Validate { plan } => {
            let decomposition = load_decomposition(&plan)?;
            let swarm_config = config::load_or_default()?;
            let queue = swarm_core::TaskQueue::load_from_decomposition(decomposition, swarm_config.queue_config())
                .context("plan failed validation")?;
            println!("plan is valid: {} tasks across {} waves.", queue.tasks().len(), queue.total_waves());
        }
        Commands::Run { plan, workers, max_concurrency } => {
            cmd_run(plan, workers, max_concurrency).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use swarm_core::types::SubtaskType;

    #[test]
    fn default_workers_covers_every_subtask_type_in_plan() {
        let decomposition = swarm_test_utils::decomposition(vec![
            swarm_test_utils::subtask("a", SubtaskType::Research, 3, &[]),
            swarm_test_utils::subtask("b", SubtaskType::Implement, 4, &["a"]),
        ]);
        let workers = default_workers(&decomposition);
        assert_eq!(workers.len(), 1);
        assert!(workers[0].capabilities.contains(&SubtaskType::Research));
        assert!(workers[0].capabilities.contains(&SubtaskType::Implement));
    }

    #[test]
    fn load_decomposition_round_trips_through_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("plan.json");
        let decomposition = swarm_test_utils::decomposition(vec![swarm_test_utils::subtask("a", SubtaskType::Implement, 3, &[])]);
        std::fs::write(&path, serde_json::to_string(&decomposition).unwrap()).unwrap();

        let loaded = load_decomposition(&path).unwrap();
        assert_eq!(loaded.subtasks.len(), 1);
        assert_eq!(loaded.subtasks[0].id.0, "a");
    }

    #[test]
    fn load_decomposition_rejects_malformed_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("plan.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_decomposition(&path).is_err());
    }
}
