//! DAG decomposition, wave scheduling, worker dispatch, and
//! budget-aware resilience for LLM agent swarms.
//!
//! The pieces compose roughly bottom-up: [`types`] and [`events`] are
//! the shared vocabulary; [`queue`] schedules work; [`health`] and
//! [`workers`] route it to a model; [`cancel`] bounds how long any one
//! dispatch may run; [`economics`] tracks spend and detects loops;
//! [`resilience`] triages a suspicious completion; [`blackboard`]
//! shares state across concurrent dispatches; [`orchestrator`] drives
//! all of it to completion.

pub mod blackboard;
pub mod cancel;
pub mod config;
pub mod economics;
pub mod events;
pub mod health;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod resilience;
pub mod types;
pub mod workers;

pub use config::SwarmConfig;
pub use events::{Event, EventBus};
pub use orchestrator::{SwarmOrchestrator, SwarmOutcome};
pub use queue::{Decomposition, TaskQueue};
pub use types::{Subtask, SubtaskId, SubtaskType, WorkerSpec};
