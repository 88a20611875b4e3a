//! Fixed notice strings injected into a worker's context when the
//! economics layer needs to steer behavior rather than abort outright.
//! Kept as constants instead of format strings scattered through
//! `mod.rs` so their wording stays auditable in one place.

pub const MAX_STEPS_PROMPT: &str =
    "Token budget usage has crossed the warning threshold. Prioritize converging on a result over further exploration.";

pub const DOOM_LOOP_PROMPT: &str =
    "The last several actions on this task were functionally identical. Try a materially different approach.";

pub const GLOBAL_DOOM_LOOP_PROMPT: &str =
    "Another worker in this swarm is repeating the same action you are. Stop and reconsider the approach before retrying.";

pub const EXPLORATION_NUDGE_PROMPT: &str =
    "This task has spent an unusual number of tool calls exploring without producing a plan. Commit to a plan now.";

pub const TEST_FIX_RETHINK_PROMPT: &str =
    "Repeated attempts to fix this test have not worked. Re-read the failure output from scratch before changing anything else.";

pub const BASH_FAILURE_CASCADE_PROMPT: &str =
    "Several shell commands have failed in a row. Check your working directory and assumptions before issuing another command.";

pub const SUMMARY_LOOP_PROMPT: &str =
    "You are repeating a summary of work already reported. Either take a new action or declare the task complete.";
