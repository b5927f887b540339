//! The seam between the supervisor and the batch system. The supervisor only
//! consumes the typed records defined here; everything LSF-specific (command
//! invocation, textual parsing) lives in the [`lsf`] module, so a different
//! scheduler can be supported by swapping the adapter.
pub mod lsf;

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::str::FromStr;

/// Scheduler-assigned job identifier.
pub type JobId = u64;

pub type SchedResult<T> = anyhow::Result<T>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pend,
    Run,
    Done,
    Exit,
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pend => f.write_str("PEND"),
            JobState::Run => f.write_str("RUN"),
            JobState::Done => f.write_str("DONE"),
            JobState::Exit => f.write_str("EXIT"),
        }
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PEND" => Ok(JobState::Pend),
            "RUN" => Ok(JobState::Run),
            "DONE" => Ok(JobState::Done),
            "EXIT" => Ok(JobState::Exit),
            _ => Err(anyhow::anyhow!("Unknown job state `{s}`")),
        }
    }
}

/// How a finished job ended, as recovered from its output file or history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    Success,
    RuntimeLimit,
    OtherFailure,
}

/// Result of one batched status query.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub states: HashMap<JobId, JobState>,
    /// IDs the scheduler no longer recognises; their fate has to be
    /// recovered from history and the output file.
    pub missing: Vec<JobId>,
}

/// Parsed per-job history record. All timestamps are epoch seconds.
#[derive(Debug, Clone, Default)]
pub struct JobHistory {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Runtime as reported by the scheduler itself, when available.
    pub run_seconds: Option<i64>,
    pub termination: Option<TerminationKind>,
}

/// Interface of the batch system as consumed by the supervisor.
pub trait Scheduler {
    /// Submits `command` to `queue` and returns the scheduler-assigned ID.
    fn submit(
        &mut self,
        queue: &str,
        parameters: &str,
        output_path: &Path,
        command: &str,
    ) -> SchedResult<JobId>;

    /// Gets the states of a batch of jobs. This takes multiple IDs at once
    /// to amortize the query cost.
    fn query(&mut self, ids: &[JobId]) -> SchedResult<QueryResult>;

    /// Gets the detailed history of a single job.
    fn history(&mut self, id: JobId) -> SchedResult<JobHistory>;

    /// Classifies a finished job's termination from its output file.
    fn classify_output(&mut self, output_path: &Path) -> SchedResult<TerminationKind>;

    /// Cancels a job, if it still exists.
    fn cancel(&mut self, id: JobId) -> SchedResult<()>;
}
