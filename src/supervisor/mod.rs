//! The supervisor: top-level actions composing the ledger, the exclusive
//! lock, the scheduler adapter and the reconciler.
pub mod process;
pub mod reconcile;

use std::time::Duration;

use crate::common::error::error;

/// Queue names in order of increasing runtime limit. Promotion after a
/// runtime-limit crash moves a job one position to the right.
pub const DEFAULT_QUEUES: &[&str] = &["short", "medium", "long"];

/// The only host the supervisor agrees to run on; compute nodes lack the
/// scheduler client tools.
pub const DEFAULT_HEAD_HOST: &str = "hpc-login1";

pub const HEAD_HOST_ENV: &str = "BHERD_HEAD_HOST";

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Ordered queue names, shortest runtime limit first.
    pub queues: Vec<String>,
    /// Crash cap; a job whose fail count reaches this value is terminal.
    pub max_resubmissions: u32,
    /// Give up instead of resubmitting after a runtime-limit crash.
    pub no_resubmit_on_limit: bool,
    /// Resubmit to the same queue instead of promoting after a
    /// runtime-limit crash.
    pub resubmit_same_queue_on_limit: bool,
    pub keep_backups: bool,
    /// Cap on output files per bucket directory.
    pub max_out_files_per_dir: u64,
    /// Cap on IDs per status query.
    pub batch_query_size: usize,
    pub sleep_short: Duration,
    pub sleep_long: Duration,
    /// Number of leading wait cycles that use the short sleep.
    pub fast_cycles: u32,
    pub head_host: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            queues: DEFAULT_QUEUES.iter().map(|q| q.to_string()).collect(),
            max_resubmissions: 3,
            no_resubmit_on_limit: false,
            resubmit_same_queue_on_limit: false,
            keep_backups: false,
            max_out_files_per_dir: 1000,
            batch_query_size: 1000,
            sleep_short: Duration::from_secs(45),
            sleep_long: Duration::from_secs(90),
            fast_cycles: 10,
            head_host: std::env::var(HEAD_HOST_ENV)
                .unwrap_or_else(|_| DEFAULT_HEAD_HOST.to_string()),
        }
    }
}

impl SupervisorConfig {
    pub fn is_valid_queue(&self, queue: &str) -> bool {
        self.queues.iter().any(|q| q == queue)
    }

    pub fn queue_index(&self, queue: &str) -> Option<usize> {
        self.queues.iter().position(|q| q == queue)
    }

    /// The promotion target after a runtime-limit crash, or [`None`] when
    /// the job already sits in the longest queue.
    pub fn next_queue(&self, queue: &str) -> Option<&str> {
        let index = self.queue_index(queue)?;
        self.queues.get(index + 1).map(|q| q.as_str())
    }
}

/// Refuses to run anywhere but on the designated head host.
pub fn check_head_host(config: &SupervisorConfig) -> crate::Result<()> {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| {
        gethostname::gethostname().to_string_lossy().into_owned()
    });
    if host != config.head_host {
        return error(format!(
            "bherd must run on the head host `{}`, but this is `{}`",
            config.head_host, host
        ));
    }
    Ok(())
}
