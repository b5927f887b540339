//! The persistent ledger of one job list: the immutable job catalog, the
//! per-job status, the saved submission parameters and the job count. The
//! ledger is the supervisor's ground truth between reconciliations.
pub mod lock;
pub mod store;

use std::path::{Path, PathBuf};

use crate::scheduler::{JobId, JobState};

/// Runtime value of a job that has not finished yet.
pub const UNKNOWN_RUNTIME: i64 = -1;

/// One catalog entry. Immutable after submission, except for the current
/// scheduler ID and the queue, which change when the job is resubmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub current_id: JobId,
    /// Relative path `<list>/<bucket>/o.<index>`, also used as the
    /// scheduler's output-file path.
    pub internal_name: String,
    pub queue: String,
    pub command: String,
}

/// Mutable per-job record, rewritten on every reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub current_id: JobId,
    pub internal_name: String,
    pub state: JobState,
    /// How many times this job has crashed so far.
    pub fail_count: u32,
    /// Runtime in seconds; [`UNKNOWN_RUNTIME`] until the job finished, then
    /// frozen.
    pub runtime: i64,
}

impl JobStatus {
    pub fn pending(id: JobId, internal_name: String) -> Self {
        Self {
            current_id: id,
            internal_name,
            state: JobState::Pend,
            fail_count: 0,
            runtime: UNKNOWN_RUNTIME,
        }
    }
}

/// Filesystem layout of one job list inside a working directory.
///
/// The ledger files live in the hidden directory `.<name>/`, the scheduler
/// output files in `<name>/<bucket>/`, and the lock file next to both as
/// `lockFile.<name>`.
#[derive(Debug, Clone)]
pub struct LedgerPaths {
    root: PathBuf,
    name: String,
}

impl LedgerPaths {
    pub fn new<P: Into<PathBuf>>(root: P, name: &str) -> Self {
        Self {
            root: root.into(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join(format!(".{}", self.name))
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.ledger_dir().join("jobs")
    }

    pub fn status_file(&self) -> PathBuf {
        self.ledger_dir().join("status")
    }

    pub fn params_file(&self) -> PathBuf {
        self.ledger_dir().join("params")
    }

    pub fn count_file(&self) -> PathBuf {
        self.ledger_dir().join("count")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(format!("lockFile.{}", self.name))
    }

    pub fn output_root(&self) -> PathBuf {
        self.root.join(&self.name)
    }

    /// Builds the internal name of the job with the given catalog index.
    /// Output files are spread over numbered bucket directories to cap the
    /// number of files per directory.
    pub fn internal_name(&self, index: u64, max_files_per_dir: u64) -> String {
        let bucket = index / max_files_per_dir + 1;
        format!("{}/{}/o.{}", self.name, bucket, index)
    }

    /// Resolves an internal name into the on-disk output-file path.
    pub fn output_file(&self, internal_name: &str) -> PathBuf {
        self.root.join(internal_name)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
