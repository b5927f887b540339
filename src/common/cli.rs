use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "bherd", version, about = "Supervisor for batches of independent LSF jobs")]
pub struct RootOptions {
    #[command(flatten)]
    pub common: CommonOpts,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Args)]
pub struct CommonOpts {
    /// Log every job state transition
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Ordered queue names, shortest runtime limit first
    #[arg(
        long,
        global = true,
        value_delimiter = ',',
        default_value = "short,medium,long"
    )]
    pub queues: Vec<String>,

    /// How many times a crashed job is resubmitted before it is given up on
    #[arg(long, global = true, default_value_t = 3)]
    pub max_resubmissions: u32,

    /// Give up on a job that exceeded its queue runtime limit instead of
    /// resubmitting it
    #[arg(long, global = true)]
    pub no_resubmit_on_limit: bool,

    /// Resubmit a job that exceeded its queue runtime limit to the same
    /// queue instead of promoting it
    #[arg(long, global = true, conflicts_with = "no_resubmit_on_limit")]
    pub resubmit_same_queue_on_limit: bool,

    /// Keep a versioned backup of every ledger file rewrite
    #[arg(long, global = true)]
    pub keep_backup_files: bool,
}

#[derive(Subcommand)]
pub enum Action {
    /// Submit every command from the job file and wait for the batch
    Make(SubmitOpts),
    /// Submit every command from the job file and return immediately
    Push(SubmitOpts),
    /// Resubmit all currently retriable crashed jobs once
    #[command(name = "pushCrashed")]
    PushCrashed(ListOpts),
    /// Reconcile once and report the batch state
    Check(ListOpts),
    /// Poll the batch until it succeeds or crashes for good
    Wait(ListOpts),
    /// Cancel all pending and running jobs
    Stop(ListOpts),
    /// Cancel all pending jobs, let running ones finish
    Chill(ListOpts),
    /// Report runtime statistics and an estimated time to completion
    Time(ListOpts),
    /// Write the commands of all crashed jobs to a file
    Crashed(CrashedOpts),
    /// Remove all files of a finished or stopped job list
    Clean(ListOpts),
}

#[derive(Args)]
pub struct SubmitOpts {
    /// Name of the job list
    pub name: String,

    /// File with one shell command per line
    pub job_file: PathBuf,

    /// Queue for the initial submission (defaults to the first queue)
    #[arg(long, short)]
    pub queue: Option<String>,

    /// Additional submission parameters, passed to the scheduler verbatim
    #[arg(long, short)]
    pub parameters: Option<String>,
}

#[derive(Args)]
pub struct ListOpts {
    /// Name of the job list
    pub name: String,
}

#[derive(Args)]
pub struct CrashedOpts {
    /// Name of the job list
    pub name: String,

    /// File the crashed commands are written to, one per line
    pub output_file: PathBuf,
}
