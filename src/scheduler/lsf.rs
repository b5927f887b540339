use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::{Command, Output};
use std::time::Duration;

use anyhow::Context;
use bstr::ByteSlice;

use crate::common::utils::time::{local_datetime_to_epoch, parse_lsf_datetime};
use crate::scheduler::{
    JobHistory, JobId, JobState, QueryResult, SchedResult, Scheduler, TerminationKind,
};

/// Marker LSF writes into the output file of a job killed by its queue's
/// runtime limit.
const RUNLIMIT_MARKER: &str = "TERM_RUNLIMIT: job killed after reaching LSF run time limit";

/// Marker LSF writes into the output file of a successfully finished job.
const SUCCESS_MARKER: &str = "Successfully completed.";

/// Replies that mean "the batch daemon is overloaded, ask again later".
const BUSY_MARKERS: &[&str] = &["not responding", "Please wait"];

/// Reply of `bhist` when the live event log no longer knows the job.
const UNKNOWN_JOB_MARKER: &str = "No matching job found";

/// Characters that force the command payload through an explicit `sh -c`
/// wrapper so they survive the scheduler's own shell invocation.
const SHELL_METACHARACTERS: &[char] = &[
    '!', '$', '^', '&', '*', '(', ')', '{', '}', '"', '\'', '?',
];

#[derive(Debug, Clone)]
pub struct LsfOptions {
    /// Upper bound on the number of IDs per `bjobs` invocation.
    pub batch_query_size: usize,
    /// Sleep between retries while the batch daemon reports busy.
    pub busy_backoff: Duration,
    /// Only status rows of this user are trusted; rows of other users are
    /// discarded.
    pub user: Option<String>,
}

impl Default for LsfOptions {
    fn default() -> Self {
        Self {
            batch_query_size: 1000,
            busy_backoff: Duration::from_secs(180),
            user: std::env::var("USER").ok(),
        }
    }
}

/// Runs one external command to completion. The seam exists so adapter tests
/// can script scheduler replies without a cluster.
pub trait RunCommand {
    fn run(&mut self, program: &str, args: &[String]) -> std::io::Result<Output>;
}

struct ProcessRunner;

impl RunCommand for ProcessRunner {
    fn run(&mut self, program: &str, args: &[String]) -> std::io::Result<Output> {
        Command::new(program).args(args).output()
    }
}

/// Adapter around the LSF command-line tools (`bsub`, `bjobs`, `bhist`,
/// `bkill`).
pub struct LsfScheduler {
    opts: LsfOptions,
    runner: Box<dyn RunCommand>,
}

impl LsfScheduler {
    pub fn new(opts: LsfOptions) -> Self {
        Self {
            opts,
            runner: Box::new(ProcessRunner),
        }
    }

    #[cfg(test)]
    fn with_runner(opts: LsfOptions, runner: Box<dyn RunCommand>) -> Self {
        Self { opts, runner }
    }

    /// Runs one LSF command and treats a nonzero exit as an error carrying
    /// the command's stderr.
    fn run_checked(&mut self, program: &str, args: &[String]) -> SchedResult<Output> {
        log::debug!("Running LSF command `{} {}`", program, args.join(" "));
        let output = self
            .runner
            .run(program, args)
            .with_context(|| format!("{program} start failed"))?;
        if !output.status.success() {
            anyhow::bail!(
                "{program} failed with exit code {}: {}",
                output.status.code().unwrap_or(-1),
                output.stderr.to_str_lossy().trim()
            );
        }
        Ok(output)
    }
}

impl Scheduler for LsfScheduler {
    fn submit(
        &mut self,
        queue: &str,
        parameters: &str,
        output_path: &Path,
        command: &str,
    ) -> SchedResult<JobId> {
        let mut args: Vec<String> = vec!["-q".to_string(), queue.to_string()];
        args.extend(parameters.split_whitespace().map(String::from));
        args.push("-o".to_string());
        args.push(output_path.display().to_string());
        args.push(escape_command(command));

        let output = self.run_checked("bsub", &args)?;
        let reply = output.stdout.to_str_lossy();
        parse_submit_reply(&reply)
    }

    fn query(&mut self, ids: &[JobId]) -> SchedResult<QueryResult> {
        debug_assert!(ids.len() <= self.opts.batch_query_size);
        if ids.is_empty() {
            return Ok(QueryResult::default());
        }

        let args: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        loop {
            let output = self
                .runner
                .run("bjobs", &args)
                .context("bjobs start failed")?;
            let stdout = output.stdout.to_str_lossy().into_owned();
            let stderr = output.stderr.to_str_lossy().into_owned();

            if is_busy_reply(&stdout, &stderr) {
                log::warn!(
                    "Batch system busy, retrying bjobs in {}",
                    humantime::format_duration(self.opts.busy_backoff)
                );
                std::thread::sleep(self.opts.busy_backoff);
                continue;
            }

            let (states, seen) = parse_bjobs(&stdout, self.opts.user.as_deref());

            // bjobs exits nonzero when some of the queried jobs have already
            // been forgotten; that case is handled through `missing`.
            if seen.is_empty() && !output.status.success() && !stderr.contains("is not found") {
                anyhow::bail!("bjobs failed: {}", stderr.trim());
            }

            let missing = ids.iter().copied().filter(|id| !seen.contains(id)).collect();
            return Ok(QueryResult { states, missing });
        }
    }

    fn history(&mut self, id: JobId) -> SchedResult<JobHistory> {
        let args = vec!["-l".to_string(), id.to_string()];
        let output = self
            .runner
            .run("bhist", &args)
            .context("bhist start failed")?;
        let text = output.stdout.to_str_lossy().into_owned();

        let text = if !output.status.success() || text.contains(UNKNOWN_JOB_MARKER) {
            // The live event log rotates; `-n 0` searches every archived log
            // file, which is slower but reaches old jobs.
            let args = vec![
                "-n".to_string(),
                "0".to_string(),
                "-l".to_string(),
                id.to_string(),
            ];
            let output = self.run_checked("bhist", &args)?;
            output.stdout.to_str_lossy().into_owned()
        } else {
            text
        };

        Ok(parse_bhist(&text))
    }

    fn classify_output(&mut self, output_path: &Path) -> SchedResult<TerminationKind> {
        let text = std::fs::read_to_string(output_path)
            .with_context(|| format!("Cannot read job output {}", output_path.display()))?;
        Ok(classify_output_text(&text))
    }

    fn cancel(&mut self, id: JobId) -> SchedResult<()> {
        let args = vec![id.to_string()];
        self.run_checked("bkill", &args)?;
        Ok(())
    }
}

/// Escapes a command payload so that it survives exactly one additional
/// round of shell interpretation on the execution host.
///
/// Commands with shell metacharacters are wrapped as `sh -c '<payload>'`,
/// with embedded single quotes spelled `'\''` so the payload reaching `sh`
/// is byte-identical to the user's input. Plain commands are only wrapped in
/// double quotes.
pub fn escape_command(command: &str) -> String {
    if command.contains(SHELL_METACHARACTERS) {
        let payload = command.replace('\'', r"'\''");
        format!("sh -c '{payload}'")
    } else {
        format!("\"{command}\"")
    }
}

/// Extracts the numeric job ID from a `bsub` reply such as
/// `Job <12345> is submitted to queue <short>.`
pub fn parse_submit_reply(reply: &str) -> SchedResult<JobId> {
    let id = reply
        .split_once('<')
        .and_then(|(_, rest)| rest.split_once('>'))
        .map(|(id, _)| id)
        .ok_or_else(|| anyhow::anyhow!("Unexpected bsub reply: {}", reply.trim()))?;
    id.parse()
        .map_err(|_| anyhow::anyhow!("Non-numeric job id in bsub reply: {}", reply.trim()))
}

fn is_busy_reply(stdout: &str, stderr: &str) -> bool {
    BUSY_MARKERS
        .iter()
        .any(|marker| stdout.contains(marker) || stderr.contains(marker))
}

/// Parses the tabular `bjobs` reply. Returns the per-ID states plus the set
/// of IDs that appeared in the output at all; rows whose state column cannot
/// be interpreted stay in the seen set so the job is treated as unchanged
/// rather than missing.
fn parse_bjobs(stdout: &str, user: Option<&str>) -> (HashMap<JobId, JobState>, HashSet<JobId>) {
    let mut states = HashMap::new();
    let mut seen = HashSet::new();

    for line in stdout.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 || fields[0] == "JOBID" {
            continue;
        }
        let id: JobId = match fields[0].parse() {
            Ok(id) => id,
            Err(_) => continue,
        };
        if let Some(user) = user {
            if fields[1] != user {
                log::debug!("Ignoring bjobs row of foreign user {}: {}", fields[1], line);
                continue;
            }
        }
        seen.insert(id);
        match fields[2].parse::<JobState>() {
            Ok(state) => {
                states.insert(id, state);
            }
            Err(_) => {
                log::warn!("Unexpected bjobs status line, leaving job {id} unchanged: {line}");
            }
        }
    }

    (states, seen)
}

/// Parses the long `bhist -l` report of one job. Timestamps come from the
/// `Dispatched` and `Done successfully`/`Exited` event lines.
fn parse_bhist(text: &str) -> JobHistory {
    let mut history = JobHistory::default();

    for line in text.lines() {
        let line = line.trim();
        if let Some((stamp, event)) = line.split_once(": ") {
            if event.starts_with("Dispatched") && history.start_time.is_none() {
                history.start_time = parse_event_time(stamp);
            } else if event.starts_with("Done successfully") {
                history.end_time = parse_event_time(stamp);
                history.termination.get_or_insert(TerminationKind::Success);
            } else if event.starts_with("Exited") {
                history.end_time = parse_event_time(stamp);
                history
                    .termination
                    .get_or_insert(TerminationKind::OtherFailure);
            }
        }
        if line.contains("TERM_RUNLIMIT") {
            history.termination = Some(TerminationKind::RuntimeLimit);
        }
    }

    history
}

fn parse_event_time(stamp: &str) -> Option<i64> {
    match parse_lsf_datetime(stamp) {
        Ok(datetime) => Some(local_datetime_to_epoch(datetime)),
        Err(error) => {
            log::warn!("Cannot parse bhist timestamp `{stamp}`: {error:?}");
            None
        }
    }
}

fn classify_output_text(text: &str) -> TerminationKind {
    if text.contains(RUNLIMIT_MARKER) {
        TerminationKind::RuntimeLimit
    } else if text.contains(SUCCESS_MARKER) {
        TerminationKind::Success
    } else {
        TerminationKind::OtherFailure
    }
}
