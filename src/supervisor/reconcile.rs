use std::collections::HashMap;

use crate::common::error::corrupt;
use crate::ledger::{Job, JobStatus, LedgerPaths};
use crate::scheduler::{JobHistory, JobId, JobState, Scheduler, TerminationKind};
use crate::supervisor::SupervisorConfig;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tallies {
    pub pend: usize,
    pub run: usize,
    pub done: usize,
    pub fail: usize,
    pub retriable: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Some jobs are still pending or running.
    Active,
    /// Every job finished successfully.
    AllDone,
    /// Nothing is active, at least one job crashed for good and none can be
    /// retried.
    AllFailed,
    /// Nothing is active, but at least one crashed job can still be retried.
    AllSettledRetriable,
}

impl BatchOutcome {
    pub fn code(&self) -> i32 {
        match self {
            BatchOutcome::AllDone => 1,
            BatchOutcome::AllFailed => -1,
            BatchOutcome::AllSettledRetriable => -2,
            BatchOutcome::Active => 0,
        }
    }
}

/// A crashed job the supervisor should submit again, with the queue of the
/// next attempt already decided by the promotion rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resubmission {
    pub id: JobId,
    pub queue: String,
}

#[derive(Debug)]
pub struct ReconcileReport {
    pub tallies: Tallies,
    pub outcome: BatchOutcome,
    pub resubmit: Vec<Resubmission>,
}

/// One reconciliation pass: probes the scheduler for every unfinished job,
/// applies the state transition table to `status` in place, and reports the
/// tallies, the batch outcome and the jobs to resubmit.
///
/// Jobs the scheduler no longer knows are settled from their history and
/// output file. A status row the scheduler answered with something
/// unparsable is left untouched and probed again next cycle.
pub fn reconcile(
    scheduler: &mut dyn Scheduler,
    config: &SupervisorConfig,
    paths: &LedgerPaths,
    jobs: &[Job],
    status: &mut [JobStatus],
) -> crate::Result<ReconcileReport> {
    let list = paths.name();

    let probe: Vec<JobId> = status
        .iter()
        .filter(|entry| entry.state != JobState::Done)
        .map(|entry| entry.current_id)
        .collect();

    let mut observed: HashMap<JobId, JobState> = HashMap::new();
    let mut missing: Vec<JobId> = Vec::new();
    for chunk in probe.chunks(config.batch_query_size) {
        let mut result = scheduler.query(chunk)?;
        observed.extend(result.states.drain());
        missing.append(&mut result.missing);
    }

    let index_of: HashMap<JobId, usize> = status
        .iter()
        .enumerate()
        .map(|(index, entry)| (entry.current_id, index))
        .collect();

    let mut histories: HashMap<JobId, JobHistory> = HashMap::new();
    let mut terminations: HashMap<JobId, TerminationKind> = HashMap::new();
    for id in missing {
        let Some(&index) = index_of.get(&id) else {
            return corrupt(list, format!("scheduler reported unknown job id {id}"));
        };
        let history = scheduler.history(id)?;
        let kind = resolve_termination(scheduler, paths, &status[index], &history);
        let state = if kind == TerminationKind::Success {
            JobState::Done
        } else {
            JobState::Exit
        };
        log::debug!("Job {id} is gone from the scheduler, resolved to {state} from its history");
        observed.insert(id, state);
        histories.insert(id, history);
        terminations.insert(id, kind);
    }

    for entry in status.iter_mut() {
        let Some(&new_state) = observed.get(&entry.current_id) else {
            continue;
        };
        let old_state = entry.state;
        if new_state != old_state {
            log::debug!(
                "Job {} ({}): {} -> {}",
                entry.current_id,
                entry.internal_name,
                old_state,
                new_state
            );
        }

        match (old_state, new_state) {
            (JobState::Pend, JobState::Pend)
            | (JobState::Run, JobState::Run)
            | (JobState::Done, JobState::Done) => {}
            (JobState::Pend, JobState::Run)
            | (JobState::Exit, JobState::Pend)
            | (JobState::Exit, JobState::Run) => {
                entry.state = new_state;
            }
            (JobState::Pend | JobState::Run | JobState::Exit, JobState::Done) => {
                let history = match histories.remove(&entry.current_id) {
                    Some(history) => history,
                    None => scheduler.history(entry.current_id)?,
                };
                match extract_runtime(&history, list, entry.current_id)? {
                    Some(runtime) => {
                        entry.state = JobState::Done;
                        entry.runtime = runtime;
                    }
                    None => {
                        log::warn!(
                            "Runtime of finished job {} is not derivable yet, probing it again next cycle",
                            entry.current_id
                        );
                    }
                }
            }
            (JobState::Pend | JobState::Run, JobState::Exit) => {
                entry.state = JobState::Exit;
                entry.fail_count += 1;
            }
            (JobState::Exit, JobState::Exit) => {
                // The crash was already counted when it was first observed.
            }
            (old, new) => {
                return corrupt(
                    list,
                    format!("job {} would transition {old} -> {new}", entry.current_id),
                );
            }
        }
    }

    // Decide the fate of every crashed job that is still under the cap:
    // promotion to a longer queue, a retry in the same queue, or none at all.
    let mut resubmit = Vec::new();
    for (job, entry) in jobs.iter().zip(status.iter_mut()) {
        if entry.state != JobState::Exit
            || !observed.contains_key(&entry.current_id)
            || entry.fail_count >= config.max_resubmissions
        {
            continue;
        }
        let kind = match terminations.get(&entry.current_id) {
            Some(kind) => *kind,
            None => {
                let path = paths.output_file(&entry.internal_name);
                scheduler.classify_output(&path).unwrap_or_else(|error| {
                    log::debug!(
                        "Cannot classify output of job {}: {error:?}",
                        entry.current_id
                    );
                    TerminationKind::OtherFailure
                })
            }
        };
        if let Some(queue) = classify_crash(config, &job.queue, kind, entry) {
            resubmit.push(Resubmission {
                id: entry.current_id,
                queue,
            });
        }
    }

    let mut tallies = Tallies {
        retriable: resubmit.len(),
        ..Default::default()
    };
    for entry in status.iter() {
        match entry.state {
            JobState::Pend => tallies.pend += 1,
            JobState::Run => tallies.run += 1,
            JobState::Done => tallies.done += 1,
            JobState::Exit => tallies.fail += 1,
        }
    }

    let outcome = if tallies.done == status.len() {
        BatchOutcome::AllDone
    } else if tallies.pend == 0 && tallies.run == 0 {
        if resubmit.is_empty() {
            BatchOutcome::AllFailed
        } else {
            BatchOutcome::AllSettledRetriable
        }
    } else {
        BatchOutcome::Active
    };

    Ok(ReconcileReport {
        tallies,
        outcome,
        resubmit,
    })
}

/// Picks the queue of the next attempt for a crashed job, or [`None`] when
/// the job must not be resubmitted. May force the fail count to the cap when
/// runtime-limit crashes are configured to be final.
fn classify_crash(
    config: &SupervisorConfig,
    queue: &str,
    kind: TerminationKind,
    entry: &mut JobStatus,
) -> Option<String> {
    match kind {
        TerminationKind::RuntimeLimit if config.no_resubmit_on_limit => {
            log::info!(
                "Job {} exceeded its queue runtime limit, giving up on it",
                entry.current_id
            );
            entry.fail_count = config.max_resubmissions;
            None
        }
        TerminationKind::RuntimeLimit if !config.resubmit_same_queue_on_limit => {
            match config.next_queue(queue) {
                Some(next) => Some(next.to_string()),
                None => {
                    log::warn!(
                        "Job {} exceeded the runtime limit of the longest queue `{queue}`, retrying there",
                        entry.current_id
                    );
                    Some(queue.to_string())
                }
            }
        }
        _ => Some(queue.to_string()),
    }
}

fn resolve_termination(
    scheduler: &mut dyn Scheduler,
    paths: &LedgerPaths,
    entry: &JobStatus,
    history: &JobHistory,
) -> TerminationKind {
    match scheduler.classify_output(&paths.output_file(&entry.internal_name)) {
        Ok(kind) => kind,
        Err(error) => {
            log::debug!(
                "Cannot classify output of job {}: {error:?}",
                entry.current_id
            );
            history.termination.unwrap_or(TerminationKind::OtherFailure)
        }
    }
}

/// Runtime of a finished job: the scheduler-reported value when positive,
/// otherwise the end-to-start difference, with real zero-second jobs rounded
/// up to one second. A job that finished before it started is a corruption
/// fault; unusable history leaves the job to the next cycle.
fn extract_runtime(history: &JobHistory, list: &str, id: JobId) -> crate::Result<Option<i64>> {
    if let Some(seconds) = history.run_seconds {
        if seconds > 0 {
            return Ok(Some(seconds));
        }
    }
    match (history.start_time, history.end_time) {
        (Some(start), Some(end)) => {
            let seconds = end - start;
            if seconds < 0 {
                corrupt(
                    list,
                    format!("job {id} finished {}s before it started", -seconds),
                )
            } else {
                Ok(Some(seconds.max(1)))
            }
        }
        _ => Ok(None),
    }
}
