use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use colored::Colorize;

use crate::common::error::error;
use crate::common::utils::fs::{remove_dir_if_empty, remove_file_if_exists};
use crate::common::utils::time::format_hms;
use crate::ledger::lock::ListLock;
use crate::ledger::store::{LedgerSnapshot, LedgerStore};
use crate::ledger::{Job, JobStatus, LedgerPaths};
use crate::scheduler::{JobState, Scheduler};
use crate::supervisor::reconcile::{
    reconcile, BatchOutcome, ReconcileReport, Resubmission, Tallies,
};
use crate::supervisor::SupervisorConfig;

/// Top-level driver of one job list: composes the ledger store, the
/// exclusive lock, the scheduler adapter and the reconciler.
pub struct Supervisor {
    config: SupervisorConfig,
    store: LedgerStore,
    scheduler: Box<dyn Scheduler>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        paths: LedgerPaths,
        scheduler: Box<dyn Scheduler>,
    ) -> Self {
        let store = LedgerStore::new(paths, config.keep_backups);
        Self {
            config,
            store,
            scheduler,
        }
    }

    fn paths(&self) -> &LedgerPaths {
        self.store.paths()
    }

    /// Submits every command of `job_file` as an independent job and writes
    /// the initial ledger. Refuses when a ledger for this list name already
    /// exists.
    pub fn push(
        &mut self,
        job_file: &Path,
        queue: Option<&str>,
        parameters: Option<&str>,
    ) -> crate::Result<()> {
        let queue = match queue {
            Some(queue) if self.config.is_valid_queue(queue) => queue.to_string(),
            Some(queue) => {
                return error(format!(
                    "Unknown queue `{queue}`; configured queues: {}",
                    self.config.queues.join(", ")
                ))
            }
            None => self.config.queues[0].clone(),
        };
        let text = fs::read_to_string(job_file)?;
        let commands: Vec<&str> = text.lines().filter(|line| !line.trim().is_empty()).collect();
        if commands.is_empty() {
            return error(format!(
                "Job file {} contains no commands",
                job_file.display()
            ));
        }

        let _lock = ListLock::acquire(&self.paths().lock_file())?;
        if self.store.any_file_exists() {
            return error(format!(
                "Job list `{}` already exists; `clean` it before pushing again",
                self.paths().name()
            ));
        }
        self.store.create_ledger_dir()?;

        let params = parameters.unwrap_or("").to_string();
        let mut jobs = Vec::with_capacity(commands.len());
        let mut status = Vec::with_capacity(commands.len());
        for (index, command) in commands.iter().enumerate() {
            let internal_name = self
                .paths()
                .internal_name(index as u64, self.config.max_out_files_per_dir);
            let output_path = self.paths().output_file(&internal_name);
            if let Some(parent) = output_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let id = self.scheduler.submit(&queue, &params, &output_path, command)?;
            log::debug!("Submitted `{command}` as job {id}");
            jobs.push(Job {
                current_id: id,
                internal_name: internal_name.clone(),
                queue: queue.clone(),
                command: command.to_string(),
            });
            status.push(JobStatus::pending(id, internal_name));
        }

        self.store.save_catalog(&jobs)?;
        self.store.save_status(&status)?;
        self.store.save_params(&params)?;
        self.store.save_count(jobs.len())?;
        self.store.write_initial_backups()?;

        log::info!(
            "Submitted {} jobs of list `{}` to queue `{queue}`",
            jobs.len(),
            self.paths().name()
        );
        Ok(())
    }

    /// Polls the batch until it either fully succeeds or crashes for good,
    /// resubmitting retriable jobs along the way.
    pub fn wait(&mut self) -> crate::Result<BatchOutcome> {
        let mut cycle: u32 = 0;
        loop {
            let outcome = self.run_cycle(true)?;
            match outcome {
                BatchOutcome::AllDone => {
                    println!("{}", "ALL JOBS SUCCEEDED".green().bold());
                    return Ok(outcome);
                }
                BatchOutcome::AllFailed => {
                    println!("{}", "CRASHED".red().bold());
                    return Ok(outcome);
                }
                BatchOutcome::Active | BatchOutcome::AllSettledRetriable => {}
            }
            // The first cycles poll eagerly; once the batch has settled into
            // long-running work the polling slows down.
            let sleep = if cycle < self.config.fast_cycles {
                self.config.sleep_short
            } else {
                self.config.sleep_long
            };
            cycle += 1;
            std::thread::sleep(sleep);
        }
    }

    /// One locked pass: load, reconcile, optionally resubmit retriable
    /// crashes, rewrite the status file.
    pub fn run_cycle(&mut self, resubmit: bool) -> crate::Result<BatchOutcome> {
        Ok(self.reconcile_and_save(resubmit)?.1.outcome)
    }

    fn reconcile_and_save(
        &mut self,
        resubmit: bool,
    ) -> crate::Result<(LedgerSnapshot, ReconcileReport)> {
        let lock = ListLock::acquire(&self.paths().lock_file())?;
        let mut snapshot = self.store.load_snapshot()?;
        let report = reconcile(
            self.scheduler.as_mut(),
            &self.config,
            self.store.paths(),
            &snapshot.jobs,
            &mut snapshot.status,
        )?;
        print_tally(self.paths().name(), &report.tallies);

        if resubmit && !report.resubmit.is_empty() {
            self.resubmit_jobs(&report.resubmit, &mut snapshot)?;
            self.store.save_catalog(&snapshot.jobs)?;
        }
        self.store.save_status(&snapshot.status)?;
        drop(lock);

        Ok((snapshot, report))
    }

    fn resubmit_jobs(
        &mut self,
        resubmissions: &[Resubmission],
        snapshot: &mut LedgerSnapshot,
    ) -> crate::Result<()> {
        for resubmission in resubmissions {
            let index = snapshot
                .status
                .iter()
                .position(|entry| entry.current_id == resubmission.id)
                .ok_or_else(|| {
                    crate::Error::GenericError(format!(
                        "Retriable job {} vanished from the ledger",
                        resubmission.id
                    ))
                })?;
            let job = &mut snapshot.jobs[index];
            let entry = &mut snapshot.status[index];

            // A stale output file would poison the classification of the
            // next attempt.
            let output_path = self.store.paths().output_file(&job.internal_name);
            remove_file_if_exists(&output_path)?;

            let new_id =
                self.scheduler
                    .submit(&resubmission.queue, &snapshot.params, &output_path, &job.command)?;
            log::info!(
                "Resubmitted job {} as {} to queue `{}` (crashes so far: {})",
                resubmission.id,
                new_id,
                resubmission.queue,
                entry.fail_count
            );
            job.current_id = new_id;
            job.queue = resubmission.queue.clone();
            entry.current_id = new_id;
            entry.state = JobState::Pend;
        }
        Ok(())
    }

    /// Cancels every pending and running job.
    pub fn stop(&mut self) -> crate::Result<()> {
        self.cancel_active(true)
    }

    /// Cancels every pending job; running jobs are left to finish.
    pub fn chill(&mut self) -> crate::Result<()> {
        self.cancel_active(false)
    }

    fn cancel_active(&mut self, include_running: bool) -> crate::Result<()> {
        let (snapshot, _) = self.reconcile_and_save(false)?;
        for entry in &snapshot.status {
            let cancel = match entry.state {
                JobState::Pend => true,
                JobState::Run => include_running,
                JobState::Done | JobState::Exit => false,
            };
            if !cancel {
                continue;
            }
            match self.scheduler.cancel(entry.current_id) {
                Ok(()) => log::info!("Cancelled job {}", entry.current_id),
                Err(e) => log::warn!(
                    "Could not cancel job {} (it may have finished already): {e:?}",
                    entry.current_id
                ),
            }
        }
        Ok(())
    }

    /// Prints runtime statistics of the batch and an estimate of the time
    /// left, based on the mean runtime of the finished jobs.
    pub fn time(&mut self) -> crate::Result<()> {
        let (snapshot, report) = self.reconcile_and_save(false)?;

        let finished: Vec<i64> = snapshot
            .status
            .iter()
            .filter(|entry| entry.state == JobState::Done && entry.runtime >= 0)
            .map(|entry| entry.runtime)
            .collect();

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0);
        let mut max_running: i64 = 0;
        let mut running_probed = false;
        for entry in snapshot
            .status
            .iter()
            .filter(|entry| entry.state == JobState::Run)
        {
            match self.scheduler.history(entry.current_id) {
                Ok(history) => {
                    if let Some(start) = history.start_time {
                        running_probed = true;
                        max_running = max_running.max((now - start).max(0));
                    }
                }
                Err(e) => log::warn!(
                    "Could not query history of running job {}: {e:?}",
                    entry.current_id
                ),
            }
        }

        println!("Finished jobs: {} of {}", finished.len(), snapshot.count);
        if !finished.is_empty() {
            let sum: i64 = finished.iter().sum();
            let mean = sum as f64 / finished.len() as f64;
            let max_finished = finished.iter().copied().max().unwrap_or(0);
            println!("Total runtime of finished jobs: {}", format_seconds(sum));
            println!("Mean runtime: {}", format_seconds(mean.round() as i64));
            println!("Longest finished job: {}", format_seconds(max_finished));
            if report.tallies.run > 0 {
                let eta = mean * (report.tallies.pend + report.tallies.run) as f64
                    / report.tallies.run as f64;
                println!(
                    "Estimated time to completion: {}",
                    format_seconds(eta.round() as i64)
                );
            }
        }
        if running_probed {
            println!(
                "Longest currently running job: {}",
                format_seconds(max_running)
            );
        }
        Ok(())
    }

    /// Writes the command of every crashed job to `output_file`, one per
    /// line.
    pub fn crashed(&mut self, output_file: &Path) -> crate::Result<()> {
        let (snapshot, _) = self.reconcile_and_save(false)?;

        let mut contents = String::new();
        let mut count = 0;
        for (job, entry) in snapshot.jobs.iter().zip(&snapshot.status) {
            if entry.state == JobState::Exit {
                contents.push_str(&job.command);
                contents.push('\n');
                count += 1;
            }
        }
        fs::write(output_file, contents)?;
        log::info!(
            "Wrote {count} crashed commands to {}",
            output_file.display()
        );
        Ok(())
    }

    /// Removes every file of the job list: output files, ledger files,
    /// backups, the emptied directories and the lock file. Refuses while
    /// the recorded status still contains pending or running jobs.
    pub fn clean(&mut self) -> crate::Result<()> {
        let lock_path = self.paths().lock_file();
        let lock = ListLock::acquire(&lock_path)?;
        let snapshot = self.store.load_snapshot()?;

        let active = snapshot
            .status
            .iter()
            .filter(|entry| matches!(entry.state, JobState::Pend | JobState::Run))
            .count();
        if active > 0 {
            return error(format!(
                "Job list `{}` still has {active} pending or running jobs; `stop` them first",
                self.paths().name()
            ));
        }

        for entry in &snapshot.status {
            remove_file_if_exists(&self.paths().output_file(&entry.internal_name))?;
        }
        let output_root = self.paths().output_root();
        if output_root.is_dir() {
            for bucket in fs::read_dir(&output_root)? {
                let path = bucket?.path();
                if path.is_dir() {
                    remove_dir_if_empty(&path)?;
                }
            }
        }
        remove_dir_if_empty(&output_root)?;
        self.store.remove_all()?;

        drop(lock);
        remove_file_if_exists(&lock_path)?;
        log::info!("Removed job list `{}`", self.paths().name());
        Ok(())
    }
}

fn print_tally(name: &str, tallies: &Tallies) {
    log::info!(
        "[{name}] pending: {}, running: {}, done: {}, crashed: {} ({} retriable)",
        tallies.pend,
        tallies.run,
        tallies.done,
        tallies.fail,
        tallies.retriable
    );
}

fn format_seconds(seconds: i64) -> String {
    format_hms(&Duration::from_secs(seconds.max(0) as u64))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;

    use super::*;
    use crate::scheduler::testing::MockScheduler;
    use crate::scheduler::{JobHistory, TerminationKind};

    fn test_supervisor(dir: &TempDir) -> (Supervisor, MockScheduler) {
        let scheduler = MockScheduler::new();
        let config = SupervisorConfig {
            sleep_short: Duration::ZERO,
            sleep_long: Duration::ZERO,
            head_host: "testhost".to_string(),
            ..Default::default()
        };
        let paths = LedgerPaths::new(dir.path(), "jl1");
        let supervisor = Supervisor::new(config, paths, Box::new(scheduler.clone()));
        (supervisor, scheduler)
    }

    fn write_job_file(dir: &TempDir, commands: &[&str]) -> PathBuf {
        let path = dir.path().join("cmds.txt");
        fs::write(&path, commands.join("\n")).unwrap();
        path
    }

    fn finished_history(start: i64, end: i64) -> JobHistory {
        JobHistory {
            start_time: Some(start),
            end_time: Some(end),
            ..Default::default()
        }
    }

    #[test]
    fn push_creates_the_full_ledger() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a", "echo b"]);

        supervisor.push(&job_file, None, Some("-m bigmem")).unwrap();

        let store = LedgerStore::new(LedgerPaths::new(dir.path(), "jl1"), false);
        let snapshot = store.load_snapshot().unwrap();
        assert_eq!(snapshot.count, 2);
        assert_eq!(snapshot.params, "-m bigmem");
        assert_eq!(snapshot.jobs[0].command, "echo a");
        assert_eq!(snapshot.jobs[0].queue, "short");
        assert_eq!(snapshot.jobs[0].internal_name, "jl1/1/o.0");
        assert!(snapshot
            .status
            .iter()
            .all(|entry| entry.state == JobState::Pend && entry.runtime == -1));
        assert!(dir.path().join("jl1/1").is_dir());

        let submitted = &scheduler.state.borrow().submitted;
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].queue, "short");
        assert_eq!(submitted[0].parameters, "-m bigmem");
    }

    #[test]
    fn push_refuses_an_existing_list() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, _scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a"]);

        supervisor.push(&job_file, None, None).unwrap();
        assert!(supervisor.push(&job_file, None, None).is_err());
    }

    #[test]
    fn push_refuses_an_unknown_queue() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, _scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a"]);

        assert!(supervisor.push(&job_file, Some("nightly"), None).is_err());
    }

    #[test]
    fn wait_reports_success_once_everything_is_done() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a", "echo b"]);
        supervisor.push(&job_file, None, None).unwrap();

        {
            let mut state = scheduler.state.borrow_mut();
            let ids: Vec<_> = state.submitted.iter().map(|record| record.id).collect();
            for id in ids {
                state.set_state(id, JobState::Done);
                state.set_history(id, finished_history(100, 100));
            }
        }

        assert_eq!(supervisor.wait().unwrap(), BatchOutcome::AllDone);

        let store = LedgerStore::new(LedgerPaths::new(dir.path(), "jl1"), false);
        let snapshot = store.load_snapshot().unwrap();
        assert!(snapshot
            .status
            .iter()
            .all(|entry| entry.state == JobState::Done
                && entry.runtime >= 1
                && entry.fail_count == 0));
    }

    #[test]
    fn crashed_job_is_resubmitted_with_a_fresh_id() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a"]);
        supervisor.push(&job_file, None, None).unwrap();

        let first_id = scheduler.state.borrow().submitted[0].id;
        let output_path = dir.path().join("jl1/1/o.0");
        fs::write(&output_path, "Exited with exit code 1.\n").unwrap();
        scheduler
            .state
            .borrow_mut()
            .set_state(first_id, JobState::Exit);
        scheduler
            .state
            .borrow_mut()
            .set_output(output_path.clone(), TerminationKind::OtherFailure);

        assert_eq!(
            supervisor.run_cycle(true).unwrap(),
            BatchOutcome::AllSettledRetriable
        );

        let store = LedgerStore::new(LedgerPaths::new(dir.path(), "jl1"), false);
        let snapshot = store.load_snapshot().unwrap();
        let second_id = scheduler.state.borrow().submitted[1].id;
        assert_ne!(first_id, second_id);
        assert_eq!(snapshot.jobs[0].current_id, second_id);
        assert_eq!(snapshot.jobs[0].queue, "short");
        assert_eq!(snapshot.status[0].current_id, second_id);
        assert_eq!(snapshot.status[0].state, JobState::Pend);
        assert_eq!(snapshot.status[0].fail_count, 1);
        // The stale output file of the crashed attempt is gone.
        assert!(!output_path.exists());
    }

    #[test]
    fn runtime_limit_crashes_walk_up_the_queues() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["simulate --big"]);
        supervisor.push(&job_file, None, None).unwrap();

        let output_path = dir.path().join("jl1/1/o.0");
        let store = LedgerStore::new(LedgerPaths::new(dir.path(), "jl1"), false);

        for expected in ["medium", "long"] {
            let current_id = scheduler.state.borrow().submitted.last().unwrap().id;
            {
                let mut state = scheduler.state.borrow_mut();
                state.set_state(current_id, JobState::Exit);
                state.set_output(output_path.clone(), TerminationKind::RuntimeLimit);
            }
            supervisor.run_cycle(true).unwrap();
            let snapshot = store.load_snapshot().unwrap();
            assert_eq!(snapshot.jobs[0].queue, expected);
            assert_eq!(snapshot.status[0].state, JobState::Pend);
        }

        // The third limit crash reaches the cap: the job stays in the top
        // queue and becomes terminal.
        let current_id = scheduler.state.borrow().submitted.last().unwrap().id;
        {
            let mut state = scheduler.state.borrow_mut();
            state.set_state(current_id, JobState::Exit);
            state.set_output(output_path.clone(), TerminationKind::RuntimeLimit);
        }
        assert_eq!(supervisor.run_cycle(true).unwrap(), BatchOutcome::AllFailed);
        let snapshot = store.load_snapshot().unwrap();
        assert_eq!(snapshot.jobs[0].queue, "long");
        assert_eq!(snapshot.status[0].state, JobState::Exit);
        assert_eq!(snapshot.status[0].fail_count, 3);
    }

    #[test]
    fn stop_cancels_pending_and_running_jobs() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a", "echo b", "echo c"]);
        supervisor.push(&job_file, None, None).unwrap();

        let ids: Vec<_> = scheduler
            .state
            .borrow()
            .submitted
            .iter()
            .map(|record| record.id)
            .collect();
        {
            let mut state = scheduler.state.borrow_mut();
            state.set_state(ids[0], JobState::Run);
            state.set_state(ids[1], JobState::Run);
            state.set_state(ids[2], JobState::Pend);
        }

        supervisor.stop().unwrap();
        let cancelled = scheduler.state.borrow().cancelled.clone();
        assert_eq!(cancelled.len(), 3);
        for id in &ids {
            assert!(cancelled.contains(id));
        }
    }

    #[test]
    fn chill_spares_running_jobs() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a", "echo b"]);
        supervisor.push(&job_file, None, None).unwrap();

        let ids: Vec<_> = scheduler
            .state
            .borrow()
            .submitted
            .iter()
            .map(|record| record.id)
            .collect();
        {
            let mut state = scheduler.state.borrow_mut();
            state.set_state(ids[0], JobState::Run);
            state.set_state(ids[1], JobState::Pend);
        }

        supervisor.chill().unwrap();
        assert_eq!(scheduler.state.borrow().cancelled, vec![ids[1]]);
    }

    #[test]
    fn crashed_writes_the_failing_commands() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo ok", "false --now"]);
        supervisor.push(&job_file, None, None).unwrap();

        let ids: Vec<_> = scheduler
            .state
            .borrow()
            .submitted
            .iter()
            .map(|record| record.id)
            .collect();
        {
            let mut state = scheduler.state.borrow_mut();
            state.set_state(ids[0], JobState::Done);
            state.set_history(ids[0], finished_history(0, 5));
            state.set_state(ids[1], JobState::Exit);
        }

        let crashed_file = dir.path().join("crashed.txt");
        supervisor.crashed(&crashed_file).unwrap();
        assert_eq!(fs::read_to_string(&crashed_file).unwrap(), "false --now\n");
    }

    #[test]
    fn clean_refuses_active_jobs_then_removes_everything() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a"]);
        supervisor.push(&job_file, None, None).unwrap();
        let output_path = dir.path().join("jl1/1/o.0");
        fs::write(&output_path, "output").unwrap();

        assert!(supervisor.clean().is_err());

        let id = scheduler.state.borrow().submitted[0].id;
        {
            let mut state = scheduler.state.borrow_mut();
            state.set_state(id, JobState::Done);
            state.set_history(id, finished_history(0, 5));
        }
        supervisor.run_cycle(false).unwrap();

        supervisor.clean().unwrap();
        assert!(!output_path.exists());
        assert!(!dir.path().join("jl1").exists());
        assert!(!dir.path().join(".jl1").exists());
        assert!(!dir.path().join("lockFile.jl1").exists());
    }

    #[test]
    fn cycle_without_retriable_jobs_leaves_the_ledger_untouched() {
        let dir = TempDir::new().unwrap();
        let (mut supervisor, _scheduler) = test_supervisor(&dir);
        let job_file = write_job_file(&dir, &["echo a", "echo b"]);
        supervisor.push(&job_file, None, None).unwrap();

        let status_file = dir.path().join(".jl1/status");
        let jobs_file = dir.path().join(".jl1/jobs");
        let status_before = fs::read(&status_file).unwrap();
        let jobs_before = fs::read(&jobs_file).unwrap();

        assert_eq!(supervisor.run_cycle(true).unwrap(), BatchOutcome::Active);

        assert_eq!(fs::read(&status_file).unwrap(), status_before);
        assert_eq!(fs::read(&jobs_file).unwrap(), jobs_before);
    }
}
