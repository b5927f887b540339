use clap::Parser;

use bherd::common::cli::{Action, CommonOpts, RootOptions};
use bherd::common::setup::setup_logging;
use bherd::ledger::LedgerPaths;
use bherd::scheduler::lsf::{LsfOptions, LsfScheduler};
use bherd::supervisor::process::Supervisor;
use bherd::supervisor::reconcile::BatchOutcome;
use bherd::supervisor::{check_head_host, SupervisorConfig};

fn make_config(opts: &CommonOpts) -> SupervisorConfig {
    SupervisorConfig {
        queues: opts.queues.clone(),
        max_resubmissions: opts.max_resubmissions,
        no_resubmit_on_limit: opts.no_resubmit_on_limit,
        resubmit_same_queue_on_limit: opts.resubmit_same_queue_on_limit,
        keep_backups: opts.keep_backup_files,
        ..Default::default()
    }
}

fn make_supervisor(config: &SupervisorConfig, name: &str) -> bherd::Result<Supervisor> {
    let workdir = std::env::current_dir()?;
    let paths = LedgerPaths::new(workdir, name);
    let scheduler = LsfScheduler::new(LsfOptions {
        batch_query_size: config.batch_query_size,
        ..Default::default()
    });
    Ok(Supervisor::new(
        config.clone(),
        paths,
        Box::new(scheduler),
    ))
}

fn run(action: Action, config: SupervisorConfig) -> bherd::Result<i32> {
    match action {
        Action::Make(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.push(
                &opts.job_file,
                opts.queue.as_deref(),
                opts.parameters.as_deref(),
            )?;
            let outcome = supervisor.wait()?;
            Ok(if outcome == BatchOutcome::AllDone { 0 } else { 1 })
        }
        Action::Push(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.push(
                &opts.job_file,
                opts.queue.as_deref(),
                opts.parameters.as_deref(),
            )?;
            Ok(0)
        }
        Action::PushCrashed(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.run_cycle(true)?;
            Ok(0)
        }
        Action::Check(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            let outcome = supervisor.run_cycle(false)?;
            Ok(if outcome == BatchOutcome::AllDone { 0 } else { 2 })
        }
        Action::Wait(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            let outcome = supervisor.wait()?;
            Ok(if outcome == BatchOutcome::AllDone { 0 } else { 1 })
        }
        Action::Stop(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.stop()?;
            Ok(0)
        }
        Action::Chill(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.chill()?;
            Ok(0)
        }
        Action::Time(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.time()?;
            Ok(0)
        }
        Action::Crashed(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.crashed(&opts.output_file)?;
            Ok(0)
        }
        Action::Clean(opts) => {
            let mut supervisor = make_supervisor(&config, &opts.name)?;
            supervisor.clean()?;
            Ok(0)
        }
    }
}

fn main() {
    let opts = RootOptions::parse();
    setup_logging(opts.common.verbose);

    let config = make_config(&opts.common);
    if let Err(e) = check_head_host(&config) {
        log::error!("{e}");
        std::process::exit(1);
    }

    match run(opts.action, config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}
