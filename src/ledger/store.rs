use std::fs;
use std::path::Path;

use crate::common::error::corrupt;
use crate::common::utils::fs::{
    atomic_write, remove_backups, remove_dir_if_empty, remove_file_if_exists, write_backup,
};
use crate::ledger::{Job, JobStatus, LedgerPaths};
use crate::scheduler::JobState;

/// Reads and rewrites the four ledger files. Every rewrite is atomic
/// (temp file + rename) and, when backups are enabled, preceded by a copy
/// of the previous file into the next backup slot.
pub struct LedgerStore {
    paths: LedgerPaths,
    keep_backups: bool,
}

/// Consistent in-memory image of a ledger, as checked by
/// [`LedgerStore::load_snapshot`].
#[derive(Debug)]
pub struct LedgerSnapshot {
    pub jobs: Vec<Job>,
    pub status: Vec<JobStatus>,
    pub params: String,
    pub count: usize,
}

impl LedgerStore {
    pub fn new(paths: LedgerPaths, keep_backups: bool) -> Self {
        Self {
            paths,
            keep_backups,
        }
    }

    pub fn paths(&self) -> &LedgerPaths {
        &self.paths
    }

    /// True if any ledger file of this list already exists.
    pub fn any_file_exists(&self) -> bool {
        [
            self.paths.jobs_file(),
            self.paths.status_file(),
            self.paths.params_file(),
            self.paths.count_file(),
        ]
        .iter()
        .any(|path| path.exists())
    }

    pub fn create_ledger_dir(&self) -> crate::Result<()> {
        fs::create_dir_all(self.paths.ledger_dir())?;
        Ok(())
    }

    /// Loads the whole ledger and verifies the cross-file invariants:
    /// catalog, status and the recorded count must agree, and every row pair
    /// must be joined by the same current ID.
    pub fn load_snapshot(&self) -> crate::Result<LedgerSnapshot> {
        let jobs = self.load_catalog()?;
        let status = self.load_status()?;
        let count = self.load_count()?;
        let params = self.load_params()?;

        let name = self.paths.name();
        if jobs.len() != status.len() || jobs.len() != count {
            return corrupt(
                name,
                format!(
                    "catalog has {} entries, status has {}, recorded count is {}",
                    jobs.len(),
                    status.len(),
                    count
                ),
            );
        }
        for (job, job_status) in jobs.iter().zip(&status) {
            if job.current_id != job_status.current_id {
                return corrupt(
                    name,
                    format!(
                        "catalog id {} does not match status id {} for {}",
                        job.current_id, job_status.current_id, job.internal_name
                    ),
                );
            }
        }

        Ok(LedgerSnapshot {
            jobs,
            status,
            params,
            count,
        })
    }

    pub fn load_catalog(&self) -> crate::Result<Vec<Job>> {
        let path = self.paths.jobs_file();
        let text = fs::read_to_string(&path)?;
        let mut jobs = Vec::new();
        for (number, line) in text.lines().enumerate() {
            jobs.push(self.parse_catalog_line(line).ok_or_else(|| {
                self.corrupt_line(&path, number, line)
            })?);
        }
        Ok(jobs)
    }

    fn parse_catalog_line(&self, line: &str) -> Option<Job> {
        let mut fields = line.splitn(4, '\t');
        Some(Job {
            current_id: fields.next()?.parse().ok()?,
            internal_name: fields.next()?.to_string(),
            queue: fields.next()?.to_string(),
            command: fields.next()?.to_string(),
        })
    }

    pub fn load_status(&self) -> crate::Result<Vec<JobStatus>> {
        let path = self.paths.status_file();
        let text = fs::read_to_string(&path)?;
        let mut status = Vec::new();
        for (number, line) in text.lines().enumerate() {
            status.push(self.parse_status_line(line).ok_or_else(|| {
                self.corrupt_line(&path, number, line)
            })?);
        }
        Ok(status)
    }

    fn parse_status_line(&self, line: &str) -> Option<JobStatus> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 5 {
            return None;
        }
        Some(JobStatus {
            current_id: fields[0].parse().ok()?,
            internal_name: fields[1].to_string(),
            state: fields[2].parse::<JobState>().ok()?,
            fail_count: fields[3].parse().ok()?,
            runtime: fields[4].parse().ok()?,
        })
    }

    pub fn save_catalog(&self, jobs: &[Job]) -> crate::Result<()> {
        let mut contents = String::new();
        for job in jobs {
            contents.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                job.current_id, job.internal_name, job.queue, job.command
            ));
        }
        self.rewrite(&self.paths.jobs_file(), &contents)
    }

    pub fn save_status(&self, status: &[JobStatus]) -> crate::Result<()> {
        let mut contents = String::new();
        for entry in status {
            contents.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                entry.current_id, entry.internal_name, entry.state, entry.fail_count, entry.runtime
            ));
        }
        self.rewrite(&self.paths.status_file(), &contents)
    }

    pub fn load_params(&self) -> crate::Result<String> {
        let text = fs::read_to_string(self.paths.params_file())?;
        Ok(text.trim_end_matches('\n').to_string())
    }

    pub fn save_params(&self, params: &str) -> crate::Result<()> {
        self.rewrite(&self.paths.params_file(), &format!("{params}\n"))
    }

    pub fn load_count(&self) -> crate::Result<usize> {
        let path = self.paths.count_file();
        let text = fs::read_to_string(&path)?;
        text.trim().parse().map_err(|_| {
            crate::Error::CorruptLedger {
                list: self.paths.name().to_string(),
                reason: format!("count file does not hold an integer: `{}`", text.trim()),
            }
        })
    }

    pub fn save_count(&self, count: usize) -> crate::Result<()> {
        self.rewrite(&self.paths.count_file(), &format!("{count}\n"))
    }

    /// Writes the version-0 backups right after the initial submission, so
    /// the pristine ledger can always be recovered.
    pub fn write_initial_backups(&self) -> crate::Result<()> {
        if !self.keep_backups {
            return Ok(());
        }
        for path in [
            self.paths.jobs_file(),
            self.paths.status_file(),
            self.paths.params_file(),
            self.paths.count_file(),
        ] {
            write_backup(&path)?;
        }
        Ok(())
    }

    /// Deletes the ledger files, their backups, and the ledger directory if
    /// nothing else is left in it.
    pub fn remove_all(&self) -> crate::Result<()> {
        for path in [
            self.paths.jobs_file(),
            self.paths.status_file(),
            self.paths.params_file(),
            self.paths.count_file(),
        ] {
            remove_backups(&path)?;
            remove_file_if_exists(&path)?;
        }
        remove_dir_if_empty(&self.paths.ledger_dir())?;
        Ok(())
    }

    fn rewrite(&self, path: &Path, contents: &str) -> crate::Result<()> {
        if self.keep_backups && path.exists() {
            write_backup(path)?;
        }
        atomic_write(path, contents)?;
        Ok(())
    }

    fn corrupt_line(&self, path: &Path, number: usize, line: &str) -> crate::Error {
        crate::Error::CorruptLedger {
            list: self.paths.name().to_string(),
            reason: format!(
                "unparsable line {} in {}: `{}`",
                number + 1,
                path.display(),
                line
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::common::utils::fs::backup_path;
    use crate::ledger::UNKNOWN_RUNTIME;

    fn store(dir: &TempDir, keep_backups: bool) -> LedgerStore {
        let store = LedgerStore::new(LedgerPaths::new(dir.path(), "jl1"), keep_backups);
        store.create_ledger_dir().unwrap();
        store
    }

    fn sample_jobs() -> Vec<Job> {
        vec![
            Job {
                current_id: 101,
                internal_name: "jl1/1/o.0".to_string(),
                queue: "short".to_string(),
                command: "echo a".to_string(),
            },
            Job {
                current_id: 102,
                internal_name: "jl1/1/o.1".to_string(),
                queue: "short".to_string(),
                command: "grep -c '^>' db.fa > counts".to_string(),
            },
        ]
    }

    fn sample_status() -> Vec<JobStatus> {
        vec![
            JobStatus::pending(101, "jl1/1/o.0".to_string()),
            JobStatus {
                current_id: 102,
                internal_name: "jl1/1/o.1".to_string(),
                state: JobState::Done,
                fail_count: 1,
                runtime: 37,
            },
        ]
    }

    #[test]
    fn catalog_roundtrip_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        let jobs = sample_jobs();

        store.save_catalog(&jobs).unwrap();
        let first = fs::read(store.paths().jobs_file()).unwrap();
        let loaded = store.load_catalog().unwrap();
        assert_eq!(loaded, jobs);

        store.save_catalog(&loaded).unwrap();
        let second = fs::read(store.paths().jobs_file()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn status_roundtrip_preserves_unknown_runtime() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        let status = sample_status();

        store.save_status(&status).unwrap();
        let loaded = store.load_status().unwrap();
        assert_eq!(loaded, status);
        assert_eq!(loaded[0].runtime, UNKNOWN_RUNTIME);
    }

    #[test]
    fn params_and_count_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        store.save_params("-m bigmem -n 4").unwrap();
        store.save_count(2).unwrap();
        assert_eq!(store.load_params().unwrap(), "-m bigmem -n 4");
        assert_eq!(store.load_count().unwrap(), 2);
    }

    #[test]
    fn snapshot_detects_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        store.save_catalog(&sample_jobs()).unwrap();
        store.save_status(&sample_status()).unwrap();
        store.save_params("").unwrap();
        store.save_count(3).unwrap();

        let error = store.load_snapshot().unwrap_err();
        assert!(matches!(error, crate::Error::CorruptLedger { .. }));
    }

    #[test]
    fn snapshot_detects_id_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        let mut status = sample_status();
        status[1].current_id = 999;
        store.save_catalog(&sample_jobs()).unwrap();
        store.save_status(&status).unwrap();
        store.save_params("").unwrap();
        store.save_count(2).unwrap();

        let error = store.load_snapshot().unwrap_err();
        assert!(matches!(error, crate::Error::CorruptLedger { .. }));
    }

    #[test]
    fn garbage_line_is_reported_as_corruption() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        fs::write(store.paths().status_file(), "101\tjl1/1/o.0\tWAT\t0\t-1\n").unwrap();
        let error = store.load_status().unwrap_err();
        assert!(matches!(error, crate::Error::CorruptLedger { .. }));
    }

    #[test]
    fn rewrites_keep_versioned_backups_when_enabled() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, true);
        let jobs = sample_jobs();

        store.save_catalog(&jobs).unwrap();
        store.save_status(&sample_status()).unwrap();
        store.save_params("").unwrap();
        store.save_count(2).unwrap();
        store.write_initial_backups().unwrap();

        assert!(backup_path(&store.paths().jobs_file(), 0).exists());

        store.save_catalog(&jobs).unwrap();
        assert!(backup_path(&store.paths().jobs_file(), 1).exists());
    }

    #[test]
    fn remove_all_clears_ledger_directory() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, true);
        store.save_catalog(&sample_jobs()).unwrap();
        store.save_status(&sample_status()).unwrap();
        store.save_params("").unwrap();
        store.save_count(2).unwrap();
        store.write_initial_backups().unwrap();

        store.remove_all().unwrap();
        assert!(!store.paths().ledger_dir().exists());
    }
}
