use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long acquisition may stall before the user is pointed at a possibly
/// stale lock file.
const STALL_WARNING_AFTER: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Exclusive advisory lock scoped to one job list, held around every
/// read-modify-write of the ledger.
///
/// The lock is released when dropped, which covers every exit path of a
/// critical section including errors.
pub struct ListLock {
    path: PathBuf,
    file: File,
}

impl ListLock {
    /// Acquires the lock, waiting indefinitely. After a grace period a
    /// warning names the lock file so a lock left behind by a dead
    /// supervisor can be removed manually.
    pub fn acquire(path: &Path) -> io::Result<ListLock> {
        let started = Instant::now();
        let mut warned = false;

        loop {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            if try_flock_exclusive(&file)? {
                return Ok(ListLock {
                    path: path.to_path_buf(),
                    file,
                });
            }

            if !warned && started.elapsed() >= STALL_WARNING_AFTER {
                log::warn!(
                    "Still waiting for lock {}; another supervisor works on this job list. \
If a previous supervisor died, remove the file manually.",
                    path.display()
                );
                warned = true;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ListLock {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

/// Tries to take an exclusive `flock` without blocking. Returns `Ok(false)`
/// when another process (or file descriptor) holds the lock.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(error)
}
