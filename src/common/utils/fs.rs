use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Rewrites `path` atomically: the contents are written to a sibling
/// temporary file which is then renamed over the target, so a crash
/// mid-write never leaves a torn file behind.
pub fn atomic_write(path: &Path, contents: &str) -> io::Result<()> {
    let tmp = with_appended_name(path, ".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// Copies `path` into its next free backup slot (`<file>.backup<N>`) and
/// returns the version that was used. The first backup of a file gets
/// version 0; every later one gets the highest existing version plus one.
pub fn write_backup(path: &Path) -> io::Result<u64> {
    let version = find_max_backup_version(path).map(|v| v + 1).unwrap_or(0);
    fs::copy(path, backup_path(path, version))?;
    Ok(version)
}

pub fn backup_path(path: &Path, version: u64) -> PathBuf {
    with_appended_name(path, &format!(".backup{version}"))
}

/// Finds all sibling files named `<file>.backup<N>` and returns the maximum
/// `N`, or [`None`] if no backup exists yet.
pub fn find_max_backup_version(path: &Path) -> Option<u64> {
    backup_versions(path).into_iter().max()
}

/// Removes every `<file>.backup<N>` sibling of `path`.
pub fn remove_backups(path: &Path) -> io::Result<()> {
    for version in backup_versions(path) {
        fs::remove_file(backup_path(path, version))?;
    }
    Ok(())
}

fn backup_versions(path: &Path) -> Vec<u64> {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Vec::new(),
    };
    let prefix = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => format!("{name}.backup"),
        None => return Vec::new(),
    };

    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .filter_map(|entry| {
            let name = entry.ok()?.file_name();
            let name = name.to_str()?;
            name.strip_prefix(&prefix)?.parse::<u64>().ok()
        })
        .collect()
}

/// Removes a directory if it exists and contains no entries.
pub fn remove_dir_if_empty(path: &Path) -> io::Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e)
            if e.kind() == io::ErrorKind::NotFound
                || e.raw_os_error() == Some(libc::ENOTEMPTY) =>
        {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Removes a file, treating a missing file as success.
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn with_appended_name(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}
