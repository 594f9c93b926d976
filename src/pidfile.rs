//! Pidfile handling: a single integer pid followed by a trailing
//! newline, checked for liveness with a `kill(pid, 0)` probe (§4.1 step
//! 1, §7).

use crate::error::PidfileError;
use std::io::Write;
use std::path::Path;

/// Returns `Ok(())` if no pidfile exists, or if one exists but names a
/// process that is no longer alive (a stale pidfile is silently
/// reclaimed). Errors if the named process is still alive.
pub fn check_not_running(path: &Path) -> Result<(), PidfileError> {
    let Some(pid) = read(path)? else {
        return Ok(());
    };
    if process_alive(pid) {
        Err(PidfileError::AlreadyRunning {
            path: path.display().to_string(),
            pid,
        })
    } else {
        Ok(())
    }
}

pub fn write(path: &Path, pid: i32) -> Result<(), PidfileError> {
    let mut file = std::fs::File::create(path).map_err(|e| PidfileError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    writeln!(file, "{pid}").map_err(|e| PidfileError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

/// Reads and parses the pidfile. `Ok(None)` if it does not exist.
pub fn read(path: &Path) -> Result<Option<i32>, PidfileError> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|e| PidfileError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PidfileError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

#[must_use]
pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("brimd-test-{name}-{}", std::process::id()))
    }

    #[test]
    fn missing_pidfile_is_not_running() {
        let path = temp_path("missing");
        let _ = std::fs::remove_file(&path);
        assert!(check_not_running(&path).is_ok());
    }

    #[test]
    fn write_then_read_round_trips() {
        let path = temp_path("roundtrip");
        write(&path, 4321).unwrap();
        assert_eq!(read(&path).unwrap(), Some(4321));
        remove(&path);
    }

    #[test]
    fn stale_pidfile_naming_a_dead_process_is_reclaimed() {
        let path = temp_path("stale");
        // pid 1 is normally alive but owned by someone else; use a pid
        // extremely unlikely to be alive instead.
        write(&path, i32::MAX - 1).unwrap();
        assert!(check_not_running(&path).is_ok());
        remove(&path);
    }

    #[test]
    fn pidfile_naming_the_current_process_is_detected_as_running() {
        let path = temp_path("self");
        write(&path, std::process::id() as i32).unwrap();
        assert!(check_not_running(&path).is_err());
        remove(&path);
    }
}
