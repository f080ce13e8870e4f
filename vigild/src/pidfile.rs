// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! PID file management. A live PID in an existing file is a startup-fatal
//! collision; a stale one is removed.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vigil_common::{Error, Result};

/// Removes the file again on drop.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: impl AsRef<Path>) -> Result<PidFile> {
        let path = path.as_ref();

        if let Ok(contents) = fs::read_to_string(path) {
            if let Ok(pid) = contents.trim().parse::<i32>() {
                if pid_is_live(pid) {
                    return Err(Error::Config(format!(
                        "another instance is running (pid {pid})"
                    )));
                }
                warn!(pid, "removing stale pid file");
            }
            let _ = fs::remove_file(path);
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        writeln!(file, "{}", std::process::id())?;

        debug!(path = %path.display(), "created pid file");
        Ok(PidFile {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if fs::remove_file(&self.path).is_ok() {
            debug!(path = %self.path.display(), "removed pid file");
        }
    }
}

/// Signal-0 probe. EPERM still means the process exists.
fn pid_is_live(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_and_removes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        {
            let pidfile = PidFile::create(&path).unwrap();
            let contents = fs::read_to_string(pidfile.path()).unwrap();
            assert_eq!(
                contents.trim().parse::<u32>().unwrap(),
                std::process::id()
            );
        }
        assert!(!path.exists());
    }

    #[test]
    fn live_pid_collision_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        // Our own PID is definitely live.
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        assert!(matches!(PidFile::create(&path), Err(Error::Config(_))));
        assert!(path.exists());
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        // PIDs cannot exceed PID_MAX_LIMIT (2^22), so this one is free.
        fs::write(&path, "4999999\n").unwrap();
        let pidfile = PidFile::create(&path).unwrap();
        let contents = fs::read_to_string(pidfile.path()).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
    }

    #[test]
    fn garbage_contents_are_treated_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vigild.pid");
        fs::write(&path, "not a pid\n").unwrap();
        assert!(PidFile::create(&path).is_ok());
    }
}
