//! Singleton enforcement via an advisory-locked pid file.
//!
//! The file holds a single line `PID\n` and stays exclusively flock-ed for
//! the daemon's lifetime.  A second daemon fails to acquire the lock and
//! exits; `--stop` and `--reload` read the pid back to address the running
//! instance.  The file is removed on orderly release only -- after a crash
//! the stale file is harmless because the lock died with the process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    #[error("another daemon instance holds {0}")]
    AlreadyRunning(PathBuf),
    #[error("pid file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("pid file {0} does not contain a pid")]
    Malformed(PathBuf),
}

#[derive(Debug)]
pub struct PidFile {
    // Held for the lifetime of the daemon; the lock dies with the fd.
    _file: File,
    path: PathBuf,
}

impl PidFile {
    /// Create, lock and write the pid file.
    pub fn acquire(path: &Path, pid: u32) -> Result<PidFile, PidFileError> {
        let io_err = |source| PidFileError::Io {
            path: path.to_owned(),
            source,
        };

        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(io_err)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(PidFileError::AlreadyRunning(path.to_owned()));
            }
            return Err(io_err(err));
        }

        file.set_len(0).map_err(io_err)?;
        file.write_all(format!("{pid}\n").as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)?;

        Ok(PidFile {
            _file: file,
            path: path.to_owned(),
        })
    }

    /// Read the pid of the running instance.
    pub fn read_pid(path: &Path) -> Result<u32, PidFileError> {
        let text = std::fs::read_to_string(path).map_err(|source| PidFileError::Io {
            path: path.to_owned(),
            source,
        })?;
        text.trim()
            .parse()
            .map_err(|_| PidFileError::Malformed(path.to_owned()))
    }

    /// Remove the file on orderly shutdown; the lock is released with it.
    pub fn release(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_pid_line_and_reads_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let lock = PidFile::acquire(&path, 4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242\n");
        assert_eq!(PidFile::read_pid(&path).unwrap(), 4242);

        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn second_acquire_in_process_is_rejected_via_reacquire() {
        // flock is per-open-file-description: a second open in the same
        // process still conflicts, which is what matters for the singleton.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let first = PidFile::acquire(&path, 1).unwrap();
        match PidFile::acquire(&path, 2) {
            Err(PidFileError::AlreadyRunning(_)) => {}
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }
        first.release();

        // After release the lock is free again.
        let third = PidFile::acquire(&path, 3).unwrap();
        third.release();
    }

    #[test]
    fn malformed_pid_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");
        std::fs::write(&path, "not a pid\n").unwrap();
        assert!(matches!(
            PidFile::read_pid(&path),
            Err(PidFileError::Malformed(_))
        ));
    }
}
