//! Single-instance lockfile and the stop/reload/info control modes.
//!
//! The lock is an OS-level advisory write lock on `.{app}.lock` in the
//! working directory; cross-process exclusion must survive this process, so
//! it is never emulated with in-process primitives.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

/// How the process was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Start,
    Stop,
    Restart,
    TryRestart,
    Reload,
    Info,
    Test,
    Kill,
    Restore,
}

impl RunMode {
    pub fn is_start(self) -> bool {
        matches!(self, Self::Start | Self::Restart | Self::TryRestart)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("can't create lockfile in working directory: {0}")]
    Create(io::Error),
    #[error("lockfile fcntl error: {0}")]
    Fcntl(io::Error),
    #[error("can't start: lockfile is already locked by another process")]
    AlreadyRunning,
    #[error("can't send signal to lock owner: {0}")]
    Signal(io::Error),
    #[error("lockfile is still locked after {0} seconds - giving up")]
    Timeout(u32),
    #[error("can't find process to {0}")]
    NoProcess(&'static str),
    #[error("{0} is not running")]
    NotRunning(String),
}

/// Holds the lock for the lifetime of the daemon.
pub struct LockGuard {
    file: File,
}

impl LockGuard {
    /// Truncate the lockfile and record our pid.
    pub fn write_pid(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", std::process::id())?;
        Ok(())
    }
}

/// Outcome of the lock/run-mode dance.
pub enum LockOutcome {
    /// We own the lock; proceed with startup.
    Acquired(LockGuard),
    /// A control action against a running instance completed; exit 0.
    Finished,
}

/// Try to take the whole-file write lock. `Ok(None)` means we own it now;
/// `Ok(Some(pid))` names the current owner.
fn try_lock(file: &File) -> io::Result<Option<i32>> {
    loop {
        let mut fl = libc::flock {
            l_type: libc::F_WRLCK as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &raw const fl) } >= 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EACCES => {}
            _ => return Err(err),
        }
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &raw mut fl) } < 0 {
            return Err(io::Error::last_os_error());
        }
        if fl.l_type != libc::F_UNLCK as libc::c_short {
            return Ok(Some(fl.l_pid as i32));
        }
        // Owner vanished between the two calls; retry.
    }
}

fn send_signal(pid: i32, signo: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, signo) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Acquire the instance lock or drive the requested control action against
/// the current owner.
pub fn wdlock(
    dir: &Path,
    app: &str,
    mode: RunMode,
    timeout_secs: u32,
) -> Result<LockOutcome, LockError> {
    let path = dir.join(format!(".{app}.lock"));
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(LockError::Create)?;

    let owner = try_lock(&file).map_err(LockError::Fcntl)?;
    if let Some(mut owner_pid) = owner {
        match mode {
            RunMode::Test => {
                eprintln!("{app} pid: {owner_pid}");
                return Ok(LockOutcome::Finished);
            }
            RunMode::Start => return Err(LockError::AlreadyRunning),
            RunMode::Reload => {
                send_signal(owner_pid, libc::SIGHUP).map_err(LockError::Signal)?;
                eprintln!("reload signal has been sent");
                return Ok(LockOutcome::Finished);
            }
            RunMode::Info => {
                send_signal(owner_pid, libc::SIGUSR1).map_err(LockError::Signal)?;
                eprintln!("info signal has been sent");
                return Ok(LockOutcome::Finished);
            }
            RunMode::Restore => return Err(LockError::AlreadyRunning),
            RunMode::Stop | RunMode::Kill | RunMode::Restart | RunMode::TryRestart => {
                let signo = if mode == RunMode::Kill {
                    libc::SIGKILL
                } else {
                    libc::SIGTERM
                };
                eprintln!(
                    "sending {} to lock owner (pid:{owner_pid})",
                    if mode == RunMode::Kill { "SIGKILL" } else { "SIGTERM" }
                );
                send_signal(owner_pid, signo).map_err(LockError::Signal)?;

                eprint!("waiting for termination ");
                let mut waited = 0u32;
                loop {
                    match try_lock(&file).map_err(LockError::Fcntl)? {
                        None => break,
                        Some(new_pid) => {
                            waited += 1;
                            if waited >= timeout_secs {
                                eprintln!(":giving up");
                                return Err(LockError::Timeout(waited));
                            }
                            if waited % 10 == 0 {
                                warn!(seconds = waited, "lockfile still locked");
                                eprint!(".");
                            }
                            if new_pid != owner_pid {
                                eprintln!();
                                eprintln!("new lock owner detected (pid:{new_pid})");
                                send_signal(new_pid, signo).map_err(LockError::Signal)?;
                                owner_pid = new_pid;
                            }
                        }
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                eprintln!("terminated");
                if matches!(mode, RunMode::Stop | RunMode::Kill) {
                    return Ok(LockOutcome::Finished);
                }
                // restart / try-restart continue with the lock we now hold
                let mut guard = LockGuard { file };
                guard.write_pid().map_err(LockError::Fcntl)?;
                return Ok(LockOutcome::Acquired(guard));
            }
        }
    }

    // Nobody holds the lock.
    match mode {
        RunMode::Start | RunMode::Restart | RunMode::Restore => {
            let mut guard = LockGuard { file };
            guard.write_pid().map_err(LockError::Fcntl)?;
            eprintln!("lockfile created and locked");
            Ok(LockOutcome::Acquired(guard))
        }
        RunMode::TryRestart => Err(LockError::NoProcess("restart")),
        RunMode::Stop | RunMode::Kill => {
            eprintln!("can't find process to terminate");
            Ok(LockOutcome::Finished)
        }
        RunMode::Reload => Err(LockError::NoProcess("send reload signal to")),
        RunMode::Info => Err(LockError::NoProcess("send info signal to")),
        RunMode::Test => Err(LockError::NotRunning(app.to_string())),
    }
}
