//! Daemonization and the one-shot process knobs applied at startup.
//!
//! The double fork keeps a stderr relay pipe open to the original terminal:
//! everything the daemon writes to stderr during initialization reaches the
//! user, and a trailing NUL byte tells the relay that initialization failed.

use std::ffi::CString;
use std::io::{self, Write};

use anyhow::{Context, bail};
use tracing::{info, warn};

fn dev_null_onto(target: libc::c_int) -> io::Result<()> {
    let devnull = CString::new("/dev/null").expect("static path");
    unsafe {
        let fd = libc::open(devnull.as_ptr(), libc::O_RDWR, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::dup2(fd, target) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        libc::close(fd);
    }
    Ok(())
}

/// Detach from the terminal. Returns only in the final daemon process; the
/// intermediate processes exit internally. The relay parent keeps copying
/// the daemon's stderr until [`close_msg_channel`] (success) or
/// [`mark_init_failure`] (failure) ends the stream.
pub fn make_daemon() -> io::Result<()> {
    io::stdout().flush().ok();
    io::stderr().flush().ok();

    let mut pipefd = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(pipefd.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    match unsafe { libc::fork() } {
        -1 => return Err(io::Error::last_os_error()),
        0 => {}
        child => {
            // Relay parent: reap the intermediate child, then copy the pipe
            // to the terminal until EOF. A NUL as the last byte means the
            // daemon failed to initialize.
            unsafe {
                libc::close(pipefd[1]);
                let mut status = 0;
                libc::waitpid(child, &mut status, 0);
                if status != 0 {
                    eprintln!("daemon spawn failed (status: {status})");
                    libc::_exit(1);
                }
                let mut buf = [0u8; 1000];
                loop {
                    let n = libc::read(pipefd[0], buf.as_mut_ptr().cast(), buf.len());
                    if n <= 0 {
                        break;
                    }
                    let n = n as usize;
                    if buf[n - 1] == 0 {
                        if n > 1 {
                            io::stderr().write_all(&buf[..n - 1]).ok();
                        }
                        libc::_exit(1);
                    }
                    io::stderr().write_all(&buf[..n]).ok();
                }
                libc::_exit(0);
            }
        }
    }

    // First child: become a session leader, then fork the real daemon.
    unsafe {
        libc::setsid();
        libc::setpgid(0, libc::getpid());
    }
    match unsafe { libc::fork() } {
        -1 => {
            let err = io::Error::last_os_error();
            unsafe {
                let msg = b"fork error\n";
                libc::write(pipefd[1], msg.as_ptr().cast(), msg.len());
                libc::close(pipefd[1]);
            }
            return Err(err);
        }
        0 => {}
        _ => unsafe { libc::_exit(0) },
    }

    // Daemon: stdin/stdout to /dev/null, stderr into the relay pipe.
    unsafe {
        libc::close(pipefd[0]);
        dev_null_onto(libc::STDIN_FILENO)?;
        dev_null_onto(libc::STDOUT_FILENO)?;
        if libc::dup2(pipefd[1], libc::STDERR_FILENO) < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::close(pipefd[1]);
    }
    Ok(())
}

/// Stop relaying stderr to the terminal once initialization succeeded.
pub fn close_msg_channel() {
    io::stderr().flush().ok();
    if let Err(err) = dev_null_onto(libc::STDERR_FILENO) {
        warn!("can't redirect stderr to /dev/null: {err}");
    }
}

/// Tell the relay parent that initialization failed, then detach stderr.
pub fn mark_init_failure() {
    io::stderr().flush().ok();
    unsafe {
        libc::write(libc::STDERR_FILENO, [0u8].as_ptr().cast(), 1);
    }
    close_msg_channel();
}

/// Raise the open-files limit, degrading by quarters when the full value is
/// not allowed.
pub fn set_file_limit(max_files: u32) {
    let mut rls = libc::rlimit {
        rlim_cur: libc::rlim_t::from(max_files),
        rlim_max: libc::rlim_t::from(max_files),
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raw const rls) } >= 0 {
        info!(limit = max_files, "open files limit has been set");
        return;
    }
    info!(
        limit = max_files,
        "can't change open files limit (trying to set smaller value)"
    );
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &raw mut rls) } < 0 {
        return;
    }
    let mut limit = rls.rlim_max.min(libc::rlim_t::from(max_files));
    while limit > 1024 {
        rls.rlim_cur = limit;
        if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raw const rls) } >= 0 {
            info!(limit, "open files limit has been set");
            return;
        }
        limit = limit * 3 / 4;
    }
}

/// Allow unlimited core dumps and mark the process dumpable.
pub fn raise_core_limit() {
    let rls = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    unsafe {
        libc::setrlimit(libc::RLIMIT_CORE, &raw const rls);
    }
    #[cfg(target_os = "linux")]
    unsafe {
        libc::prctl(libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
    }
}

/// Lock the whole address space in RAM.
pub fn lock_memory() {
    let rls = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    unsafe {
        libc::setrlimit(libc::RLIMIT_MEMLOCK, &raw const rls);
        if libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) < 0 {
            warn!("memory lock error: {}", io::Error::last_os_error());
        } else {
            info!("process memory was successfully locked in RAM");
        }
    }
}

pub fn set_nice_level(level: i32) {
    unsafe {
        libc::setpriority(libc::PRIO_PROCESS as _, std::process::id() as libc::id_t, level);
    }
}

/// Tell the kernel's OOM killer to leave this process alone.
pub fn disable_oom_killer() {
    #[cfg(target_os = "linux")]
    {
        match std::fs::write("/proc/self/oom_score_adj", "-1000\n") {
            Ok(()) => info!("out of memory killer disabled"),
            Err(_) => info!("can't disable out of memory killer"),
        }
    }
}

/// Cap glibc malloc arenas so a thready server does not balloon its
/// virtual address space.
pub fn limit_malloc_arenas(arenas: u8) {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        const M_ARENA_MAX: libc::c_int = -8;
        const M_ARENA_TEST: libc::c_int = -7;
        if arenas == 0 {
            info!("setting glibc malloc arenas turned off");
            return;
        }
        if std::env::var_os("MALLOC_ARENA_MAX").is_none() {
            info!(arenas, "setting glibc malloc arena max");
            unsafe {
                libc::mallopt(M_ARENA_MAX, libc::c_int::from(arenas));
            }
        }
        if std::env::var_os("MALLOC_ARENA_TEST").is_none() {
            info!(arenas, "setting glibc malloc arena test");
            unsafe {
                libc::mallopt(M_ARENA_TEST, libc::c_int::from(arenas));
            }
        }
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    {
        let _ = arenas;
    }
}

pub fn set_umask(mask: u32) {
    unsafe {
        libc::umask((mask & 0o77) as libc::mode_t);
    }
}

fn group_id_by_name(name: &str) -> anyhow::Result<libc::gid_t> {
    let cname = CString::new(name).context("group name contains NUL")?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        bail!("{name}: no such group");
    }
    Ok(unsafe { (*gr).gr_gid })
}

fn user_by_name(name: &str) -> anyhow::Result<(libc::uid_t, libc::gid_t)> {
    let cname = CString::new(name).context("user name contains NUL")?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        bail!("{name}: no such user");
    }
    Ok(unsafe { ((*pw).pw_uid, (*pw).pw_gid) })
}

/// Drop privileges to the configured user/group when running as root.
/// Names prefixed with `#` are parsed as numeric ids.
pub fn change_user_group(user: &str, group: &str) -> anyhow::Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }

    let gid = if let Some(raw) = group.strip_prefix('#') {
        Some(raw.parse::<libc::gid_t>().context("numeric group id")?)
    } else if !group.is_empty() {
        Some(group_id_by_name(group)?)
    } else {
        None
    };

    let (uid, user_gid) = if let Some(raw) = user.strip_prefix('#') {
        (raw.parse::<libc::uid_t>().context("numeric user id")?, None)
    } else {
        let (uid, gid) = user_by_name(user)?;
        (uid, Some(gid))
    };

    let gid = match gid.or(user_gid) {
        Some(gid) => gid,
        None => bail!("{user}: numeric user id needs an explicit group"),
    };

    if unsafe { libc::setgid(gid) } < 0 {
        bail!("can't set gid to {gid}: {}", io::Error::last_os_error());
    }
    info!(gid, "set gid");
    if unsafe { libc::setuid(uid) } < 0 {
        bail!("can't set uid to {uid}: {}", io::Error::last_os_error());
    }
    info!(uid, "set uid");
    Ok(())
}
