//! Signal demultiplexing over a self-pipe.
//!
//! Handlers do nothing but write one intention byte; the reactor reads the
//! pipe from its poll loop and does the actual work on the loop thread.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::JoinHandle;

use libc::c_int;

/// Intention bytes carried over the self-pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlByte {
    Terminate = 1,
    Reload = 2,
    ChildDone = 3,
    Info = 4,
    Alarm = 5,
    InternalExit = 6,
}

impl ControlByte {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::Terminate),
            2 => Some(Self::Reload),
            3 => Some(Self::ChildDone),
            4 => Some(Self::Info),
            5 => Some(Self::Alarm),
            6 => Some(Self::InternalExit),
            _ => None,
        }
    }
}

/// Write end of the self-pipe, readable from the signal handler.
static SIGNAL_WFD: AtomicI32 = AtomicI32::new(-1);

fn pipe_send(byte: u8) {
    let fd = SIGNAL_WFD.load(Ordering::Relaxed);
    if fd >= 0 {
        // Async-signal-safe: a single write(2), result ignored.
        unsafe {
            libc::write(fd, [byte].as_ptr().cast(), 1);
        }
    }
}

extern "C" fn on_signal(signo: c_int) {
    let byte = match signo {
        libc::SIGTERM | libc::SIGINT => ControlByte::Terminate as u8,
        libc::SIGHUP => ControlByte::Reload as u8,
        libc::SIGCHLD => ControlByte::ChildDone as u8,
        libc::SIGUSR1 => ControlByte::Info as u8,
        libc::SIGALRM | libc::SIGVTALRM | libc::SIGPROF => ControlByte::Alarm as u8,
        _ => return,
    };
    pipe_send(byte);
}

fn install_handler(signo: c_int, handler: libc::sighandler_t) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_flags = libc::SA_RESTART;
        sa.sa_sigaction = handler;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signo, &sa, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// The installed self-pipe. Owns both ends; the write end is also published
/// to the signal handler and duplicated into [`Control`] handles.
pub struct SignalPipe {
    rfd: OwnedFd,
    wfd: OwnedFd,
}

impl SignalPipe {
    /// Create the pipe and install every handler. In daemon mode SIGINT is
    /// ignored instead of terminating, since the controlling terminal is
    /// gone anyway.
    pub fn install(daemon: bool) -> io::Result<Self> {
        let mut fds = [0 as c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let rfd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let wfd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        for fd in [rfd.as_raw_fd(), wfd.as_raw_fd()] {
            unsafe {
                libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
            }
        }
        SIGNAL_WFD.store(wfd.as_raw_fd(), Ordering::Relaxed);

        let handled = on_signal as usize as libc::sighandler_t;
        install_handler(libc::SIGTERM, handled)?;
        install_handler(libc::SIGHUP, handled)?;
        install_handler(libc::SIGCHLD, handled)?;
        install_handler(libc::SIGUSR1, handled)?;
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        ))]
        install_handler(libc::SIGINFO, handled)?;
        install_handler(libc::SIGALRM, handled)?;
        install_handler(libc::SIGVTALRM, handled)?;
        install_handler(libc::SIGPROF, handled)?;
        for signo in [
            libc::SIGQUIT,
            libc::SIGPIPE,
            libc::SIGTSTP,
            libc::SIGTTIN,
            libc::SIGTTOU,
            libc::SIGUSR2,
        ] {
            install_handler(signo, libc::SIG_IGN)?;
        }
        install_handler(
            libc::SIGINT,
            if daemon { libc::SIG_IGN } else { handled },
        )?;

        Ok(Self { rfd, wfd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.rfd.as_raw_fd()
    }

    /// Read one intention byte; `None` on EOF or an unknown byte.
    pub fn read_byte(&self) -> Option<ControlByte> {
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(self.rfd.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        if n == 1 {
            ControlByte::from_raw(buf[0])
        } else {
            None
        }
    }

    pub(crate) fn dup_write_end(&self) -> io::Result<OwnedFd> {
        let fd = unsafe { libc::fcntl(self.wfd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        SIGNAL_WFD.store(-1, Ordering::Relaxed);
    }
}

type ReapCallback = Box<dyn FnOnce(i32) + Send>;

struct Reaper {
    handle: JoinHandle<i32>,
    callback: ReapCallback,
}

struct ControlInner {
    wfd: OwnedFd,
    // Keeps a standalone control's pipe readable so sends never SIGPIPE.
    _rfd: Option<OwnedFd>,
    reapers: Mutex<Vec<Reaper>>,
}

/// Cloneable cross-thread handle into the reactor: request an orderly exit,
/// announce a finished background task, register completion watchers.
#[derive(Clone)]
pub struct Control {
    inner: std::sync::Arc<ControlInner>,
}

impl Control {
    pub(crate) fn new(wfd: OwnedFd) -> Self {
        Self {
            inner: std::sync::Arc::new(ControlInner {
                wfd,
                _rfd: None,
                reapers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A control handle with its own private pipe, for components that run
    /// without a reactor (tools, tests). Exit requests go nowhere; the
    /// reaper registry works as usual.
    pub fn standalone() -> io::Result<Self> {
        let mut fds = [0 as c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let rfd = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let wfd = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok(Self {
            inner: std::sync::Arc::new(ControlInner {
                wfd,
                _rfd: Some(rfd),
                reapers: Mutex::new(Vec::new()),
            }),
        })
    }

    fn send(&self, byte: ControlByte) {
        unsafe {
            libc::write(self.inner.wfd.as_raw_fd(), [byte as u8].as_ptr().cast(), 1);
        }
    }

    /// Ask the reactor to begin its shutdown sequence.
    pub fn request_exit(&self) {
        self.send(ControlByte::InternalExit);
    }

    /// Announce that a registered background task has finished. Called by
    /// the task itself as its last action before returning.
    pub fn notify_child_done(&self) {
        self.send(ControlByte::ChildDone);
    }

    /// Watch a background task; `callback` receives its exit code once it
    /// finishes (3 if the task panicked).
    pub fn reap_register(&self, handle: JoinHandle<i32>, callback: ReapCallback) {
        self.inner.reapers.lock().unwrap().push(Reaper { handle, callback });
    }

    pub fn reapers_pending(&self) -> bool {
        !self.inner.reapers.lock().unwrap().is_empty()
    }

    /// Collect every finished watched task. Returns `(exit_code, callback)`
    /// pairs; the caller invokes the callbacks outside the registry lock.
    pub fn take_finished(&self) -> Vec<(i32, ReapCallback)> {
        let mut reapers = self.inner.reapers.lock().unwrap();
        let mut done = Vec::new();
        let mut idx = 0;
        while idx < reapers.len() {
            if reapers[idx].handle.is_finished() {
                let reaper = reapers.swap_remove(idx);
                let code = reaper.handle.join().unwrap_or(3);
                done.push((code, reaper.callback));
            } else {
                idx += 1;
            }
        }
        done
    }
}
