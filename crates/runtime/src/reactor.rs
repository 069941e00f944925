//! The single-threaded event loop.
//!
//! Every iteration: rebuild the descriptor set from the registered poll
//! hooks, poll with a 10 ms deadline, refresh the shared clock, dispatch
//! signal-pipe bytes, serve the poll hooks, run per-loop hooks and due
//! timers, reap finished background tasks, then advance the shutdown state
//! machine. All hooks, timer bodies and job callbacks run on this thread.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::signals::{Control, ControlByte, SignalPipe};
use crate::timers::{TimerId, TimerSet};

const POLL_TIMEOUT_MS: i32 = 10;
const LONG_LOOP_US: u64 = 5_000_000;

/// Descriptor set rebuilt on every loop iteration.
#[derive(Default)]
pub struct PollDesc {
    fds: Vec<libc::pollfd>,
}

impl PollDesc {
    fn reset(&mut self) {
        self.fds.clear();
    }

    /// Add a descriptor to watch; the returned index is valid for
    /// [`PollDesc::revents`] until the next iteration.
    pub fn add(&mut self, fd: RawFd, events: i16) -> usize {
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        self.fds.len() - 1
    }

    pub fn revents(&self, idx: usize) -> i16 {
        self.fds.get(idx).map_or(0, |p| p.revents)
    }

    fn poll(&mut self, timeout_ms: i32) -> i32 {
        unsafe { libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms) }
    }
}

/// A poll participant: populates descriptors before the poll, consumes
/// readiness after it.
pub trait PollHook {
    fn describe(&mut self, desc: &mut PollDesc);
    fn serve(&mut self, desc: &PollDesc);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Running,
    WantExit,
    Draining,
}

/// The reactor. Hooks are registered during initialization; `run` consumes
/// the reactor and returns once the shutdown sequence completes.
pub struct Reactor {
    clock: Arc<Clock>,
    signals: SignalPipe,
    control: Control,
    destructors: Vec<Box<dyn FnOnce()>>,
    want_exit: Vec<Box<dyn FnMut()>>,
    can_exit: Vec<Box<dyn FnMut() -> bool>>,
    reload: Vec<Box<dyn FnMut()>>,
    info: Vec<Box<dyn FnMut()>>,
    keepalive: Vec<Box<dyn FnMut()>>,
    each_loop: Vec<Box<dyn FnMut()>>,
    poll_hooks: Vec<Box<dyn PollHook>>,
    timers: TimerSet,
}

impl Reactor {
    pub fn new(clock: Arc<Clock>, signals: SignalPipe) -> io::Result<Self> {
        let control = Control::new(signals.dup_write_end()?);
        Ok(Self {
            clock,
            signals,
            control,
            destructors: Vec::new(),
            want_exit: Vec::new(),
            can_exit: Vec::new(),
            reload: Vec::new(),
            info: Vec::new(),
            keepalive: Vec::new(),
            each_loop: Vec::new(),
            poll_hooks: Vec::new(),
            timers: TimerSet::new(),
        })
    }

    pub fn clock(&self) -> Arc<Clock> {
        self.clock.clone()
    }

    pub fn control(&self) -> Control {
        self.control.clone()
    }

    /// Run once at exit, in reverse registration order.
    pub fn destruct_register(&mut self, f: Box<dyn FnOnce()>) {
        self.destructors.push(f);
    }

    pub fn wantexit_register(&mut self, f: Box<dyn FnMut()>) {
        self.want_exit.push(f);
    }

    /// The loop will not finish while any of these returns false.
    pub fn canexit_register(&mut self, f: Box<dyn FnMut() -> bool>) {
        self.can_exit.push(f);
    }

    pub fn reload_register(&mut self, f: Box<dyn FnMut()>) {
        self.reload.push(f);
    }

    pub fn info_register(&mut self, f: Box<dyn FnMut()>) {
        self.info.push(f);
    }

    pub fn keepalive_register(&mut self, f: Box<dyn FnMut()>) {
        self.keepalive.push(f);
    }

    pub fn eachloop_register(&mut self, f: Box<dyn FnMut()>) {
        self.each_loop.push(f);
    }

    pub fn poll_register(&mut self, hook: Box<dyn PollHook>) {
        self.poll_hooks.push(hook);
    }

    pub fn time_register(
        &mut self,
        period_s: u32,
        offset_s: u32,
        f: Box<dyn FnMut()>,
    ) -> Option<TimerId> {
        self.timers.register_s(self.clock.now_us(), period_s, offset_s, f)
    }

    pub fn msectime_register(
        &mut self,
        period_ms: u32,
        offset_ms: u32,
        f: Box<dyn FnMut()>,
    ) -> Option<TimerId> {
        self.timers.register_ms(self.clock.now_us(), period_ms, offset_ms, f)
    }

    pub fn time_change(&mut self, id: TimerId, period_s: u32, offset_s: u32) -> bool {
        self.timers.change_ms(
            id,
            self.clock.now_us(),
            period_s.saturating_mul(1_000),
            offset_s.saturating_mul(1_000),
        )
    }

    /// Manual clock tick for long-running initialization work: refreshes
    /// the shared clock and runs the keepalive hooks.
    pub fn keep_alive(&mut self) {
        let (prev, now) = self.clock.refresh();
        if now > prev && prev > 0 && now - prev > LONG_LOOP_US {
            warn!(gap_us = now - prev, "long loop detected");
        }
        for f in &mut self.keepalive {
            f();
        }
    }

    /// Drive the loop until the shutdown sequence finishes, then run the
    /// destructors in reverse registration order.
    pub fn run(mut self) {
        let mut desc = PollDesc::default();
        let mut phase = Phase::Running;
        let mut reload_pending = false;
        let mut info_pending = false;
        let mut reap_pending = false;
        let mut prev_us = self.clock.now_us();

        loop {
            desc.reset();
            let sig_idx = desc.add(self.signals.read_fd(), libc::POLLIN);
            for hook in &mut self.poll_hooks {
                hook.describe(&mut desc);
            }

            let ready = desc.poll(POLL_TIMEOUT_MS);
            let (last_us, now_us) = self.clock.refresh();
            if now_us > last_us && last_us > 0 && now_us - last_us > LONG_LOOP_US {
                warn!(gap_us = now_us - last_us, "long loop detected");
            }

            if ready < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(code) if code == libc::EAGAIN => {
                        warn!("poll returned EAGAIN");
                        std::thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    Some(code) if code == libc::EINTR => {
                        // Interrupted: skip serving, still run the hooks below.
                    }
                    _ => {
                        error!("poll error: {err}");
                        break;
                    }
                }
            } else {
                if desc.revents(sig_idx) & libc::POLLIN != 0 {
                    match self.signals.read_byte() {
                        Some(ControlByte::Terminate) if phase == Phase::Running => {
                            info!("terminate signal received");
                            phase = Phase::WantExit;
                        }
                        Some(ControlByte::InternalExit) if phase == Phase::Running => {
                            info!("internal terminate request");
                            phase = Phase::WantExit;
                        }
                        Some(ControlByte::Reload) => {
                            info!("reloading configuration");
                            reload_pending = true;
                        }
                        Some(ControlByte::ChildDone) => {
                            reap_pending = true;
                        }
                        Some(ControlByte::Info) => {
                            info!("logging extra info");
                            info_pending = true;
                        }
                        Some(ControlByte::Alarm) => {
                            info!("unexpected alarm/prof signal received - ignoring");
                        }
                        _ => {}
                    }
                }
                for hook in &mut self.poll_hooks {
                    hook.serve(&desc);
                }
            }

            for f in &mut self.each_loop {
                f();
            }

            self.timers.rebase(prev_us, now_us);
            self.timers.run_due(now_us);
            prev_us = now_us;

            if reap_pending {
                for (code, callback) in self.control.take_finished() {
                    callback(code);
                }
                reap_pending = self.control.reapers_pending();
            }

            if phase == Phase::Running {
                if reload_pending {
                    for f in &mut self.reload {
                        f();
                    }
                    reload_pending = false;
                }
                if info_pending {
                    for f in &mut self.info {
                        f();
                    }
                    info_pending = false;
                }
            }

            if phase == Phase::WantExit {
                for f in &mut self.want_exit {
                    f();
                }
                phase = Phase::Draining;
            }

            if phase == Phase::Draining && self.can_exit.iter_mut().all(|f| f()) {
                break;
            }
        }

        info!("exited from main loop");
        while let Some(destructor) = self.destructors.pop() {
            destructor();
        }
    }
}
