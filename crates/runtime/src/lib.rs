//! Process substrate for the shardforge daemons: the reactor main loop with
//! its hook registries and timers, the bounded producer–consumer queue, the
//! shared clock, signal plumbing, single-instance locking, daemonization
//! and configuration.

pub mod clock;
pub mod config;
pub mod daemonize;
pub mod lockfile;
pub mod queue;
pub mod reactor;
pub mod signals;
pub mod timers;

pub use clock::Clock;
pub use config::Config;
pub use lockfile::{LockGuard, LockOutcome, RunMode, wdlock};
pub use queue::{Entry, Queue, QueueError};
pub use reactor::{PollDesc, PollHook, Reactor};
pub use signals::{Control, ControlByte, SignalPipe};
pub use timers::{TimerId, TimerSet};
