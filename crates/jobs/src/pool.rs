//! The job pool: submission, indexing, completion delivery, lifecycle.
//!
//! Submissions enqueue a job id; worker threads pull ids, execute the
//! operation and push `(id, status)` onto the status queue. The wake pipe
//! carries exactly one byte per empty→non-empty transition of the status
//! queue, so the reactor gets at least one readable edge per completion
//! batch without the pipe ever filling up.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{info, warn};

use shardforge_runtime::queue::Queue;
use shardforge_runtime::reactor::{PollDesc, PollHook};

use crate::backend::{ChunkBackend, LoadLevel, LoadSink};
use crate::ops::{
    ChunkOpArgs, JobOp, JobStatus, OutSlot, ReplicateArgs, ReplicateSource, ServArgs,
};
use crate::worker;

const JOB_HASH_SIZE: usize = 0x400;

fn bucket_of(job_id: u32) -> usize {
    (job_id & 0x3FF) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobState {
    Enabled,
    InProgress,
    Disabled,
}

pub type Callback = Box<dyn FnOnce(JobStatus) + Send>;

pub(crate) struct JobEntry {
    pub(crate) id: u32,
    pub(crate) state: JobState,
    pub(crate) op: Option<JobOp>,
    pub(crate) callback: Option<Callback>,
}

pub(crate) struct JobTable {
    buckets: Vec<Vec<JobEntry>>,
    next_id: u32,
    pub(crate) workers_max: u32,
    pub(crate) workers_max_idle: u32,
    workers_himark: u32,
    workers_lomark: u32,
    pub(crate) workers_avail: u32,
    pub(crate) workers_total: u32,
    pub(crate) term_waiting: u32,
    last_worker_notice: u32,
    stats_max_jobs: u32,
}

impl JobTable {
    pub(crate) fn find_mut(&mut self, job_id: u32) -> Option<&mut JobEntry> {
        self.buckets[bucket_of(job_id)]
            .iter_mut()
            .find(|job| job.id == job_id)
    }

    fn remove(&mut self, job_id: u32) -> Option<JobEntry> {
        let bucket = &mut self.buckets[bucket_of(job_id)];
        let pos = bucket.iter().position(|job| job.id == job_id)?;
        Some(bucket.swap_remove(pos))
    }

    pub(crate) fn worker_notice(&mut self) {
        if self.workers_total % 10 == 0 && self.last_worker_notice != self.workers_total {
            info!(workers = self.workers_total, "worker count crossed");
            self.last_worker_notice = self.workers_total;
        }
    }
}

pub(crate) struct Shared {
    pub(crate) jobs: Mutex<JobTable>,
    pub(crate) term: Condvar,
    pipe_lock: Mutex<()>,
    rpipe: OwnedFd,
    wpipe: OwnedFd,
    pub(crate) work: Queue<()>,
    statuses: Queue<JobStatus>,
    pub(crate) backend: Arc<dyn ChunkBackend>,
}

/// Put a completion on the status queue, waking the reactor on the
/// empty→non-empty edge.
pub(crate) fn send_status(shared: &Shared, job_id: u32, status: JobStatus) {
    let _edge = shared.pipe_lock.lock().unwrap();
    if shared.statuses.is_empty() {
        unsafe {
            libc::write(shared.wpipe.as_raw_fd(), [status.as_byte()].as_ptr().cast(), 1);
        }
    }
    let _ = shared.statuses.put(job_id, status, 1);
}

/// Spawn one worker thread. Called with the job table locked; counters are
/// only bumped when the spawn succeeded.
pub(crate) fn spawn_worker(shared: &Arc<Shared>, jobs: &mut JobTable) {
    let for_thread = shared.clone();
    let spawned = std::thread::Builder::new()
        .name("job-worker".to_string())
        .spawn(move || worker::worker_loop(for_thread));
    match spawned {
        Ok(_) => {
            jobs.workers_avail += 1;
            jobs.workers_total += 1;
            jobs.worker_notice();
        }
        Err(err) => warn!("can't spawn job worker: {err}"),
    }
}

/// The chunk-server job engine. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct JobPool {
    shared: Arc<Shared>,
}

impl JobPool {
    /// Create the pool with the given work-queue capacity and spawn the
    /// first worker.
    pub fn new(backend: Arc<dyn ChunkBackend>, queue_length: u32) -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let rpipe = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let wpipe = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let shared = Arc::new(Shared {
            jobs: Mutex::new(JobTable {
                buckets: (0..JOB_HASH_SIZE).map(|_| Vec::new()).collect(),
                next_id: 1,
                workers_max: 250,
                workers_max_idle: 40,
                workers_himark: 187,
                workers_lomark: 125,
                workers_avail: 0,
                workers_total: 0,
                term_waiting: 0,
                last_worker_notice: 0,
                stats_max_jobs: 0,
            }),
            term: Condvar::new(),
            pipe_lock: Mutex::new(()),
            rpipe,
            wpipe,
            work: Queue::new(queue_length),
            statuses: Queue::new(0),
            backend,
        });

        {
            let mut jobs = shared.jobs.lock().unwrap();
            spawn_worker(&shared, &mut jobs);
        }
        Ok(Self { shared })
    }

    /// Re-read the worker limits; the load marks derive from the maximum.
    pub fn reload(&self, workers_max: u32, workers_max_idle: u32) {
        let mut jobs = self.shared.jobs.lock().unwrap();
        jobs.workers_max = workers_max.max(1);
        jobs.workers_himark = jobs.workers_max * 3 / 4;
        jobs.workers_lomark = jobs.workers_max / 2;
        jobs.workers_max_idle = workers_max_idle;
    }

    fn submit(
        &self,
        op: JobOp,
        callback: Callback,
        err_on_full: JobStatus,
        return_on_full: bool,
    ) -> u32 {
        let shared = &self.shared;
        let job_id = {
            let mut jobs = shared.jobs.lock().unwrap();
            let id = jobs.next_id;
            jobs.next_id = jobs.next_id.wrapping_add(1);
            if jobs.next_id == 0 {
                jobs.next_id = 1;
            }
            let bucket = bucket_of(id);
            jobs.buckets[bucket].push(JobEntry {
                id,
                state: JobState::Enabled,
                op: Some(op),
                callback: Some(callback),
            });
            id
        };

        if shared.work.try_put(job_id, (), 1).is_ok() {
            return job_id;
        }
        if return_on_full {
            // Backpressure contract: drop the job, free its arguments, let
            // the caller throttle at the socket.
            let mut jobs = shared.jobs.lock().unwrap();
            jobs.remove(job_id);
            return 0;
        }
        // Always-report contract: the job never ran, but its callback still
        // fires with the configured error status.
        send_status(shared, job_id, err_on_full);
        job_id
    }

    pub fn inval(&self, callback: Callback) -> u32 {
        self.submit(JobOp::Inval, callback, JobStatus::InvalidArgs, false)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn chunk_op(
        &self,
        callback: Callback,
        chunk_id: u64,
        version: u32,
        new_version: u32,
        copy_chunk_id: u64,
        copy_version: u32,
        length: u32,
    ) -> u32 {
        self.submit(
            JobOp::ChunkOp(ChunkOpArgs {
                chunk_id,
                version,
                new_version,
                copy_chunk_id,
                copy_version,
                length,
            }),
            callback,
            JobStatus::NotDone,
            false,
        )
    }

    pub fn serv_read(&self, callback: Callback, sock: RawFd, packet: Arc<[u8]>) -> u32 {
        self.submit(
            JobOp::ServRead(ServArgs { sock, packet }),
            callback,
            JobStatus::NotDone,
            true,
        )
    }

    pub fn serv_write(&self, callback: Callback, sock: RawFd, packet: Arc<[u8]>) -> u32 {
        self.submit(
            JobOp::ServWrite(ServArgs { sock, packet }),
            callback,
            JobStatus::NotDone,
            true,
        )
    }

    pub fn replicate_raid(
        &self,
        callback: Callback,
        chunk_id: u64,
        version: u32,
        xor_masks: [u32; 4],
        sources: Vec<ReplicateSource>,
    ) -> u32 {
        self.submit(
            JobOp::Replicate(ReplicateArgs {
                chunk_id,
                version,
                xor_masks,
                sources,
            }),
            callback,
            JobStatus::NotDone,
            false,
        )
    }

    /// Plain one-source replication; the mask pattern selects every block
    /// from the single peer.
    pub fn replicate_simple(
        &self,
        callback: Callback,
        chunk_id: u64,
        version: u32,
        ip: u32,
        port: u16,
    ) -> u32 {
        self.replicate_raid(
            callback,
            chunk_id,
            version,
            [0x88888888, 0x44444444, 0x22222222, 0x11111111],
            vec![ReplicateSource {
                chunk_id,
                version,
                ip,
                port,
            }],
        )
    }

    pub fn get_blocks(&self, callback: Callback, chunk_id: u64, version: u32, out: OutSlot<u16>) -> u32 {
        self.submit(
            JobOp::GetBlocks {
                chunk_id,
                version,
                out,
            },
            callback,
            JobStatus::NotDone,
            false,
        )
    }

    pub fn get_checksum(
        &self,
        callback: Callback,
        chunk_id: u64,
        version: u32,
        out: OutSlot<u32>,
    ) -> u32 {
        self.submit(
            JobOp::GetChecksum {
                chunk_id,
                version,
                out,
            },
            callback,
            JobStatus::NotDone,
            false,
        )
    }

    pub fn get_checksum_tab(
        &self,
        callback: Callback,
        chunk_id: u64,
        version: u32,
        out: OutSlot<Vec<u8>>,
    ) -> u32 {
        self.submit(
            JobOp::GetChecksumTab {
                chunk_id,
                version,
                out,
            },
            callback,
            JobStatus::NotDone,
            false,
        )
    }

    pub fn chunk_move(&self, callback: Callback, src: std::fs::File, dst: std::fs::File) -> u32 {
        self.submit(
            JobOp::ChunkMove { src, dst },
            callback,
            JobStatus::NotDone,
            false,
        )
    }

    /// Cancel a job that has not started yet. A job already picked up by a
    /// worker runs to completion.
    pub fn disable(&self, job_id: u32) {
        let mut jobs = self.shared.jobs.lock().unwrap();
        if let Some(job) = jobs.find_mut(job_id) {
            if job.state == JobState::Enabled {
                job.state = JobState::Disabled;
            }
        }
    }

    /// Swap the completion callback of a live job.
    pub fn change_callback(&self, job_id: u32, callback: Callback) {
        let mut jobs = self.shared.jobs.lock().unwrap();
        if let Some(job) = jobs.find_mut(job_id) {
            job.callback = Some(callback);
        }
    }

    fn receive_status(&self) -> Option<(u32, JobStatus, bool)> {
        let _edge = self.shared.pipe_lock.lock().unwrap();
        let entry = self.shared.statuses.try_get().ok()?;
        let more = !self.shared.statuses.is_empty();
        if !more {
            let mut byte = [0u8; 1];
            unsafe {
                libc::read(self.shared.rpipe.as_raw_fd(), byte.as_mut_ptr().cast(), 1);
            }
        }
        Some((entry.id, entry.item, more))
    }

    /// Drain the status queue: unlink every completed job and, when
    /// `deliver` is set, run its callback. Callbacks run after the index
    /// lock is released, in status order.
    pub fn poll_check(&self, deliver: bool) {
        let mut ready: Vec<(Callback, JobStatus)> = Vec::new();
        loop {
            let Some((job_id, status, more)) = self.receive_status() else {
                break;
            };
            {
                let mut jobs = self.shared.jobs.lock().unwrap();
                if let Some(mut job) = jobs.remove(job_id) {
                    if deliver {
                        if let Some(callback) = job.callback.take() {
                            ready.push((callback, status));
                        }
                    }
                }
            }
            if !more {
                break;
            }
        }
        for (callback, status) in ready {
            callback(status);
        }
    }

    /// Work in flight: busy workers plus queued submissions.
    pub fn jobs_count(&self) -> u32 {
        let jobs = self.shared.jobs.lock().unwrap();
        (jobs.workers_total - jobs.workers_avail) + self.shared.work.elements()
    }

    /// Record the current in-flight count into the high-water stat.
    pub fn note_jobs_high_water(&self) {
        let count = self.jobs_count();
        let mut jobs = self.shared.jobs.lock().unwrap();
        if count > jobs.stats_max_jobs {
            jobs.stats_max_jobs = count;
        }
    }

    /// Take and reset the high-water jobs count.
    pub fn stats_take_max(&self) -> u32 {
        let mut jobs = self.shared.jobs.lock().unwrap();
        std::mem::take(&mut jobs.stats_max_jobs)
    }

    /// Report coarse load upstream when outside the normal band: at or
    /// above the high mark, or below the low mark.
    pub fn heavy_load_check(&self, sink: &dyn LoadSink) {
        let (level, load) = {
            let jobs = self.shared.jobs.lock().unwrap();
            let busy = jobs.workers_total - jobs.workers_avail;
            let level = if busy >= jobs.workers_himark {
                Some(LoadLevel::High)
            } else if busy < jobs.workers_lomark {
                Some(LoadLevel::Low)
            } else {
                None
            };
            (level, busy + self.shared.work.elements())
        };
        if let Some(level) = level {
            sink.heavy_load(load, level);
        }
    }

    /// True once no work is in flight; used to gate shutdown.
    pub fn can_exit(&self) -> bool {
        self.jobs_count() == 0
    }

    /// Readable end of the wake pipe, for poll registration.
    pub fn wake_fd(&self) -> RawFd {
        self.shared.rpipe.as_raw_fd()
    }

    /// Wait up to `timeout_ms` for a completion wake byte.
    pub fn poll_wake(&self, timeout_ms: i32) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.wake_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let ready = unsafe { libc::poll(&raw mut pfd, 1, timeout_ms) };
        ready > 0 && pfd.revents & libc::POLLIN != 0
    }

    /// Close the work queue, wait for every worker to retire, then drop any
    /// undelivered statuses without invoking callbacks.
    pub fn shutdown(&self) {
        self.shared.work.close();
        let mut jobs = self.shared.jobs.lock().unwrap();
        while jobs.workers_total > 0 {
            jobs.term_waiting += 1;
            jobs = self.shared.term.wait(jobs).unwrap();
        }
        drop(jobs);
        if !self.shared.statuses.is_empty() {
            warn!("status queue not empty on shutdown");
            self.poll_check(false);
        }
    }
}

/// Poll-loop adapter: wake-pipe readable → drain completions and refresh
/// the high-water stat.
pub struct JobPoolHook {
    pool: JobPool,
    pos: Option<usize>,
}

impl JobPoolHook {
    pub fn new(pool: JobPool) -> Self {
        Self { pool, pos: None }
    }
}

impl PollHook for JobPoolHook {
    fn describe(&mut self, desc: &mut PollDesc) {
        self.pos = Some(desc.add(self.pool.wake_fd(), libc::POLLIN));
    }

    fn serve(&mut self, desc: &PollDesc) {
        if let Some(pos) = self.pos {
            if desc.revents(pos) & libc::POLLIN != 0 {
                self.pool.poll_check(true);
            }
        }
        self.pool.note_jobs_high_water();
    }
}
