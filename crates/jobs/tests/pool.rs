#![allow(unused_crate_dependencies)]

use std::fs::File;
use std::os::fd::RawFd;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use shardforge_jobs::{
    Callback, ChunkBackend, ChunkOpArgs, JobPool, JobStatus, LoadLevel, LoadSink,
    ReplicateSource, out_slot,
};

/// Backend whose operations can be held open until the test releases them.
#[derive(Default)]
struct TestBackend {
    blocked: Mutex<bool>,
    unblock: Condvar,
    started: Mutex<u32>,
    started_cv: Condvar,
    last_replicate: Mutex<Option<(u64, u32, Vec<ReplicateSource>)>>,
}

impl TestBackend {
    fn unblocked() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn blocked() -> Arc<Self> {
        let backend = Self::default();
        *backend.blocked.lock().unwrap() = true;
        Arc::new(backend)
    }

    fn release(&self) {
        *self.blocked.lock().unwrap() = false;
        self.unblock.notify_all();
    }

    fn wait_started(&self, want: u32) {
        let mut started = self.started.lock().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while *started < want {
            let (guard, timeout) = self
                .started_cv
                .wait_timeout(started, Duration::from_millis(100))
                .unwrap();
            started = guard;
            assert!(
                Instant::now() < deadline,
                "backend never reached {want} started ops"
            );
            let _ = timeout;
        }
    }

    fn enter(&self) {
        {
            let mut started = self.started.lock().unwrap();
            *started += 1;
            self.started_cv.notify_all();
        }
        let mut blocked = self.blocked.lock().unwrap();
        while *blocked {
            blocked = self.unblock.wait(blocked).unwrap();
        }
    }
}

impl ChunkBackend for TestBackend {
    fn chunk_op(&self, _args: &ChunkOpArgs) -> JobStatus {
        self.enter();
        JobStatus::Ok
    }

    fn serv_read(&self, _sock: RawFd, _packet: &[u8]) -> JobStatus {
        self.enter();
        JobStatus::Ok
    }

    fn serv_write(&self, _sock: RawFd, _packet: &[u8]) -> JobStatus {
        self.enter();
        JobStatus::Ok
    }

    fn replicate(
        &self,
        chunk_id: u64,
        version: u32,
        _xor_masks: &[u32; 4],
        sources: &[ReplicateSource],
    ) -> JobStatus {
        self.enter();
        *self.last_replicate.lock().unwrap() = Some((chunk_id, version, sources.to_vec()));
        JobStatus::Ok
    }

    fn get_blocks(&self, _chunk_id: u64, _version: u32) -> Result<u16, JobStatus> {
        self.enter();
        Ok(42)
    }

    fn get_checksum(&self, _chunk_id: u64, _version: u32) -> Result<u32, JobStatus> {
        self.enter();
        Ok(0xDEAD_BEEF)
    }

    fn get_checksum_tab(&self, _chunk_id: u64, _version: u32) -> Result<Vec<u8>, JobStatus> {
        self.enter();
        Ok(vec![1, 2, 3])
    }

    fn move_chunk(&self, _src: &File, _dst: &File) -> JobStatus {
        self.enter();
        JobStatus::Ok
    }
}

fn report_to(tx: Sender<JobStatus>) -> Callback {
    Box::new(move |status| {
        let _ = tx.send(status);
    })
}

fn collect(pool: &JobPool, rx: &Receiver<JobStatus>, want: usize) -> Vec<JobStatus> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut got = Vec::new();
    while got.len() < want {
        if pool.poll_wake(50) {
            pool.poll_check(true);
        }
        while let Ok(status) = rx.try_recv() {
            got.push(status);
        }
        assert!(Instant::now() < deadline, "timed out, got {got:?}");
    }
    got
}

fn submit_chunk_op(pool: &JobPool, cb: Callback) -> u32 {
    pool.chunk_op(cb, 1, 1, 0, 0, 0, 0)
}

#[test]
fn callback_fires_exactly_once_per_submit() {
    let backend = TestBackend::unblocked();
    let pool = JobPool::new(backend, 16).unwrap();
    let (tx, rx) = channel();
    let job_id = submit_chunk_op(&pool, report_to(tx));
    assert_ne!(job_id, 0);

    assert_eq!(collect(&pool, &rx, 1), vec![JobStatus::Ok]);
    // No second wake, no second delivery.
    assert!(!pool.poll_wake(100));
    assert!(rx.try_recv().is_err());
    pool.shutdown();
}

#[test]
fn inval_answers_through_the_normal_path() {
    let backend = TestBackend::unblocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();
    let (tx, rx) = channel();
    assert_ne!(pool.inval(report_to(tx)), 0);
    assert_eq!(collect(&pool, &rx, 1), vec![JobStatus::InvalidArgs]);
    // The typed no-op never touches the backend.
    assert_eq!(*backend.started.lock().unwrap(), 0);
    pool.shutdown();
}

#[test]
fn one_wake_edge_covers_a_whole_batch() {
    let backend = TestBackend::blocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();
    pool.reload(1, 40);
    let (tx, rx) = channel();
    submit_chunk_op(&pool, report_to(tx.clone()));
    submit_chunk_op(&pool, report_to(tx));
    backend.wait_started(1);
    backend.release();

    assert_eq!(collect(&pool, &rx, 2), vec![JobStatus::Ok, JobStatus::Ok]);
    // Both completions were drained; the pipe must be quiet again.
    assert!(!pool.poll_wake(100));
    pool.shutdown();
}

#[test]
fn full_queue_honors_both_submit_contracts() {
    let backend = TestBackend::blocked();
    let pool = JobPool::new(backend.clone(), 1).unwrap();
    pool.reload(1, 40);

    let (tx_a, rx_a) = channel();
    let a = submit_chunk_op(&pool, report_to(tx_a));
    assert_ne!(a, 0);
    backend.wait_started(1);

    let (tx_b, rx_b) = channel();
    let b = submit_chunk_op(&pool, report_to(tx_b));
    assert_ne!(b, 0);

    // Queue is now full. A drop-on-full submission returns id 0 and its
    // callback never fires.
    let (tx_c, rx_c) = channel();
    let packet: Arc<[u8]> = Arc::from(&b"rd-pkt"[..]);
    let c = pool.serv_read(report_to(tx_c), 0, packet);
    assert_eq!(c, 0);

    // An always-report submission still gets a callback, with the
    // configured error status, before the blocked job finishes.
    let (tx_d, rx_d) = channel();
    let d = submit_chunk_op(&pool, report_to(tx_d));
    assert_ne!(d, 0);
    assert_eq!(collect(&pool, &rx_d, 1), vec![JobStatus::NotDone]);

    backend.release();
    assert_eq!(collect(&pool, &rx_a, 1), vec![JobStatus::Ok]);
    assert_eq!(collect(&pool, &rx_b, 1), vec![JobStatus::Ok]);
    assert!(rx_c.try_recv().is_err());
    pool.shutdown();
}

#[test]
fn disable_before_pickup_reports_not_done() {
    let backend = TestBackend::blocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();
    pool.reload(1, 40);

    let (tx_a, rx_a) = channel();
    submit_chunk_op(&pool, report_to(tx_a));
    backend.wait_started(1);

    let (tx_b, rx_b) = channel();
    let b = submit_chunk_op(&pool, report_to(tx_b));
    pool.disable(b);

    backend.release();
    assert_eq!(collect(&pool, &rx_a, 1), vec![JobStatus::Ok]);
    assert_eq!(collect(&pool, &rx_b, 1), vec![JobStatus::NotDone]);
    pool.shutdown();
}

#[test]
fn disable_after_promotion_is_a_no_op() {
    let backend = TestBackend::blocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();

    let (tx, rx) = channel();
    let job_id = submit_chunk_op(&pool, report_to(tx));
    backend.wait_started(1);
    // The worker already promoted the job; the full operation runs.
    pool.disable(job_id);
    backend.release();
    assert_eq!(collect(&pool, &rx, 1), vec![JobStatus::Ok]);
    pool.shutdown();
}

#[test]
fn rebound_callback_receives_the_status() {
    let backend = TestBackend::blocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();

    let (tx_old, rx_old) = channel();
    let job_id = submit_chunk_op(&pool, report_to(tx_old));
    let (tx_new, rx_new) = channel();
    pool.change_callback(job_id, report_to(tx_new));

    backend.release();
    assert_eq!(collect(&pool, &rx_new, 1), vec![JobStatus::Ok]);
    assert!(rx_old.try_recv().is_err());
    pool.shutdown();
}

#[test]
fn serv_read_happy_path() {
    let backend = TestBackend::unblocked();
    let pool = JobPool::new(backend, 16).unwrap();
    let (tx, rx) = channel();
    let packet: Arc<[u8]> = Arc::from(&b"rd-pkt"[..]);
    assert_ne!(pool.serv_read(report_to(tx), 0, packet), 0);
    assert_eq!(collect(&pool, &rx, 1), vec![JobStatus::Ok]);
    assert!(!pool.poll_wake(100));
    pool.shutdown();
}

#[test]
fn chunk_move_runs_against_the_given_handles() {
    let backend = TestBackend::unblocked();
    let pool = JobPool::new(backend, 16).unwrap();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("src"), b"move me").unwrap();
    let src = File::open(dir.path().join("src")).unwrap();
    let dst = File::create(dir.path().join("dst")).unwrap();

    let (tx, rx) = channel();
    assert_ne!(pool.chunk_move(report_to(tx), src, dst), 0);
    assert_eq!(collect(&pool, &rx, 1), vec![JobStatus::Ok]);
    pool.shutdown();
}

#[test]
fn probe_ops_fill_their_output_slots() {
    let backend = TestBackend::unblocked();
    let pool = JobPool::new(backend, 16).unwrap();
    let (tx, rx) = channel();

    let blocks = out_slot();
    pool.get_blocks(report_to(tx.clone()), 7, 1, blocks.clone());
    let checksum = out_slot();
    pool.get_checksum(report_to(tx.clone()), 7, 1, checksum.clone());
    let tab = out_slot();
    pool.get_checksum_tab(report_to(tx), 7, 1, tab.clone());

    let got = collect(&pool, &rx, 3);
    assert_eq!(got, vec![JobStatus::Ok; 3]);
    assert_eq!(*blocks.lock().unwrap(), Some(42));
    assert_eq!(*checksum.lock().unwrap(), Some(0xDEAD_BEEF));
    assert_eq!(*tab.lock().unwrap(), Some(vec![1, 2, 3]));
    pool.shutdown();
}

#[test]
fn replicate_simple_builds_one_source() {
    let backend = TestBackend::unblocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();
    let (tx, rx) = channel();
    pool.replicate_simple(report_to(tx), 99, 3, 0x7F000001, 9422);
    assert_eq!(collect(&pool, &rx, 1), vec![JobStatus::Ok]);

    let seen = backend.last_replicate.lock().unwrap().clone().unwrap();
    assert_eq!(seen.0, 99);
    assert_eq!(seen.1, 3);
    assert_eq!(
        seen.2,
        vec![ReplicateSource {
            chunk_id: 99,
            version: 3,
            ip: 0x7F000001,
            port: 9422,
        }]
    );
    pool.shutdown();
}

#[test]
fn jobs_count_tracks_busy_and_queued() {
    let backend = TestBackend::blocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();
    pool.reload(1, 40);

    let (tx, rx) = channel();
    submit_chunk_op(&pool, report_to(tx.clone()));
    backend.wait_started(1);
    submit_chunk_op(&pool, report_to(tx));
    assert_eq!(pool.jobs_count(), 2);
    assert!(!pool.can_exit());

    backend.release();
    collect(&pool, &rx, 2);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !pool.can_exit() {
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }
    pool.shutdown();
}

#[test]
fn heavy_load_reports_both_bands() {
    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<(u32, LoadLevel)>>,
    }
    impl LoadSink for RecordingSink {
        fn heavy_load(&self, load: u32, level: LoadLevel) {
            self.seen.lock().unwrap().push((load, level));
        }
    }

    let backend = TestBackend::blocked();
    let pool = JobPool::new(backend.clone(), 16).unwrap();
    pool.reload(4, 40);

    let (tx, rx) = channel();
    for _ in 0..3 {
        submit_chunk_op(&pool, report_to(tx.clone()));
    }
    backend.wait_started(3);

    let sink = RecordingSink::default();
    pool.heavy_load_check(&sink);
    assert_eq!(sink.seen.lock().unwrap().last().copied(), Some((3, LoadLevel::High)));

    backend.release();
    collect(&pool, &rx, 3);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        pool.heavy_load_check(&sink);
        if sink.seen.lock().unwrap().last().map(|entry| entry.1) == Some(LoadLevel::Low) {
            break;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }
    pool.shutdown();
}

#[test]
fn shutdown_drops_undelivered_statuses() {
    let backend = TestBackend::unblocked();
    let pool = JobPool::new(backend, 16).unwrap();
    let (tx, rx) = channel();
    submit_chunk_op(&pool, report_to(tx));

    // Wait for the completion to be queued, but never deliver it.
    assert!(pool.poll_wake(5000));
    pool.shutdown();
    assert!(rx.try_recv().is_err());
}
