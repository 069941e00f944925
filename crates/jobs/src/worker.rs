//! Worker thread body.

use std::sync::Arc;

use crate::ops::{JobOp, JobStatus};
use crate::pool::{JobState, JobTable, Shared, send_status, spawn_worker};

/// Retire the current worker. `idle` says whether this worker is counted in
/// the available set right now.
fn close_worker(shared: &Shared, jobs: &mut JobTable, idle: bool) {
    if idle {
        jobs.workers_avail -= 1;
    }
    jobs.workers_total -= 1;
    if jobs.workers_total == 0 && jobs.term_waiting > 0 {
        shared.term.notify_all();
        jobs.term_waiting = 0;
    }
    jobs.worker_notice();
}

pub(crate) fn worker_loop(shared: Arc<Shared>) {
    loop {
        let entry = match shared.work.get() {
            Ok(entry) => entry,
            Err(_) => {
                // Queue closed: the pool is shutting down.
                let mut jobs = shared.jobs.lock().unwrap();
                close_worker(&shared, &mut jobs, true);
                return;
            }
        };
        let job_id = entry.id;

        let (op, disabled) = {
            let mut jobs = shared.jobs.lock().unwrap();
            jobs.workers_avail -= 1;
            if jobs.workers_avail == 0 && jobs.workers_total < jobs.workers_max {
                spawn_worker(&shared, &mut jobs);
            }
            match jobs.find_mut(job_id) {
                Some(job) => {
                    if job.state == JobState::Enabled {
                        job.state = JobState::InProgress;
                    }
                    let disabled = job.state == JobState::Disabled;
                    (job.op.take(), disabled)
                }
                None => (None, true),
            }
        };

        let status = match op {
            Some(JobOp::Inval) => JobStatus::InvalidArgs,
            Some(JobOp::Exit) => {
                let mut jobs = shared.jobs.lock().unwrap();
                close_worker(&shared, &mut jobs, false);
                return;
            }
            _ if disabled => JobStatus::NotDone,
            Some(JobOp::ChunkOp(args)) => shared.backend.chunk_op(&args),
            Some(JobOp::ServRead(args)) => shared.backend.serv_read(args.sock, &args.packet),
            Some(JobOp::ServWrite(args)) => shared.backend.serv_write(args.sock, &args.packet),
            Some(JobOp::Replicate(args)) => shared.backend.replicate(
                args.chunk_id,
                args.version,
                &args.xor_masks,
                &args.sources,
            ),
            Some(JobOp::GetBlocks {
                chunk_id,
                version,
                out,
            }) => match shared.backend.get_blocks(chunk_id, version) {
                Ok(blocks) => {
                    *out.lock().unwrap() = Some(blocks);
                    JobStatus::Ok
                }
                Err(status) => status,
            },
            Some(JobOp::GetChecksum {
                chunk_id,
                version,
                out,
            }) => match shared.backend.get_checksum(chunk_id, version) {
                Ok(checksum) => {
                    *out.lock().unwrap() = Some(checksum);
                    JobStatus::Ok
                }
                Err(status) => status,
            },
            Some(JobOp::GetChecksumTab {
                chunk_id,
                version,
                out,
            }) => match shared.backend.get_checksum_tab(chunk_id, version) {
                Ok(tab) => {
                    *out.lock().unwrap() = Some(tab);
                    JobStatus::Ok
                }
                Err(status) => status,
            },
            Some(JobOp::ChunkMove { src, dst }) => shared.backend.move_chunk(&src, &dst),
            None => JobStatus::NotDone,
        };

        send_status(&shared, job_id, status);

        let mut jobs = shared.jobs.lock().unwrap();
        jobs.workers_avail += 1;
        if jobs.workers_avail > jobs.workers_max_idle {
            close_worker(&shared, &mut jobs, true);
            return;
        }
    }
}
