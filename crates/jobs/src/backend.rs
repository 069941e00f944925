//! Collaborator interfaces the job pool dispatches into.

use std::fs::File;
use std::os::fd::RawFd;

use crate::ops::{ChunkOpArgs, JobStatus, ReplicateSource};

/// Blocking chunk-level operations executed by worker threads: the on-disk
/// chunk engine, the wire serve functions and the network replicator. Every
/// call returns one status byte.
pub trait ChunkBackend: Send + Sync {
    fn chunk_op(&self, args: &ChunkOpArgs) -> JobStatus;

    /// Serve a read request: the packet has been parsed off `sock` already,
    /// the reply is written back to it.
    fn serv_read(&self, sock: RawFd, packet: &[u8]) -> JobStatus;

    fn serv_write(&self, sock: RawFd, packet: &[u8]) -> JobStatus;

    fn replicate(
        &self,
        chunk_id: u64,
        version: u32,
        xor_masks: &[u32; 4],
        sources: &[ReplicateSource],
    ) -> JobStatus;

    fn get_blocks(&self, chunk_id: u64, version: u32) -> Result<u16, JobStatus>;

    fn get_checksum(&self, chunk_id: u64, version: u32) -> Result<u32, JobStatus>;

    fn get_checksum_tab(&self, chunk_id: u64, version: u32) -> Result<Vec<u8>, JobStatus>;

    fn move_chunk(&self, src: &File, dst: &File) -> JobStatus;
}

/// Coarse three-level load signal propagated upstream for global admission
/// control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadLevel {
    Low = 1,
    High = 2,
}

/// Upstream receiver of heavy-load reports (the master link).
pub trait LoadSink: Send + Sync {
    fn heavy_load(&self, load: u32, level: LoadLevel);
}
