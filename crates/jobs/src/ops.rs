//! The closed set of chunk-level operations and their single-byte statuses.

use std::fs::File;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

/// Status byte reported for every finished job.
///
/// This is the whole vocabulary spoken across the worker/callback boundary;
/// richer errors inside a backend must narrow to one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    Ok = 0,
    /// Malformed operation arguments.
    InvalidArgs = 1,
    /// The operation was disabled before execution, or the work queue
    /// refused it under the always-report contract.
    NotDone = 2,
    IoError = 3,
    NoChunk = 4,
    WrongVersion = 5,
}

impl JobStatus {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Output cell for the probe operations; the submitter keeps a clone and
/// reads it from the completion callback.
pub type OutSlot<T> = Arc<Mutex<Option<T>>>;

pub fn out_slot<T>() -> OutSlot<T> {
    Arc::new(Mutex::new(None))
}

/// Arguments of a chunk lifecycle operation (create, delete, truncate,
/// version change, duplicate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOpArgs {
    pub chunk_id: u64,
    pub version: u32,
    pub new_version: u32,
    pub copy_chunk_id: u64,
    pub copy_version: u32,
    pub length: u32,
}

/// A wire packet handed to the serve operations. The buffer is shared with
/// the connection state that produced it and stays alive until the job's
/// callback has run.
#[derive(Debug, Clone)]
pub struct ServArgs {
    pub sock: RawFd,
    pub packet: Arc<[u8]>,
}

/// One replication source peer; 18 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicateSource {
    pub chunk_id: u64,
    pub version: u32,
    pub ip: u32,
    pub port: u16,
}

impl ReplicateSource {
    pub const ENCODED_LEN: usize = 18;

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.chunk_id.to_be_bytes());
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.ip.to_be_bytes());
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    pub fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            chunk_id: u64::from_be_bytes(raw[0..8].try_into().ok()?),
            version: u32::from_be_bytes(raw[8..12].try_into().ok()?),
            ip: u32::from_be_bytes(raw[12..16].try_into().ok()?),
            port: u16::from_be_bytes(raw[16..18].try_into().ok()?),
        })
    }

    /// Parse a packed source table of `count * ENCODED_LEN` bytes.
    pub fn decode_table(raw: &[u8], count: u8) -> Option<Vec<Self>> {
        let count = usize::from(count);
        if raw.len() < count * Self::ENCODED_LEN {
            return None;
        }
        let mut sources = Vec::with_capacity(count);
        for idx in 0..count {
            sources.push(Self::decode(&raw[idx * Self::ENCODED_LEN..])?);
        }
        Some(sources)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicateArgs {
    pub chunk_id: u64,
    pub version: u32,
    pub xor_masks: [u32; 4],
    pub sources: Vec<ReplicateSource>,
}

/// One job's operation, carrying its arguments by value.
pub enum JobOp {
    /// Typed no-op answering `InvalidArgs`; used to reject malformed
    /// requests through the normal completion path.
    Inval,
    ChunkOp(ChunkOpArgs),
    ServRead(ServArgs),
    ServWrite(ServArgs),
    Replicate(ReplicateArgs),
    GetBlocks {
        chunk_id: u64,
        version: u32,
        out: OutSlot<u16>,
    },
    GetChecksum {
        chunk_id: u64,
        version: u32,
        out: OutSlot<u32>,
    },
    GetChecksumTab {
        chunk_id: u64,
        version: u32,
        out: OutSlot<Vec<u8>>,
    },
    ChunkMove {
        src: File,
        dst: File,
    },
    /// Worker retire sentinel; never built by the public submit surface.
    Exit,
}
