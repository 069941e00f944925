//! Local-disk chunk backend and the master-link load sink.
//!
//! One chunk is one file under `chunks/` in the data directory, named by
//! chunk id and version. The serve operations speak a fixed request layout
//! over an already-connected socket:
//!
//! read:  `chunk_id(8) | version(4) | offset(4) | size(4)`,
//!        answered with `status(1) | data`
//! write: `chunk_id(8) | version(4) | offset(4) | data…`,
//!        answered with `status(1)`

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, warn};

use shardforge_jobs::{ChunkBackend, ChunkOpArgs, JobStatus, LoadLevel, LoadSink, ReplicateSource};

const BLOCK_SIZE: u64 = 0x10000;
const READ_REQUEST_LEN: usize = 20;
const WRITE_HEADER_LEN: usize = 16;

fn status_from_io(err: &io::Error) -> JobStatus {
    if err.kind() == io::ErrorKind::NotFound {
        JobStatus::NoChunk
    } else {
        JobStatus::IoError
    }
}

fn write_all_fd(sock: RawFd, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        let n = unsafe { libc::write(sock, data.as_ptr().cast(), data.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        data = &data[n as usize..];
    }
    Ok(())
}

/// Chunk storage on the local filesystem.
pub struct LocalDiskBackend {
    chunk_dir: PathBuf,
}

impl LocalDiskBackend {
    pub fn new(data_path: impl Into<PathBuf>) -> io::Result<Self> {
        let chunk_dir = data_path.into().join("chunks");
        std::fs::create_dir_all(&chunk_dir)?;
        Ok(Self { chunk_dir })
    }

    fn chunk_path(&self, chunk_id: u64, version: u32) -> PathBuf {
        self.chunk_dir
            .join(format!("chunk_{chunk_id:016X}_{version:08X}.dat"))
    }

    fn open_chunk(&self, chunk_id: u64, version: u32) -> io::Result<File> {
        File::open(self.chunk_path(chunk_id, version))
    }

    fn serve_read(&self, sock: RawFd, packet: &[u8]) -> Result<(), JobStatus> {
        if packet.len() < READ_REQUEST_LEN {
            return Err(JobStatus::InvalidArgs);
        }
        let chunk_id = u64::from_be_bytes(packet[0..8].try_into().expect("fixed slice"));
        let version = u32::from_be_bytes(packet[8..12].try_into().expect("fixed slice"));
        let offset = u32::from_be_bytes(packet[12..16].try_into().expect("fixed slice"));
        let size = u32::from_be_bytes(packet[16..20].try_into().expect("fixed slice"));

        let mut file = self.open_chunk(chunk_id, version).map_err(|err| status_from_io(&err))?;
        file.seek(SeekFrom::Start(u64::from(offset)))
            .map_err(|err| status_from_io(&err))?;
        let mut data = vec![0u8; size as usize];
        let mut filled = 0;
        while filled < data.len() {
            let n = file.read(&mut data[filled..]).map_err(|err| status_from_io(&err))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);

        let mut reply = Vec::with_capacity(1 + data.len());
        reply.push(JobStatus::Ok.as_byte());
        reply.extend_from_slice(&data);
        write_all_fd(sock, &reply).map_err(|_| JobStatus::IoError)
    }

    fn serve_write(&self, sock: RawFd, packet: &[u8]) -> Result<(), JobStatus> {
        if packet.len() < WRITE_HEADER_LEN {
            return Err(JobStatus::InvalidArgs);
        }
        let chunk_id = u64::from_be_bytes(packet[0..8].try_into().expect("fixed slice"));
        let version = u32::from_be_bytes(packet[8..12].try_into().expect("fixed slice"));
        let offset = u32::from_be_bytes(packet[12..16].try_into().expect("fixed slice"));
        let data = &packet[16..];

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.chunk_path(chunk_id, version))
            .map_err(|err| status_from_io(&err))?;
        file.seek(SeekFrom::Start(u64::from(offset)))
            .map_err(|err| status_from_io(&err))?;
        file.write_all(data).map_err(|err| status_from_io(&err))?;
        write_all_fd(sock, &[JobStatus::Ok.as_byte()]).map_err(|_| JobStatus::IoError)
    }
}

impl ChunkBackend for LocalDiskBackend {
    /// Chunk lifecycle dispatch: `new_version == 0` deletes; a zero current
    /// version creates; a non-zero `copy_chunk_id` duplicates; otherwise
    /// the version is moved and, when `length` is not the no-op marker, the
    /// chunk is truncated.
    fn chunk_op(&self, args: &ChunkOpArgs) -> JobStatus {
        let result: io::Result<()> = (|| {
            if args.new_version == 0 {
                std::fs::remove_file(self.chunk_path(args.chunk_id, args.version))?;
                return Ok(());
            }
            if args.version == 0 {
                File::create(self.chunk_path(args.chunk_id, args.new_version))?;
                return Ok(());
            }
            if args.copy_chunk_id != 0 {
                std::fs::copy(
                    self.chunk_path(args.chunk_id, args.version),
                    self.chunk_path(args.copy_chunk_id, args.copy_version),
                )?;
            }
            if args.new_version != args.version {
                std::fs::rename(
                    self.chunk_path(args.chunk_id, args.version),
                    self.chunk_path(args.chunk_id, args.new_version),
                )?;
            }
            if args.length != u32::MAX {
                let file = OpenOptions::new()
                    .write(true)
                    .open(self.chunk_path(args.chunk_id, args.new_version))?;
                file.set_len(u64::from(args.length))?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => JobStatus::Ok,
            Err(err) => status_from_io(&err),
        }
    }

    fn serv_read(&self, sock: RawFd, packet: &[u8]) -> JobStatus {
        match self.serve_read(sock, packet) {
            Ok(()) => JobStatus::Ok,
            Err(status) => status,
        }
    }

    fn serv_write(&self, sock: RawFd, packet: &[u8]) -> JobStatus {
        match self.serve_write(sock, packet) {
            Ok(()) => JobStatus::Ok,
            Err(status) => status,
        }
    }

    /// Degenerate replication: pull the first source that is present in the
    /// local store. Cross-host transport belongs to the network replicator.
    fn replicate(
        &self,
        chunk_id: u64,
        version: u32,
        _xor_masks: &[u32; 4],
        sources: &[ReplicateSource],
    ) -> JobStatus {
        for source in sources {
            let from = self.chunk_path(source.chunk_id, source.version);
            if from.exists() {
                return match std::fs::copy(&from, self.chunk_path(chunk_id, version)) {
                    Ok(_) => JobStatus::Ok,
                    Err(err) => status_from_io(&err),
                };
            }
        }
        warn!(chunk_id, "no replication source available locally");
        JobStatus::NoChunk
    }

    fn get_blocks(&self, chunk_id: u64, version: u32) -> Result<u16, JobStatus> {
        let file = self.open_chunk(chunk_id, version).map_err(|err| status_from_io(&err))?;
        let len = file.metadata().map_err(|err| status_from_io(&err))?.len();
        Ok(len.div_ceil(BLOCK_SIZE) as u16)
    }

    fn get_checksum(&self, chunk_id: u64, version: u32) -> Result<u32, JobStatus> {
        let mut file = self.open_chunk(chunk_id, version).map_err(|err| status_from_io(&err))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        loop {
            let n = file.read(&mut buf).map_err(|err| status_from_io(&err))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    fn get_checksum_tab(&self, chunk_id: u64, version: u32) -> Result<Vec<u8>, JobStatus> {
        let mut file = self.open_chunk(chunk_id, version).map_err(|err| status_from_io(&err))?;
        let mut tab = Vec::new();
        let mut buf = vec![0u8; BLOCK_SIZE as usize];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).map_err(|err| status_from_io(&err))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            tab.extend_from_slice(&crc32fast::hash(&buf[..filled]).to_be_bytes());
            if filled < buf.len() {
                break;
            }
        }
        Ok(tab)
    }

    fn move_chunk(&self, src: &File, dst: &File) -> JobStatus {
        let mut from = src;
        let mut to = dst;
        match io::copy(&mut from, &mut to) {
            Ok(_) => JobStatus::Ok,
            Err(err) => status_from_io(&err),
        }
    }
}

/// Stand-in for the master connection: records and logs heavy-load reports
/// so global admission control has something to read.
#[derive(Default)]
pub struct MasterLink {
    last_report: Mutex<Option<(u32, LoadLevel)>>,
}

impl MasterLink {
    pub fn last_report(&self) -> Option<(u32, LoadLevel)> {
        *self.last_report.lock().unwrap()
    }
}

impl LoadSink for MasterLink {
    fn heavy_load(&self, load: u32, level: LoadLevel) {
        debug!(load, ?level, "heavy load report");
        *self.last_report.lock().unwrap() = Some((load, level));
    }
}
