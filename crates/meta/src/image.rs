//! On-disk metadata image: versioned header, framed sections with declared
//! lengths, per-section CRC sidecar, explicit end marker.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use crate::state::{MetaState, SectionId};
use crate::wire::{CountingReader, CrcWriter};

pub const SIGNATURE: &[u8; 8] = b"MFSM 2.0";
pub const SIGNATURE_PREFIX: &[u8; 5] = b"MFSM ";
pub const BOOTSTRAP_SIGNATURE: &[u8; 8] = b"MFSM NEW";
pub const EOF_MARKER: &[u8; 16] = b"[MFS EOF MARKER]";

/// Declared length of a section streamed without patch-back.
const LENGTH_UNKNOWN: u64 = u64::MAX;

const FILE_BUFFER_SIZE: usize = 0x100_0000;

/// Outcome of a header/trailer validation pass over one candidate file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCheck {
    Ok { version: u64, id: u64 },
    NoFile,
    IoError,
    BadHeader,
    BadEnding { version: u64, id: u64 },
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("bad image header")]
    BadHeader,
    #[error("image format predates section framing")]
    TooOld,
    #[error("section {0} was stored by a newer version")]
    VersionTooNew(String),
    #[error("unknown section {0}")]
    UnknownSection(String),
    #[error("section {section}: declared {declared} bytes, loader consumed {consumed}")]
    LengthMismatch {
        section: String,
        declared: u64,
        consumed: u64,
    },
}

fn parse_format_version(header: &[u8; 8]) -> Option<u8> {
    if &header[..5] != SIGNATURE_PREFIX {
        return None;
    }
    let major = header[5];
    let minor = header[7];
    if major.is_ascii_digit() && header[6] == b'.' && minor.is_ascii_digit() {
        Some(((major - b'0') << 4) + (minor - b'0'))
    } else {
        None
    }
}

fn tag_name(tag: &[u8; 4]) -> String {
    String::from_utf8_lossy(tag).into_owned()
}

/// Validate a candidate image: signature, header fields, end marker.
pub fn check_file(path: &Path) -> FileCheck {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return FileCheck::NoFile,
        Err(_) => return FileCheck::IoError,
    };

    let mut signature = [0u8; 8];
    if file.read_exact(&mut signature).is_err() {
        return FileCheck::IoError;
    }
    if &signature == BOOTSTRAP_SIGNATURE {
        return FileCheck::Ok { version: 1, id: 0 };
    }
    let Some(fver) = parse_format_version(&signature) else {
        return FileCheck::BadHeader;
    };

    let mut header = [0u8; 16];
    if file.read_exact(&mut header).is_err() {
        return FileCheck::IoError;
    }
    let (version, id) = if fver < 0x20 {
        // Legacy header: node counter (4), version (8), session counter (4).
        let version = u64::from_be_bytes(header[4..12].try_into().expect("fixed slice"));
        (version, 0)
    } else {
        (
            u64::from_be_bytes(header[0..8].try_into().expect("fixed slice")),
            u64::from_be_bytes(header[8..16].try_into().expect("fixed slice")),
        )
    };

    let expected: [u8; 16] = if fver < 0x16 { [0u8; 16] } else { *EOF_MARKER };
    let mut trailer = [0u8; 16];
    if file.seek(SeekFrom::End(-16)).is_err() || file.read_exact(&mut trailer).is_err() {
        return FileCheck::IoError;
    }
    if trailer != expected {
        return FileCheck::BadEnding { version, id };
    }
    FileCheck::Ok { version, id }
}

/// Stream the image body (header, sections, end marker); the caller writes
/// the 8-byte signature first. Returns the `(tag, crc)` sidecar records in
/// write order.
pub fn write_image<W: Write + Seek>(
    out: &mut W,
    state: &MetaState,
) -> io::Result<Vec<([u8; 4], u32)>> {
    let mut records = Vec::with_capacity(SectionId::WRITE_ORDER.len() + 2);

    let mut header = [0u8; 16];
    header[0..8].copy_from_slice(&state.version.to_be_bytes());
    header[8..16].copy_from_slice(&state.id.to_be_bytes());
    out.write_all(&header)?;
    records.push((*b"HEAD", crc32fast::hash(&header)));

    for section in SectionId::WRITE_ORDER {
        let tag = section.tag();
        let mver = state.section_version(section);
        let mut section_header = [0u8; 16];
        section_header[0..4].copy_from_slice(&tag);
        section_header[4] = b' ';
        section_header[5] = b'0' + ((mver >> 4) & 0xF);
        section_header[6] = b'.';
        section_header[7] = b'0' + (mver & 0xF);
        section_header[8..16].copy_from_slice(&LENGTH_UNKNOWN.to_be_bytes());
        out.write_all(&section_header)?;

        let payload_start = out.stream_position()?;
        let (length, crc) = {
            let mut payload = CrcWriter::new(out);
            state.store_section(section, &mut payload)?;
            payload.finish()
        };
        let payload_end = out.stream_position()?;

        // Patch the real payload length into the header.
        out.seek(SeekFrom::Start(payload_start - 8))?;
        out.write_all(&length.to_be_bytes())?;
        out.seek(SeekFrom::Start(payload_end))?;
        records.push((tag, crc));
    }

    out.write_all(EOF_MARKER)?;
    records.push((*b"TAIL", crc32fast::hash(EOF_MARKER)));
    Ok(records)
}

/// Write the sidecar: one `tag(4) | crc32(4)` record per segment.
pub fn write_crc_sidecar(path: &Path, records: &[([u8; 4], u32)]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    for (tag, crc) in records {
        out.write_all(tag)?;
        out.write_all(&crc.to_be_bytes())?;
    }
    out.flush()
}

pub fn read_crc_sidecar(path: &Path) -> io::Result<Vec<([u8; 4], u32)>> {
    let raw = std::fs::read(path)?;
    if raw.len() % 8 != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated crc sidecar"));
    }
    Ok(raw
        .chunks_exact(8)
        .map(|record| {
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&record[0..4]);
            let crc = u32::from_be_bytes(record[4..8].try_into().expect("fixed slice"));
            (tag, crc)
        })
        .collect())
}

/// Read every section after the signature has been parsed off `r`.
pub fn load_image<R: Read>(r: R, fver: u8, ignore: bool) -> Result<MetaState, LoadError> {
    if fver < 0x16 {
        return Err(LoadError::TooOld);
    }
    let mut r = CountingReader::new(r);
    let mut state = MetaState::default();

    let mut header = [0u8; 16];
    r.read_exact(&mut header)?;
    if fver < 0x20 {
        state.version = u64::from_be_bytes(header[4..12].try_into().expect("fixed slice"));
        state.id = 0;
    } else {
        state.version = u64::from_be_bytes(header[0..8].try_into().expect("fixed slice"));
        state.id = u64::from_be_bytes(header[8..16].try_into().expect("fixed slice"));
    }

    loop {
        let mut section_header = [0u8; 16];
        r.read_exact(&mut section_header)?;
        if &section_header == EOF_MARKER {
            break;
        }
        let mut tag = [0u8; 4];
        tag.copy_from_slice(&section_header[0..4]);
        let declared = u64::from_be_bytes(section_header[8..16].try_into().expect("fixed slice"));
        let mver = ((section_header[5].wrapping_sub(b'0') & 0xF) << 4)
            + (section_header[7].wrapping_sub(b'0') & 0xF);

        let Some(section) = SectionId::from_tag(&tag) else {
            // A section of indeterminate length can't be skipped at all.
            if !ignore || declared == LENGTH_UNKNOWN {
                return Err(LoadError::UnknownSection(tag_name(&tag)));
            }
            warn!(
                section = tag_name(&tag),
                length = declared,
                "unknown section found - all data from this section will be lost"
            );
            io::copy(&mut (&mut r).take(declared), &mut io::sink()).map_err(LoadError::Io)?;
            continue;
        };

        if mver > state.section_version(section) {
            return Err(LoadError::VersionTooNew(tag_name(&tag)));
        }

        let before = r.consumed();
        state.load_section(section, &mut r, mver)?;
        let consumed = r.consumed() - before;

        if declared != LENGTH_UNKNOWN && consumed != declared {
            if !ignore {
                return Err(LoadError::LengthMismatch {
                    section: tag_name(&tag),
                    declared,
                    consumed,
                });
            }
            warn!(
                section = tag_name(&tag),
                declared, consumed, "section length mismatch - file may be corrupted"
            );
            if consumed < declared {
                io::copy(&mut (&mut r).take(declared - consumed), &mut io::sink())
                    .map_err(LoadError::Io)?;
            }
        }
    }
    Ok(state)
}

/// Load a whole image file, bootstrap signature included.
pub fn load_from_file(path: &Path, ignore: bool) -> Result<MetaState, LoadError> {
    let mut file = BufReader::with_capacity(FILE_BUFFER_SIZE, File::open(path)?);
    let mut signature = [0u8; 8];
    file.read_exact(&mut signature)?;
    if &signature == BOOTSTRAP_SIGNATURE {
        return Ok(MetaState::new());
    }
    let fver = parse_format_version(&signature).ok_or(LoadError::BadHeader)?;
    load_image(file, fver, ignore)
}

/// Write a whole image file plus its CRC sidecar.
pub fn store_to_file(path: &Path, crc_path: Option<&Path>, state: &MetaState) -> io::Result<()> {
    let mut out = BufWriter::with_capacity(FILE_BUFFER_SIZE, File::create(path)?);
    out.write_all(SIGNATURE)?;
    let records = write_image(&mut out, state)?;
    out.flush()?;
    if let Some(crc_path) = crc_path {
        write_crc_sidecar(crc_path, &records)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sections::{ChunkInfo, Node, NodeKind, Session};
    use std::io::Cursor;

    fn sample_state() -> MetaState {
        let mut state = MetaState::new();
        state.version = 1000;
        state.id = 0x4D46_5331;
        state.sessions.sessions.push(Session {
            id: 1,
            ip: 0x0A000001,
            open_since: 1234,
            name: "client-1".to_string(),
        });
        state.nodes.insert(Node {
            inode: 1,
            kind: NodeKind::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            length: 0,
            chunks: Vec::new(),
        });
        state.chunks.insert(0x77, ChunkInfo { version: 3, archived: false });
        state
    }

    #[test]
    fn image_round_trip_preserves_state() {
        let state = sample_state();
        let mut raw = Cursor::new(Vec::new());
        raw.write_all(SIGNATURE).unwrap();
        write_image(&mut raw, &state).unwrap();

        let raw = raw.into_inner();
        let mut r = raw.as_slice();
        let mut signature = [0u8; 8];
        r.read_exact(&mut signature).unwrap();
        assert_eq!(&signature, SIGNATURE);
        let loaded = load_image(r, 0x20, false).unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn sidecar_crcs_match_payload_bytes() {
        let state = sample_state();
        let mut raw = Cursor::new(Vec::new());
        raw.write_all(SIGNATURE).unwrap();
        let records = write_image(&mut raw, &state).unwrap();
        let raw = raw.into_inner();

        // 2 framing records plus one per section, in write order.
        assert_eq!(records.len(), SectionId::WRITE_ORDER.len() + 2);
        assert_eq!(&records[0].0, b"HEAD");
        assert_eq!(records[0].1, crc32fast::hash(&raw[8..24]));
        assert_eq!(&records.last().unwrap().0, b"TAIL");

        // Walk the frame and recompute each payload crc independently.
        let mut offset = 24;
        for (idx, section) in SectionId::WRITE_ORDER.iter().enumerate() {
            let header = &raw[offset..offset + 16];
            assert_eq!(&header[0..4], &section.tag());
            let length =
                u64::from_be_bytes(header[8..16].try_into().unwrap()) as usize;
            let payload = &raw[offset + 16..offset + 16 + length];
            assert_eq!(records[idx + 1].1, crc32fast::hash(payload), "section {idx}");
            offset += 16 + length;
        }
        assert_eq!(&raw[offset..offset + 16], EOF_MARKER);
    }

    #[test]
    fn check_file_validates_good_and_broken_images() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("metadata.mfs");
        let state = sample_state();
        store_to_file(&good, None, &state).unwrap();
        assert_eq!(
            check_file(&good),
            FileCheck::Ok { version: 1000, id: 0x4D46_5331 }
        );

        // Truncation loses the end marker.
        let raw = std::fs::read(&good).unwrap();
        let cut = dir.path().join("metadata.mfs.cut");
        std::fs::write(&cut, &raw[..raw.len() - 8]).unwrap();
        assert!(matches!(check_file(&cut), FileCheck::BadEnding { version: 1000, .. }));

        let garbage = dir.path().join("metadata.mfs.garbage");
        std::fs::write(&garbage, b"not a metadata image at all").unwrap();
        assert_eq!(check_file(&garbage), FileCheck::BadHeader);

        assert_eq!(check_file(&dir.path().join("absent")), FileCheck::NoFile);

        let bootstrap = dir.path().join("metadata.bootstrap");
        std::fs::write(&bootstrap, BOOTSTRAP_SIGNATURE).unwrap();
        assert_eq!(check_file(&bootstrap), FileCheck::Ok { version: 1, id: 0 });
    }

    #[test]
    fn unknown_section_needs_ignore_mode() {
        let state = MetaState::new();
        let mut raw = Cursor::new(Vec::new());
        raw.write_all(SIGNATURE).unwrap();
        write_image(&mut raw, &state).unwrap();
        let mut raw = raw.into_inner();

        // Splice a bogus section right before the end marker.
        let marker_at = raw.len() - 16;
        let mut bogus = Vec::new();
        bogus.extend_from_slice(b"WTAG 1.0");
        bogus.extend_from_slice(&4u64.to_be_bytes());
        bogus.extend_from_slice(&[1, 2, 3, 4]);
        raw.splice(marker_at..marker_at, bogus);

        let strict = load_image(&raw[8..], 0x20, false);
        assert!(matches!(strict, Err(LoadError::UnknownSection(_))));
        let lax = load_image(&raw[8..], 0x20, true).unwrap();
        assert_eq!(lax.version, 1);
    }

    #[test]
    fn declared_length_mismatch_is_detected() {
        let state = sample_state();
        let mut raw = Cursor::new(Vec::new());
        raw.write_all(SIGNATURE).unwrap();
        write_image(&mut raw, &state).unwrap();
        let mut raw = raw.into_inner();

        // Inflate the first section's declared length by 4 and pad it, so
        // the loader consumes less than declared.
        let header_at = 24;
        let length_at = header_at + 8;
        let declared =
            u64::from_be_bytes(raw[length_at..length_at + 16 - 8].try_into().unwrap());
        let payload_end = header_at + 16 + declared as usize;
        raw[length_at..length_at + 8].copy_from_slice(&(declared + 4).to_be_bytes());
        raw.splice(payload_end..payload_end, [0u8; 4]);

        let strict = load_image(&raw[8..], 0x20, false);
        assert!(matches!(strict, Err(LoadError::LengthMismatch { .. })));
        let lax = load_image(&raw[8..], 0x20, true).unwrap();
        assert_eq!(lax.version, state.version);
    }

    #[test]
    fn newer_section_version_is_refused() {
        let state = MetaState::new();
        let mut raw = Cursor::new(Vec::new());
        raw.write_all(SIGNATURE).unwrap();
        write_image(&mut raw, &state).unwrap();
        let mut raw = raw.into_inner();

        // First section claims format 9.9.
        raw[24 + 5] = b'9';
        raw[24 + 7] = b'9';
        assert!(matches!(
            load_image(&raw[8..], 0x20, false),
            Err(LoadError::VersionTooNew(_))
        ));
    }
}
