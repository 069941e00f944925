//! Append-only changelog: hourly-rotated text files of
//! `logversion|OPERATION(args…)` lines, replayed on restore.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::state::{ApplyError, MetaState};

/// Largest version hole accepted while replaying.
pub const MAX_ID_HOLE: u64 = 10_000;

/// How much of a file's tail is scanned for its last version.
const TAIL_SCAN_BYTES: u64 = 0x10000;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("{file}: can't parse changelog line {line}")]
    Parse { file: PathBuf, line: u64 },
    #[error("changelog entries {first} and {second} disagree for version {version}")]
    Inconsistent {
        version: u64,
        first: String,
        second: String,
    },
    #[error("version hole too large: {from} -> {to}")]
    VersionGap { from: u64, to: u64 },
    #[error(transparent)]
    Apply(#[from] ApplyError),
}

/// The live changelog writer plus rotation bookkeeping.
pub struct Changelog {
    dir: PathBuf,
    back_logs: u32,
    file: Option<BufWriter<File>>,
}

impl Changelog {
    pub fn new(dir: impl Into<PathBuf>, back_logs: u32) -> Self {
        Self {
            dir: dir.into(),
            back_logs,
            file: None,
        }
    }

    pub fn set_back_logs(&mut self, back_logs: u32) {
        self.back_logs = back_logs;
    }

    fn numbered_path(&self, n: u32) -> PathBuf {
        self.dir.join(format!("changelog.{n}.mfs"))
    }

    /// Append one entry to the live file.
    pub fn append(&mut self, version: u64, entry: &str) -> io::Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .append(true)
                .create(true)
                .open(self.numbered_path(0))?;
            self.file = Some(BufWriter::new(file));
        }
        let out = self.file.as_mut().expect("opened above");
        writeln!(out, "{version}|{entry}")?;
        out.flush()
    }

    /// Shift every numbered file one generation up and start a fresh live
    /// file on the next append.
    pub fn rotate(&mut self) {
        self.file = None;
        for n in (0..self.back_logs).rev() {
            let from = self.numbered_path(n);
            if from.exists() {
                let _ = std::fs::rename(from, self.numbered_path(n + 1));
            }
        }
    }

    /// Whether a directory entry looks like one of our changelog files.
    pub fn is_changelog_name(name: &str) -> bool {
        name.strip_prefix("changelog.")
            .and_then(|rest| rest.strip_suffix(".mfs"))
            .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
    }

    /// Version of the first entry, `None` for an empty file.
    pub fn first_version(path: &Path) -> io::Result<Option<u64>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(parse_version(&line))
    }

    /// Version of the last entry, scanning only the file tail.
    pub fn last_version(path: &Path) -> io::Result<Option<u64>> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let start = len.saturating_sub(TAIL_SCAN_BYTES);
        file.seek(SeekFrom::Start(start))?;
        let mut tail = String::new();
        file.read_to_string(&mut tail)?;
        let mut last = None;
        for line in tail.lines() {
            // The scan window may open mid-line; unparsable lines are
            // skipped, later complete lines win.
            if let Some(version) = parse_version(line) {
                last = Some(version);
            }
        }
        Ok(last)
    }

    /// Merge the given files and apply every entry at or past the state's
    /// current version. Returns the number of entries applied.
    pub fn replay(
        files: &[PathBuf],
        state: &mut MetaState,
        max_gap: u64,
    ) -> Result<u64, ReplayError> {
        let mut entries: BTreeMap<u64, String> = BTreeMap::new();
        for path in files {
            let reader = BufReader::new(File::open(path)?);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let Some((version, op)) = parse_line(&line) else {
                    return Err(ReplayError::Parse {
                        file: path.clone(),
                        line: idx as u64 + 1,
                    });
                };
                match entries.get(&version) {
                    None => {
                        entries.insert(version, op.to_string());
                    }
                    Some(seen) if seen == op => {}
                    Some(seen) => {
                        return Err(ReplayError::Inconsistent {
                            version,
                            first: seen.clone(),
                            second: op.to_string(),
                        });
                    }
                }
            }
        }

        let mut applied = 0;
        for (version, op) in entries.range(state.version..) {
            if *version > state.version && *version - state.version > max_gap {
                return Err(ReplayError::VersionGap {
                    from: state.version,
                    to: *version,
                });
            }
            if *version > state.version {
                warn!(
                    from = state.version,
                    to = *version,
                    "hole in changelog versions - continuing"
                );
            }
            state.apply(*version, op)?;
            applied += 1;
        }
        Ok(applied)
    }
}

fn parse_line(line: &str) -> Option<(u64, &str)> {
    let (version, op) = line.split_once('|')?;
    let version = version.parse().ok()?;
    if version == 0 || op.is_empty() {
        return None;
    }
    Some((version, op))
}

fn parse_version(line: &str) -> Option<u64> {
    parse_line(line.trim_end()).map(|(version, _)| version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_recognition() {
        assert!(Changelog::is_changelog_name("changelog.0.mfs"));
        assert!(Changelog::is_changelog_name("changelog.17.mfs"));
        assert!(!Changelog::is_changelog_name("changelog.mfs"));
        assert!(!Changelog::is_changelog_name("changelog.0.mfs.bak"));
        assert!(!Changelog::is_changelog_name("metadata.mfs"));
        assert!(!Changelog::is_changelog_name("changelog.x.mfs"));
    }

    #[test]
    fn append_rotate_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Changelog::new(dir.path(), 5);
        log.append(11, "CHUNKADD(1,1)").unwrap();
        log.append(12, "CHUNKADD(2,1)").unwrap();
        log.rotate();
        log.append(13, "CHUNKDEL(1)").unwrap();

        let rotated = dir.path().join("changelog.1.mfs");
        let live = dir.path().join("changelog.0.mfs");
        assert_eq!(Changelog::first_version(&rotated).unwrap(), Some(11));
        assert_eq!(Changelog::last_version(&rotated).unwrap(), Some(12));
        assert_eq!(Changelog::first_version(&live).unwrap(), Some(13));
        assert_eq!(Changelog::last_version(&live).unwrap(), Some(13));

        log.rotate();
        assert!(dir.path().join("changelog.2.mfs").exists());
        assert!(dir.path().join("changelog.1.mfs").exists());
        assert!(!live.exists());
    }

    #[test]
    fn replay_applies_in_order_across_files() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("changelog.1.mfs");
        let newer = dir.path().join("changelog.0.mfs");
        std::fs::write(&older, "5|CREATE(1,2,a.txt)\n6|LENGTH(2,100)\n").unwrap();
        std::fs::write(&newer, "6|LENGTH(2,100)\n7|CHUNKADD(9,1)\n").unwrap();

        let mut state = MetaState::new();
        state.version = 5;
        let applied =
            Changelog::replay(&[older, newer], &mut state, MAX_ID_HOLE).unwrap();
        assert_eq!(applied, 3);
        assert_eq!(state.version, 8);
        assert_eq!(state.nodes.get(2).unwrap().length, 100);
        assert!(state.chunks.get(9).is_some());
    }

    #[test]
    fn replay_skips_already_applied_entries() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("changelog.0.mfs");
        std::fs::write(&file, "5|CHUNKADD(1,1)\n6|CHUNKADD(2,1)\n").unwrap();

        let mut state = MetaState::new();
        state.version = 6;
        let applied = Changelog::replay(&[file], &mut state, MAX_ID_HOLE).unwrap();
        assert_eq!(applied, 1);
        assert_eq!(state.version, 7);
        // The entry at version 5 was already part of the image.
        assert!(state.chunks.get(1).is_none());
        assert!(state.chunks.get(2).is_some());
    }

    #[test]
    fn replay_rejects_large_version_holes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("changelog.0.mfs");
        std::fs::write(&file, "5|CHUNKADD(1,1)\n20000|CHUNKADD(2,1)\n").unwrap();

        let mut state = MetaState::new();
        state.version = 5;
        let err = Changelog::replay(&[file], &mut state, MAX_ID_HOLE).unwrap_err();
        assert!(matches!(err, ReplayError::VersionGap { from: 6, to: 20000 }));
    }

    #[test]
    fn replay_accepts_small_holes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("changelog.0.mfs");
        std::fs::write(&file, "5|CHUNKADD(1,1)\n105|CHUNKADD(2,1)\n").unwrap();

        let mut state = MetaState::new();
        state.version = 5;
        let applied = Changelog::replay(&[file], &mut state, MAX_ID_HOLE).unwrap();
        assert_eq!(applied, 2);
        assert_eq!(state.version, 106);
    }

    #[test]
    fn replay_rejects_conflicting_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("changelog.0.mfs");
        let b = dir.path().join("changelog.1.mfs");
        std::fs::write(&a, "5|CHUNKADD(1,1)\n").unwrap();
        std::fs::write(&b, "5|CHUNKADD(2,2)\n").unwrap();

        let mut state = MetaState::new();
        let err = Changelog::replay(&[a, b], &mut state, MAX_ID_HOLE).unwrap_err();
        assert!(matches!(err, ReplayError::Inconsistent { version: 5, .. }));
    }
}
