//! Startup recovery: choose the best on-disk image, replay changelogs,
//! tidy the data directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use tracing::{error, info, warn};

use crate::changelog::{Changelog, MAX_ID_HOLE};
use crate::image::{self, FileCheck};
use crate::saver::{self, BACK_FILE, BACK_TMP_FILE, EMERGENCY_NAME, EMERGENCY_PREFIXES, META_FILE};
use crate::state::MetaState;

#[derive(Debug, Clone, Copy)]
pub struct RestoreOptions {
    /// Search every candidate image and replay changelogs, instead of
    /// insisting on a clean `metadata.mfs`.
    pub auto: bool,
    /// Keep going over inconsistencies that would otherwise be fatal.
    pub ignore: bool,
    pub verbose: u8,
}

/// Load the metadata state from the data directory, then retire leftovers
/// of any interrupted store.
pub fn load_all(dir: &Path, opts: &RestoreOptions) -> anyhow::Result<MetaState> {
    let state = if opts.auto {
        load_auto(dir, opts)?
    } else {
        load_plain(dir, opts)?
    };
    let _ = std::fs::remove_file(dir.join(BACK_TMP_FILE));
    Ok(state)
}

fn emergency_candidates(dir: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![dir.join(EMERGENCY_NAME)];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(Path::new(&home).join(EMERGENCY_NAME));
    }
    for prefix in EMERGENCY_PREFIXES {
        candidates.push(Path::new(prefix).join(EMERGENCY_NAME));
    }
    candidates
}

fn describe_check(path: &Path, check: FileCheck) {
    match check {
        FileCheck::Ok { version, id } if id != 0 => {
            info!(file = %path.display(), version, id = format_args!("{id:#X}"), "found valid metadata file");
        }
        FileCheck::Ok { version, .. } => {
            info!(file = %path.display(), version, "found valid metadata file");
        }
        FileCheck::IoError => {
            warn!(file = %path.display(), "error reading metadata file");
        }
        FileCheck::BadHeader => {
            warn!(file = %path.display(), "found invalid metadata file (wrong header)");
        }
        FileCheck::BadEnding { version, .. } => {
            warn!(file = %path.display(), version, "found invalid metadata file (wrong ending)");
        }
        FileCheck::NoFile => {}
    }
}

/// Log the status of every metadata candidate, for the operator staring at
/// a refused restore.
pub fn log_file_infos(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            error!("can't access data directory: {err}");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.len() > 8 && name.starts_with("metadata") {
            describe_check(&entry.path(), image::check_file(&entry.path()));
        }
    }
}

fn load_auto(dir: &Path, opts: &RestoreOptions) -> anyhow::Result<MetaState> {
    let mut best_version = 0u64;
    let mut best_id = 0u64;
    let mut best_path: Option<PathBuf> = None;

    let entries = std::fs::read_dir(dir).context("can't access data directory")?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.len() <= 8 || !name.starts_with("metadata") {
            continue;
        }
        let path = entry.path();
        let check = image::check_file(&path);
        if opts.verbose > 1 {
            describe_check(&path, check);
        }
        if let FileCheck::Ok { version, id } = check {
            if best_id != 0 && id != 0 && best_id != id {
                if opts.ignore {
                    warn!("found metadata file with different id number - ignoring");
                } else {
                    log_file_infos(dir);
                    bail!(
                        "found metadata files with different id numbers - cleanup your data directory or use '-i' flag (might be dangerous without cleaning)"
                    );
                }
            }
            if version > best_version {
                best_version = version;
                best_path = Some(path);
                if id != 0 {
                    best_id = id;
                }
            }
        }
    }

    // Emergency copies are only trusted once a real cluster id is known.
    if best_id != 0 {
        for path in emergency_candidates(dir) {
            let check = image::check_file(&path);
            if opts.verbose > 1 {
                describe_check(&path, check);
            }
            if let FileCheck::Ok { version, id } = check {
                if version > best_version && id == best_id {
                    best_version = version;
                    best_path = Some(path);
                }
            }
        }
    }

    let Some(best_path) = best_path else {
        bail!("can't find valid metadata file");
    };
    if opts.verbose > 0 {
        if best_id != 0 {
            info!(
                file = %best_path.display(),
                version = best_version,
                id = format_args!("{best_id:#X}"),
                "chosen most recent metadata file"
            );
        } else {
            info!(file = %best_path.display(), version = best_version, "chosen most recent metadata file");
        }
    }

    let mut state = image::load_from_file(&best_path, opts.ignore)
        .with_context(|| format!("error loading metadata file ({})", best_path.display()))?;

    // Collect changelogs whose ranges continue past the image.
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).context("can't access data directory")?.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !Changelog::is_changelog_name(&name) {
            continue;
        }
        let path = entry.path();
        let first = Changelog::first_version(&path).unwrap_or(None);
        let last = Changelog::last_version(&path).unwrap_or(None);
        let usable = matches!((first, last), (Some(first), Some(last))
            if first > 0 && last >= state.version);
        if opts.verbose > 0 {
            if usable {
                info!(file = %path.display(), ?first, ?last, "using changelog file");
            } else {
                info!(file = %path.display(), ?first, ?last, "skipping changelog file");
            }
        }
        if usable {
            files.push(path);
        }
    }
    if !files.is_empty() {
        match Changelog::replay(&files, &mut state, MAX_ID_HOLE) {
            Ok(applied) => {
                info!(applied, version = state.version, "changelogs applied");
            }
            Err(err) if opts.ignore => {
                warn!(
                    "error applying changelogs - ignoring (using best possible metadata version): {err}"
                );
            }
            Err(err) => {
                return Err(err)
                    .context("error applying changelogs - fix changelogs manually or use '-i' flag");
            }
        }
    }

    // Move the canonical file out of the way so the next save cycle can
    // produce a fresh one.
    let meta = dir.join(META_FILE);
    if let Ok(info) = std::fs::metadata(&meta) {
        if info.len() == 0 {
            std::fs::remove_file(&meta).context("can't unlink metadata.mfs")?;
        } else if !dir.join(BACK_FILE).exists() {
            std::fs::rename(&meta, dir.join(BACK_FILE))
                .context("can't rename metadata.mfs -> metadata.mfs.back")?;
        } else {
            let target = unique_meta_name(dir)?;
            std::fs::rename(&meta, &target)
                .with_context(|| format!("can't rename metadata.mfs -> {}", target.display()))?;
            info!(file = %target.display(), "current metadata file moved aside");
        }
    }
    Ok(state)
}

fn unique_meta_name(dir: &Path) -> anyhow::Result<PathBuf> {
    for _ in 0..64 {
        let candidate = dir.join(format!("{META_FILE}.{:08x}", rand::random::<u32>()));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    bail!("can't pick a spare name for metadata.mfs");
}

fn load_plain(dir: &Path, opts: &RestoreOptions) -> anyhow::Result<MetaState> {
    let meta = dir.join(META_FILE);
    let (version, id) = match image::check_file(&meta) {
        FileCheck::Ok { version, id } => (version, id),
        FileCheck::NoFile => bail!("can't find metadata.mfs - try using option '-a'"),
        FileCheck::IoError => bail!("error reading metadata.mfs - try using option '-a'"),
        FileCheck::BadHeader => bail!("metadata.mfs has wrong header - try using option '-a'"),
        FileCheck::BadEnding { .. } => {
            bail!("metadata.mfs has wrong ending - try using option '-a'")
        }
    };

    if let FileCheck::Ok {
        version: back_version,
        id: back_id,
    } = image::check_file(&dir.join(BACK_FILE))
    {
        if back_version > version {
            bail!(
                "backup file is newer than current file - please check it manually - try using option '-a'"
            );
        }
        if back_id != 0 && id != 0 && back_id != id {
            bail!(
                "backup file has different file id - please check it manually - try using options '-a' and '-i'"
            );
        }
    }

    let state = image::load_from_file(&meta, opts.ignore)
        .context("error loading metadata.mfs - try using option '-a'")?;
    std::fs::rename(&meta, dir.join(BACK_FILE))
        .context("can't rename metadata.mfs -> metadata.mfs.back")?;
    Ok(state)
}

/// The `restore` run mode: recover the newest consistent state and leave a
/// clean canonical `metadata.mfs` behind.
pub fn restore_to_disk(dir: &Path, ignore: bool) -> anyhow::Result<()> {
    let opts = RestoreOptions {
        auto: true,
        ignore,
        verbose: 1,
    };
    let state = load_all(dir, &opts)?;
    if state.version == 0 {
        info!("no metadata to store");
        return Ok(());
    }
    saver::store_once(dir, &state, 1).context("can't store metadata")?;
    std::fs::rename(dir.join(BACK_FILE), dir.join(META_FILE))
        .context("can't rename metadata.mfs.back -> metadata.mfs")?;
    Ok(())
}
