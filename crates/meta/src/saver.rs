//! Coordinated metadata snapshots: temp-file streaming under an advisory
//! lock, backup rotation, emergency fallbacks, and the background saver
//! thread with its exit-code protocol.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use shardforge_runtime::{Clock, Control};

use crate::changelog::Changelog;
use crate::image;
use crate::state::MetaState;

pub const META_FILE: &str = "metadata.mfs";
pub const BACK_FILE: &str = "metadata.mfs.back";
pub const BACK_TMP_FILE: &str = "metadata.mfs.back.tmp";
pub const CRC_FILE: &str = "metadata.crc";
pub const EMERGENCY_NAME: &str = "metadata.mfs.emergency";

/// Well-known fallback prefixes, tried in order after the data directory
/// and the home directory.
pub const EMERGENCY_PREFIXES: &[&str] = &[
    "/tmp",
    "/var",
    "/usr",
    "/usr/share",
    "/usr/local",
    "/usr/local/var",
    "/usr/local/share",
];

const FILE_BUFFER_SIZE: usize = 0x100_0000;

/// Saver exit codes (also used by the background thread).
const SAVE_OK: i32 = 0;
const SAVE_EMERGENCY: i32 = 1;
const SAVE_FAILED: i32 = 2;

/// Last-store status byte reported through the info hook.
const STORED_IN_BACKGROUND: u8 = 0;
const STORED_IN_FOREGROUND: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// A background saver thread is running.
    Started,
    /// Foreground store completed.
    Stored,
    /// Nothing loaded yet; there is no state worth writing.
    NothingToStore,
    /// A previous store is still in flight.
    Refused,
    /// The store failed (an emergency copy may exist; see the log).
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct SaveSettings {
    pub save_freq: u32,
    pub back_logs: u32,
    pub back_meta_copies: u32,
}

impl Default for SaveSettings {
    fn default() -> Self {
        Self {
            save_freq: 1,
            back_logs: 50,
            back_meta_copies: 1,
        }
    }
}

#[derive(Debug, Default)]
struct StoreStats {
    last_successful_store: i64,
    last_store_seconds: f64,
    last_store_status: u8,
    store_started: Option<Instant>,
}

fn rotate_backups(dir: &Path, copies: u32) {
    if copies == 0 {
        return;
    }
    for n in (1..copies).rev() {
        let _ = std::fs::rename(
            dir.join(format!("{BACK_FILE}.{n}")),
            dir.join(format!("{BACK_FILE}.{}", n + 1)),
        );
    }
    let _ = std::fs::rename(dir.join(BACK_FILE), dir.join(format!("{BACK_FILE}.1")));
}

/// Stream the image into `metadata.mfs.back.tmp` (plus the CRC sidecar),
/// optionally holding the whole-file advisory lock while writing.
fn stream_image(dir: &Path, state: &MetaState, lock: bool) -> io::Result<()> {
    let tmp = dir.join(BACK_TMP_FILE);
    let file = File::create(&tmp)?;
    if lock && unsafe { libc::lockf(file.as_raw_fd(), libc::F_TLOCK, 0) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut out = BufWriter::with_capacity(FILE_BUFFER_SIZE, file);
    out.write_all(image::SIGNATURE)?;
    let records = image::write_image(&mut out, state)?;
    out.flush()?;
    image::write_crc_sidecar(&dir.join(CRC_FILE), &records)
}

/// Promote the finished temp file: rotate backups, rename into place,
/// retire the canonical file until the next clean shutdown.
fn finalize_store(dir: &Path, copies: u32) -> io::Result<()> {
    rotate_backups(dir, copies);
    std::fs::rename(dir.join(BACK_TMP_FILE), dir.join(BACK_FILE))?;
    let _ = std::fs::remove_file(dir.join(META_FILE));
    Ok(())
}

/// One complete store cycle with no locking or stats, used by the restore
/// command and the foreground path.
pub(crate) fn store_once(dir: &Path, state: &MetaState, copies: u32) -> io::Result<()> {
    stream_image(dir, state, false)?;
    finalize_store(dir, copies)
}

/// Plain single-file store, no sidecar, no rotation.
fn store_plain(path: &Path, state: &MetaState) -> io::Result<()> {
    let mut out = BufWriter::with_capacity(FILE_BUFFER_SIZE, File::create(path)?);
    out.write_all(image::SIGNATURE)?;
    image::write_image(&mut out, state)?;
    out.flush()
}

/// Walk the emergency location chain; first success wins.
pub fn emergency_store(dir: &Path, state: &MetaState) -> Option<PathBuf> {
    let mut candidates = vec![dir.join(EMERGENCY_NAME)];
    if let Some(home) = std::env::var_os("HOME") {
        candidates.push(Path::new(&home).join(EMERGENCY_NAME));
    }
    for prefix in EMERGENCY_PREFIXES {
        candidates.push(Path::new(prefix).join(EMERGENCY_NAME));
    }
    for path in candidates {
        if store_plain(&path, state).is_ok() {
            info!(file = %path.display(), "metadata file stored in emergency mode");
            return Some(path);
        }
    }
    None
}

/// Whether another process holds the temp-file lock. Our own in-flight
/// saver is tracked separately: POSIX record locks are per-process, so a
/// lock held by one of our threads would not show up here.
fn tmp_locked_elsewhere(dir: &Path) -> bool {
    let tmp = dir.join(BACK_TMP_FILE);
    match std::fs::OpenOptions::new().read(true).write(true).open(&tmp) {
        Ok(file) => unsafe { libc::lockf(file.as_raw_fd(), libc::F_TEST, 0) < 0 },
        Err(_) => false,
    }
}

/// Full background-save body: stream under lock, rotate, promote; on
/// failure fall back to the emergency chain.
fn save_snapshot(dir: &Path, state: &MetaState, copies: u32) -> i32 {
    let result = stream_image(dir, state, true).and_then(|()| finalize_store(dir, copies));
    match result {
        Ok(()) => SAVE_OK,
        Err(err) => {
            error!("can't write metadata: {err}");
            let _ = std::fs::remove_file(dir.join(BACK_TMP_FILE));
            if emergency_store(dir, state).is_some() {
                SAVE_EMERGENCY
            } else {
                SAVE_FAILED
            }
        }
    }
}

/// Owner of the metadata state, its changelog, and the store machinery.
pub struct MetaEngine {
    dir: PathBuf,
    state: Mutex<MetaState>,
    changelog: Mutex<Changelog>,
    settings: Mutex<SaveSettings>,
    stats: Mutex<StoreStats>,
    saving: AtomicBool,
    control: Control,
    clock: Arc<Clock>,
}

impl MetaEngine {
    pub fn new(dir: impl Into<PathBuf>, control: Control, clock: Arc<Clock>) -> Arc<Self> {
        let dir = dir.into();
        let settings = SaveSettings::default();
        Arc::new(Self {
            changelog: Mutex::new(Changelog::new(dir.clone(), settings.back_logs)),
            dir,
            state: Mutex::new(MetaState::default()),
            settings: Mutex::new(settings),
            stats: Mutex::new(StoreStats::default()),
            saving: AtomicBool::new(false),
            control,
            clock,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    pub fn set_state(&self, state: MetaState) {
        *self.state.lock().unwrap() = state;
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut MetaState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn version(&self) -> u64 {
        self.state.lock().unwrap().version
    }

    pub fn meta_id(&self) -> u64 {
        self.state.lock().unwrap().id
    }

    /// Apply the configured limits: the save frequency is capped to half
    /// the changelog retention, the rotation depth to 99.
    pub fn reload(&self, save_freq: u32, back_logs: u32, back_meta_copies: u32) {
        let mut settings = self.settings.lock().unwrap();
        settings.save_freq = save_freq;
        if settings.save_freq > back_logs / 2 {
            warn!("METADATA_SAVE_FREQ is higher than half of BACK_LOGS - decreasing");
            settings.save_freq = back_logs / 2;
        }
        settings.save_freq = settings.save_freq.max(1);
        settings.back_logs = back_logs;
        settings.back_meta_copies = if back_meta_copies > 99 {
            warn!("BACK_META_KEEP_PREVIOUS is too high (>99) - decreasing");
            99
        } else {
            back_meta_copies
        };
        self.changelog.lock().unwrap().set_back_logs(back_logs);
    }

    /// Record a mutating operation in the changelog and advance the
    /// metadata version past it.
    pub fn log_operation(&self, entry: &str) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let version = state.version;
        self.changelog.lock().unwrap().append(version, entry)?;
        state.version = version + 1;
        Ok(())
    }

    /// Accept a replicated metaid assignment.
    pub fn mr_set_meta_id(&self, new_id: u64) -> bool {
        self.state.lock().unwrap().set_meta_id(new_id)
    }

    /// Give a legacy zero-id state a fresh cluster incarnation id and
    /// record the assignment so followers converge.
    pub fn check_id(&self) {
        {
            let state = self.state.lock().unwrap();
            if state.id != 0 {
                return;
            }
        }
        let now_s = self.clock.now_s().max(0) as u64;
        let low = rand::random::<u32>().wrapping_add(self.clock.now_us() as u32);
        let new_id = (now_s << 32) | u64::from(low);
        self.state.lock().unwrap().id = new_id;
        if let Err(err) = self.log_operation(&format!("SETMETAID({new_id})")) {
            warn!("can't log metaid assignment: {err}");
        }
        info!(metaid = format_args!("{new_id:#018X}"), "new metadata id assigned");
    }

    /// Snapshot the state to disk. Background mode clones the state under
    /// a short lock and streams it from a dedicated saver thread, reporting
    /// back through the reactor's reaper registry.
    pub fn store_all(self: &Arc<Self>, background: bool) -> StoreOutcome {
        if self.state.lock().unwrap().version == 0 {
            return StoreOutcome::NothingToStore;
        }
        if self.saving.load(Ordering::Acquire) {
            warn!("previous metadata save hasn't finished yet - not starting another one");
            return StoreOutcome::Refused;
        }
        if tmp_locked_elsewhere(&self.dir) {
            error!("previous metadata save process hasn't finished yet - do not start another one");
            return StoreOutcome::Refused;
        }
        let copies = self.settings.lock().unwrap().back_meta_copies;
        if !background {
            return self.store_foreground(copies);
        }

        let snapshot = self.state.lock().unwrap().clone();
        let dir = self.dir.clone();
        let control = self.control.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<()>();
        self.saving.store(true, Ordering::Release);
        self.stats.lock().unwrap().store_started = Some(Instant::now());

        let spawned = std::thread::Builder::new()
            .name("metadata saver".to_string())
            .spawn(move || -> i32 {
                // Wait until the reaper is armed, so the completion byte
                // can never outrun the registration.
                let _ = ready_rx.recv();
                let code = save_snapshot(&dir, &snapshot, copies);
                control.notify_child_done();
                code
            });
        match spawned {
            Ok(handle) => {
                let engine = self.clone();
                self.control
                    .reap_register(handle, Box::new(move |code| engine.store_ended(code)));
                let _ = ready_tx.send(());
                StoreOutcome::Started
            }
            Err(err) => {
                warn!(
                    "can't spawn metadata saver ({err}) - storing in foreground, this will block the server for a while"
                );
                self.saving.store(false, Ordering::Release);
                self.stats.lock().unwrap().store_started = None;
                self.store_foreground(copies)
            }
        }
    }

    fn store_foreground(&self, copies: u32) -> StoreOutcome {
        let started = Instant::now();
        let snapshot = self.state.lock().unwrap().clone();
        match store_once(&self.dir, &snapshot, copies) {
            Ok(()) => {
                let mut stats = self.stats.lock().unwrap();
                stats.last_store_seconds = started.elapsed().as_secs_f64();
                stats.last_successful_store = self.clock.now_s();
                stats.last_store_status = STORED_IN_FOREGROUND;
                stats.store_started = None;
                StoreOutcome::Stored
            }
            Err(err) => {
                error!("can't write metadata: {err}");
                let _ = std::fs::remove_file(self.dir.join(BACK_TMP_FILE));
                match emergency_store(&self.dir, &snapshot) {
                    Some(path) => {
                        warn!(file = %path.display(), "metadata stored in emergency location only")
                    }
                    None => error!("metadata not stored !!!"),
                }
                StoreOutcome::Failed
            }
        }
    }

    /// Completion callback for the background saver.
    fn store_ended(&self, code: i32) {
        self.saving.store(false, Ordering::Release);
        let mut stats = self.stats.lock().unwrap();
        match stats.store_started.take() {
            Some(started) => {
                stats.last_store_seconds = started.elapsed().as_secs_f64();
                info!(
                    seconds = format_args!("{:.3}", stats.last_store_seconds),
                    "store process has finished"
                );
            }
            None => info!("store process has finished - unknown store time"),
        }
        match code {
            SAVE_OK => {
                stats.last_store_status = STORED_IN_BACKGROUND;
                stats.last_successful_store = self.clock.now_s();
            }
            SAVE_EMERGENCY => {
                error!("metadata stored in emergency mode (in non-standard location) - exiting");
                self.control.request_exit();
            }
            SAVE_FAILED => {
                error!("metadata not stored !!! (saver failed) - exiting");
                self.control.request_exit();
            }
            _ => {
                error!("metadata not stored !!! (saver crashed) - exiting");
                self.control.request_exit();
            }
        }
    }

    /// Hourly timer body: rotate the changelog; on every save-frequency
    /// boundary, run a background snapshot.
    pub fn periodic_snapshot(self: &Arc<Self>) {
        self.changelog.lock().unwrap().rotate();
        let freq = self.settings.lock().unwrap().save_freq.max(1);
        let hours = (self.clock.now_s().max(0) as u64) / 3600;
        if hours % u64::from(freq) == 0 {
            match self.store_all(true) {
                StoreOutcome::Started | StoreOutcome::Stored | StoreOutcome::NothingToStore => {}
                StoreOutcome::Refused | StoreOutcome::Failed => {
                    error!("can't store metadata - exiting");
                    self.control.request_exit();
                }
            }
        }
    }

    /// Shutdown path: rotate the changelog, store in the foreground until
    /// it succeeds, then promote the backup to the canonical file.
    pub fn term(&self) {
        self.changelog.lock().unwrap().rotate();
        loop {
            if self.state.lock().unwrap().version == 0 {
                info!("no metadata to store");
                return;
            }
            let copies = self.settings.lock().unwrap().back_meta_copies;
            if self.store_foreground(copies) == StoreOutcome::Stored {
                if let Err(err) =
                    std::fs::rename(self.dir.join(BACK_FILE), self.dir.join(META_FILE))
                {
                    warn!("can't rename {BACK_FILE} -> {META_FILE}: {err}");
                }
                return;
            }
            error!(
                "can't store metadata - try to make more space on your hdd or change privileges - retrying after 10 seconds"
            );
            std::thread::sleep(Duration::from_secs(10));
        }
    }

    /// Info-signal hook: last store statistics.
    pub fn info(&self) {
        let (last_store, seconds, status) = self.last_store_info();
        info!(
            last_successful_store = last_store,
            store_seconds = format_args!("{seconds:.3}"),
            status,
            "metadata store stats"
        );
    }

    pub fn last_store_info(&self) -> (i64, f64, u8) {
        let stats = self.stats.lock().unwrap();
        (
            stats.last_successful_store,
            stats.last_store_seconds,
            stats.last_store_status,
        )
    }
}
