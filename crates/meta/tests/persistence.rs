#![allow(unused_crate_dependencies)]

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shardforge_meta::saver::{BACK_FILE, BACK_TMP_FILE, CRC_FILE, META_FILE};
use shardforge_meta::sections::{ChunkInfo, Node, NodeKind};
use shardforge_meta::{
    FileCheck, MetaEngine, MetaState, RestoreOptions, StoreOutcome, check_file, emergency_store,
    load_all, load_from_file, restore_to_disk, store_to_file,
};
use shardforge_runtime::{Clock, Control};

fn sample_state(version: u64, id: u64) -> MetaState {
    let mut state = MetaState::new();
    state.version = version;
    state.id = id;
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
    state.chunks.insert(1, ChunkInfo { version: 1, archived: false });
    state
}

fn engine(dir: &Path) -> (Arc<MetaEngine>, Control) {
    let control = Control::standalone().unwrap();
    let engine = MetaEngine::new(dir, control.clone(), Arc::new(Clock::new()));
    (engine, control)
}

fn auto_opts(ignore: bool) -> RestoreOptions {
    RestoreOptions {
        auto: true,
        ignore,
        verbose: 0,
    }
}

#[test]
fn image_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(META_FILE);
    let crc = dir.path().join(CRC_FILE);
    let state = sample_state(42, 0x5157);

    store_to_file(&path, Some(&crc), &state).unwrap();
    assert_eq!(check_file(&path), FileCheck::Ok { version: 42, id: 0x5157 });
    let loaded = load_from_file(&path, false).unwrap();
    assert_eq!(loaded, state);

    // Sidecar: one record per section, framed by HEAD and TAIL.
    let records = shardforge_meta::image::read_crc_sidecar(&crc).unwrap();
    assert_eq!(records.len(), 15);
    assert_eq!(&records[0].0, b"HEAD");
    assert_eq!(&records[1].0, b"SESS");
    assert_eq!(&records[14].0, b"TAIL");
}

#[test]
fn snapshot_rotation_keeps_generations() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _control) = engine(dir.path());
    engine.reload(1, 50, 3);
    engine.set_state(sample_state(100, 0xAA));

    for next in [101, 102, 103] {
        assert_eq!(engine.store_all(false), StoreOutcome::Stored);
        engine.with_state(|state| state.version = next);
    }
    assert_eq!(engine.store_all(false), StoreOutcome::Stored);

    let expect = [
        (BACK_FILE.to_string(), 103),
        (format!("{BACK_FILE}.1"), 102),
        (format!("{BACK_FILE}.2"), 101),
        (format!("{BACK_FILE}.3"), 100),
    ];
    for (name, version) in expect {
        assert_eq!(
            check_file(&dir.path().join(&name)),
            FileCheck::Ok { version, id: 0xAA },
            "{name}"
        );
    }
    assert!(!dir.path().join(BACK_TMP_FILE).exists());
    assert!(!dir.path().join(META_FILE).exists());
}

#[test]
fn background_store_reports_through_reaper() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, control) = engine(dir.path());
    engine.set_state(sample_state(7, 0xBB));

    assert_eq!(engine.store_all(true), StoreOutcome::Started);

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let finished = control.take_finished();
        if !finished.is_empty() {
            for (code, callback) in finished {
                assert_eq!(code, 0);
                callback(code);
            }
            break;
        }
        assert!(Instant::now() < deadline, "saver never finished");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(
        check_file(&dir.path().join(BACK_FILE)),
        FileCheck::Ok { version: 7, id: 0xBB }
    );
    assert!(dir.path().join(CRC_FILE).exists());
    assert!(!dir.path().join(BACK_TMP_FILE).exists());
    let (last_store, _seconds, status) = engine.last_store_info();
    assert_eq!(status, 0);
    assert!(last_store > 0);
}

#[test]
fn failed_background_store_lands_in_an_emergency_location() {
    // The emergency chain consults $HOME; point it somewhere harmless
    // before anything can fail over to it.
    let home = tempfile::tempdir().unwrap().keep();
    unsafe {
        std::env::set_var("HOME", &home);
    }

    let dir = tempfile::tempdir().unwrap();
    // Occupy both the temp file and the local emergency name with
    // directories, so the saver cannot create either.
    std::fs::create_dir(dir.path().join(BACK_TMP_FILE)).unwrap();
    std::fs::create_dir(dir.path().join("metadata.mfs.emergency")).unwrap();

    let (engine, control) = engine(dir.path());
    engine.set_state(sample_state(3, 0x11));
    assert_eq!(engine.store_all(true), StoreOutcome::Started);

    let deadline = Instant::now() + Duration::from_secs(5);
    'reaped: loop {
        for (code, callback) in control.take_finished() {
            assert_eq!(code, 1, "expected the emergency-save exit code");
            callback(code);
            break 'reaped;
        }
        assert!(Instant::now() < deadline, "saver never finished");
        std::thread::sleep(Duration::from_millis(10));
    }

    assert!(matches!(
        check_file(&home.join("metadata.mfs.emergency")),
        FileCheck::Ok { version: 3, .. }
    ));
}

#[test]
fn emergency_store_prefers_the_data_directory() {
    let dir = tempfile::tempdir().unwrap();
    let state = sample_state(5, 1);
    let path = emergency_store(dir.path(), &state).unwrap();
    assert_eq!(path, dir.path().join("metadata.mfs.emergency"));
    assert!(matches!(check_file(&path), FileCheck::Ok { version: 5, .. }));
}

#[test]
fn auto_restore_replays_changelogs() {
    let dir = tempfile::tempdir().unwrap();
    store_to_file(&dir.path().join(BACK_FILE), None, &sample_state(5, 0xCC)).unwrap();
    std::fs::write(
        dir.path().join("changelog.2.mfs"),
        "2|CHUNKADD(10,1)\n3|CHUNKADD(11,1)\n4|CHUNKADD(12,1)\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("changelog.1.mfs"),
        "5|CHUNKADD(20,1)\n6|CHUNKADD(21,1)\n",
    )
    .unwrap();
    std::fs::write(
        dir.path().join("changelog.0.mfs"),
        "7|CHUNKADD(22,1)\n8|CHUNKADD(23,1)\n",
    )
    .unwrap();
    // Leftover of an interrupted save must be swept.
    std::fs::write(dir.path().join(BACK_TMP_FILE), b"half-written junk").unwrap();

    let state = load_all(dir.path(), &auto_opts(false)).unwrap();
    assert_eq!(state.version, 9);
    assert_eq!(state.id, 0xCC);
    for chunk in [20, 21, 22, 23] {
        assert!(state.chunks.get(chunk).is_some(), "chunk {chunk}");
    }
    // The stale file predates the image and was skipped whole.
    assert!(state.chunks.get(10).is_none());
    assert!(!dir.path().join(BACK_TMP_FILE).exists());
}

#[test]
fn divergent_metaids_need_ignore_mode() {
    let dir = tempfile::tempdir().unwrap();
    store_to_file(&dir.path().join(BACK_FILE), None, &sample_state(10, 0xAAAA)).unwrap();
    store_to_file(
        &dir.path().join(format!("{BACK_FILE}.1")),
        None,
        &sample_state(12, 0xBBBB),
    )
    .unwrap();

    assert!(load_all(dir.path(), &auto_opts(false)).is_err());

    let state = load_all(dir.path(), &auto_opts(true)).unwrap();
    assert_eq!(state.version, 12);
    assert_eq!(state.id, 0xBBBB);
}

#[test]
fn plain_load_promotes_the_canonical_file() {
    let dir = tempfile::tempdir().unwrap();
    store_to_file(&dir.path().join(META_FILE), None, &sample_state(20, 0xDD)).unwrap();

    let opts = RestoreOptions {
        auto: false,
        ignore: false,
        verbose: 0,
    };
    let state = load_all(dir.path(), &opts).unwrap();
    assert_eq!(state.version, 20);
    assert!(!dir.path().join(META_FILE).exists());
    assert!(dir.path().join(BACK_FILE).exists());
}

#[test]
fn plain_load_wants_auto_mode_when_things_look_wrong() {
    let dir = tempfile::tempdir().unwrap();
    let opts = RestoreOptions {
        auto: false,
        ignore: false,
        verbose: 0,
    };
    let err = load_all(dir.path(), &opts).unwrap_err();
    assert!(err.to_string().contains("-a"));

    // A backup newer than the canonical file is suspicious too.
    store_to_file(&dir.path().join(META_FILE), None, &sample_state(20, 0xDD)).unwrap();
    store_to_file(&dir.path().join(BACK_FILE), None, &sample_state(25, 0xDD)).unwrap();
    let err = load_all(dir.path(), &opts).unwrap_err();
    assert!(err.to_string().contains("newer"));
}

#[test]
fn restore_command_leaves_a_clean_canonical_file() {
    let dir = tempfile::tempdir().unwrap();
    store_to_file(&dir.path().join(BACK_FILE), None, &sample_state(5, 0xEE)).unwrap();
    std::fs::write(
        dir.path().join("changelog.0.mfs"),
        "5|CHUNKADD(31,1)\n6|CHUNKADD(32,1)\n",
    )
    .unwrap();

    restore_to_disk(dir.path(), false).unwrap();
    assert_eq!(
        check_file(&dir.path().join(META_FILE)),
        FileCheck::Ok { version: 7, id: 0xEE }
    );
    let state = load_from_file(&dir.path().join(META_FILE), false).unwrap();
    assert!(state.chunks.get(31).is_some());
    assert!(state.chunks.get(32).is_some());
}

#[test]
fn check_id_assigns_and_logs_a_fresh_id() {
    let dir = tempfile::tempdir().unwrap();
    let (engine, _control) = engine(dir.path());
    engine.set_state(MetaState::new());

    engine.check_id();
    let id = engine.meta_id();
    assert_ne!(id, 0);
    assert_eq!(engine.version(), 2);

    let live = dir.path().join("changelog.0.mfs");
    let line = std::fs::read_to_string(&live).unwrap();
    assert_eq!(line.trim(), format!("1|SETMETAID({id})"));

    // Replicated assignment: same id fine, different id refused.
    assert!(engine.mr_set_meta_id(id));
    assert!(!engine.mr_set_meta_id(id.wrapping_add(1)));
    // Idempotent once assigned.
    engine.check_id();
    assert_eq!(engine.meta_id(), id);
}
