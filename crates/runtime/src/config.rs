//! Daemon configuration.
//!
//! A single JSON object whose keys match the documented option names.
//! Every field has a default, so a partial file (or no file at all, when
//! the path was not user-supplied) is fine.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/shardforge/shardforged.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    pub workers_max: u32,
    pub workers_max_idle: u32,
    pub workers_queue_length: u32,
    pub metadata_save_freq: u32,
    pub back_logs: u32,
    pub back_meta_keep_previous: u32,
    pub working_user: String,
    pub working_group: String,
    pub data_path: String,
    pub file_umask: u32,
    pub lock_memory: bool,
    pub nice_level: i32,
    pub limit_glibc_malloc_arenas: u8,
    pub disable_oom_killer: bool,
    pub syslog_ident: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers_max: 250,
            workers_max_idle: 40,
            workers_queue_length: 250,
            metadata_save_freq: 1,
            back_logs: 50,
            back_meta_keep_previous: 1,
            working_user: "nobody".to_string(),
            working_group: String::new(),
            data_path: "/var/lib/shardforge".to_string(),
            file_umask: 0o027,
            lock_memory: false,
            nice_level: -19,
            limit_glibc_malloc_arenas: 4,
            disable_oom_killer: true,
            syslog_ident: String::new(),
        }
    }
}

const KNOWN_KEYS: &[&str] = &[
    "WORKERS_MAX",
    "WORKERS_MAX_IDLE",
    "WORKERS_QUEUE_LENGTH",
    "METADATA_SAVE_FREQ",
    "BACK_LOGS",
    "BACK_META_KEEP_PREVIOUS",
    "WORKING_USER",
    "WORKING_GROUP",
    "DATA_PATH",
    "FILE_UMASK",
    "LOCK_MEMORY",
    "NICE_LEVEL",
    "LIMIT_GLIBC_MALLOC_ARENAS",
    "DISABLE_OOM_KILLER",
    "SYSLOG_IDENT",
];

impl Config {
    /// Read the config file. A missing file is only an error when the user
    /// named the path explicitly; otherwise defaults apply with a warning.
    pub fn load(path: &Path, user_supplied: bool) -> anyhow::Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && !user_supplied => {
                warn!(path = %path.display(), "can't load config file - using defaults");
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("can't load config file {}", path.display()));
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("can't parse config file {}", path.display()))
    }

    /// Names of keys in the file that are not recognized options.
    pub fn unknown_keys(path: &Path) -> anyhow::Result<Vec<String>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let value: serde_json::Value = serde_json::from_str(&raw)?;
        let mut unknown = Vec::new();
        if let Some(object) = value.as_object() {
            for key in object.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    unknown.push(key.clone());
                }
            }
        }
        Ok(unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.workers_max, 250);
        assert_eq!(cfg.workers_max_idle, 40);
        assert_eq!(cfg.workers_queue_length, 250);
        assert_eq!(cfg.metadata_save_freq, 1);
        assert_eq!(cfg.back_logs, 50);
        assert_eq!(cfg.back_meta_keep_previous, 1);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"WORKERS_MAX": 16, "BACK_LOGS": 8}"#).unwrap();
        let cfg = Config::load(&path, true).unwrap();
        assert_eq!(cfg.workers_max, 16);
        assert_eq!(cfg.back_logs, 8);
        assert_eq!(cfg.workers_max_idle, 40);
    }

    #[test]
    fn missing_file_is_only_fatal_when_user_supplied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        assert!(Config::load(&path, false).is_ok());
        assert!(Config::load(&path, true).is_err());
    }

    #[test]
    fn unknown_keys_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.json");
        std::fs::write(&path, r#"{"WORKERS_MAX": 4, "WORKER_MAX": 9}"#).unwrap();
        assert_eq!(Config::unknown_keys(&path).unwrap(), vec!["WORKER_MAX"]);
    }
}
