use std::path::PathBuf;

use clap::{Parser, Subcommand};

use shardforge_runtime::RunMode;
use shardforge_runtime::config::DEFAULT_CONFIG_PATH;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Mode {
    /// Start the daemon (default).
    Start,
    /// Stop the running instance and wait for it to terminate.
    Stop,
    /// Stop the running instance, then start.
    Restart,
    /// Restart only if an instance is running.
    TryRestart,
    /// Ask the running instance to reload its configuration.
    Reload,
    /// Ask the running instance to log extra information.
    Info,
    /// Print the pid of the running instance.
    Test,
    /// SIGKILL the running instance.
    Kill,
    /// Recover metadata from images and changelogs, then exit.
    Restore,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "shardforged", version, about = "Shardforge cluster daemon")]
pub struct Cli {
    /// Run in the foreground, logging to stderr.
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Report unrecognized configuration keys.
    #[arg(short = 'u', long = "log-unknown-config")]
    pub log_unknown_config: bool,

    /// Do not attempt to raise the core dump size limit.
    #[arg(short = 'n', long = "no-coredump")]
    pub no_coredump: bool,

    /// How long to wait for the lockfile, in seconds.
    #[arg(short = 't', long = "lock-timeout", default_value_t = 1800)]
    pub lock_timeout: u32,

    /// Configuration file path.
    #[arg(
        short = 'c',
        long = "config",
        env = "SHARDFORGED_CONFIG",
        default_value = DEFAULT_CONFIG_PATH
    )]
    pub config: PathBuf,

    /// Scan for the best metadata image and replay changelogs on startup.
    #[arg(short = 'a', long = "auto-restore")]
    pub auto_restore: bool,

    /// Keep going over metadata inconsistencies that are normally fatal.
    #[arg(short = 'i', long = "ignore-inconsistencies")]
    pub ignore_inconsistencies: bool,

    /// Increase restore verbosity (repeatable).
    #[arg(short = 'x', action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub mode: Option<Mode>,
}

impl Cli {
    /// Whether `-c` was given explicitly (a missing default file is fine, a
    /// missing user-named file is not).
    pub fn config_is_user_supplied(&self) -> bool {
        self.config != PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    pub fn run_mode(&self) -> RunMode {
        match self.mode.unwrap_or(Mode::Start) {
            Mode::Start => RunMode::Start,
            Mode::Stop => RunMode::Stop,
            Mode::Restart => RunMode::Restart,
            Mode::TryRestart => RunMode::TryRestart,
            Mode::Reload => RunMode::Reload,
            Mode::Info => RunMode::Info,
            Mode::Test => RunMode::Test,
            Mode::Kill => RunMode::Kill,
            Mode::Restore => RunMode::Restore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_start() {
        let cli = Cli::parse_from(["shardforged"]);
        assert_eq!(cli.run_mode(), RunMode::Start);
        assert!(!cli.foreground);
        assert_eq!(cli.lock_timeout, 1800);
        assert!(!cli.config_is_user_supplied());
    }

    #[test]
    fn parses_modes_and_flags() {
        let cli = Cli::parse_from(["shardforged", "-f", "-t", "60", "try-restart"]);
        assert_eq!(cli.run_mode(), RunMode::TryRestart);
        assert!(cli.foreground);
        assert_eq!(cli.lock_timeout, 60);

        let cli = Cli::parse_from(["shardforged", "-c", "/tmp/other.json", "-a", "-i", "-xx", "restore"]);
        assert_eq!(cli.run_mode(), RunMode::Restore);
        assert!(cli.config_is_user_supplied());
        assert!(cli.auto_restore);
        assert!(cli.ignore_inconsistencies);
        assert_eq!(cli.verbose, 2);
    }
}
