//! `shardforged` - the shardforge cluster daemon.

mod backend;
mod cli;
mod init;

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use shardforge_runtime::lockfile::LockOutcome;
use shardforge_runtime::{Clock, Config, Reactor, RunMode, SignalPipe, daemonize, wdlock};

use crate::cli::Cli;

const APP_NAME: &str = "shardforged";
const MAX_OPEN_FILES: u32 = 4096;

fn init_tracing(daemon: bool, data_path: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if daemon {
        let log_path = Path::new(data_path).join(format!("{APP_NAME}.log"));
        match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => {
                builder.with_ansi(false).with_writer(Mutex::new(file)).init();
                return;
            }
            Err(err) => {
                eprintln!("can't open log file {}: {err}", log_path.display());
            }
        }
    }
    builder.with_writer(std::io::stderr).init();
}

fn run() -> i32 {
    let cli = Cli::parse();
    let mode = cli.run_mode();
    let run_daemon = mode.is_start() && !cli.foreground;

    if run_daemon {
        if let Err(err) = daemonize::make_daemon() {
            eprintln!("can't daemonize: {err}");
            return 1;
        }
    }

    let signals = match SignalPipe::install(run_daemon) {
        Ok(signals) => signals,
        Err(err) => {
            eprintln!("can't install signal handlers: {err}");
            if run_daemon {
                daemonize::mark_init_failure();
            }
            return 1;
        }
    };

    let config = match Config::load(&cli.config, cli.config_is_user_supplied()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err:#}");
            if run_daemon {
                daemonize::mark_init_failure();
            }
            return 1;
        }
    };
    init_tracing(run_daemon, &config.data_path);
    if cli.log_unknown_config {
        match Config::unknown_keys(&cli.config) {
            Ok(keys) => {
                for key in keys {
                    eprintln!("config: unknown option {key}");
                }
            }
            Err(err) => eprintln!("config: can't scan for unknown options: {err:#}"),
        }
    }

    if mode.is_start() {
        daemonize::set_file_limit(MAX_OPEN_FILES);
        if !cli.no_coredump {
            daemonize::raise_core_limit();
        }
        if config.lock_memory {
            daemonize::lock_memory();
        }
        daemonize::set_nice_level(config.nice_level);
    }
    if let Err(err) = daemonize::change_user_group(&config.working_user, &config.working_group) {
        eprintln!("{err:#}");
        if run_daemon {
            daemonize::mark_init_failure();
        }
        return 1;
    }

    if mode.is_start() {
        eprintln!("working directory: {}", config.data_path);
    }
    if let Err(err) = std::env::set_current_dir(&config.data_path)
        .with_context(|| format!("can't set working directory to {}", config.data_path))
    {
        eprintln!("{err:#}");
        if run_daemon {
            daemonize::mark_init_failure();
        }
        return 1;
    }
    daemonize::set_umask(config.file_umask);

    let _lock = match wdlock(Path::new("."), APP_NAME, mode, cli.lock_timeout) {
        Ok(LockOutcome::Acquired(guard)) => guard,
        Ok(LockOutcome::Finished) => return 0,
        Err(err) => {
            eprintln!("{err}");
            if run_daemon {
                daemonize::mark_init_failure();
            }
            return 1;
        }
    };

    if mode == RunMode::Restore {
        return match shardforge_meta::restore_to_disk(Path::new("."), cli.ignore_inconsistencies)
        {
            Ok(()) => {
                eprintln!("metadata restored");
                0
            }
            Err(err) => {
                error!("restore failed: {err:#}");
                eprintln!("restore failed: {err:#}");
                1
            }
        };
    }

    if config.disable_oom_killer {
        daemonize::disable_oom_killer();
    }
    daemonize::limit_malloc_arenas(config.limit_glibc_malloc_arenas);

    let clock = Arc::new(Clock::new());
    let mut reactor = match Reactor::new(clock, signals) {
        Ok(reactor) => reactor,
        Err(err) => {
            eprintln!("can't set up the main loop: {err}");
            if run_daemon {
                daemonize::mark_init_failure();
            }
            return 1;
        }
    };

    let config = Arc::new(Mutex::new(config));
    let server = match init::initialize(&mut reactor, &cli, config, cli.config.clone()) {
        Ok(server) => server,
        Err(err) => {
            error!("initialization failed: {err:#}");
            eprintln!("error occurred during initialization - exiting");
            if run_daemon {
                daemonize::mark_init_failure();
            }
            return 1;
        }
    };
    info!(
        metaversion = server.meta.version(),
        workers_max = server.config.lock().unwrap().workers_max,
        "modules initialized"
    );

    eprintln!("{APP_NAME} daemon initialized properly");
    if run_daemon {
        daemonize::close_msg_channel();
    }

    reactor.run();
    if let Some((load, level)) = server.master.last_report() {
        info!(load, ?level, "last reported load");
    }
    info!(
        jobs_high_water = server.pool.stats_take_max(),
        uptime_s = server.clock.monotonic().as_secs(),
        "process exited successfully"
    );
    0
}

fn main() {
    std::process::exit(run());
}
