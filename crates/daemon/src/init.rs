//! Module initialization and reactor wiring.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{error, info};

use shardforge_jobs::{JobPool, JobPoolHook};
use shardforge_meta::{MetaEngine, RestoreOptions};
use shardforge_runtime::{Clock, Config, Reactor};

use crate::backend::{LocalDiskBackend, MasterLink};
use crate::cli::Cli;

/// Everything the daemon wires together at startup. Constructed once and
/// shared with the reactor hooks by reference counting.
pub struct Server {
    pub clock: Arc<Clock>,
    pub pool: JobPool,
    pub meta: Arc<MetaEngine>,
    pub master: Arc<MasterLink>,
    pub config: Arc<Mutex<Config>>,
}

fn step<T>(name: &str, body: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    info!("init: {name}");
    body().inspect_err(|_| error!("init: {name} failed !!!"))
}

fn init_meta(
    reactor: &mut Reactor,
    cli: &Cli,
    config: &Config,
) -> anyhow::Result<Arc<MetaEngine>> {
    let engine = MetaEngine::new(".", reactor.control(), reactor.clock());
    let opts = RestoreOptions {
        auto: cli.auto_restore,
        ignore: cli.ignore_inconsistencies,
        verbose: cli.verbose,
    };
    let state = shardforge_meta::load_all(Path::new("."), &opts)?;
    info!(version = state.version, "metadata file has been loaded");
    engine.set_state(state);
    engine.reload(
        config.metadata_save_freq,
        config.back_logs,
        config.back_meta_keep_previous,
    );

    {
        let engine = engine.clone();
        let _ = reactor.time_register(3600, 0, Box::new(move || engine.periodic_snapshot()));
    }
    {
        let engine = engine.clone();
        reactor.destruct_register(Box::new(move || engine.term()));
    }
    {
        let engine = engine.clone();
        reactor.info_register(Box::new(move || engine.info()));
    }
    engine.check_id();
    Ok(engine)
}

fn init_jobs(reactor: &mut Reactor, config: &Config) -> anyhow::Result<JobPool> {
    let backend = LocalDiskBackend::new(".").context("chunk storage init")?;
    let pool = JobPool::new(Arc::new(backend), config.workers_queue_length)
        .context("job pool init")?;
    pool.reload(config.workers_max, config.workers_max_idle);

    reactor.poll_register(Box::new(JobPoolHook::new(pool.clone())));
    {
        let pool = pool.clone();
        reactor.canexit_register(Box::new(move || pool.can_exit()));
    }
    {
        let pool = pool.clone();
        reactor.destruct_register(Box::new(move || pool.shutdown()));
    }
    Ok(pool)
}

/// Run the init table in order and register every reactor hook.
pub fn initialize(
    reactor: &mut Reactor,
    cli: &Cli,
    config: Arc<Mutex<Config>>,
    config_path: PathBuf,
) -> anyhow::Result<Server> {
    let snapshot = config.lock().unwrap().clone();

    let meta = step("metadata engine", || init_meta(reactor, cli, &snapshot))?;
    let pool = step("job pool", || init_jobs(reactor, &snapshot))?;
    let master = Arc::new(MasterLink::default());

    // Heavy-load detection runs every loop iteration.
    {
        let pool = pool.clone();
        let master = master.clone();
        reactor.eachloop_register(Box::new(move || pool.heavy_load_check(master.as_ref())));
    }
    // Info signal: current in-flight work.
    {
        let pool = pool.clone();
        reactor.info_register(Box::new(move || {
            info!(
                jobs = pool.jobs_count(),
                max_since_last = pool.stats_take_max(),
                "job pool stats"
            );
        }));
    }
    // Reload: re-read the config file, then push the new limits into each
    // component.
    {
        let config = config.clone();
        let pool = pool.clone();
        let meta = meta.clone();
        reactor.reload_register(Box::new(move || {
            match Config::load(&config_path, false) {
                Ok(fresh) => {
                    pool.reload(fresh.workers_max, fresh.workers_max_idle);
                    meta.reload(
                        fresh.metadata_save_freq,
                        fresh.back_logs,
                        fresh.back_meta_keep_previous,
                    );
                    *config.lock().unwrap() = fresh;
                }
                Err(err) => error!("config reload failed: {err:#}"),
            }
        }));
    }

    Ok(Server {
        clock: reactor.clock(),
        pool,
        meta,
        master,
        config,
    })
}
