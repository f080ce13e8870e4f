// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the subsystems into one process and owns startup and shutdown
//! sequencing.

use crate::config::Config;
use crate::control::ControlServer;
use crate::dispatch::EventDispatcher;
use crate::handlers::{ControlContext, RuntimeSettings};
use crate::ingest::IngestReader;
use crate::logging;
use crate::pidfile::PidFile;
use crate::queue::{self, EventConsumer, EventQueue};
use crate::signals;
use crate::storage::{SqliteStore, Storage};
use crate::supervisor::{DetectorCommand, Supervisor, SupervisorConfig};
use anyhow::Context;
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const MAIN_LOOP_TICK: Duration = Duration::from_millis(200);

pub struct Daemon {
    config: Config,
    config_path: PathBuf,
    _pidfile: PidFile,
    queue: EventQueue,
    consumer: Option<EventConsumer>,
    storage: Arc<dyn Storage>,
    running: Arc<AtomicBool>,
}

impl Daemon {
    /// Builds the passive parts of the daemon. Everything that can make
    /// startup fail fatally (bad config, pid collision, unopenable
    /// database) happens here.
    pub fn new(config: Config, config_path: impl Into<PathBuf>) -> anyhow::Result<Daemon> {
        config.validate()?;

        ensure_dir(&config.ipc.socket_dir)?;
        if let Some(parent) = config.storage.database.parent() {
            ensure_dir(parent)?;
        }

        let pidfile = PidFile::create(&config.general.pid_file)?;
        let (queue, consumer) = queue::with_capacity(config.ipc.event_buffer_size as usize);
        let storage: Arc<dyn Storage> = Arc::new(SqliteStore::open(&config.storage.database)?);

        info!("daemon initialized");
        Ok(Daemon {
            config,
            config_path: config_path.into(),
            _pidfile: pidfile,
            queue,
            consumer: Some(consumer),
            storage,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Starts the subsystems in dependency order, runs until a shutdown is
    /// requested, then tears them down.
    pub fn run(&mut self) -> anyhow::Result<()> {
        let consumer = self
            .consumer
            .take()
            .context("daemon run invoked more than once")?;

        // Consumer first so accepted events always have somewhere to go.
        let dispatcher = Arc::new(EventDispatcher::start(consumer, Arc::clone(&self.storage)));
        let reader = Arc::new(IngestReader::start(
            self.config.event_socket(),
            self.queue.clone(),
        ));

        let supervisor = Arc::new(Supervisor::new(
            DetectorCommand {
                binary: self.config.detector.binary.clone(),
                config: self.config.detector.config.clone(),
                event_socket: self.config.event_socket(),
                rules_dir: Some(self.config.detector.rules_dir.clone()),
                log_dir: self.config.detector.log_dir.clone(),
                interfaces: self.config.detector.interfaces.clone(),
            },
            SupervisorConfig {
                check_interval: Duration::from_millis(
                    self.config.watchdog.check_interval_ms as u64,
                ),
                max_restart_attempts: self.config.watchdog.max_restart_attempts,
                ..Default::default()
            },
        ));
        supervisor.start()?;

        let ctx = Arc::new(ControlContext {
            running: Arc::clone(&self.running),
            started_at: Instant::now(),
            supervisor: Arc::clone(&supervisor),
            reader: Arc::clone(&reader),
            queue: self.queue.clone(),
            dispatcher: Arc::clone(&dispatcher),
            storage: Arc::clone(&self.storage),
            settings: Mutex::new(RuntimeSettings {
                rules_dir: self.config.detector.rules_dir.clone(),
                recorded: BTreeMap::new(),
            }),
        });
        let control = ControlServer::start(self.config.api_socket(), Arc::clone(&ctx))?;

        info!("all subsystems started, daemon running");

        while self.running.load(Ordering::SeqCst) && !signals::shutdown_requested() {
            thread::sleep(MAIN_LOOP_TICK);
            if signals::take_reload() {
                self.reload_config();
            }
            if signals::take_dump_stats() {
                dump_stats(&ctx);
            }
        }

        info!("daemon shutting down");
        control.stop();
        supervisor.stop();
        reader.stop();
        dispatcher.stop();
        info!("daemon stopped");
        Ok(())
    }

    /// SIGHUP: re-read the config file and re-apply what can change at
    /// runtime (the log level).
    fn reload_config(&self) {
        info!(path = %self.config_path.display(), "reloading configuration");
        let mut fresh = Config::default();
        if let Err(e) = fresh.load(&self.config_path) {
            error!(error = %e, "config reload failed, keeping current settings");
            return;
        }
        fresh.apply_env();
        if let Err(e) = logging::set_level(&fresh.general.log_level) {
            warn!(error = %e, "could not apply reloaded log level");
        }
    }
}

fn dump_stats(ctx: &ControlContext) {
    let queue = ctx.queue.stats();
    let pipeline = ctx.dispatcher.counters();
    let ingest = ctx.reader.counters();
    let detector = ctx.reader.detector_stats();
    info!(
        uptime = ctx.started_at.elapsed().as_secs(),
        enqueued = queue.enqueued,
        dequeued = queue.dequeued,
        queue_dropped = queue.dropped,
        stored = pipeline.stored,
        store_failures = pipeline.dropped,
        lines_read = ingest.lines_read,
        parse_errors = ingest.parse_errors,
        reconnects = ingest.reconnects,
        detector_alerts = detector.alerts_total,
        detector_packets = detector.packets_captured,
        "stats dump"
    );
}

fn ensure_dir(path: &Path) -> anyhow::Result<()> {
    if path.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(path)
        .with_context(|| format!("failed to create directory {}", path.display()))
}

/// Classic double fork: detach from the session, drop the controlling
/// terminal, and point stdio at /dev/null.
pub fn daemonize() -> anyhow::Result<()> {
    // Safety: called from main before any thread is spawned.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid failed")?;
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    if let Err(e) = chdir("/") {
        warn!(error = %e, "chdir to / failed");
    }
    umask(Mode::empty());

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    for fd in 0..=2 {
        let _ = dup2(devnull.as_raw_fd(), fd);
    }
    Ok(())
}
