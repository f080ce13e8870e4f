// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Detector subprocess lifecycle: launch, liveness, bounded-backoff
//! restart, graceful stop, rule reload and rule validation.

use anyhow::Context;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{access, AccessFlags, Pid};
use std::ffi::OsString;
use std::fmt;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

const MAX_BACKOFF_MS: u64 = 60_000;
/// Total SIGTERM grace before SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
    Failed,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Failed => "failed",
        }
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The argv recipe for launching the detector.
#[derive(Clone, Debug)]
pub struct DetectorCommand {
    pub binary: PathBuf,
    pub config: PathBuf,
    pub event_socket: PathBuf,
    pub rules_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub interfaces: Vec<String>,
}

impl DetectorCommand {
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-c".into(),
            self.config.clone().into(),
            "--unix-socket".into(),
            self.event_socket.clone().into(),
        ];
        if let Some(rules_dir) = &self.rules_dir {
            args.push("-S".into());
            args.push(rules_dir.clone().into());
        }
        if let Some(log_dir) = &self.log_dir {
            args.push("-l".into());
            args.push(log_dir.clone().into());
        }
        for iface in &self.interfaces {
            args.push("-i".into());
            args.push(iface.clone().into());
        }
        args.push("--runmode".into());
        args.push("workers".into());
        args
    }

    fn spawn(&self) -> anyhow::Result<Child> {
        access(&self.binary, AccessFlags::X_OK).with_context(|| {
            format!(
                "detector binary not found or not executable: {}",
                self.binary.display()
            )
        })?;

        let mut command = Command::new(&self.binary);
        command.args(self.args()).stdin(Stdio::null());

        if let Some(log_dir) = &self.log_dir {
            let log = OpenOptions::new()
                .create(true)
                .append(true)
                .mode(0o644)
                .open(log_dir.join("detector.log"))
                .context("failed to open detector log file")?;
            command.stdout(log.try_clone().context("failed to clone detector log fd")?);
            command.stderr(log);
        } else {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }

        debug!(binary = %self.binary.display(), args = ?self.args(), "launching detector");
        command.spawn().context("failed to spawn detector")
    }

    /// Runs the detector in test mode (`-T`) and collects its exit status,
    /// killing it past the deadline.
    pub fn run_validation(&self, timeout: Duration) -> anyhow::Result<ExitStatus> {
        access(&self.binary, AccessFlags::X_OK).with_context(|| {
            format!(
                "detector binary not found or not executable: {}",
                self.binary.display()
            )
        })?;

        let mut command = Command::new(&self.binary);
        command.arg("-T").arg("-c").arg(&self.config);
        if let Some(rules_dir) = &self.rules_dir {
            command.arg("-S").arg(rules_dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command.spawn().context("failed to spawn detector for validation")?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait().context("failed to wait for validation")? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                anyhow::bail!("rule validation timed out after {}s", timeout.as_secs());
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SupervisorConfig {
    pub check_interval: Duration,
    pub restart_backoff: Duration,
    pub max_restart_attempts: u32,
    pub auto_restart: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            check_interval: Duration::from_secs(5),
            restart_backoff: Duration::from_secs(1),
            max_restart_attempts: 5,
            auto_restart: true,
        }
    }
}

struct StateInner {
    state: SupervisorState,
    child: Option<Child>,
    restart_count: u32,
    last_start: Option<SystemTime>,
    last_stop: Option<SystemTime>,
}

struct Shared {
    command: DetectorCommand,
    config: SupervisorConfig,
    running: AtomicBool,
    state: Mutex<StateInner>,
    cond: Condvar,
}

pub struct Supervisor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(command: DetectorCommand, config: SupervisorConfig) -> Self {
        Supervisor {
            shared: Arc::new(Shared {
                command,
                config,
                running: AtomicBool::new(false),
                state: Mutex::new(StateInner {
                    state: SupervisorState::Stopped,
                    child: None,
                    restart_count: 0,
                    last_start: None,
                    last_stop: None,
                }),
                cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    pub fn start(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.shared.command.binary.as_os_str().is_empty(),
            "detector binary not configured"
        );
        anyhow::ensure!(
            !self.shared.command.config.as_os_str().is_empty(),
            "detector config not configured"
        );

        let mut guard = self
            .thread
            .lock()
            .map_err(|_| anyhow::anyhow!("supervisor state poisoned"))?;
        anyhow::ensure!(guard.is_none(), "supervisor already started");

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("vigil-supervisor".to_owned())
            .spawn(move || supervisor_loop(shared))
            .context("failed to spawn supervisor thread")?;
        *guard = Some(handle);
        Ok(())
    }

    /// Stops the watchdog thread; the thread terminates the child on its
    /// way out.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.cond.notify_all();
        if let Ok(mut guard) = self.thread.lock() {
            if let Some(handle) = guard.take() {
                let _ = handle.join();
            }
        }
        info!("supervisor stopped");
    }

    pub fn state(&self) -> SupervisorState {
        self.shared
            .state
            .lock()
            .map(|s| s.state)
            .unwrap_or(SupervisorState::Failed)
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.shared
            .state
            .lock()
            .ok()
            .and_then(|s| s.child.as_ref().map(|c| c.id()))
    }

    pub fn restart_count(&self) -> u32 {
        self.shared
            .state
            .lock()
            .map(|s| s.restart_count)
            .unwrap_or(0)
    }

    pub fn last_start_time(&self) -> Option<SystemTime> {
        self.shared.state.lock().ok().and_then(|s| s.last_start)
    }

    pub fn last_stop_time(&self) -> Option<SystemTime> {
        self.shared.state.lock().ok().and_then(|s| s.last_stop)
    }

    /// Probes the child, reaping it if it already exited.
    pub fn is_child_running(&self) -> bool {
        self.shared
            .state
            .lock()
            .map(|mut s| child_alive(&mut s))
            .unwrap_or(false)
    }

    /// Signals the child to reload its rule set.
    pub fn reload_rules(&self) -> anyhow::Result<()> {
        let state = self
            .shared
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("supervisor state poisoned"))?;
        let pid = state
            .child
            .as_ref()
            .map(|c| c.id())
            .context("detector is not running")?;
        info!(pid, "sending SIGUSR2 to detector for rule reload");
        kill(Pid::from_raw(pid as i32), Signal::SIGUSR2)
            .context("failed to signal detector for rule reload")?;
        Ok(())
    }

    /// Runs the detector's test-mode rule validation.
    pub fn validate_rules(&self, timeout: Duration) -> anyhow::Result<ExitStatus> {
        self.shared.command.run_validation(timeout)
    }
}

fn restart_backoff(base: Duration, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let ms = (base.as_millis() as u64)
        .checked_shl(shift)
        .unwrap_or(u64::MAX);
    Duration::from_millis(ms.min(MAX_BACKOFF_MS))
}

fn child_alive(state: &mut StateInner) -> bool {
    let Some(child) = state.child.as_mut() else {
        return false;
    };
    match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            info!(status = %status, "detector exited");
            state.child = None;
            false
        }
        Err(e) => {
            warn!(error = %e, "failed to probe detector child");
            state.child = None;
            false
        }
    }
}

/// SIGTERM with a bounded grace period, then SIGKILL and a blocking reap.
fn stop_child(mut child: Child) {
    let pid = child.id();
    info!(pid, "stopping detector");

    if kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok() {
        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => {
                    info!("detector stopped gracefully");
                    return;
                }
                Ok(None) => thread::sleep(Duration::from_millis(100)),
                Err(_) => return,
            }
        }
        warn!("detector did not stop gracefully, sending SIGKILL");
    }

    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
    let _ = child.wait();
}

fn sleep_while_running(shared: &Shared, duration: Duration) {
    let deadline = Instant::now() + duration;
    while shared.running.load(Ordering::SeqCst) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(Duration::from_millis(50).min(remaining));
    }
}

fn launch(shared: &Shared, state: &mut StateInner) -> bool {
    match shared.command.spawn() {
        Ok(child) => {
            info!(pid = child.id(), "detector started");
            state.child = Some(child);
            state.last_start = Some(SystemTime::now());
            state.state = SupervisorState::Running;
            true
        }
        Err(e) => {
            error!(error = %e, "failed to start detector");
            false
        }
    }
}

fn supervisor_loop(shared: Arc<Shared>) {
    info!("supervisor thread started");

    let mut state = match shared.state.lock() {
        Ok(state) => state,
        Err(_) => return,
    };

    state.state = SupervisorState::Starting;
    if !launch(&shared, &mut state) {
        state.state = SupervisorState::Failed;
    }

    while shared.running.load(Ordering::SeqCst) {
        let (guard, _) = match shared.cond.wait_timeout(state, shared.config.check_interval) {
            Ok(res) => res,
            Err(_) => return,
        };
        state = guard;
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        if child_alive(&mut state) {
            // Only a healthy liveness check clears the restart counter;
            // clearing it at launch would hide flapping.
            if state.state == SupervisorState::Running {
                state.restart_count = 0;
            }
            continue;
        }

        if state.state == SupervisorState::Running {
            warn!("detector process died unexpectedly");
            state.state = SupervisorState::Stopped;
            state.last_stop = Some(SystemTime::now());
        }

        if shared.config.auto_restart && state.restart_count < shared.config.max_restart_attempts {
            state.state = SupervisorState::Restarting;
            state.restart_count += 1;
            let attempt = state.restart_count;
            let backoff = restart_backoff(shared.config.restart_backoff, attempt);
            info!(
                attempt,
                max_attempts = shared.config.max_restart_attempts,
                backoff_ms = backoff.as_millis() as u64,
                "restarting detector"
            );

            // Back off without holding the lock.
            drop(state);
            sleep_while_running(&shared, backoff);
            state = match shared.state.lock() {
                Ok(state) => state,
                Err(_) => return,
            };
            if !shared.running.load(Ordering::SeqCst) {
                break;
            }

            if launch(&shared, &mut state) {
                info!("detector restarted");
            } else if state.restart_count >= shared.config.max_restart_attempts {
                state.state = SupervisorState::Failed;
                error!("max restart attempts reached, giving up");
            }
        }
    }

    let child = state.child.take();
    drop(state);
    if let Some(child) = child {
        stop_child(child);
    }
    if let Ok(mut state) = shared.state.lock() {
        state.state = SupervisorState::Stopped;
        state.last_stop = Some(SystemTime::now());
    }

    info!("supervisor thread stopped");
}
