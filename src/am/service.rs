use chrono::Local;
use nix::errno::Errno;
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::am::app::{validate_app_name, validate_env_name, AppKind, AppRecord};
use crate::am::config::MasterConfig;
use crate::am::daemon::am_event;
use crate::am::error::LifecycleError;
use crate::am::launcher::{Launcher, WaitOutcome};
use crate::am::ports::PortAllocator;
use crate::am::repo::{GitSync, RepoSync};
use crate::am::rpc::AppStatus;
use crate::am::state::{RunningEntry, StateManager};

/// How long to let SIGKILL settle before declaring the stop failed.
const KILL_SETTLE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub kind: AppKind,
    pub repo: String,
    pub entry: String,
    pub owner: String,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// The app was already stopped; repeated stops are not an error.
    AlreadyStopped,
}

/// Public lifecycle API. Sequences repository sync, port allocation, launch
/// and state registration, and enforces the ABSENT/STOPPED/RUNNING state
/// machine. The daemon serializes all calls through one lock, so `&mut self`
/// here really is exclusive.
pub struct AppService {
    state: StateManager,
    ports: PortAllocator,
    launcher: Launcher,
    repo: Box<dyn RepoSync>,
    stop_grace: Duration,
}

impl AppService {
    pub fn new(cfg: &MasterConfig) -> anyhow::Result<Self> {
        Self::with_repo(cfg, Box::new(GitSync))
    }

    /// Recovery runs inside `StateManager::new`, before this constructor
    /// returns; no lifecycle call can observe pre-recovery state.
    pub fn with_repo(cfg: &MasterConfig, repo: Box<dyn RepoSync>) -> anyhow::Result<Self> {
        fs::create_dir_all(&cfg.storage_directory).map_err(|e| {
            anyhow::anyhow!("create storage directory {}: {e}", cfg.storage_directory.display())
        })?;
        Ok(Self {
            state: StateManager::new(&cfg.storage_directory),
            ports: PortAllocator::new(cfg.port_ranges.clone()),
            launcher: Launcher::new(&cfg.storage_directory),
            repo,
            stop_grace: Duration::from_millis(cfg.stop_grace_period_ms),
        })
    }

    /// Create and launch an app. An existing record with the same name is
    /// overwritten and the app relaunched (a running instance is stopped
    /// first); `create` is how an app is redefined, not an error.
    ///
    /// Step order: validate, sync, allocate, persist, launch, register. A
    /// failure leaves the state reached by the last successful step; nothing
    /// is rolled back.
    pub fn create(&mut self, req: CreateRequest) -> Result<u16, LifecycleError> {
        validate_app_name(&req.name)?;
        for key in req.environment.keys() {
            validate_env_name(key)?;
        }

        if self.state.find_record(&req.name).is_some() {
            am_event("create", Some(&req.name), "existing record; decision=overwrite_and_relaunch");
            if self.state.is_running(&req.name) {
                self.stop(&req.name)?;
            }
        }

        self.sync_checkout(&req.name, &req.repo)?;
        let port = self
            .ports
            .allocate(&req.name, None)
            .ok_or(LifecycleError::PortsExhausted)?;

        self.state.upsert_record(AppRecord {
            name: req.name.clone(),
            kind: req.kind,
            repo: req.repo.clone(),
            entry: req.entry.clone(),
            owner: req.owner.clone(),
            environment: req.environment.clone(),
            last_known_port: Some(port),
            active: false,
            last_start_ms: 0,
        });

        let handle = self
            .launcher
            .start(&req.name, req.kind, &req.entry, port, &req.environment)?;
        self.state.register_running(&req.name, handle, port);
        am_event("create", Some(&req.name), format!("outcome=running port={port}"));
        Ok(port)
    }

    /// Start a stopped app, preferring its last known port. Starting a
    /// running app is a no-op that reports the current port.
    pub fn start(&mut self, name: &str) -> Result<u16, LifecycleError> {
        if let Some(port) = self.state.port_of(name) {
            am_event("start", Some(name), format!("outcome=already_running port={port}"));
            return Ok(port);
        }
        let rec = self
            .state
            .find_record(name)
            .cloned()
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        self.sync_checkout(name, &rec.repo)?;
        let port = self
            .ports
            .allocate(name, rec.last_known_port)
            .ok_or(LifecycleError::PortsExhausted)?;

        let handle = self
            .launcher
            .start(name, rec.kind, &rec.entry, port, &rec.environment)?;
        self.state.register_running(name, handle, port);
        am_event("start", Some(name), format!("outcome=running port={port}"));
        Ok(port)
    }

    /// Stop a running app: SIGTERM, bounded grace wait, SIGKILL escalation.
    /// A process that is already gone counts as a successful stop, as does
    /// stopping an app that is not running. Unknown names are an error.
    pub fn stop(&mut self, name: &str) -> Result<StopOutcome, LifecycleError> {
        if self.state.find_record(name).is_none() {
            return Err(LifecycleError::NotFound(name.to_string()));
        }
        let grace = self.stop_grace;
        let Some(entry) = self.state.entry_mut(name) else {
            am_event("stop", Some(name), "outcome=not_running (idempotent)");
            return Ok(StopOutcome::AlreadyStopped);
        };

        let result = stop_entry(name, entry, grace);
        // Unregister on every path: pid file first, then the running entry.
        // Even a failed kill must not leave a stale pid file to re-adopt.
        self.state.unregister_running(name);
        result?;
        Ok(StopOutcome::Stopped)
    }

    /// Stop (when running) and start again with the previous configuration.
    /// A stop failure propagates as a restart failure.
    pub fn restart(&mut self, name: &str) -> Result<u16, LifecycleError> {
        if self.state.find_record(name).is_none() {
            return Err(LifecycleError::NotFound(name.to_string()));
        }
        if self.state.is_running(name) {
            self.stop(name)?;
        }
        self.start(name)
    }

    /// Heartbeat: refresh the idle-expiry clock for a running app. False
    /// when the app is not running; never creates state.
    pub fn record_access(&mut self, name: &str) -> bool {
        self.state.record_access(name)
    }

    pub fn statuses(&self) -> Vec<AppStatus> {
        self.state
            .all_records()
            .into_iter()
            .map(|rec| {
                let running = self.state.is_running(&rec.name);
                AppStatus {
                    port: self.state.port_of(&rec.name).or(rec.last_known_port),
                    uptime_ms: self.state.uptime_ms(&rec.name),
                    last_access_ms: self.state.last_access_ms(&rec.name),
                    running,
                    active: rec.active,
                    name: rec.name,
                    kind: rec.kind.to_string(),
                    repo: rec.repo,
                    entry: rec.entry,
                    owner: rec.owner,
                    last_start_ms: rec.last_start_ms,
                }
            })
            .collect()
    }

    /// Running apps whose last heartbeat is older than `idle_timeout_ms`.
    /// The expiry sweeper stops these with ordinary `stop` calls.
    pub fn idle_apps(&self, idle_timeout_ms: u64) -> Vec<String> {
        let now = Local::now().timestamp_millis();
        self.state
            .running_snapshot()
            .into_iter()
            .filter(|e| now.saturating_sub(e.last_access_ms) > idle_timeout_ms as i64)
            .map(|e| e.name)
            .collect()
    }

    fn sync_checkout(&mut self, name: &str, location: &str) -> Result<(), LifecycleError> {
        let dir = self.launcher.app_dir(name);
        let fresh = self
            .repo
            .ensure_cloned(name, location, &dir)
            .map_err(|e| LifecycleError::sync(name, format!("{e:#}")))?;
        if !fresh {
            self.repo
                .pull(name, &dir)
                .map_err(|e| LifecycleError::sync(name, format!("{e:#}")))?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> &StateManager {
        &self.state
    }
}

fn stop_entry(name: &str, entry: &mut RunningEntry, grace: Duration) -> Result<(), LifecycleError> {
    let pid = entry.handle.pid();
    am_event(
        "stop",
        Some(name),
        format!("attempt=terminate pid={pid} grace_ms={}", grace.as_millis()),
    );
    match entry.handle.terminate() {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            am_event("stop", Some(name), format!("outcome=already_gone pid={pid}"));
            return Ok(());
        }
        Err(e) => {
            am_event("stop", Some(name), format!("outcome=signal_failed pid={pid} err={e}"));
            return Err(LifecycleError::process(name, format!("SIGTERM pid={pid}: {e}")));
        }
    }

    match entry.handle.wait(grace) {
        WaitOutcome::Exited => {
            am_event("stop", Some(name), format!("outcome=graceful_exit pid={pid}"));
            Ok(())
        }
        WaitOutcome::TimedOut => {
            am_event(
                "stop",
                Some(name),
                format!("outcome=grace_expired pid={pid} decision=kill"),
            );
            match entry.handle.kill() {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(LifecycleError::process(name, format!("SIGKILL pid={pid}: {e}")));
                }
            }
            match entry.handle.wait(KILL_SETTLE) {
                WaitOutcome::Exited => {
                    am_event("stop", Some(name), format!("outcome=killed pid={pid}"));
                    Ok(())
                }
                WaitOutcome::TimedOut => Err(LifecycleError::process(
                    name,
                    format!("pid={pid} still running after SIGKILL"),
                )),
            }
        }
    }
}
