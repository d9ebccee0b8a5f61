use chrono::Local;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::am::app::AppRecord;
use crate::am::daemon::am_event;
use crate::am::launcher::ProcessHandle;
use crate::am::pidfile::{Liveness, PidRegistry};
use crate::am::store::MetadataStore;

pub const METADATA_FILE: &str = "apps.json";

/// In-memory descriptor of one currently supervised process. Exists exactly
/// while the orchestration layer believes a live process backs the app.
#[derive(Debug)]
pub struct RunningEntry {
    pub handle: ProcessHandle,
    pub port: u16,
    pub started_at_ms: i64,
    pub last_access_ms: i64,
}

/// Comparable view of the running table, for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningSummary {
    pub name: String,
    pub pid: i32,
    pub port: u16,
    pub started_at_ms: i64,
    pub last_access_ms: i64,
}

/// Combines the metadata store, the pid registry and the running table, and
/// owns the startup recovery that reconciles all three with reality.
#[derive(Debug)]
pub struct StateManager {
    storage: PathBuf,
    store: MetadataStore,
    pids: PidRegistry,
    running: HashMap<String, RunningEntry>,
}

impl StateManager {
    /// Loads metadata and runs recovery, synchronously, before any lifecycle
    /// call can be served. Recovery happens here and only here; there is no
    /// periodic re-scan.
    pub fn new(storage: &Path) -> Self {
        let mut sm = Self {
            storage: storage.to_path_buf(),
            store: MetadataStore::load(storage.join(METADATA_FILE)),
            pids: PidRegistry::new(storage),
            running: HashMap::new(),
        };
        sm.recover();
        sm
    }

    fn recover(&mut self) {
        am_event("recover", None, "begin reconciling metadata and pid files");
        let now = Local::now().timestamp_millis();

        for rec in self.store.all() {
            let name = rec.name.as_str();
            let Some(pid) = self.pids.get(name) else {
                if rec.active {
                    am_event("recover", Some(name), "no pid file; forcing active=false");
                    self.store.update_fields(name, |r| r.active = false);
                }
                continue;
            };
            match PidRegistry::probe(pid) {
                Liveness::Alive => {
                    let Some(port) = rec.last_known_port else {
                        // Alive pid but no port on record: we cannot route to
                        // it, so we do not own it. Keep the metadata, drop
                        // the pid file.
                        am_event(
                            "recover",
                            Some(name),
                            format!("pid={pid} alive but no recorded port; discarding pid file"),
                        );
                        self.pids.remove(name);
                        if rec.active {
                            self.store.update_fields(name, |r| r.active = false);
                        }
                        continue;
                    };
                    let handle = ProcessHandle::adopt(pid);
                    let started_at_ms = handle.create_time_ms().unwrap_or(now);
                    am_event(
                        "recover",
                        Some(name),
                        format!("adopted pid={pid} port={port} started_at_ms={started_at_ms}"),
                    );
                    self.running.insert(
                        rec.name.clone(),
                        RunningEntry { handle, port, started_at_ms, last_access_ms: now },
                    );
                    if !rec.active {
                        // Crash window between pid-save and metadata-save:
                        // the process is alive, so the record catches up.
                        self.store.update_fields(name, |r| r.active = true);
                    }
                }
                Liveness::Dead => {
                    am_event("recover", Some(name), format!("pid={pid} dead; removing stale pid file"));
                    self.pids.remove(name);
                    if rec.active {
                        self.store.update_fields(name, |r| r.active = false);
                    }
                }
                Liveness::Denied => {
                    // Exists but unsignalable: we cannot stop or supervise
                    // it, so it is not ours to manage.
                    am_event(
                        "recover",
                        Some(name),
                        format!("pid={pid} signal_permission_denied; discarding pid file"),
                    );
                    self.pids.remove(name);
                    if rec.active {
                        self.store.update_fields(name, |r| r.active = false);
                    }
                }
            }
        }

        self.sweep_orphan_pid_files();
        am_event("recover", None, format!("done running={}", self.running.len()));
    }

    /// Pid files with no matching metadata record are noise from a past
    /// incarnation; the metadata wins and the files go.
    fn sweep_orphan_pid_files(&self) {
        let Ok(entries) = fs::read_dir(&self.storage) else {
            return;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let dir_name = entry.file_name().to_string_lossy().to_string();
            if self.store.find(&dir_name).is_some() {
                continue;
            }
            let pid_file = entry.path().join("app.pid");
            if pid_file.is_file() {
                am_event(
                    "recover",
                    Some(&dir_name),
                    format!("orphan_pid_file no_metadata file={}", pid_file.display()),
                );
                let _ = fs::remove_file(&pid_file);
            }
        }
    }

    /// Record a freshly launched process: running table first, then the pid
    /// file, then the metadata flip. A crash between the last two is healed
    /// by the next recovery pass.
    pub fn register_running(&mut self, name: &str, handle: ProcessHandle, port: u16) {
        let now = Local::now().timestamp_millis();
        let pid = handle.pid();
        self.running.insert(
            name.to_string(),
            RunningEntry { handle, port, started_at_ms: now, last_access_ms: now },
        );
        self.pids.save(name, pid);
        self.store.update_fields(name, |r| {
            r.active = true;
            r.last_known_port = Some(port);
            r.last_start_ms = now;
        });
    }

    /// Remove a stopped process. The pid file goes first so that a crash
    /// mid-stop leaves either an alive process with its pid file (re-adopted)
    /// or a dead one without (treated as stopped); never the reverse.
    pub fn unregister_running(&mut self, name: &str) {
        self.pids.remove(name);
        self.running.remove(name);
        self.store.update_fields(name, |r| r.active = false);
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }

    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.running.get(name).map(|e| e.port)
    }

    pub fn uptime_ms(&self, name: &str) -> Option<i64> {
        self.running
            .get(name)
            .map(|e| (Local::now().timestamp_millis() - e.started_at_ms).max(0))
    }

    pub fn started_at_ms(&self, name: &str) -> Option<i64> {
        self.running.get(name).map(|e| e.started_at_ms)
    }

    pub fn last_access_ms(&self, name: &str) -> Option<i64> {
        self.running.get(name).map(|e| e.last_access_ms)
    }

    /// Heartbeat entry point. False when the app is not currently running;
    /// no entry is ever created here.
    pub fn record_access(&mut self, name: &str) -> bool {
        match self.running.get_mut(name) {
            Some(entry) => {
                entry.last_access_ms = Local::now().timestamp_millis();
                true
            }
            None => false,
        }
    }

    pub fn entry_mut(&mut self, name: &str) -> Option<&mut RunningEntry> {
        self.running.get_mut(name)
    }

    pub fn running_snapshot(&self) -> Vec<RunningSummary> {
        let mut out: Vec<RunningSummary> = self
            .running
            .iter()
            .map(|(name, e)| RunningSummary {
                name: name.clone(),
                pid: e.handle.pid(),
                port: e.port,
                started_at_ms: e.started_at_ms,
                last_access_ms: e.last_access_ms,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    // Metadata passthroughs; the store stays private so every caller shares
    // the same mutation discipline.

    pub fn upsert_record(&mut self, record: AppRecord) {
        self.store.upsert(record);
    }

    pub fn find_record(&self, name: &str) -> Option<&AppRecord> {
        self.store.find(name)
    }

    pub fn all_records(&self) -> Vec<AppRecord> {
        self.store.all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::am::app::AppKind;
    use crate::am::launcher::{Launcher, WaitOutcome};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn record(name: &str, port: Option<u16>, active: bool) -> AppRecord {
        AppRecord {
            name: name.to_string(),
            kind: AppKind::Flask,
            repo: "https://example.com/r.git".to_string(),
            entry: "app.py".to_string(),
            owner: "a@b.com".to_string(),
            environment: BTreeMap::new(),
            last_known_port: port,
            active,
            last_start_ms: 0,
        }
    }

    fn seed_metadata(storage: &Path, records: Vec<AppRecord>) {
        let mut store = MetadataStore::load(storage.join(METADATA_FILE));
        for r in records {
            store.upsert(r);
        }
    }

    fn spawn_sleeper(storage: &Path, name: &str) -> ProcessHandle {
        let launcher = Launcher::new(storage);
        let argv = vec!["sh".to_string(), "-c".to_string(), "sleep 30".to_string()];
        launcher.spawn_argv(name, &argv, 48300, &BTreeMap::new()).unwrap()
    }

    fn kill_and_reap(mut handle: ProcessHandle) {
        let _ = handle.kill();
        assert_eq!(handle.wait(Duration::from_secs(5)), WaitOutcome::Exited);
    }

    #[test]
    fn recovery_adopts_live_process_with_its_own_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_sleeper(dir.path(), "demo");
        let pid = handle.pid();

        seed_metadata(dir.path(), vec![record("demo", Some(48300), true)]);
        PidRegistry::new(dir.path()).save("demo", pid);

        let sm = StateManager::new(dir.path());
        assert!(sm.is_running("demo"));
        assert_eq!(sm.port_of("demo"), Some(48300));
        let started = sm.started_at_ms("demo").unwrap();
        let now = Local::now().timestamp_millis();
        assert!(started <= now && started > now - 60_000);

        kill_and_reap(handle);
    }

    #[test]
    fn recovery_self_heals_active_flag_for_adopted_process() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_sleeper(dir.path(), "demo");

        // Simulate a crash after the pid file was written but before the
        // metadata flip: active is still false.
        seed_metadata(dir.path(), vec![record("demo", Some(48300), false)]);
        PidRegistry::new(dir.path()).save("demo", handle.pid());

        let sm = StateManager::new(dir.path());
        assert!(sm.is_running("demo"));
        assert!(sm.find_record("demo").unwrap().active);

        kill_and_reap(handle);
    }

    #[test]
    fn recovery_cleans_up_dead_pid_and_forces_inactive() {
        let dir = tempfile::tempdir().unwrap();
        seed_metadata(dir.path(), vec![record("demo", Some(48300), true)]);
        let pids = PidRegistry::new(dir.path());
        pids.save("demo", i32::MAX - 1);

        let sm = StateManager::new(dir.path());
        assert!(!sm.is_running("demo"));
        assert!(!sm.find_record("demo").unwrap().active);
        assert!(!pids.pid_file("demo").exists());
    }

    #[test]
    fn recovery_marks_active_record_without_pid_file_as_stopped() {
        let dir = tempfile::tempdir().unwrap();
        seed_metadata(dir.path(), vec![record("demo", Some(48300), true)]);

        let sm = StateManager::new(dir.path());
        assert!(!sm.is_running("demo"));
        assert!(!sm.find_record("demo").unwrap().active);
    }

    #[test]
    fn recovery_discards_pid_files_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let pids = PidRegistry::new(dir.path());
        pids.save("ghost", std::process::id() as i32);

        let sm = StateManager::new(dir.path());
        assert!(!sm.is_running("ghost"));
        assert!(!pids.pid_file("ghost").exists());
    }

    #[test]
    fn recovery_twice_over_unchanged_disk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn_sleeper(dir.path(), "demo");
        seed_metadata(dir.path(), vec![record("demo", Some(48300), true)]);
        PidRegistry::new(dir.path()).save("demo", handle.pid());

        let first = StateManager::new(dir.path()).running_snapshot();
        let second = StateManager::new(dir.path()).running_snapshot();

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].name, second[0].name);
        assert_eq!(first[0].pid, second[0].pid);
        assert_eq!(first[0].port, second[0].port);
        // Start time is re-derived from the kernel counter both times;
        // allow for clock measurement jitter between the two passes.
        assert!((first[0].started_at_ms - second[0].started_at_ms).abs() <= 50);

        kill_and_reap(handle);
    }

    #[test]
    fn register_and_unregister_keep_disk_and_memory_in_step() {
        let dir = tempfile::tempdir().unwrap();
        seed_metadata(dir.path(), vec![record("demo", None, false)]);
        let handle = spawn_sleeper(dir.path(), "demo");
        let pid = handle.pid();

        let mut sm = StateManager::new(dir.path());
        sm.register_running("demo", handle, 48301);

        assert!(sm.is_running("demo"));
        assert_eq!(sm.port_of("demo"), Some(48301));
        let rec = sm.find_record("demo").unwrap();
        assert!(rec.active);
        assert_eq!(rec.last_known_port, Some(48301));
        assert!(rec.last_start_ms > 0);
        let pids = PidRegistry::new(dir.path());
        assert_eq!(pids.get("demo"), Some(pid));

        let entry = sm.entry_mut("demo").unwrap();
        let _ = entry.handle.kill();
        assert_eq!(entry.handle.wait(Duration::from_secs(5)), WaitOutcome::Exited);
        sm.unregister_running("demo");

        assert!(!sm.is_running("demo"));
        assert_eq!(pids.get("demo"), None);
        assert!(!sm.find_record("demo").unwrap().active);
        // Preferred port survives for the next start.
        assert_eq!(sm.find_record("demo").unwrap().last_known_port, Some(48301));
    }

    #[test]
    fn heartbeat_only_touches_running_apps() {
        let dir = tempfile::tempdir().unwrap();
        seed_metadata(dir.path(), vec![record("demo", None, false)]);
        let handle = spawn_sleeper(dir.path(), "demo");

        let mut sm = StateManager::new(dir.path());
        assert!(!sm.record_access("demo"));

        sm.register_running("demo", handle, 48302);
        let before = sm.last_access_ms("demo").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(sm.record_access("demo"));
        assert!(sm.last_access_ms("demo").unwrap() > before);

        let entry = sm.entry_mut("demo").unwrap();
        let _ = entry.handle.kill();
        assert_eq!(entry.handle.wait(Duration::from_secs(5)), WaitOutcome::Exited);
        sm.unregister_running("demo");
        assert!(!sm.record_access("demo"));
    }
}
