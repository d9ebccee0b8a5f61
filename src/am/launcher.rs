use chrono::Local;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::am::app::{validate_env_name, AppKind};
use crate::am::daemon::am_event;
use crate::am::error::LifecycleError;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited,
    TimedOut,
}

/// Opaque handle over a supervised OS process. Either a child we spawned
/// (and must reap), or a process re-adopted by pid after a manager restart.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: i32,
    child: Option<Child>,
}

impl ProcessHandle {
    pub fn from_child(child: Child) -> Self {
        let pid = child.id() as i32;
        Self { pid, child: Some(child) }
    }

    pub fn adopt(pid: i32) -> Self {
        Self { pid, child: None }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            // An adopted process we cannot signal still exists.
            None => !matches!(probe(self.pid), Liveness::Dead),
        }
    }

    /// Ask the process to exit (SIGTERM).
    pub fn terminate(&self) -> Result<(), Errno> {
        signal::kill(Pid::from_raw(self.pid), Signal::SIGTERM)
    }

    /// Force the process down (SIGKILL).
    pub fn kill(&self) -> Result<(), Errno> {
        signal::kill(Pid::from_raw(self.pid), Signal::SIGKILL)
    }

    /// Poll until the process is gone or `timeout` elapses. Spawned children
    /// are reaped here; adopted processes are probed with the null signal.
    pub fn wait(&mut self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            let gone = match self.child.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                None => matches!(probe(self.pid), Liveness::Dead),
            };
            if gone {
                return WaitOutcome::Exited;
            }
            if Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }

    /// Absolute wall-clock start time of the process in milliseconds, derived
    /// from the kernel's starttime counter. Used at recovery so uptime
    /// reflects the process, not the moment the manager restarted.
    pub fn create_time_ms(&self) -> Option<i64> {
        let hz = clock_ticks_per_second()?;
        let sys_uptime_s = read_system_uptime_seconds()?;
        let start_ticks = read_pid_starttime_ticks(self.pid)?;
        let started_s = (start_ticks as f64) / hz;
        let up_s = (sys_uptime_s - started_s).max(0.0);
        Some(Local::now().timestamp_millis() - (up_s * 1000.0).round() as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    Dead,
    Denied,
}

fn probe(pid: i32) -> Liveness {
    match signal::kill(Pid::from_raw(pid), None) {
        Ok(()) => Liveness::Alive,
        Err(Errno::ESRCH) => Liveness::Dead,
        Err(Errno::EPERM) => Liveness::Denied,
        Err(_) => Liveness::Dead,
    }
}

fn clock_ticks_per_second() -> Option<f64> {
    let v = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if v <= 0 { None } else { Some(v as f64) }
}

fn read_system_uptime_seconds() -> Option<f64> {
    let s = fs::read_to_string("/proc/uptime").ok()?;
    let first = s.split_whitespace().next()?;
    first.parse::<f64>().ok()
}

fn read_pid_starttime_ticks(pid: i32) -> Option<u64> {
    let path = format!("/proc/{pid}/stat");
    let stat = fs::read_to_string(path).ok()?;
    let rparen = stat.rfind(')')?;
    let after = stat.get(rparen + 2..)?; // skip ") "
    let fields: Vec<&str> = after.split_whitespace().collect();
    // fields[0] is original field 3 (state). starttime is original field 22 => index 22-3 = 19
    let start = *fields.get(19)?;
    start.parse::<u64>().ok()
}

/// Builds the launch command for an app, wires its environment and log
/// files, and spawns the child in the app's checkout directory.
#[derive(Debug, Clone)]
pub struct Launcher {
    storage: PathBuf,
}

impl Launcher {
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self { storage: storage.into() }
    }

    pub fn app_dir(&self, name: &str) -> PathBuf {
        self.storage.join(name)
    }

    pub fn env_file(&self, name: &str) -> PathBuf {
        self.app_dir(name).join(".env")
    }

    pub fn start(
        &self,
        name: &str,
        kind: AppKind,
        entry: &str,
        port: u16,
        environment: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, LifecycleError> {
        for key in environment.keys() {
            validate_env_name(key)?;
        }
        let argv = kind.launch_argv(entry, port);
        self.spawn_argv(name, &argv, port, environment)
    }

    pub(crate) fn spawn_argv(
        &self,
        name: &str,
        argv: &[String],
        port: u16,
        environment: &BTreeMap<String, String>,
    ) -> Result<ProcessHandle, LifecycleError> {
        let dir = self.app_dir(name);
        fs::create_dir_all(&dir)
            .map_err(|e| LifecycleError::process(name, format!("create app directory {}: {e}", dir.display())))?;

        let log_dir = dir.join("logs");
        fs::create_dir_all(&log_dir)
            .map_err(|e| LifecycleError::process(name, format!("create log directory {}: {e}", log_dir.display())))?;
        let stdout_log = open_append(&log_dir.join("stdout.log"))
            .map_err(|e| LifecycleError::process(name, e))?;
        let stderr_log = open_append(&log_dir.join("stderr.log"))
            .map_err(|e| LifecycleError::process(name, e))?;

        // Precedence, lowest first: inherited base env, per-app .env file,
        // record environment, PORT. PORT always wins so the child binds the
        // port the manager tracks.
        let mut merged: BTreeMap<String, String> = parse_env_file(&self.env_file(name));
        for (k, v) in environment {
            merged.insert(k.clone(), v.clone());
        }
        merged.insert("PORT".to_string(), port.to_string());

        am_event(
            "launch",
            Some(name),
            format!("spawn cwd={} argv={}", dir.display(), argv.join(" ")),
        );
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(&dir)
            .envs(&merged)
            .stdout(Stdio::from(stdout_log))
            .stderr(Stdio::from(stderr_log))
            .spawn()
            .map_err(|e| {
                LifecycleError::process(
                    name,
                    format!(
                        "spawn cwd={} argv={} failed: kind={:?} os_error={:?} err={e}",
                        dir.display(),
                        argv.join(" "),
                        e.kind(),
                        e.raw_os_error()
                    ),
                )
            })?;

        let handle = ProcessHandle::from_child(child);
        am_event("launch", Some(name), format!("spawned pid={} port={port}", handle.pid()));
        Ok(handle)
    }
}

fn open_append(path: &Path) -> Result<fs::File, String> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("open log file {}: {e}", path.display()))
}

/// Minimal `.env` reader: `KEY=VALUE` per line, `#` comments, optional
/// `export ` prefix and single/double quotes around the value. Missing file
/// means no entries.
pub fn parse_env_file(path: &Path) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Ok(text) = fs::read_to_string(path) else {
        return out;
    };
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let mut value = value.trim();
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        out.insert(key.to_string(), value.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn env_file_parsing_handles_comments_quotes_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        fs::write(
            &path,
            "# comment\nFOO=bar\nexport BAZ=\"quoted value\"\nQUX='single'\n\nBROKEN_LINE\n=nokey\n",
        )
        .unwrap();
        let env = parse_env_file(&path);
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("BAZ").map(String::as_str), Some("quoted value"));
        assert_eq!(env.get("QUX").map(String::as_str), Some("single"));
        assert_eq!(env.len(), 3);

        assert!(parse_env_file(&dir.path().join("missing")).is_empty());
    }

    #[test]
    fn spawned_process_runs_logs_exist_and_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path());

        let mut handle = launcher
            .spawn_argv("demo", &sh("sleep 30"), 48200, &BTreeMap::new())
            .unwrap();
        assert!(handle.is_running());
        assert!(dir.path().join("demo/logs/stdout.log").exists());
        assert!(dir.path().join("demo/logs/stderr.log").exists());

        handle.terminate().unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)), WaitOutcome::Exited);
        assert!(!handle.is_running());
    }

    #[test]
    fn port_variable_overrides_caller_environment() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path());

        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        // A caller-supplied PORT must lose against the allocated one.
        env.insert("PORT".to_string(), "9999".to_string());

        let mut handle = launcher
            .spawn_argv("demo", &sh("echo \"$PORT $FOO\" > out.txt"), 48201, &env)
            .unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)), WaitOutcome::Exited);
        let out = fs::read_to_string(dir.path().join("demo/out.txt")).unwrap();
        assert_eq!(out.trim(), "48201 bar");
    }

    #[test]
    fn env_file_loses_against_caller_environment() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path());
        fs::create_dir_all(dir.path().join("demo")).unwrap();
        fs::write(dir.path().join("demo/.env"), "FOO=from_file\nBAZ=kept\n").unwrap();

        let mut env = BTreeMap::new();
        env.insert("FOO".to_string(), "from_caller".to_string());

        let mut handle = launcher
            .spawn_argv("demo", &sh("echo \"$FOO $BAZ\" > out.txt"), 48202, &env)
            .unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)), WaitOutcome::Exited);
        let out = fs::read_to_string(dir.path().join("demo/out.txt")).unwrap();
        assert_eq!(out.trim(), "from_caller kept");
    }

    #[test]
    fn sigterm_ignoring_process_requires_kill() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path());

        let mut handle = launcher
            .spawn_argv("stubborn", &sh("trap '' TERM; sleep 30"), 48203, &BTreeMap::new())
            .unwrap();
        // Give the shell a moment to install the trap.
        std::thread::sleep(Duration::from_millis(200));

        handle.terminate().unwrap();
        assert_eq!(handle.wait(Duration::from_millis(500)), WaitOutcome::TimedOut);

        handle.kill().unwrap();
        assert_eq!(handle.wait(Duration::from_secs(5)), WaitOutcome::Exited);
    }

    #[test]
    fn spawn_failure_surfaces_as_process_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path());
        let argv = vec!["definitely-not-a-real-binary-name".to_string()];
        let err = launcher.spawn_argv("demo", &argv, 48204, &BTreeMap::new());
        assert!(matches!(err, Err(LifecycleError::Process { .. })));
        // The app directory stays; retries are cheap.
        assert!(dir.path().join("demo").is_dir());
    }

    #[test]
    fn adopted_handle_reports_liveness_and_start_time() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Launcher::new(dir.path());

        let spawned = launcher
            .spawn_argv("demo", &sh("sleep 30"), 48205, &BTreeMap::new())
            .unwrap();
        let pid = spawned.pid();

        let mut adopted = ProcessHandle::adopt(pid);
        assert!(adopted.is_running());
        let created = adopted.create_time_ms().unwrap();
        let now = Local::now().timestamp_millis();
        assert!(created <= now && created > now - 60_000);

        // Reap through the spawning handle first: a killed child stays a
        // zombie (and probes as alive) until the parent waits on it.
        adopted.kill().unwrap();
        let mut spawned = spawned;
        assert_eq!(spawned.wait(Duration::from_secs(5)), WaitOutcome::Exited);
        assert!(!adopted.is_running());
    }
}
