use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};

use crate::am::daemon::am_event;

/// Result of signalling a pid with the null signal. `Denied` means the
/// process exists but we lack permission to signal it; only `Dead` implies
/// the process is definitely gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
    Denied,
}

/// Durable name -> pid mapping, one small file per app. Written at launch,
/// removed at stop; consulted only by startup recovery.
#[derive(Debug, Clone)]
pub struct PidRegistry {
    storage: PathBuf,
}

impl PidRegistry {
    pub fn new(storage: impl Into<PathBuf>) -> Self {
        Self { storage: storage.into() }
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.storage.join(name).join("app.pid")
    }

    /// Best-effort: a pid file we fail to write costs us re-adoption after a
    /// manager restart, not the launch itself.
    pub fn save(&self, name: &str, pid: i32) {
        let path = self.pid_file(name);
        if let Some(parent) = path.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                am_event("pid", Some(name), format!("save_failed mkdir {} err={e}", parent.display()));
                return;
            }
        }
        match fs::write(&path, format!("{pid}\n")) {
            Ok(()) => am_event("pid", Some(name), format!("saved pid={pid} file={}", path.display())),
            Err(e) => am_event("pid", Some(name), format!("save_failed pid={pid} file={} err={e}", path.display())),
        }
    }

    pub fn get(&self, name: &str) -> Option<i32> {
        let path = self.pid_file(name);
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    am_event("pid", Some(name), format!("read_failed file={} err={e}", path.display()));
                }
                return None;
            }
        };
        match text.trim().parse::<i32>() {
            Ok(pid) => Some(pid),
            Err(e) => {
                am_event("pid", Some(name), format!("discard_unparseable file={} err={e}", path.display()));
                None
            }
        }
    }

    pub fn remove(&self, name: &str) {
        let path = self.pid_file(name);
        match fs::remove_file(&path) {
            Ok(()) => am_event("pid", Some(name), format!("removed file={}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => am_event("pid", Some(name), format!("remove_failed file={} err={e}", path.display())),
        }
    }

    /// Signal the process with the null signal (no effect on the target).
    pub fn probe(pid: i32) -> Liveness {
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => Liveness::Alive,
            Err(Errno::ESRCH) => Liveness::Dead,
            Err(Errno::EPERM) => Liveness::Denied,
            Err(_) => Liveness::Dead,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let reg = PidRegistry::new(dir.path());

        assert_eq!(reg.get("demo"), None);
        reg.save("demo", 4242);
        assert_eq!(reg.get("demo"), Some(4242));
        assert!(reg.pid_file("demo").exists());

        // Overwrite on save.
        reg.save("demo", 4343);
        assert_eq!(reg.get("demo"), Some(4343));

        reg.remove("demo");
        assert_eq!(reg.get("demo"), None);
        // Removing again is a quiet no-op.
        reg.remove("demo");
    }

    #[test]
    fn garbage_pid_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let reg = PidRegistry::new(dir.path());
        fs::create_dir_all(dir.path().join("demo")).unwrap();
        fs::write(reg.pid_file("demo"), "not-a-pid").unwrap();
        assert_eq!(reg.get("demo"), None);
    }

    #[test]
    fn probe_distinguishes_alive_from_dead() {
        let own = std::process::id() as i32;
        assert_eq!(PidRegistry::probe(own), Liveness::Alive);
        // Max pid on Linux is bounded well below this.
        assert_eq!(PidRegistry::probe(i32::MAX - 1), Liveness::Dead);
    }
}
