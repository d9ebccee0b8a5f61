use anyhow::Context as _;
use std::path::Path;
use std::process::Command;

use crate::am::daemon::am_event;

/// Source-control collaborator. The engine only ever needs two capabilities:
/// make sure a checkout exists, and bring an existing checkout up to date.
pub trait RepoSync: Send {
    /// Clone `location` into `dir` unless a checkout is already present.
    /// Returns true when a fresh clone was made, false for the no-op case.
    fn ensure_cloned(&self, app: &str, location: &str, dir: &Path) -> anyhow::Result<bool>;

    /// Update an existing checkout in place.
    fn pull(&self, app: &str, dir: &Path) -> anyhow::Result<()>;
}

/// Shells out to the `git` binary. No retries; a failed clone leaves the
/// directory in place so the next attempt can pick up where this one stopped.
#[derive(Debug, Clone, Default)]
pub struct GitSync;

impl RepoSync for GitSync {
    fn ensure_cloned(&self, app: &str, location: &str, dir: &Path) -> anyhow::Result<bool> {
        if dir.join(".git").is_dir() {
            return Ok(false);
        }
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create app directory {}", dir.display()))?;
        am_event("repo", Some(app), format!("clone location={location} dir={}", dir.display()));
        run_git(&["clone", location, &dir.display().to_string()])?;
        Ok(true)
    }

    fn pull(&self, app: &str, dir: &Path) -> anyhow::Result<()> {
        am_event("repo", Some(app), format!("pull dir={}", dir.display()));
        run_git(&["-C", &dir.display().to_string(), "pull", "--ff-only"])
    }
}

fn run_git(args: &[&str]) -> anyhow::Result<()> {
    let out = Command::new("git")
        .args(args)
        .output()
        .with_context(|| format!("run git {}", args.join(" ")))?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        anyhow::bail!(
            "git {} failed (exit={}): {}",
            args.join(" "),
            out.status.code().map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
            stderr.trim()
        );
    }
    Ok(())
}
