use thiserror::Error;

/// Failure kinds for lifecycle operations. Callers branch on the variant,
/// not on message text.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Rejected before any side effect (unknown kind, invalid name, bad env key).
    #[error("configuration error: {0}")]
    Config(String),

    /// Every candidate port in the configured ranges is taken.
    #[error("no free port in the configured ranges")]
    PortsExhausted,

    /// Repository clone/pull failed; the operation is aborted, the working
    /// directory is left in place for the next attempt.
    #[error("repository sync failed for app '{app}': {detail}")]
    Sync { app: String, detail: String },

    /// Spawn or signal failure around the child process.
    #[error("process error for app '{app}': {detail}")]
    Process { app: String, detail: String },

    /// No metadata record for the requested name.
    #[error("no such app: '{0}'")]
    NotFound(String),

    /// Persisted state and runtime state disagree beyond what recovery repairs.
    #[error("state inconsistency for app '{app}': {detail}")]
    State { app: String, detail: String },
}

impl LifecycleError {
    pub fn process(app: &str, detail: impl std::fmt::Display) -> Self {
        LifecycleError::Process {
            app: app.to_string(),
            detail: detail.to_string(),
        }
    }

    pub fn sync(app: &str, detail: impl std::fmt::Display) -> Self {
        LifecycleError::Sync {
            app: app.to_string(),
            detail: detail.to_string(),
        }
    }
}
