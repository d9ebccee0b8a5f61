use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::am::error::LifecycleError;

/// Supported application types. The kind decides the launch command line;
/// everything else about an app is uniform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    Streamlit,
    Voila,
    Flask,
    Fastapi,
    Gradio,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Streamlit => "streamlit",
            AppKind::Voila => "voila",
            AppKind::Flask => "flask",
            AppKind::Fastapi => "fastapi",
            AppKind::Gradio => "gradio",
        }
    }

    /// Argv for launching an app of this kind. The port flag differs per
    /// runner; the `PORT` environment variable is injected regardless so the
    /// child can bind the tracked port either way.
    pub fn launch_argv(&self, entry: &str, port: u16) -> Vec<String> {
        let port = port.to_string();
        match self {
            AppKind::Streamlit => vec![
                "streamlit".into(),
                "run".into(),
                entry.into(),
                "--server.port".into(),
                port,
            ],
            AppKind::Voila => vec!["voila".into(), entry.into(), "--port".into(), port],
            AppKind::Flask | AppKind::Fastapi | AppKind::Gradio => {
                vec!["python3".into(), entry.into(), "--port".into(), port]
            }
        }
    }
}

impl FromStr for AppKind {
    type Err = LifecycleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "streamlit" => Ok(AppKind::Streamlit),
            "voila" => Ok(AppKind::Voila),
            "flask" => Ok(AppKind::Flask),
            "fastapi" => Ok(AppKind::Fastapi),
            "gradio" => Ok(AppKind::Gradio),
            other => Err(LifecycleError::Config(format!(
                "unsupported app kind {other:?} (supported: streamlit, voila, flask, fastapi, gradio)"
            ))),
        }
    }
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted description of a managed app. One record per unique name; the
/// metadata file is the single source of truth for this set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub kind: AppKind,
    /// Where to fetch code from (git URL or local path).
    pub repo: String,
    /// File to execute, relative to the checkout root.
    pub entry: String,
    /// Contact for the app owner. Informational only.
    pub owner: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Last port the app successfully ran on; preferred on relaunch.
    #[serde(default)]
    pub last_known_port: Option<u16>,
    /// Whether the app is believed to be running. Only the state manager
    /// mutates this.
    #[serde(default)]
    pub active: bool,
    /// Millisecond timestamp of the most recent successful launch (0 = never).
    #[serde(default)]
    pub last_start_ms: i64,
}

/// App names become directory names under the storage root, so keep them to
/// a safe character set.
pub fn validate_app_name(name: &str) -> Result<(), LifecycleError> {
    if name.is_empty() || name.len() > 64 {
        return Err(LifecycleError::Config(format!(
            "app name must be 1..=64 characters, got {:?}",
            name
        )));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if !ok || name.starts_with('.') {
        return Err(LifecycleError::Config(format!(
            "app name {name:?} may only contain [A-Za-z0-9._-] and must not start with '.'"
        )));
    }
    Ok(())
}

pub fn validate_env_name(name: &str) -> Result<(), LifecycleError> {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !head_ok || !tail_ok {
        return Err(LifecycleError::Config(format!(
            "invalid environment variable name {name:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Streamlit".parse::<AppKind>().unwrap(), AppKind::Streamlit);
        assert_eq!(" flask ".parse::<AppKind>().unwrap(), AppKind::Flask);
        assert!("rails".parse::<AppKind>().is_err());
    }

    #[test]
    fn streamlit_argv_carries_server_port_flag() {
        let argv = AppKind::Streamlit.launch_argv("app.py", 8081);
        assert_eq!(argv, vec!["streamlit", "run", "app.py", "--server.port", "8081"]);
    }

    #[test]
    fn python_kinds_share_the_interpreter_template() {
        for kind in [AppKind::Flask, AppKind::Fastapi, AppKind::Gradio] {
            let argv = kind.launch_argv("main.py", 4040);
            assert_eq!(argv[0], "python3");
            assert_eq!(argv[2..], ["--port".to_string(), "4040".to_string()]);
        }
    }

    #[test]
    fn app_names_are_restricted_to_path_safe_characters() {
        assert!(validate_app_name("demo-app_1.2").is_ok());
        assert!(validate_app_name("").is_err());
        assert!(validate_app_name("a/b").is_err());
        assert!(validate_app_name(".hidden").is_err());
        assert!(validate_app_name(&"x".repeat(65)).is_err());
    }

    #[test]
    fn env_names_follow_posix_rules() {
        assert!(validate_env_name("API_KEY").is_ok());
        assert!(validate_env_name("_private").is_ok());
        assert!(validate_env_name("1BAD").is_err());
        assert!(validate_env_name("BAD-DASH").is_err());
        assert!(validate_env_name("").is_err());
    }

    #[test]
    fn record_round_trips_through_json_with_defaults() {
        let json = r#"{"name":"demo","kind":"streamlit","repo":"https://example.com/r.git","entry":"app.py","owner":"a@b.com"}"#;
        let rec: AppRecord = serde_json::from_str(json).unwrap();
        assert_eq!(rec.kind, AppKind::Streamlit);
        assert!(!rec.active);
        assert_eq!(rec.last_known_port, None);
        assert_eq!(rec.last_start_ms, 0);
        assert!(rec.environment.is_empty());
    }
}
