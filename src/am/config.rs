use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Effective daemon configuration, flattened from the grouped YAML file.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Base directory for app checkouts, pid files, per-app logs and the
    /// metadata file.
    pub storage_directory: PathBuf,

    pub sock: PathBuf,

    /// Candidate port ranges, probed in order. `end` is exclusive.
    pub port_ranges: Vec<PortRange>,

    /// How long to wait for an app to exit after SIGTERM before SIGKILL.
    pub stop_grace_period_ms: u64,

    pub expiry: ExpiryConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

#[derive(Debug, Clone)]
pub struct ExpiryConfig {
    pub enabled: bool,
    /// Apps idle (no heartbeat) longer than this are stopped by the sweeper.
    pub idle_timeout_ms: u64,
    pub check_interval_ms: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            idle_timeout_ms: default_idle_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

// -------- YAML file schema (grouped; strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MasterConfigFile {
    global: GlobalConfigFile,
    #[serde(default)]
    unix_socket: Option<UnixSocketConfigFile>,
    #[serde(default)]
    ports: Option<PortsConfigFile>,
    #[serde(default)]
    process: Option<ProcessConfigFile>,
    #[serde(default)]
    expiry: Option<ExpiryConfigFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GlobalConfigFile {
    storage_directory: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnixSocketConfigFile {
    #[serde(default = "default_sock")]
    path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct PortsConfigFile {
    ranges: Vec<PortRange>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessConfigFile {
    #[serde(default = "default_stop_grace_period_ms")]
    stop_grace_period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpiryConfigFile {
    #[serde(default)]
    enabled: bool,
    /// Duration string, e.g. "3d" or "72h".
    #[serde(default)]
    idle_timeout: Option<String>,
    /// Duration string, e.g. "5m".
    #[serde(default)]
    check_interval: Option<String>,
}

fn default_sock() -> PathBuf {
    "/tmp/appmaster.sock".into()
}

fn default_stop_grace_period_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    3 * 24 * 3_600_000
}

fn default_check_interval_ms() -> u64 {
    5 * 60_000
}

fn default_port_ranges() -> Vec<PortRange> {
    vec![
        PortRange { start: 8080, end: 8090 },
        PortRange { start: 4040, end: 4050 },
    ]
}

/// Parse durations like "1500ms", "10s", "5m", "2h", "3d".
pub fn parse_duration_ms(s: &str) -> anyhow::Result<u64> {
    let t = s.trim();
    if t.is_empty() {
        anyhow::bail!("empty duration");
    }
    let mut idx = t.len();
    for (i, ch) in t.char_indices() {
        if !(ch.is_ascii_digit() || ch == '.') {
            idx = i;
            break;
        }
    }
    if idx == 0 {
        anyhow::bail!("invalid duration: {s}");
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid duration number in {s:?}: {e}"))?;
    if num < 0.0 {
        anyhow::bail!("duration must be >= 0");
    }
    let mult: f64 = match unit_s.trim().to_ascii_lowercase().as_str() {
        "ms" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        "d" => 86_400_000.0,
        other => anyhow::bail!("unknown duration unit {other:?} (use ms/s/m/h/d)"),
    };
    Ok((num * mult).round() as u64)
}

pub fn load_master_config(config_path: &Path) -> anyhow::Result<MasterConfig> {
    let raw = std::fs::read_to_string(config_path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", config_path.display()))?;
    let file_cfg: MasterConfigFile = serde_yaml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", config_path.display()))?;

    let mut cfg = MasterConfig {
        storage_directory: file_cfg.global.storage_directory,
        sock: default_sock(),
        port_ranges: default_port_ranges(),
        stop_grace_period_ms: default_stop_grace_period_ms(),
        expiry: ExpiryConfig::default(),
    };

    if let Some(us) = file_cfg.unix_socket {
        cfg.sock = us.path;
    }
    if let Some(ports) = file_cfg.ports {
        anyhow::ensure!(!ports.ranges.is_empty(), "ports.ranges must not be empty");
        for r in &ports.ranges {
            anyhow::ensure!(
                r.start < r.end,
                "ports.ranges entry must have start < end, got {}..{}",
                r.start,
                r.end
            );
        }
        cfg.port_ranges = ports.ranges;
    }
    if let Some(p) = file_cfg.process {
        cfg.stop_grace_period_ms = p.stop_grace_period_ms;
    }
    if let Some(e) = file_cfg.expiry {
        cfg.expiry.enabled = e.enabled;
        if let Some(spec) = e.idle_timeout.as_deref() {
            cfg.expiry.idle_timeout_ms = parse_duration_ms(spec)
                .map_err(|err| anyhow::anyhow!("invalid expiry.idle_timeout {spec:?}: {err}"))?;
        }
        if let Some(spec) = e.check_interval.as_deref() {
            cfg.expiry.check_interval_ms = parse_duration_ms(spec)
                .map_err(|err| anyhow::anyhow!("invalid expiry.check_interval {spec:?}: {err}"))?;
        }
    }

    // Resolve relative paths against the config file directory.
    let base = config_path.parent().unwrap_or_else(|| Path::new("."));
    if cfg.storage_directory.is_relative() {
        cfg.storage_directory = base.join(&cfg.storage_directory);
    }
    if cfg.sock.is_relative() {
        cfg.sock = base.join(&cfg.sock);
    }

    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(dir: &Path, yaml: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        path
    }

    #[test]
    fn durations_parse_with_all_units() {
        assert_eq!(parse_duration_ms("1500ms").unwrap(), 1500);
        assert_eq!(parse_duration_ms("10s").unwrap(), 10_000);
        assert_eq!(parse_duration_ms("5m").unwrap(), 300_000);
        assert_eq!(parse_duration_ms("2h").unwrap(), 7_200_000);
        assert_eq!(parse_duration_ms("3d").unwrap(), 259_200_000);
        assert!(parse_duration_ms("10x").is_err());
        assert!(parse_duration_ms("").is_err());
        assert!(parse_duration_ms("s").is_err());
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "global:\n  storage_directory: ./apps\n");
        let cfg = load_master_config(&path).unwrap();
        assert_eq!(cfg.storage_directory, dir.path().join("./apps"));
        assert_eq!(cfg.sock, PathBuf::from("/tmp/appmaster.sock"));
        assert_eq!(cfg.stop_grace_period_ms, 5_000);
        assert_eq!(cfg.port_ranges.len(), 2);
        assert_eq!(cfg.port_ranges[0].start, 8080);
        assert!(!cfg.expiry.enabled);
    }

    #[test]
    fn grouped_sections_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "\
global:
  storage_directory: /srv/apps
unix_socket:
  path: ./run/am.sock
ports:
  ranges:
    - { start: 9000, end: 9010 }
process:
  stop_grace_period_ms: 1000
expiry:
  enabled: true
  idle_timeout: 1h
  check_interval: 30s
";
        let path = write_config(dir.path(), yaml);
        let cfg = load_master_config(&path).unwrap();
        assert_eq!(cfg.storage_directory, PathBuf::from("/srv/apps"));
        assert_eq!(cfg.sock, dir.path().join("./run/am.sock"));
        assert_eq!(cfg.port_ranges[0].start, 9000);
        assert_eq!(cfg.stop_grace_period_ms, 1000);
        assert!(cfg.expiry.enabled);
        assert_eq!(cfg.expiry.idle_timeout_ms, 3_600_000);
        assert_eq!(cfg.expiry.check_interval_ms, 30_000);
    }

    #[test]
    fn unknown_fields_and_bad_ranges_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "global:\n  storage_directory: ./a\n  surprise: 1\n");
        assert!(load_master_config(&path).is_err());

        let path = write_config(
            dir.path(),
            "global:\n  storage_directory: ./a\nports:\n  ranges:\n    - { start: 9000, end: 9000 }\n",
        );
        assert!(load_master_config(&path).is_err());
    }
}
