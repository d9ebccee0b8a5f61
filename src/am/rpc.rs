use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use chrono::{Local, TimeZone};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Request {
    Create {
        name: String,
        kind: String,
        repo: String,
        entry: String,
        owner: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Heartbeat { name: String },
    Status {
        #[serde(default)]
        name: Option<String>,
    },
    Events {
        #[serde(default = "default_event_lines")]
        n: usize,
    },
    ServerVersion,
}

fn default_event_lines() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub ts: String,
    pub component: String,
    #[serde(default)]
    pub app: Option<String>,
    pub message: String,
}

/// One row of `status` output: the persisted record joined with whatever the
/// running table knows right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppStatus {
    pub name: String,
    pub kind: String,
    pub repo: String,
    pub entry: String,
    pub owner: String,
    pub running: bool,
    /// Persisted activity flag; normally agrees with `running` outside of
    /// transition windows.
    pub active: bool,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub uptime_ms: Option<i64>,
    #[serde(default)]
    pub last_start_ms: i64,
    #[serde(default)]
    pub last_access_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default)]
    pub message: String,
    /// Port the operation launched on / found running, when applicable.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub statuses: Vec<AppStatus>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

impl Response {
    pub fn ok_message(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into(), port: None, statuses: vec![], events: vec![] }
    }

    pub fn ok_port(message: impl Into<String>, port: u16) -> Self {
        Self { ok: true, message: message.into(), port: Some(port), statuses: vec![], events: vec![] }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into(), port: None, statuses: vec![], events: vec![] }
    }

    pub fn render_text(&self) -> String {
        if !self.message.is_empty() && self.statuses.is_empty() {
            return self.message.clone();
        }
        if self.statuses.is_empty() {
            return "(no apps)".to_string();
        }

        fn pad(s: &str, width: usize) -> String {
            if s.len() >= width {
                return s.to_string();
            }
            let mut out = String::with_capacity(width);
            out.push_str(s);
            out.push_str(&" ".repeat(width - s.len()));
            out
        }

        let headers = ["name", "kind", "state", "port", "uptime", "last_start", "owner"];
        let rows: Vec<Vec<String>> = self
            .statuses
            .iter()
            .map(|s| {
                let state = if s.running { "RUNNING" } else { "STOPPED" };
                let port = s.port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string());
                let uptime = s.uptime_ms.map(fmt_uptime_ms).unwrap_or_else(|| "-".to_string());
                let last_start = if s.last_start_ms > 0 {
                    Local
                        .timestamp_millis_opt(s.last_start_ms)
                        .single()
                        .map(|dt| dt.format("%Y-%m-%d_%H:%M:%S").to_string())
                        .unwrap_or_else(|| "-".to_string())
                } else {
                    "-".to_string()
                };
                vec![
                    s.name.clone(),
                    s.kind.clone(),
                    state.to_string(),
                    port,
                    uptime,
                    last_start,
                    s.owner.clone(),
                ]
            })
            .collect();

        let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
        for row in &rows {
            for (i, col) in row.iter().enumerate() {
                widths[i] = widths[i].max(col.len());
            }
        }

        let mut out = String::new();
        for (i, h) in headers.iter().enumerate() {
            out.push_str(&pad(h, widths[i]));
            out.push_str("  ");
        }
        out.push('\n');
        for row in &rows {
            for (i, col) in row.iter().enumerate() {
                out.push_str(&pad(col, widths[i]));
                out.push_str("  ");
            }
            out.push('\n');
        }
        out
    }
}

pub fn fmt_uptime_ms(ms: i64) -> String {
    if ms < 0 {
        return "-".to_string();
    }
    let mut s = (ms as u64 + 500) / 1000;
    let days = s / 86_400;
    s %= 86_400;
    let hours = s / 3_600;
    s %= 3_600;
    let mins = s / 60;
    let secs = s % 60;
    if days > 0 {
        format!("{days}d{hours:02}h")
    } else if hours > 0 {
        format!("{hours}h{mins:02}m")
    } else if mins > 0 {
        format!("{mins}m{secs:02}s")
    } else {
        format!("{secs}s")
    }
}

pub fn client_call(sock: &Path, req: Request) -> anyhow::Result<Response> {
    let mut stream = UnixStream::connect(sock).map_err(|e| {
        anyhow::anyhow!("failed to connect to appmaster socket {}: {e}", sock.display())
    })?;

    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut resp_line = String::new();
    reader.read_line(&mut resp_line)?;
    if resp_line.trim().is_empty() {
        anyhow::bail!("empty response from daemon");
    }
    let resp: Response = serde_json::from_str(resp_line.trim_end())?;
    if !resp.ok {
        anyhow::bail!("{}", resp.message);
    }
    Ok(resp)
}
