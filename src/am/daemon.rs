use anyhow::Context as _;
use chrono::Local;
use std::collections::VecDeque;
use std::fs;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::str::FromStr as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader as TokioBufReader};
use tokio::net::UnixListener as TokioUnixListener;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc as tokio_mpsc;
use tokio::time as tokio_time;

use crate::am::app::AppKind;
use crate::am::asyncutil::TaskTracker;
use crate::am::build_info;
use crate::am::config::MasterConfig;
use crate::am::rpc::{EventEntry, Request, Response};
use crate::am::service::{AppService, CreateRequest, StopOutcome};

const DAEMON_LOG_NAME: &str = "appmaster";
const DAEMON_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
const DAEMON_LOG_BACKUPS: usize = 5;
const EVENT_RING_MAX: usize = 2000;

static TASKS: OnceLock<TaskTracker> = OnceLock::new();
static DAEMON_LOG_TX: OnceLock<tokio_mpsc::UnboundedSender<String>> = OnceLock::new();

pub(crate) fn tasks() -> &'static TaskTracker {
    TASKS.get_or_init(TaskTracker::new)
}

/// Emit one event line: timestamp, component, optional app, key=value text.
/// Always goes to stderr; also to the daemon log file once its writer runs.
pub(crate) fn am_event(component: &str, app: Option<&str>, msg: impl AsRef<str>) {
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let line = match app {
        Some(a) => format!("{ts} [{component}] app={a} {}", msg.as_ref()),
        None => format!("{ts} [{component}] {}", msg.as_ref()),
    };
    eprintln!("{line}");
    if let Some(tx) = DAEMON_LOG_TX.get() {
        let _ = tx.send(line);
    }
}

fn push_event(
    events: &Arc<Mutex<VecDeque<EventEntry>>>,
    component: &str,
    app: Option<&str>,
    msg: impl AsRef<str>,
) {
    am_event(component, app, msg.as_ref());
    let entry = EventEntry {
        ts: Local::now().format("%Y-%m-%d_%H:%M:%S%.3f").to_string(),
        component: component.to_string(),
        app: app.map(|s| s.to_string()),
        message: msg.as_ref().to_string(),
    };
    let mut q = events.lock().unwrap_or_else(|p| p.into_inner());
    q.push_back(entry);
    while q.len() > EVENT_RING_MAX {
        q.pop_front();
    }
}

struct DaemonState {
    service: AppService,
    events: Arc<Mutex<VecDeque<EventEntry>>>,
}

pub fn run_daemon(cfg: &MasterConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    rt.block_on(run_daemon_async(cfg.clone()))
}

pub async fn run_daemon_async(cfg: MasterConfig) -> anyhow::Result<()> {
    fs::create_dir_all(&cfg.storage_directory).map_err(|e| {
        anyhow::anyhow!("create storage directory {}: {e}", cfg.storage_directory.display())
    })?;

    start_daemon_log_file(&cfg);
    am_event("boot", None, build_info::banner());

    // Recovery runs inside the service constructor, synchronously, before the
    // socket exists. No client can observe pre-recovery state.
    let service = AppService::new(&cfg)?;

    let sock = cfg.sock.clone();
    prepare_socket(&sock)?;
    let listener = TokioUnixListener::bind(&sock)
        .map_err(|e| anyhow::anyhow!("failed to bind socket {}: {e}", sock.display()))?;

    let state = Arc::new(Mutex::new(DaemonState {
        service,
        events: Arc::new(Mutex::new(VecDeque::new())),
    }));

    let shutting_down = Arc::new(AtomicBool::new(false));
    start_signal_listener_async(Arc::clone(&shutting_down));

    if cfg.expiry.enabled {
        start_expiry_sweeper(Arc::clone(&state), Arc::clone(&shutting_down), cfg.expiry.clone());
    }

    am_event("rpc", None, format!("listening sock={}", sock.display()));

    while !shutting_down.load(Ordering::Relaxed) {
        tokio::select! {
            r = listener.accept() => {
                match r {
                    Ok((stream, _addr)) => {
                        let st = Arc::clone(&state);
                        tasks().spawn(async move {
                            if let Err(e) = handle_connection_async(st, stream).await {
                                am_event("rpc", None, format!("connection_error err={e:#}"));
                            }
                        });
                    }
                    Err(e) => {
                        am_event("rpc", None, format!("accept_error err={e}"));
                        tokio_time::sleep(Duration::from_millis(200)).await;
                    }
                }
            }
            _ = tokio_time::sleep(Duration::from_millis(200)) => {
                // periodic wake so we can observe shutting_down without relying on accept.
            }
        }
    }

    // Managed apps keep running across a manager restart on purpose: the
    // next boot re-adopts them from pid files.
    am_event(
        "shutdown",
        None,
        format!(
            "signal received; apps stay up for re-adoption on next boot (active_tasks={} total_spawned={})",
            tasks().active_count(),
            tasks().total_spawned()
        ),
    );
    let _ = fs::remove_file(&sock);
    Ok(())
}

fn start_signal_listener_async(flag: Arc<AtomicBool>) {
    tasks().spawn(async move {
        let mut term = unix_signal(SignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(SignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => { flag.store(true, Ordering::Relaxed); }
            _ = int.recv() => { flag.store(true, Ordering::Relaxed); }
        }
    });
}

fn prepare_socket(sock: &Path) -> anyhow::Result<()> {
    if let Some(parent) = sock.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            anyhow::anyhow!("failed to create socket directory {}: {e}", parent.display())
        })?;
    }

    if sock.exists() {
        // If something is already listening, fail. Otherwise remove stale socket.
        match StdUnixStream::connect(sock) {
            Ok(_) => anyhow::bail!(
                "appmaster daemon already running (socket {} is accepting connections)",
                sock.display()
            ),
            Err(_) => {
                fs::remove_file(sock).map_err(|e| {
                    anyhow::anyhow!("failed to remove stale socket {}: {e}", sock.display())
                })?;
            }
        }
    }
    Ok(())
}

async fn handle_connection_async(
    state: Arc<Mutex<DaemonState>>,
    stream: tokio::net::UnixStream,
) -> anyhow::Result<()> {
    let mut reader = TokioBufReader::new(stream);
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 || line.trim().is_empty() {
        return Ok(());
    }
    let req: Request = serde_json::from_str(line.trim_end())?;
    let mut stream = reader.into_inner();

    let resp = match dispatch_async(state, req).await {
        Ok(r) => r,
        // Use the full anyhow chain so clients can actually debug failures.
        Err(e) => Response::error(format!("{e:#}")),
    };
    let resp_line = serde_json::to_string(&resp)? + "\n";
    stream.write_all(resp_line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

async fn dispatch_async(state: Arc<Mutex<DaemonState>>, req: Request) -> anyhow::Result<Response> {
    match req {
        // Lifecycle operations block (repo sync, spawn, bounded stop waits);
        // they run on the blocking pool and serialize on the state lock.
        Request::Create { name, kind, repo, entry, owner, env } => {
            run_blocking(state, move |st| {
                let kind = AppKind::from_str(&kind)?;
                let req = CreateRequest {
                    name: name.clone(),
                    kind,
                    repo,
                    entry,
                    owner,
                    environment: env,
                };
                let port = st.service.create(req)?;
                push_event(&st.events, "create", Some(&name), format!("outcome=running port={port}"));
                Ok(Response::ok_port(format!("app '{name}' running on port {port}"), port))
            })
            .await
        }
        Request::Start { name } => {
            run_blocking(state, move |st| {
                let port = st.service.start(&name)?;
                push_event(&st.events, "start", Some(&name), format!("outcome=running port={port}"));
                Ok(Response::ok_port(format!("app '{name}' running on port {port}"), port))
            })
            .await
        }
        Request::Stop { name } => {
            run_blocking(state, move |st| {
                let outcome = st.service.stop(&name)?;
                let (msg, outcome_kv) = match outcome {
                    StopOutcome::Stopped => (format!("app '{name}' stopped"), "outcome=stopped"),
                    StopOutcome::AlreadyStopped => {
                        (format!("app '{name}' was not running"), "outcome=already_stopped")
                    }
                };
                push_event(&st.events, "stop", Some(&name), outcome_kv);
                Ok(Response::ok_message(msg))
            })
            .await
        }
        Request::Restart { name } => {
            run_blocking(state, move |st| {
                let port = st.service.restart(&name)?;
                push_event(&st.events, "restart", Some(&name), format!("outcome=running port={port}"));
                Ok(Response::ok_port(format!("app '{name}' restarted on port {port}"), port))
            })
            .await
        }
        Request::Heartbeat { name } => {
            let mut st = state.lock().unwrap_or_else(|p| p.into_inner());
            if st.service.record_access(&name) {
                Ok(Response::ok_message("ok"))
            } else {
                Ok(Response::error(format!("app '{name}' is not running")))
            }
        }
        Request::Status { name } => {
            let st = state.lock().unwrap_or_else(|p| p.into_inner());
            let mut statuses = st.service.statuses();
            if let Some(name) = name {
                statuses.retain(|s| s.name == name);
                if statuses.is_empty() {
                    return Ok(Response::error(format!("no such app: '{name}'")));
                }
            }
            Ok(Response {
                ok: true,
                message: String::new(),
                port: None,
                statuses,
                events: vec![],
            })
        }
        Request::Events { n } => {
            let st = state.lock().unwrap_or_else(|p| p.into_inner());
            let q = st.events.lock().unwrap_or_else(|p| p.into_inner());
            let start = q.len().saturating_sub(n);
            let events: Vec<EventEntry> = q.iter().skip(start).cloned().collect();
            Ok(Response {
                ok: true,
                message: String::new(),
                port: None,
                statuses: vec![],
                events,
            })
        }
        Request::ServerVersion => Ok(Response::ok_message(build_info::banner())),
    }
}

async fn run_blocking<F>(state: Arc<Mutex<DaemonState>>, f: F) -> anyhow::Result<Response>
where
    F: FnOnce(&mut DaemonState) -> anyhow::Result<Response> + Send + 'static,
{
    tasks()
        .spawn_blocking(move || {
            let mut st = state.lock().unwrap_or_else(|p| p.into_inner());
            f(&mut st)
        })
        .await
        .map_err(|e| anyhow::anyhow!("join error: {e}"))?
}

/// Periodically stop running apps whose last heartbeat is older than the
/// configured idle timeout. These are ordinary `stop` calls with no special
/// priority; they share the state lock with interactive requests.
fn start_expiry_sweeper(
    state: Arc<Mutex<DaemonState>>,
    shutting_down: Arc<AtomicBool>,
    expiry: crate::am::config::ExpiryConfig,
) {
    tasks().spawn(async move {
        let interval = Duration::from_millis(expiry.check_interval_ms.max(1000));
        loop {
            tokio_time::sleep(interval).await;
            if shutting_down.load(Ordering::Relaxed) {
                break;
            }
            let idle: Vec<String> = {
                let st = state.lock().unwrap_or_else(|p| p.into_inner());
                st.service.idle_apps(expiry.idle_timeout_ms)
            };
            for name in idle {
                let st = Arc::clone(&state);
                let result = tasks()
                    .spawn_blocking(move || {
                        let mut st = st.lock().unwrap_or_else(|p| p.into_inner());
                        let events = Arc::clone(&st.events);
                        push_event(
                            &events,
                            "expiry",
                            Some(&name),
                            format!("decision=stop idle_timeout_ms={}", expiry.idle_timeout_ms),
                        );
                        let r = st.service.stop(&name);
                        match &r {
                            Ok(_) => push_event(&events, "expiry", Some(&name), "outcome=stopped"),
                            Err(e) => push_event(&events, "expiry", Some(&name), format!("outcome=stop_failed err={e}")),
                        }
                        r.map(|_| ())
                    })
                    .await;
                if let Err(e) = result {
                    am_event("expiry", None, format!("join_error err={e}"));
                }
            }
        }
    });
}

fn start_daemon_log_file(cfg: &MasterConfig) {
    let base_path = cfg
        .storage_directory
        .join("logs")
        .join(format!("{DAEMON_LOG_NAME}.log"));
    let (tx, mut rx) = tokio_mpsc::unbounded_channel::<String>();
    if DAEMON_LOG_TX.set(tx).is_err() {
        // Already wired (daemon restarted in-process); keep the old writer.
        return;
    }

    am_event(
        "log",
        None,
        format!(
            "daemon_log_file path={} rotate=size max_bytes={DAEMON_LOG_MAX_BYTES} backups={DAEMON_LOG_BACKUPS}",
            base_path.display()
        ),
    );

    tasks().spawn(async move {
        let mut f = match open_append_log_async(&base_path).await {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "{} [log] failed to open daemon log file {} err={e}",
                    Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
                    base_path.display()
                );
                return;
            }
        };

        let mut bytes_written: u64 = tokio::fs::metadata(&base_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        while let Some(line) = rx.recv().await {
            if bytes_written >= DAEMON_LOG_MAX_BYTES {
                let _ = f.flush().await;
                if let Ok(fresh) = rotate_numbered_reopen_async(&base_path, DAEMON_LOG_BACKUPS).await {
                    f = fresh;
                    bytes_written = 0;
                }
            }

            let mut s = line;
            if !s.ends_with('\n') {
                s.push('\n');
            }
            if f.write_all(s.as_bytes()).await.is_ok() {
                bytes_written = bytes_written.saturating_add(s.len() as u64);
            }
        }
    });
}

async fn open_append_log_async(path: &Path) -> anyhow::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create log directory {}", parent.display()))?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open daemon log {}", path.display()))
}

/// Shift `base.1 -> base.2 -> ...`, move the live file to `base.1`, reopen.
async fn rotate_numbered_reopen_async(base_path: &Path, backups: usize) -> anyhow::Result<tokio::fs::File> {
    let numbered = |n: usize| {
        let mut p = base_path.as_os_str().to_owned();
        p.push(format!(".{n}"));
        std::path::PathBuf::from(p)
    };
    for i in (1..backups).rev() {
        let _ = tokio::fs::rename(numbered(i), numbered(i + 1)).await;
    }
    let _ = tokio::fs::rename(base_path, numbered(1)).await;
    open_append_log_async(base_path).await
}
