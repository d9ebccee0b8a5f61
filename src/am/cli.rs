use crate::am::{build_info, config, daemon, rpc};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "appmaster", version, about = "supervisor for user-deployed data apps")]
pub struct Args {
    /// Path to the daemon config YAML
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Register a new app, fetch its code and launch it. An existing app
    /// with the same name is overwritten and relaunched.
    Create {
        name: String,
        /// App kind: streamlit, voila, flask, fastapi or gradio
        #[arg(short = 'k', long = "kind")]
        kind: String,
        /// Repository to fetch code from
        #[arg(short = 'r', long = "repo")]
        repo: String,
        /// Entry file inside the checkout, e.g. app.py
        #[arg(short = 'p', long = "entry")]
        entry: String,
        /// Owner contact, e.g. an email address
        #[arg(short = 'o', long = "owner")]
        owner: String,
        /// Environment variables for the app, repeatable: -e KEY=VALUE
        #[arg(short = 'e', long = "env")]
        env: Vec<String>,
    },
    /// Start a stopped app on its last known port when still free
    Start { name: String },
    /// Stop a running app (SIGTERM, then SIGKILL after the grace period)
    Stop { name: String },
    /// Stop (if running) and start again with the same configuration
    Restart { name: String },
    /// Record an activity heartbeat for a running app
    Heartbeat { name: String },
    /// Show status for one app, or all
    Status {
        name: Option<String>,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show recent daemon events ("what happened")
    Events {
        /// Number of events to show
        #[arg(short = 'n', default_value_t = 200)]
        n: usize,
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Show the build stamp of this binary and of the running daemon
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = config::load_master_config(&args.config)?;

    match args.cmd {
        None => daemon::run_daemon(&cfg),
        Some(Cmd::Create { name, kind, repo, entry, owner, env }) => {
            let env = parse_env_pairs(&env)?;
            let resp = rpc::client_call(
                &cfg.sock,
                rpc::Request::Create { name, kind, repo, entry, owner, env },
            )?;
            println!("{}", resp.message.trim_end());
            Ok(())
        }
        Some(Cmd::Start { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Start { name })?;
            println!("{}", resp.message.trim_end());
            Ok(())
        }
        Some(Cmd::Stop { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Stop { name })?;
            println!("{}", resp.message.trim_end());
            Ok(())
        }
        Some(Cmd::Restart { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Restart { name })?;
            println!("{}", resp.message.trim_end());
            Ok(())
        }
        Some(Cmd::Heartbeat { name }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Heartbeat { name })?;
            println!("{}", resp.message.trim_end());
            Ok(())
        }
        Some(Cmd::Status { name, format }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Status { name })?;
            match format {
                OutputFormat::Text => println!("{}", resp.render_text()),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
            }
            Ok(())
        }
        Some(Cmd::Events { n, format }) => {
            let resp = rpc::client_call(&cfg.sock, rpc::Request::Events { n })?;
            match format {
                OutputFormat::Text => {
                    for e in resp.events {
                        if let Some(app) = e.app {
                            println!("{} [{}] app={} {}", e.ts, e.component, app, e.message);
                        } else {
                            println!("{} [{}] {}", e.ts, e.component, e.message);
                        }
                    }
                    Ok(())
                }
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&resp)?);
                    Ok(())
                }
            }
        }
        Some(Cmd::Version) => {
            println!("client: {}", build_info::banner());
            match rpc::client_call(&cfg.sock, rpc::Request::ServerVersion) {
                Ok(resp) => println!("daemon: {}", resp.message.trim_end()),
                Err(e) => println!("daemon: unreachable ({e})"),
            }
            Ok(())
        }
    }
}

fn parse_env_pairs(pairs: &[String]) -> anyhow::Result<std::collections::BTreeMap<String, String>> {
    let mut out = std::collections::BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            anyhow::bail!("invalid -e value {pair:?} (expected KEY=VALUE)");
        };
        anyhow::ensure!(!key.trim().is_empty(), "invalid -e value {pair:?} (empty key)");
        out.insert(key.trim().to_string(), value.to_string());
    }
    Ok(out)
}
