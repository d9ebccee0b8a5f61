pub mod app;
pub mod asyncutil;
pub mod build_info;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod launcher;
pub mod pidfile;
pub mod ports;
pub mod repo;
pub mod rpc;
pub mod service;
pub mod state;
pub mod store;

pub fn main() -> anyhow::Result<()> {
    cli::run()
}
