use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use pairlink_core::config;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Serve the signaling relay over WebSocket
    Relay,
    /// Join a call through a running relay
    Peer,
    /// Run both peers in one process against an in-memory relay
    Loopback,
}

#[derive(Parser, Debug)]
#[command(name = "pairlink")]
#[command(author = "Pairlink Team")]
#[command(version)]
#[command(about = "Peer-to-peer call negotiation over a signaling relay", long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/pairlink.toml")]
    pub config: PathBuf,

    /// What to run
    #[arg(short, long, value_enum, default_value_t = Mode::Loopback)]
    pub mode: Mode,

    /// This peer's id (peer mode)
    #[arg(long)]
    pub local_id: Option<String>,

    /// The other peer's id (peer mode)
    #[arg(long)]
    pub remote_id: Option<String>,

    /// Ring the remote peer instead of waiting to be called
    #[arg(long, action)]
    pub invite: bool,

    /// Request an audio-only call
    #[arg(long, action)]
    pub audio_only: bool,

    /// Relay WebSocket URL, overrides relay.url
    #[arg(long)]
    pub relay_url: Option<String>,

    /// Relay listen port, overrides relay.port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Verbose logging
    #[arg(short, long, action)]
    pub verbose: bool,
}

impl Args {
    pub fn load_config(&self) -> Result<config::Config, Box<dyn std::error::Error>> {
        config::Config::load(&self.config)
    }

    /// Fold command line overrides into `config`
    pub fn apply_overrides(&self, config: &mut config::Config) {
        if let Some(port) = self.port {
            config.relay.port = port;
        }
        if let Some(url) = &self.relay_url {
            config.relay.url = Some(url.clone());
        }
        if self.verbose {
            config.logging.level = "debug".to_string();
        }
    }
}
