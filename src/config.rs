//! Command-line / environment configuration and logging setup

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::signaling::{DEFAULT_SIGNALING_PORT, IceServer};

const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
const DEFAULT_PONG_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid ICE server list: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Runtime settings for the signaling server
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    pub bind_addr: SocketAddr,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_room_id_len: usize,
    /// Passed through to every peer on join
    pub ice_servers: Vec<IceServer>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_SIGNALING_PORT),
            ping_interval: Duration::from_secs(DEFAULT_PING_INTERVAL_SECS),
            pong_timeout: Duration::from_secs(DEFAULT_PONG_TIMEOUT_SECS),
            max_room_id_len: DEFAULT_MAX_ROOM_ID_LEN,
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
        }
    }
}

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Signaling server command line arguments
#[derive(Parser, Debug)]
#[command(name = "medfly-signaling")]
#[command(version, about = "WebRTC signaling relay for broadcaster/viewer rooms", long_about = None)]
pub struct Cli {
    /// Listen address (IPv4 or IPv6)
    #[arg(short = 'a', long, env = "SIGNALING_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Listen port
    #[arg(short = 'p', long, env = "SIGNALING_PORT", default_value_t = DEFAULT_SIGNALING_PORT)]
    pub port: u16,

    /// JSON file with ICE servers (array, or {"iceServers": [...]})
    #[arg(long = "ice-servers", env = "ICE_SERVERS_FILE", value_name = "FILE")]
    pub ice_servers_file: Option<PathBuf>,

    /// Inline ICE server JSON, used when no file is given
    #[arg(long = "ice-servers-json", env = "ICE_SERVERS", value_name = "JSON")]
    pub ice_servers_json: Option<String>,

    /// Seconds between keepalive pings
    #[arg(long, default_value_t = DEFAULT_PING_INTERVAL_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    pub ping_interval_secs: u64,

    /// Seconds to wait for a pong before dropping the connection
    #[arg(long, default_value_t = DEFAULT_PONG_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    pub pong_timeout_secs: u64,

    /// Longest accepted room name in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_ROOM_ID_LEN)]
    pub max_room_id_len: usize,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    pub log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn into_config(self) -> Result<SignalingConfig, ConfigError> {
        let ice_servers =
            load_ice_servers(self.ice_servers_file.as_deref(), self.ice_servers_json.as_deref())?;

        Ok(SignalingConfig {
            bind_addr: self.bind_addr(),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_timeout: Duration::from_secs(self.pong_timeout_secs),
            max_room_id_len: self.max_room_id_len,
            ice_servers,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IceServerList {
    Bare(Vec<IceServer>),
    Wrapped {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<IceServer>,
    },
}

fn parse_ice_servers(json: &str) -> Result<Vec<IceServer>, ConfigError> {
    Ok(match serde_json::from_str(json)? {
        IceServerList::Bare(list) => list,
        IceServerList::Wrapped { ice_servers } => ice_servers,
    })
}

/// File wins over inline JSON; with neither, the public STUN server is used.
pub fn load_ice_servers(
    file: Option<&Path>,
    inline: Option<&str>,
) -> Result<Vec<IceServer>, ConfigError> {
    if let Some(path) = file {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        return parse_ice_servers(&json);
    }

    match inline {
        Some(json) => parse_ice_servers(json),
        None => Ok(vec![IceServer::stun(DEFAULT_STUN_URL)]),
    }
}

pub fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "medfly_signaling=error,tungstenite=error",
        LogLevel::Warn => "medfly_signaling=warn,tungstenite=warn",
        LogLevel::Info => "medfly_signaling=info,tungstenite=warn",
        LogLevel::Debug => "medfly_signaling=debug,tungstenite=info",
        LogLevel::Trace => "medfly_signaling=trace,tungstenite=debug",
    };

    // RUST_LOG takes priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}
