use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ascii-chat")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Terminal video conferencing", long_about = None)]
pub struct Args {
    /// Options file (TOML); missing fields take defaults
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Verbose logging (same as ASCII_CHAT_LOG_LEVEL=debug)
    #[arg(short, long, action)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a conference server
    Server {
        /// Addresses to bind
        #[arg(required = true)]
        bind: Vec<IpAddr>,

        /// TCP port
        #[arg(long, default_value = "9100")]
        port: u16,

        /// Also accept WebSocket connections on this port
        #[arg(long)]
        ws_port: Option<u16>,

        /// Expose prometheus metrics on this port
        #[arg(long)]
        metrics_port: Option<u16>,

        /// Register with this discovery service URL
        #[arg(long)]
        discovery_service: Option<String>,

        /// Probe and advertise the public IP when registering
        #[arg(long, action)]
        discovery_expose_ip: bool,

        /// Require a session password
        #[arg(long)]
        password: Option<String>,

        /// Identity key file (generated on first run)
        #[arg(long)]
        identity: Option<PathBuf>,
    },

    /// Join a conference
    Client {
        /// host:port, ws:// URL, or a three-word session string
        target: String,

        /// Session password
        #[arg(long)]
        password: Option<String>,

        /// Print the first received frame and exit
        #[arg(long, action)]
        snapshot: bool,

        /// Discovery service used to resolve session strings
        #[arg(long, default_value = "https://acds.ascii-chat.dev")]
        discovery_service: String,

        /// Display name shown to other participants
        #[arg(long)]
        name: Option<String>,

        /// Identity key file (generated on first run)
        #[arg(long)]
        identity: Option<PathBuf>,
    },

    /// Run the discovery service (ACDS)
    DiscoveryService {
        /// Addresses to bind
        #[arg(required = true)]
        bind: Vec<IpAddr>,

        /// HTTP port
        #[arg(long, default_value = "9120")]
        port: u16,

        /// STUN server URLs handed to clients
        #[arg(long)]
        stun: Vec<String>,

        /// TURN server URLs (with --turn-secret)
        #[arg(long)]
        turn_url: Vec<String>,

        /// TURN REST shared secret
        #[arg(long)]
        turn_secret: Option<String>,
    },
}

impl Args {
    pub fn load_options(
        &self,
    ) -> Result<ascii_chat_core::Options, Box<dyn std::error::Error>> {
        match &self.config {
            Some(path) => ascii_chat_core::Options::load(path),
            None => Ok(ascii_chat_core::Options::default()),
        }
    }
}
