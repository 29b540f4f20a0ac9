//! ascii-chat - main entry point
//!
//! One binary, three roles: `server`, `client`, `discovery-service`.

mod args;

use args::{Args, Command};
use ascii_chat_core::client::source::{TestPatternSource, ToneSource};
use ascii_chat_core::client::{spawn, ClientCommand, ClientConfig, ClientEvent, Target};
use ascii_chat_core::config::Options;
use ascii_chat_core::crypto::{Identity, TrustStore};
use ascii_chat_core::discovery::client::{fetch_external_ip, parse_key_base64};
use ascii_chat_core::discovery::service::{DiscoveryConfig, DiscoveryState, TurnConfig};
use ascii_chat_core::discovery::{words, DiscoveryClient, EndpointInfo};
use ascii_chat_core::media::VIDEO_CODEC_NAME;
use ascii_chat_core::protocol::control::StreamCapabilities;
use ascii_chat_core::server::{session, ServerContext};
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use log::{error, info, warn};
use std::io::Write;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_CONFIG: i32 = 1;
const EXIT_AUTH: i32 = 2;
const EXIT_NETWORK: i32 = 3;
const EXIT_INTERNAL: i32 = 4;

const IP_PROBE_URL: &str = "https://api.ipify.org";

fn init_logging(verbose: bool) {
    let level = std::env::var("ASCII_CHAT_LOG_LEVEL")
        .unwrap_or_else(|_| if verbose { "debug".into() } else { "info".into() });
    env_logger::Builder::new()
        .parse_filters(&level)
        .format_timestamp_millis()
        .init();
}

/// Default location for persisted keys when none is given.
fn state_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ascii-chat")
}

fn load_identity(path: Option<PathBuf>, default_name: &str) -> Result<Identity, i32> {
    let path = path.unwrap_or_else(|| state_dir().join(default_name));
    Identity::load_or_generate(&path).map_err(|err| {
        error!("cannot load identity key {}: {}", path.display(), err);
        EXIT_CONFIG
    })
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    let options = match args.load_options() {
        Ok(options) => options,
        Err(err) => {
            error!("bad options file: {}", err);
            std::process::exit(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("runtime init failed: {}", err);
            std::process::exit(EXIT_INTERNAL);
        }
    };

    let code = match args.command {
        Command::Server {
            bind,
            port,
            ws_port,
            metrics_port,
            discovery_service,
            discovery_expose_ip,
            password,
            identity,
        } => runtime.block_on(run_server(
            options,
            bind,
            port,
            ws_port,
            metrics_port,
            discovery_service,
            discovery_expose_ip,
            password,
            identity,
        )),
        Command::Client { target, password, snapshot, discovery_service, name, identity } => {
            runtime.block_on(run_client(
                options,
                target,
                password,
                snapshot,
                discovery_service,
                name,
                identity,
            ))
        }
        Command::DiscoveryService { bind, port, stun, turn_url, turn_secret } => {
            runtime.block_on(run_discovery(options, bind, port, stun, turn_url, turn_secret))
        }
    };
    std::process::exit(code);
}

#[allow(clippy::too_many_arguments)]
async fn run_server(
    options: Options,
    bind: Vec<IpAddr>,
    port: u16,
    ws_port: Option<u16>,
    metrics_port: Option<u16>,
    discovery_service: Option<String>,
    discovery_expose_ip: bool,
    password: Option<String>,
    identity_path: Option<PathBuf>,
) -> i32 {
    let identity = match load_identity(identity_path, "identity.key") {
        Ok(identity) => identity,
        Err(code) => return code,
    };
    info!("host identity {}", identity.fingerprint());

    let trust = match TrustStore::open_default() {
        Ok(trust) => trust,
        Err(err) => {
            error!("cannot open trust store: {}", err);
            return EXIT_CONFIG;
        }
    };

    let expose_ip = discovery_expose_ip || options.flags.discovery_expose_ip;
    let ctx = ServerContext::new(options, identity, trust, password);

    for addr in &bind {
        let tcp_addr = SocketAddr::new(*addr, port);
        let listener = match tokio::net::TcpListener::bind(tcp_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("cannot bind {}: {}", tcp_addr, err);
                return EXIT_NETWORK;
            }
        };
        tokio::spawn(session::run_tcp_listener(ctx.clone(), listener));

        if let Some(ws_port) = ws_port {
            let ws_addr = SocketAddr::new(*addr, ws_port);
            let listener = match tokio::net::TcpListener::bind(ws_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("cannot bind {}: {}", ws_addr, err);
                    return EXIT_NETWORK;
                }
            };
            tokio::spawn(session::run_ws_listener(ctx.clone(), listener));
        }

        if let Some(metrics_port) = metrics_port {
            let metrics_addr = SocketAddr::new(*addr, metrics_port);
            let listener = match tokio::net::TcpListener::bind(metrics_addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!("cannot bind {}: {}", metrics_addr, err);
                    return EXIT_NETWORK;
                }
            };
            tokio::spawn(session::run_metrics_listener(ctx.clone(), listener));
        }
    }

    if let Some(discovery_url) = discovery_service {
        let mut endpoints = Vec::new();
        if expose_ip {
            let probed = tokio::task::spawn_blocking(|| {
                fetch_external_ip(IP_PROBE_URL, Duration::from_secs(3))
            })
            .await
            .ok()
            .flatten();
            match probed {
                Some(ip) => endpoints.push(EndpointInfo {
                    kind: "tcp".into(),
                    addr: format!("{}:{}", ip, port),
                }),
                None => warn!("external IP probe failed; registering bind addresses only"),
            }
        }
        for addr in &bind {
            if !addr.is_unspecified() {
                endpoints.push(EndpointInfo { kind: "tcp".into(), addr: format!("{}:{}", addr, port) });
                if let Some(ws_port) = ws_port {
                    endpoints.push(EndpointInfo {
                        kind: "ws".into(),
                        addr: format!("ws://{}:{}", addr, ws_port),
                    });
                }
            }
        }

        match session::register_with_discovery(ctx.clone(), discovery_url.clone(), endpoints).await
        {
            Some(session_string) => {
                println!("session string: {}", session_string);
                #[cfg(feature = "webrtc-transport")]
                {
                    let ice = vec![ascii_chat_core::transport::webrtc::IceServer {
                        urls: vec!["stun:stun.l.google.com:19302".to_string()],
                        username: None,
                        credential: None,
                    }];
                    tokio::spawn(session::run_webrtc_responder(
                        ctx.clone(),
                        discovery_url,
                        session_string,
                        ice,
                    ));
                }
            }
            None => warn!("continuing without discovery registration"),
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        error!("signal handler failed");
        return EXIT_INTERNAL;
    }
    info!("shutting down");
    session::shutdown(&ctx).await;
    0
}

/// Load (or bootstrap and pin) the discovery service key.
fn discovery_service_key(discovery_url: &str) -> Option<VerifyingKey> {
    let pin_path = state_dir().join("acds.key");
    if let Ok(pinned) = std::fs::read_to_string(&pin_path) {
        match parse_key_base64(pinned.trim()) {
            Ok(key) => return Some(key),
            Err(err) => warn!("ignoring corrupt discovery pin: {}", err),
        }
    }
    match DiscoveryClient::fetch_service_key(discovery_url, Duration::from_secs(5)) {
        Ok(key) => {
            use base64::Engine;
            let encoded = base64::engine::general_purpose::STANDARD.encode(key.as_bytes());
            if let Some(dir) = pin_path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(err) = std::fs::write(&pin_path, encoded) {
                warn!("could not persist discovery pin: {}", err);
            }
            Some(key)
        }
        Err(err) => {
            warn!("discovery key bootstrap failed ({}); lookups will be unverified", err);
            None
        }
    }
}

async fn run_client(
    options: Options,
    target: String,
    password: Option<String>,
    snapshot: bool,
    discovery_service: String,
    name: Option<String>,
    identity_path: Option<PathBuf>,
) -> i32 {
    let identity = match load_identity(identity_path, "identity.key") {
        Ok(identity) => identity,
        Err(code) => return code,
    };

    let trust = match TrustStore::open_default() {
        Ok(trust) => trust,
        Err(err) => {
            error!("cannot open trust store: {}", err);
            return EXIT_CONFIG;
        }
    };

    let (parsed_target, discovery_key) = if let Ok(addr) = target.parse::<SocketAddr>() {
        (Target::Tcp(addr), None)
    } else if target.starts_with("ws://") || target.starts_with("wss://") {
        (Target::WebSocket(target.clone()), None)
    } else if let Ok(Some(addr)) = {
        use std::net::ToSocketAddrs;
        target.as_str().to_socket_addrs().map(|mut addrs| addrs.next())
    } {
        (Target::Tcp(addr), None)
    } else if let Some(session_string) = words::canonicalize(&target) {
        let key = tokio::task::spawn_blocking({
            let url = discovery_service.clone();
            move || discovery_service_key(&url)
        })
        .await
        .ok()
        .flatten();
        (
            Target::SessionString { session_string, discovery_url: discovery_service.clone() },
            key,
        )
    } else {
        error!("target must be host:port, a ws:// URL, or a three-word session string");
        return EXIT_CONFIG;
    };

    let capabilities = StreamCapabilities {
        codec: VIDEO_CODEC_NAME.to_string(),
        color: "truecolor".to_string(),
        audio: true,
        cols: 80,
        rows: 24,
        name: name.unwrap_or_else(|| "anonymous".to_string()),
    };

    let trust_policy = options.flags.trust_policy;
    let sample_rate = options.rates.audio_sample_rate;
    let window = options.rates.audio_window;
    let config = ClientConfig {
        identity,
        password,
        trust: Arc::new(trust),
        trust_policy,
        capabilities,
        options,
        discovery_key,
    };

    let mut handle = spawn(
        parsed_target,
        config,
        Some(Box::new(TestPatternSource::new(64, 48))),
        Some(Box::new(ToneSource::new(sample_rate, window))),
    );

    let mut stdout = std::io::stdout();
    loop {
        match handle.next_event().await {
            Some(ClientEvent::State(state)) => info!("client state: {:?}", state),
            Some(ClientEvent::Accepted { client_id }) => info!("joined as client {}", client_id),
            Some(ClientEvent::Frame(frame)) => {
                // Rendering proper (raw mode, cursor control, input) lives
                // in the terminal front-end; this just puts frames on
                // stdout.
                let _ = stdout.write_all(b"\x1b[H\x1b[2J");
                let _ = stdout.write_all(&frame.data);
                let _ = stdout.flush();
                if snapshot {
                    handle.command(ClientCommand::Quit);
                    return 0;
                }
            }
            Some(ClientEvent::Audio(_)) => {}
            Some(ClientEvent::Rejected(reason)) => {
                error!("server rejected session: {:?}", reason);
                return EXIT_AUTH;
            }
            Some(ClientEvent::Fatal(message)) => {
                error!("{}", message);
                return if message.contains("IDENTITY") || message.contains("identity") {
                    EXIT_AUTH
                } else {
                    EXIT_NETWORK
                };
            }
            None => return 0,
        }
    }
}

async fn run_discovery(
    options: Options,
    bind: Vec<IpAddr>,
    port: u16,
    stun: Vec<String>,
    turn_url: Vec<String>,
    turn_secret: Option<String>,
) -> i32 {
    let identity = match load_identity(None, "acds-identity.key") {
        Ok(identity) => identity,
        Err(code) => return code,
    };

    let mut config = DiscoveryConfig {
        session_ttl: options.timeouts.session_ttl(),
        ..Default::default()
    };
    if !stun.is_empty() {
        config.stun_servers = stun;
    }
    if let Some(secret) = turn_secret {
        if turn_url.is_empty() {
            error!("--turn-secret requires at least one --turn-url");
            return EXIT_CONFIG;
        }
        config.turn = Some(TurnConfig {
            urls: turn_url,
            shared_secret: secret,
            credential_ttl: Duration::from_secs(86_400),
        });
    }

    let state = DiscoveryState::new(config, identity);
    info!("service key: {}", state.service_pubkey_base64());

    let mut servers = Vec::new();
    for addr in bind {
        let bind_addr = SocketAddr::new(addr, port);
        let listener = match tokio::net::TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!("cannot bind {}: {}", bind_addr, err);
                return EXIT_NETWORK;
            }
        };
        servers.push(tokio::spawn(ascii_chat_core::discovery::service::run(
            state.clone(),
            listener,
        )));
    }

    if tokio::signal::ctrl_c().await.is_err() {
        return EXIT_INTERNAL;
    }
    for server in servers {
        server.abort();
    }
    0
}
