//! ACDS: the discovery service process.
//!
//! Axum REST surface over a sharded in-memory session registry. Sessions
//! are ephemeral: servers re-register on their keep-alive tick, so losing
//! the registry only widens a reconnect window.

use super::words;
use super::{
    EndpointInfo, LookupResponse, RefreshRequest, RegisterRequest, RegisterResponse, RelayItem,
    RelayRequest, SessionInfo, TurnCredential,
};
use crate::crypto::Identity;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::json;
use sha1::Sha1;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const SHARD_COUNT: usize = 16;

/// TURN server configuration; credentials are minted per lookup with the
/// shared-secret REST scheme.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub shared_secret: String,
    pub credential_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub session_ttl: Duration,
    pub stun_servers: Vec<String>,
    pub turn: Option<TurnConfig>,
    /// Token bucket refill per source IP, per minute, for register/relay.
    pub rate_limit_per_min: u32,
    /// Buffered relay items per session before senders get turned away.
    pub relay_buffer_cap: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            session_ttl: Duration::from_secs(3600),
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn: None,
            rate_limit_per_min: 30,
            relay_buffer_cap: 64,
        }
    }
}

struct SessionEntry {
    host_pubkey: String,
    endpoints: Vec<EndpointInfo>,
    expires_at: Instant,
    /// Per-recipient mailboxes, drained on poll (delivered once).
    mailboxes: HashMap<String, VecDeque<RelayItem>>,
    buffered_items: usize,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn allow(&mut self, per_minute: u32) -> bool {
        let burst = per_minute as f64;
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * per_minute as f64 / 60.0).min(burst);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct DiscoveryState {
    pub config: DiscoveryConfig,
    identity: Identity,
    shards: Vec<Mutex<HashMap<String, SessionEntry>>>,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

impl DiscoveryState {
    pub fn new(config: DiscoveryConfig, identity: Identity) -> Arc<Self> {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Arc::new(DiscoveryState { config, identity, shards, buckets: Mutex::new(HashMap::new()) })
    }

    pub fn service_pubkey_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD
            .encode(self.identity.verifying_key().as_bytes())
    }

    fn shard(&self, session: &str) -> &Mutex<HashMap<String, SessionEntry>> {
        let mut hasher = DefaultHasher::new();
        session.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    fn rate_limited(&self, ip: IpAddr) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(ip).or_insert_with(|| TokenBucket {
            tokens: self.config.rate_limit_per_min as f64,
            last_refill: Instant::now(),
        });
        !bucket.allow(self.config.rate_limit_per_min)
    }

    /// Register a server; picks an unused session string.
    fn register(&self, request: RegisterRequest) -> RegisterResponse {
        let mut rng = rand::thread_rng();
        loop {
            let session_string = words::generate(&mut rng);
            let mut shard = self.shard(&session_string).lock();
            if shard.contains_key(&session_string) {
                continue;
            }
            shard.insert(
                session_string.clone(),
                SessionEntry {
                    host_pubkey: request.host_pubkey.clone(),
                    endpoints: request.endpoints.clone(),
                    expires_at: Instant::now() + self.config.session_ttl,
                    mailboxes: HashMap::new(),
                    buffered_items: 0,
                },
            );
            info!("registered session {}", session_string);
            return RegisterResponse {
                session_string,
                expires_in_secs: self.config.session_ttl.as_secs(),
            };
        }
    }

    fn mint_turn_credential(&self) -> Option<TurnCredential> {
        let turn = self.config.turn.as_ref()?;
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() + turn.credential_ttl.as_secs())
            .unwrap_or(turn.credential_ttl.as_secs());
        let username = format!("{}:ascii-chat", expiry);
        let credential = hmac_sha1_base64(&turn.shared_secret, &username);
        Some(TurnCredential {
            urls: turn.urls.clone(),
            username,
            credential,
            ttl_secs: turn.credential_ttl.as_secs(),
        })
    }

    /// Drop every expired session. Runs on the sweeper tick.
    fn sweep(&self) {
        let now = Instant::now();
        for shard in &self.shards {
            shard.lock().retain(|session, entry| {
                let keep = entry.expires_at > now;
                if !keep {
                    debug!("session {} expired", session);
                }
                keep
            });
        }
    }
}

fn hmac_sha1_base64(secret: &str, message: &str) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| Hmac::<Sha1>::new_from_slice(&[]).unwrap());
    mac.update(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, code: &str) -> ApiError {
    (status, Json(json!({ "error": code })))
}

fn canonical(session: &str) -> Result<String, ApiError> {
    words::canonicalize(session)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "bad_session_string"))
}

async fn handle_register(
    State(state): State<Arc<DiscoveryState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if state.rate_limited(peer.ip()) {
        return Err(api_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited"));
    }
    Ok(Json(state.register(request)))
}

async fn handle_lookup(
    State(state): State<Arc<DiscoveryState>>,
    Path(session): Path<String>,
) -> Result<Json<LookupResponse>, ApiError> {
    let session = canonical(&session)?;
    let shard = state.shard(&session);
    let mut guard = shard.lock();
    let entry = guard
        .get(&session)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session_not_found"))?;
    if entry.expires_at <= Instant::now() {
        guard.remove(&session);
        return Err(api_error(StatusCode::GONE, "session_expired"));
    }

    let info = SessionInfo {
        session_string: session.clone(),
        endpoints: entry.endpoints.clone(),
        host_pubkey: entry.host_pubkey.clone(),
        stun_servers: state.config.stun_servers.clone(),
        turn_credential: state.mint_turn_credential(),
    };
    drop(guard);

    let body = serde_json::to_vec(&info)
        .map_err(|_| api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal"))?;
    let signature =
        base64::engine::general_purpose::STANDARD.encode(state.identity.sign(&body).to_bytes());
    Ok(Json(LookupResponse { session: info, signature }))
}

async fn handle_refresh(
    State(state): State<Arc<DiscoveryState>>,
    Path(session): Path<String>,
    Json(request): Json<RefreshRequest>,
) -> Result<StatusCode, ApiError> {
    let session = canonical(&session)?;
    let mut guard = state.shard(&session).lock();
    let entry = guard
        .get_mut(&session)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session_not_found"))?;
    if entry.host_pubkey != request.host_pubkey {
        return Err(api_error(StatusCode::FORBIDDEN, "wrong_host_key"));
    }
    entry.expires_at = Instant::now() + state.config.session_ttl;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_unregister(
    State(state): State<Arc<DiscoveryState>>,
    Path(session): Path<String>,
    Json(request): Json<RefreshRequest>,
) -> Result<StatusCode, ApiError> {
    let session = canonical(&session)?;
    let mut guard = state.shard(&session).lock();
    match guard.get(&session) {
        Some(entry) if entry.host_pubkey == request.host_pubkey => {
            guard.remove(&session);
            info!("unregistered session {}", session);
            Ok(StatusCode::NO_CONTENT)
        }
        Some(_) => Err(api_error(StatusCode::FORBIDDEN, "wrong_host_key")),
        None => Err(api_error(StatusCode::NOT_FOUND, "session_not_found")),
    }
}

async fn handle_relay_post(
    State(state): State<Arc<DiscoveryState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(session): Path<String>,
    Json(request): Json<RelayRequest>,
) -> Result<StatusCode, ApiError> {
    if state.rate_limited(peer.ip()) {
        return Err(api_error(StatusCode::TOO_MANY_REQUESTS, "rate_limited"));
    }
    if request.kind != "sdp" && request.kind != "ice" {
        return Err(api_error(StatusCode::BAD_REQUEST, "bad_relay_kind"));
    }
    let session = canonical(&session)?;
    let mut guard = state.shard(&session).lock();
    let entry = guard
        .get_mut(&session)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session_not_found"))?;
    if entry.buffered_items >= state.config.relay_buffer_cap {
        warn!("relay buffer full for session {}", session);
        return Err(api_error(StatusCode::TOO_MANY_REQUESTS, "relay_buffer_full"));
    }
    entry.buffered_items += 1;
    entry
        .mailboxes
        .entry(request.to)
        .or_default()
        .push_back(RelayItem { from: request.from, kind: request.kind, body: request.body });
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_relay_poll(
    State(state): State<Arc<DiscoveryState>>,
    Path((session, to)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = canonical(&session)?;
    let mut guard = state.shard(&session).lock();
    let entry = guard
        .get_mut(&session)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "session_not_found"))?;
    let items: Vec<RelayItem> = entry
        .mailboxes
        .get_mut(&to)
        .map(|mailbox| mailbox.drain(..).collect())
        .unwrap_or_default();
    entry.buffered_items -= items.len();
    Ok(Json(json!({ "items": items })))
}

async fn handle_service_key(
    State(state): State<Arc<DiscoveryState>>,
) -> Json<serde_json::Value> {
    Json(json!({ "pubkey": state.service_pubkey_base64() }))
}

pub fn router(state: Arc<DiscoveryState>) -> Router {
    Router::new()
        .route("/v1/key", get(handle_service_key))
        .route("/v1/sessions", post(handle_register))
        .route("/v1/sessions/{session}", get(handle_lookup).delete(handle_unregister))
        .route("/v1/sessions/{session}/refresh", post(handle_refresh))
        .route("/v1/sessions/{session}/relay", post(handle_relay_post))
        .route("/v1/sessions/{session}/relay/{to}", get(handle_relay_poll))
        .with_state(state)
}

/// Serve until the listener errors. Spawns the TTL sweeper alongside.
pub async fn run(
    state: Arc<DiscoveryState>,
    listener: tokio::net::TcpListener,
) -> std::io::Result<()> {
    let sweeper_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            sweeper_state.sweep();
        }
    });

    info!("discovery service listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with_ttl(ttl: Duration) -> Arc<DiscoveryState> {
        let config = DiscoveryConfig { session_ttl: ttl, ..Default::default() };
        DiscoveryState::new(config, Identity::generate())
    }

    fn register_one(state: &DiscoveryState) -> RegisterResponse {
        state.register(RegisterRequest {
            host_pubkey: "aGsa".into(),
            endpoints: vec![EndpointInfo { kind: "tcp".into(), addr: "127.0.0.1:9000".into() }],
        })
    }

    #[test]
    fn register_yields_canonical_session_string() {
        let state = state_with_ttl(Duration::from_secs(60));
        let response = register_one(&state);
        assert!(words::looks_like_session_string(&response.session_string));
    }

    #[test]
    fn sweep_removes_expired_sessions() {
        let state = state_with_ttl(Duration::from_millis(0));
        let response = register_one(&state);
        state.sweep();
        let shard = state.shard(&response.session_string);
        assert!(!shard.lock().contains_key(&response.session_string));
    }

    #[test]
    fn turn_credentials_use_shared_secret_scheme() {
        let config = DiscoveryConfig {
            turn: Some(TurnConfig {
                urls: vec!["turn:turn.example:3478?transport=udp".into()],
                shared_secret: "s3cret".into(),
                credential_ttl: Duration::from_secs(86400),
            }),
            ..Default::default()
        };
        let state = DiscoveryState::new(config, Identity::generate());
        let cred = state.mint_turn_credential().expect("credential");
        assert!(cred.username.ends_with(":ascii-chat"));
        assert_eq!(cred.credential, hmac_sha1_base64("s3cret", &cred.username));
    }

    #[test]
    fn token_bucket_limits_then_refills() {
        let mut bucket = TokenBucket { tokens: 2.0, last_refill: Instant::now() };
        assert!(bucket.allow(2));
        assert!(bucket.allow(2));
        assert!(!bucket.allow(2));
    }
}
