//! Discovery client.
//!
//! Small blocking HTTP client (ureq) used by servers to register and
//! keep-alive, and by clients to resolve session strings and relay
//! WebRTC signaling. Async callers wrap calls in `spawn_blocking`.
//! Lookup responses are verified against the pinned service key.

use super::{
    DiscoveryError, LookupResponse, RefreshRequest, RegisterRequest, RegisterResponse,
    RelayItem, RelayRequest, SessionInfo,
};
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use log::warn;
use serde::Deserialize;
use std::time::Duration;

/// Well-known path serving the service's Ed25519 public key. Fetched
/// once over HTTPS at first run and pinned.
pub const SERVICE_KEY_PATH: &str = "/v1/key";

pub struct DiscoveryClient {
    base_url: String,
    agent: ureq::Agent,
    /// Pinned service key; lookups are rejected without a valid
    /// signature when set.
    service_key: Option<VerifyingKey>,
}

impl DiscoveryClient {
    pub fn new(base_url: &str, timeout: Duration, service_key: Option<VerifyingKey>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout(timeout)
            .build();
        DiscoveryClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
            service_key,
        }
    }

    /// One-shot bootstrap: fetch and parse the service key. The caller
    /// persists the pin.
    pub fn fetch_service_key(
        base_url: &str,
        timeout: Duration,
    ) -> Result<VerifyingKey, DiscoveryError> {
        #[derive(Deserialize)]
        struct KeyResponse {
            pubkey: String,
        }
        let url = format!("{}{}", base_url.trim_end_matches('/'), SERVICE_KEY_PATH);
        let response = ureq::get(&url)
            .timeout(timeout)
            .call()
            .map_err(|err| DiscoveryError::Unreachable(err.to_string()))?;
        let parsed: KeyResponse = response
            .into_json()
            .map_err(|err| DiscoveryError::Malformed(err.to_string()))?;
        parse_key_base64(&parsed.pubkey)
    }

    pub fn register(&self, request: &RegisterRequest) -> Result<RegisterResponse, DiscoveryError> {
        let url = format!("{}/v1/sessions", self.base_url);
        let response = self
            .agent
            .post(&url)
            .send_json(request)
            .map_err(map_ureq_error)?;
        response
            .into_json()
            .map_err(|err| DiscoveryError::Malformed(err.to_string()))
    }

    /// Resolve a session string, verifying the response signature.
    pub fn lookup(&self, session_string: &str) -> Result<SessionInfo, DiscoveryError> {
        let url = format!("{}/v1/sessions/{}", self.base_url, session_string);
        let response = self.agent.get(&url).call().map_err(map_ureq_error)?;
        let parsed: LookupResponse = response
            .into_json()
            .map_err(|err| DiscoveryError::Malformed(err.to_string()))?;

        if let Some(ref key) = self.service_key {
            let body = serde_json::to_vec(&parsed.session)
                .map_err(|err| DiscoveryError::Malformed(err.to_string()))?;
            let raw = base64::engine::general_purpose::STANDARD
                .decode(&parsed.signature)
                .map_err(|_| DiscoveryError::BadSignature)?;
            let raw: [u8; 64] = raw.try_into().map_err(|_| DiscoveryError::BadSignature)?;
            let signature = Signature::from_bytes(&raw);
            if key.verify(&body, &signature).is_err() {
                return Err(DiscoveryError::BadSignature);
            }
        } else {
            warn!("no pinned discovery key; accepting unverified lookup response");
        }
        Ok(parsed.session)
    }

    pub fn refresh(&self, session_string: &str, host_pubkey: &str) -> Result<(), DiscoveryError> {
        let url = format!("{}/v1/sessions/{}/refresh", self.base_url, session_string);
        self.agent
            .post(&url)
            .send_json(&RefreshRequest { host_pubkey: host_pubkey.to_string() })
            .map(|_| ())
            .map_err(map_ureq_error)
    }

    pub fn unregister(&self, session_string: &str, host_pubkey: &str) -> Result<(), DiscoveryError> {
        let url = format!("{}/v1/sessions/{}", self.base_url, session_string);
        self.agent
            .delete(&url)
            .send_json(&RefreshRequest { host_pubkey: host_pubkey.to_string() })
            .map(|_| ())
            .map_err(map_ureq_error)
    }

    pub fn relay_send(
        &self,
        session_string: &str,
        request: &RelayRequest,
    ) -> Result<(), DiscoveryError> {
        let url = format!("{}/v1/sessions/{}/relay", self.base_url, session_string);
        self.agent
            .post(&url)
            .send_json(request)
            .map(|_| ())
            .map_err(map_ureq_error)
    }

    pub fn relay_poll(
        &self,
        session_string: &str,
        to: &str,
    ) -> Result<Vec<RelayItem>, DiscoveryError> {
        #[derive(Deserialize)]
        struct PollResponse {
            items: Vec<RelayItem>,
        }
        let url = format!("{}/v1/sessions/{}/relay/{}", self.base_url, session_string, to);
        let response = self.agent.get(&url).call().map_err(map_ureq_error)?;
        let parsed: PollResponse = response
            .into_json()
            .map_err(|err| DiscoveryError::Malformed(err.to_string()))?;
        Ok(parsed.items)
    }
}

/// Probe the public IP through a plain "what is my IP" endpoint, for
/// servers registering behind NAT with `--discovery-expose-ip`.
pub fn fetch_external_ip(url: &str, timeout: Duration) -> Option<String> {
    let response = ureq::get(url).timeout(timeout).call().ok()?;
    let body = response.into_string().ok()?;
    let ip = body.trim();
    if ip.is_empty() {
        None
    } else {
        Some(ip.to_string())
    }
}

pub fn parse_key_base64(encoded: &str) -> Result<VerifyingKey, DiscoveryError> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|_| DiscoveryError::Malformed("bad key encoding".into()))?;
    let raw: [u8; 32] = raw
        .try_into()
        .map_err(|_| DiscoveryError::Malformed("bad key length".into()))?;
    VerifyingKey::from_bytes(&raw).map_err(|_| DiscoveryError::Malformed("bad key bytes".into()))
}

fn map_ureq_error(err: ureq::Error) -> DiscoveryError {
    match err {
        ureq::Error::Status(404, _) => DiscoveryError::SessionNotFound,
        ureq::Error::Status(410, _) => DiscoveryError::SessionExpired,
        ureq::Error::Status(429, _) => DiscoveryError::RateLimited,
        ureq::Error::Status(code, _) => {
            DiscoveryError::Malformed(format!("unexpected status {}", code))
        }
        ureq::Error::Transport(transport) => DiscoveryError::Unreachable(transport.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::service::{run, DiscoveryConfig, DiscoveryState};
    use crate::discovery::EndpointInfo;
    use crate::crypto::Identity;
    use std::sync::Arc;

    async fn spawn_service() -> (String, Arc<DiscoveryState>) {
        let state = DiscoveryState::new(DiscoveryConfig::default(), Identity::generate());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_state = state.clone();
        tokio::spawn(async move {
            let _ = run(server_state, listener).await;
        });
        (format!("http://{}", addr), state)
    }

    fn test_request() -> RegisterRequest {
        RegisterRequest {
            host_pubkey: base64::engine::general_purpose::STANDARD.encode([1u8; 32]),
            endpoints: vec![EndpointInfo { kind: "tcp".into(), addr: "192.0.2.1:9000".into() }],
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn register_lookup_round_trip_with_signature() {
        let (base_url, state) = spawn_service().await;
        let service_key = parse_key_base64(&state.service_pubkey_base64()).unwrap();

        let session = tokio::task::spawn_blocking(move || {
            let client =
                DiscoveryClient::new(&base_url, Duration::from_secs(5), Some(service_key));
            let registered = client.register(&test_request()).expect("register");
            let info = client.lookup(&registered.session_string).expect("lookup");
            (registered, info)
        })
        .await
        .unwrap();

        assert_eq!(session.1.session_string, session.0.session_string);
        assert_eq!(session.1.endpoints[0].addr, "192.0.2.1:9000");
        assert!(!session.1.stun_servers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lookup_unknown_session_is_not_found() {
        let (base_url, _state) = spawn_service().await;
        let err = tokio::task::spawn_blocking(move || {
            let client = DiscoveryClient::new(&base_url, Duration::from_secs(5), None);
            client.lookup("quiet-maple-heron").unwrap_err()
        })
        .await
        .unwrap();
        assert_eq!(err, DiscoveryError::SessionNotFound);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lookup_is_case_insensitive() {
        let (base_url, _state) = spawn_service().await;
        let found = tokio::task::spawn_blocking(move || {
            let client = DiscoveryClient::new(&base_url, Duration::from_secs(5), None);
            let registered = client.register(&test_request()).expect("register");
            client
                .lookup(&registered.session_string.to_ascii_uppercase())
                .expect("lookup")
        })
        .await
        .unwrap();
        assert_eq!(found.endpoints.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_items_delivered_once() {
        let (base_url, _state) = spawn_service().await;
        let (first, second) = tokio::task::spawn_blocking(move || {
            let client = DiscoveryClient::new(&base_url, Duration::from_secs(5), None);
            let registered = client.register(&test_request()).expect("register");
            client
                .relay_send(
                    &registered.session_string,
                    &RelayRequest {
                        from: "client-1".into(),
                        to: "server".into(),
                        kind: "sdp".into(),
                        body: "v=0...".into(),
                    },
                )
                .expect("relay send");
            let first = client.relay_poll(&registered.session_string, "server").expect("poll");
            let second = client.relay_poll(&registered.session_string, "server").expect("poll");
            (first, second)
        })
        .await
        .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].kind, "sdp");
        assert!(second.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refresh_requires_matching_key() {
        let (base_url, _state) = spawn_service().await;
        let (ok, err) = tokio::task::spawn_blocking(move || {
            let client = DiscoveryClient::new(&base_url, Duration::from_secs(5), None);
            let request = test_request();
            let registered = client.register(&request).expect("register");
            let ok = client.refresh(&registered.session_string, &request.host_pubkey);
            let err = client.refresh(&registered.session_string, "c29tZW90aGVya2V5");
            (ok, err)
        })
        .await
        .unwrap();
        assert!(ok.is_ok());
        assert!(err.is_err());
    }
}
