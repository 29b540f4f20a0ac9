//! Runtime options.
//!
//! Every tunable lives in one `Options` struct constructed at startup:
//! loadable from TOML, overridable from the CLI, defaulted in code. No
//! hidden globals in the hot path.

use crate::crypto::TrustPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Options {
    /// Media pacing
    #[serde(default)]
    pub rates: Rates,

    /// Deadlines and intervals
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Buffer budgets and limits
    #[serde(default)]
    pub sizes: Sizes,

    /// Feature flags
    #[serde(default)]
    pub flags: Flags,

    /// Video mixer appearance
    #[serde(default)]
    pub mixer: MixerOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rates {
    /// Upper bound on per-recipient video ticks per second
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Mixer output sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub audio_sample_rate: u32,

    /// Samples per audio window (20 ms at 48 kHz)
    #[serde(default = "default_audio_window")]
    pub audio_window: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_handshake_ms")]
    pub handshake_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    #[serde(default = "default_fragment_reassembly_ms")]
    pub fragment_reassembly_ms: u64,

    #[serde(default = "default_slow_consumer_grace_ms")]
    pub slow_consumer_grace_ms: u64,

    #[serde(default = "default_discovery_lookup_ms")]
    pub discovery_lookup_ms: u64,

    /// Discovery session registration lifetime
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,

    /// Cap on the client reconnect backoff
    #[serde(default = "default_reconnect_cap_ms")]
    pub reconnect_cap_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sizes {
    /// Payload bytes above which a message is fragmented
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Per-session outbound queue byte budget
    #[serde(default = "default_send_queue_budget")]
    pub send_queue_budget: usize,

    /// Backpressure asserted above this fraction of the budget (percent)
    #[serde(default = "default_high_water_pct")]
    pub high_water_pct: u8,

    /// Writable signalled again below this fraction (percent)
    #[serde(default = "default_low_water_pct")]
    pub low_water_pct: u8,

    /// Per-client reassembly buffer cap in bytes
    #[serde(default = "default_reassembly_cap")]
    pub reassembly_cap: usize,

    /// Windows retained in each client's audio ring
    #[serde(default = "default_audio_ring")]
    pub audio_ring: usize,

    /// Participants accepted before new connections are rejected
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Flags {
    /// Unknown-host handling when nobody can answer a prompt
    #[serde(default)]
    pub trust_policy: TrustPolicy,

    /// Advertise the externally-probed IP when registering with discovery
    #[serde(default)]
    pub discovery_expose_ip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixerOptions {
    /// Luminance palette, darkest to brightest
    #[serde(default = "default_palette")]
    pub palette: String,

    /// Terminal font cell height/width ratio used when sizing tiles
    #[serde(default = "default_cell_aspect")]
    pub cell_aspect: f32,
}

impl Timeouts {
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }
    pub fn fragment_reassembly(&self) -> Duration {
        Duration::from_millis(self.fragment_reassembly_ms)
    }
    pub fn slow_consumer_grace(&self) -> Duration {
        Duration::from_millis(self.slow_consumer_grace_ms)
    }
    pub fn discovery_lookup(&self) -> Duration {
        Duration::from_millis(self.discovery_lookup_ms)
    }
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.session_ttl_ms)
    }
    pub fn reconnect_cap(&self) -> Duration {
        Duration::from_millis(self.reconnect_cap_ms)
    }
}

impl Sizes {
    pub fn high_water(&self) -> usize {
        self.send_queue_budget * self.high_water_pct as usize / 100
    }
    pub fn low_water(&self) -> usize {
        self.send_queue_budget * self.low_water_pct as usize / 100
    }
}

impl Options {
    /// Load options from a TOML file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Options, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let options: Options = toml::from_str(&content)?;
        Ok(options)
    }
}

fn default_target_fps() -> u32 {
    30
}
fn default_sample_rate() -> u32 {
    48_000
}
fn default_audio_window() -> usize {
    960
}
fn default_handshake_ms() -> u64 {
    10_000
}
fn default_heartbeat_interval_ms() -> u64 {
    5_000
}
fn default_heartbeat_timeout_ms() -> u64 {
    15_000
}
fn default_fragment_reassembly_ms() -> u64 {
    5_000
}
fn default_slow_consumer_grace_ms() -> u64 {
    3_000
}
fn default_discovery_lookup_ms() -> u64 {
    5_000
}
fn default_session_ttl_ms() -> u64 {
    3_600_000
}
fn default_reconnect_cap_ms() -> u64 {
    4_000
}
fn default_mtu() -> usize {
    60_000
}
fn default_send_queue_budget() -> usize {
    8 * 1024 * 1024
}
fn default_high_water_pct() -> u8 {
    75
}
fn default_low_water_pct() -> u8 {
    50
}
fn default_reassembly_cap() -> usize {
    16 * 1024 * 1024
}
fn default_audio_ring() -> usize {
    4
}
fn default_max_clients() -> usize {
    64
}
fn default_palette() -> String {
    " .:-=+*#%@".to_string()
}
fn default_cell_aspect() -> f32 {
    2.0
}

impl Default for Rates {
    fn default() -> Self {
        Rates {
            target_fps: default_target_fps(),
            audio_sample_rate: default_sample_rate(),
            audio_window: default_audio_window(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            handshake_ms: default_handshake_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            fragment_reassembly_ms: default_fragment_reassembly_ms(),
            slow_consumer_grace_ms: default_slow_consumer_grace_ms(),
            discovery_lookup_ms: default_discovery_lookup_ms(),
            session_ttl_ms: default_session_ttl_ms(),
            reconnect_cap_ms: default_reconnect_cap_ms(),
        }
    }
}

impl Default for Sizes {
    fn default() -> Self {
        Sizes {
            mtu: default_mtu(),
            send_queue_budget: default_send_queue_budget(),
            high_water_pct: default_high_water_pct(),
            low_water_pct: default_low_water_pct(),
            reassembly_cap: default_reassembly_cap(),
            audio_ring: default_audio_ring(),
            max_clients: default_max_clients(),
        }
    }
}

impl Default for MixerOptions {
    fn default() -> Self {
        MixerOptions { palette: default_palette(), cell_aspect: default_cell_aspect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let options = Options::default();
        assert_eq!(options.timeouts.heartbeat_interval(), Duration::from_secs(5));
        assert_eq!(options.timeouts.heartbeat_timeout(), Duration::from_secs(15));
        assert_eq!(options.timeouts.fragment_reassembly(), Duration::from_secs(5));
        assert_eq!(options.rates.target_fps, 30);
        assert_eq!(options.sizes.high_water(), 6 * 1024 * 1024);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let options: Options = toml::from_str(
            r#"
            [rates]
            target_fps = 15

            [flags]
            trust_policy = "accept-once"
            "#,
        )
        .expect("parse");
        assert_eq!(options.rates.target_fps, 15);
        assert_eq!(options.flags.trust_policy, TrustPolicy::AcceptOnce);
        assert_eq!(options.timeouts.heartbeat_interval_ms, 5_000);
    }
}
