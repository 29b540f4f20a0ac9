//! Prometheus counters for the server and discovery service.
//!
//! Each `ServerContext` owns its own registry, so tests never share
//! metric state.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub packets_in: IntCounter,
    pub packets_out: IntCounter,
    pub frames_mixed: IntCounter,
    pub ticks_skipped: IntCounter,
    pub frames_dropped: IntCounter,
    pub evictions: IntCounterVec,
    pub clients_connected: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let packets_in =
            IntCounter::new("ascii_chat_packets_in_total", "Packets received").unwrap();
        let packets_out =
            IntCounter::new("ascii_chat_packets_out_total", "Packets sent").unwrap();
        let frames_mixed =
            IntCounter::new("ascii_chat_frames_mixed_total", "Mixer frames produced").unwrap();
        let ticks_skipped = IntCounter::new(
            "ascii_chat_ticks_skipped_total",
            "Mixer ticks skipped under backpressure or failure",
        )
        .unwrap();
        let frames_dropped = IntCounter::new(
            "ascii_chat_frames_dropped_total",
            "Outbound frames dropped by local queue backpressure",
        )
        .unwrap();
        let evictions = IntCounterVec::new(
            Opts::new("ascii_chat_evictions_total", "Clients evicted, by reason"),
            &["reason"],
        )
        .unwrap();
        let clients_connected =
            IntGauge::new("ascii_chat_clients_connected", "Currently connected clients").unwrap();

        for collector in [
            Box::new(packets_in.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(packets_out.clone()),
            Box::new(frames_mixed.clone()),
            Box::new(ticks_skipped.clone()),
            Box::new(frames_dropped.clone()),
            Box::new(evictions.clone()),
            Box::new(clients_connected.clone()),
        ] {
            registry.register(collector).unwrap();
        }

        Metrics {
            registry,
            packets_in,
            packets_out,
            frames_mixed,
            ticks_skipped,
            frames_dropped,
            evictions,
            clients_connected,
        }
    }

    /// Text exposition for the debug endpoint.
    pub fn gather_text(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        let metrics = Metrics::new();
        metrics.packets_in.inc_by(3);
        metrics.evictions.with_label_values(&["slow_consumer"]).inc();
        let text = metrics.gather_text();
        assert!(text.contains("ascii_chat_packets_in_total 3"));
        assert!(text.contains(r#"ascii_chat_evictions_total{reason="slow_consumer"} 1"#));
    }

    #[test]
    fn independent_registries() {
        let a = Metrics::new();
        let b = Metrics::new();
        a.packets_in.inc();
        assert!(b.gather_text().contains("ascii_chat_packets_in_total 0"));
    }
}
