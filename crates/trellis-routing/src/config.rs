//! # Protocol Timers
//!
//! Every time constant of the routing core in one deserializable struct.
//! Defaults match the protocol as deployed; tests shrink them to keep
//! virtual clocks readable.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Slack subtracted from update deadlines so a record rides along with
    /// a frame that is going out anyway (ms).
    pub include_anyway_ms: u64,
    /// Packets received from a neighbour before an acknowledging update is
    /// forced.
    pub ack_window: i32,
    /// How often a subscriber's link record is re-advertised (ms).
    pub subscriber_update_ms: u64,
    /// Ceiling on the send alarm when nothing is pending (ms).
    pub alarm_ceiling_ms: u64,
    /// Grace period after a receive before the send alarm fires, letting
    /// other queued inbound packets drain first (ms).
    pub drain_deadline_ms: u64,
    /// Cap on a single link-state payload (bytes).
    pub payload_cap: usize,
    /// A link is considered broken after this many silent interface ticks.
    pub link_timeout_ticks: u64,
    /// Sizing bound for the link-state tables.
    pub max_link_states: usize,
    /// Delay before re-advertising after a sequence gap reveals loss (ms).
    pub missed_seq_update_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            include_anyway_ms: 500,
            ack_window: 16,
            subscriber_update_ms: 5_000,
            alarm_ceiling_ms: 10_000,
            drain_deadline_ms: 10,
            payload_cap: 400,
            link_timeout_ticks: 5,
            max_link_states: 512,
            missed_seq_update_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = ProtocolConfig::default();
        assert_eq!(config.include_anyway_ms, 500);
        assert_eq!(config.ack_window, 16);
        assert_eq!(config.payload_cap, 400);
        assert_eq!(config.alarm_ceiling_ms, 10_000);
    }

    #[test]
    fn partial_toml_like_json_fills_defaults() {
        let config: ProtocolConfig =
            serde_json::from_str(r#"{"payload_cap": 200}"#).unwrap();
        assert_eq!(config.payload_cap, 200);
        assert_eq!(config.subscriber_update_ms, 5_000);
    }
}
