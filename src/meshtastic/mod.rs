//! Meshtastic packet decoding.
//!
//! Decoding is split into three layers:
//! - [`crypto`]: AES-CTR channel decryption (key stretching and nonce layout)
//! - [`classify`]: ordered structural parse attempts that decide what a payload is
//! - [`decoder`]: topic and envelope handling that turns one MQTT message into a
//!   [`DecodedPacket`] (or a node-count sample) ready to be persisted
//!
//! ```rust,no_run
//! use meshcollectd::meshtastic::decoder::{Decoded, MessageDecoder};
//! # fn demo(decoder: &MessageDecoder) -> anyhow::Result<()> {
//! let payload = br#"{"from":1,"to":0,"type":"text","payload":{"text":"hi"}}"#;
//! match decoder.decode("msh/EU/2/json/LongFast/!00000001", payload, 1_735_700_000)? {
//!     Decoded::Packet(p) => println!("{} from {}", p.kind, p.sender),
//!     Decoded::NodeCount(s) => println!("node count from {}", s.node_id),
//! }
//! # Ok(())
//! # }
//! ```

pub mod classify;
pub mod crypto;
pub mod decoder;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protobuf::meshtastic_generated as proto;

/// Semantic message type. The string form is what lands in the `type` column of events
/// and in the distilled per-type counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    NodeInfo,
    Position,
    Telemetry,
    Text,
    NeighborInfo,
    Traceroute,
    Routing,
    Unknown,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::NodeInfo => "nodeinfo",
            Kind::Position => "position",
            Kind::Telemetry => "telemetry",
            Kind::Text => "text",
            Kind::NeighborInfo => "neighborinfo",
            Kind::Traceroute => "traceroute",
            Kind::Routing => "routing",
            Kind::Unknown => "unknown",
        }
    }

    /// Map the `type` field of a JSON message. Accepts a few aliases seen from gateways
    /// (`neighbors`, `message`); anything unrecognised is `Unknown`.
    pub fn from_tag(tag: &str) -> Kind {
        match tag.trim().to_ascii_lowercase().as_str() {
            "nodeinfo" | "user" => Kind::NodeInfo,
            "position" => Kind::Position,
            "telemetry" => Kind::Telemetry,
            "text" | "message" => Kind::Text,
            "neighborinfo" | "neighbors" => Kind::NeighborInfo,
            "traceroute" => Kind::Traceroute,
            "routing" => Kind::Routing,
            _ => Kind::Unknown,
        }
    }

    /// Fixed port table. Ports without an entry (admin, store-forward, range test, ...)
    /// are recorded as `Unknown`.
    pub fn from_port(portnum: i32) -> Kind {
        match proto::PortNum::try_from(portnum) {
            Ok(proto::PortNum::NodeinfoApp) => Kind::NodeInfo,
            Ok(proto::PortNum::PositionApp) => Kind::Position,
            Ok(proto::PortNum::TextMessageApp) => Kind::Text,
            Ok(proto::PortNum::TelemetryApp) => Kind::Telemetry,
            Ok(proto::PortNum::RoutingApp) => Kind::Routing,
            Ok(proto::PortNum::TracerouteApp) => Kind::Traceroute,
            Ok(proto::PortNum::NeighborinfoApp) => Kind::NeighborInfo,
            _ => Kind::Unknown,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NodeIdentity {
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<u32>,
    pub role: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NeighborEntry {
    pub node_id: u32,
    pub snr: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NeighborReport {
    /// Node that produced the report when the payload names one; the packet sender otherwise.
    pub reporter: Option<u32>,
    pub neighbors: Vec<NeighborEntry>,
}

/// Kind-specific data extracted from a packet. `None` when the payload could not be
/// decrypted or did not carry anything usable for its kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum PayloadFields {
    #[default]
    None,
    Node(NodeIdentity),
    Position(PositionFix),
    Telemetry { summary: String },
    Text(String),
    /// Route entries that could not be resolved to a node id are kept as `None` so hop
    /// pairs touching them can be skipped without shifting the others.
    Traceroute(Vec<Option<u32>>),
    Neighbors(NeighborReport),
}

impl PayloadFields {
    /// Short one-line description for debug logs.
    pub fn summary(&self) -> String {
        match self {
            PayloadFields::None => "-".to_string(),
            PayloadFields::Node(n) => format!(
                "user {} ({})",
                n.long_name.as_deref().unwrap_or("?"),
                n.short_name.as_deref().unwrap_or("?")
            ),
            PayloadFields::Position(p) => {
                format!("position lat={:.5} lon={:.5}", p.latitude, p.longitude)
            }
            PayloadFields::Telemetry { summary } => summary.clone(),
            PayloadFields::Text(t) => format!("text {}", crate::logutil::truncate_for_log(t, 80)),
            PayloadFields::Traceroute(route) => format!("traceroute {} hops", route.len()),
            PayloadFields::Neighbors(r) => format!("neighbors {}", r.neighbors.len()),
        }
    }
}

/// Fully decoded and classified packet, ready to be split into store operations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedPacket {
    pub topic: String,
    pub sender: u32,
    pub receiver: Option<u32>,
    pub physical_sender: u32,
    pub timestamp: i64,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub kind: Kind,
    pub fields: PayloadFields,
    /// Raw payload hex, kept only for classification misses.
    pub raw_hex: Option<String>,
    /// Encrypted payload that could not be decrypted; the event is still recorded.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub decrypt_failed: bool,
}

/// `nodes_count` topic sample: how many nodes a gateway heard over three windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeCountSample {
    pub node_id: u32,
    pub timestamp: i64,
    pub count_30min: u64,
    pub count_60min: u64,
    pub count_120min: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_table() {
        assert_eq!(Kind::from_port(proto::PortNum::NodeinfoApp as i32), Kind::NodeInfo);
        assert_eq!(Kind::from_port(proto::PortNum::TracerouteApp as i32), Kind::Traceroute);
        assert_eq!(Kind::from_port(proto::PortNum::RoutingApp as i32), Kind::Routing);
        assert_eq!(Kind::from_port(proto::PortNum::AdminApp as i32), Kind::Unknown);
        assert_eq!(Kind::from_port(9999), Kind::Unknown);
    }

    #[test]
    fn tags_round_trip_through_as_str() {
        for kind in [
            Kind::NodeInfo,
            Kind::Position,
            Kind::Telemetry,
            Kind::Text,
            Kind::NeighborInfo,
            Kind::Traceroute,
            Kind::Routing,
            Kind::Unknown,
        ] {
            assert_eq!(Kind::from_tag(kind.as_str()), kind);
        }
        assert_eq!(Kind::from_tag("NEIGHBORS"), Kind::NeighborInfo);
        assert_eq!(Kind::from_tag("bogus"), Kind::Unknown);
    }
}
