//! Payload classification.
//!
//! A decrypted payload carries no type marker of its own, so the classifier tries a fixed,
//! ordered list of protobuf decodes (`Data`, `User`, `Position`, `Telemetry`) and takes the
//! first that parses. The check is deliberately liberal: prost accepts anything that is
//! well-formed wire data for the message, so the order matters. An envelope port number,
//! when one exists, overrides all of this.

use bytes::Bytes;
use prost::Message;

use super::{Kind, NeighborEntry, NeighborReport, NodeIdentity, PayloadFields, PositionFix};
use crate::protobuf::meshtastic_generated as proto;
use crate::validation::{parse_node_id, sanitize_name};

/// Result of one successful structural parse.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    Data(proto::Data),
    User(proto::User),
    Position(proto::Position),
    Telemetry(proto::Telemetry),
}

type Attempt = fn(Bytes) -> Result<ParsedPayload, prost::DecodeError>;

fn try_data(b: Bytes) -> Result<ParsedPayload, prost::DecodeError> {
    proto::Data::decode(b).map(ParsedPayload::Data)
}
fn try_user(b: Bytes) -> Result<ParsedPayload, prost::DecodeError> {
    proto::User::decode(b).map(ParsedPayload::User)
}
fn try_position(b: Bytes) -> Result<ParsedPayload, prost::DecodeError> {
    proto::Position::decode(b).map(ParsedPayload::Position)
}
fn try_telemetry(b: Bytes) -> Result<ParsedPayload, prost::DecodeError> {
    proto::Telemetry::decode(b).map(ParsedPayload::Telemetry)
}

// Order is priority: a payload that is valid as several messages takes the first.
const ATTEMPTS: [(&str, Attempt); 4] = [
    ("data", try_data),
    ("user", try_user),
    ("position", try_position),
    ("telemetry", try_telemetry),
];

#[derive(Debug, Clone)]
pub struct Classification {
    pub kind: Kind,
    pub parsed: Option<ParsedPayload>,
    /// Application payload: `Data.payload` when a `Data` wrapper was found, the input
    /// bytes otherwise.
    pub app_payload: Bytes,
    pub raw_hex: String,
    pub text: Option<String>,
}

/// Run the structural parse attempts in order; the first `Ok` wins.
pub fn parse_structural(bytes: &Bytes) -> Option<ParsedPayload> {
    for (name, attempt) in ATTEMPTS.iter() {
        match attempt(bytes.clone()) {
            Ok(parsed) => return Some(parsed),
            Err(e) => log::trace!("classify: {} parse failed: {}", name, e),
        }
    }
    None
}

/// Valid UTF-8, non-empty, and every char printable or whitespace.
pub fn printable_text(bytes: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(bytes).ok()?;
    if s.is_empty() || !s.chars().all(|c| !c.is_control() || c.is_whitespace()) {
        return None;
    }
    Some(s.to_string())
}

/// Classify a payload. `hint` is the envelope's `Data.portnum` when the packet arrived
/// decoded; it is authoritative and skips the structural cascade.
pub fn classify(bytes: Bytes, hint: Option<i32>) -> Classification {
    let raw_hex = hex::encode(&bytes);
    let text = printable_text(&bytes);

    if let Some(port) = hint {
        return Classification {
            kind: Kind::from_port(port),
            parsed: None,
            app_payload: bytes,
            raw_hex,
            text,
        };
    }

    let parsed = parse_structural(&bytes);
    let (kind, app_payload) = match &parsed {
        Some(ParsedPayload::Data(d)) => {
            let kind = Kind::from_port(d.portnum);
            if kind == Kind::Unknown && text.is_some() {
                (Kind::Text, bytes.clone())
            } else {
                (kind, d.payload.clone())
            }
        }
        Some(ParsedPayload::User(_)) => (Kind::NodeInfo, bytes.clone()),
        Some(ParsedPayload::Position(_)) => (Kind::Position, bytes.clone()),
        Some(ParsedPayload::Telemetry(_)) => (Kind::Telemetry, bytes.clone()),
        None if text.is_some() => (Kind::Text, bytes.clone()),
        None => (Kind::Unknown, bytes.clone()),
    };

    Classification {
        kind,
        parsed,
        app_payload,
        raw_hex,
        text,
    }
}

/// Extract the kind-specific fields from a classification.
pub fn payload_fields(c: &Classification) -> PayloadFields {
    let payload = &c.app_payload;
    match c.kind {
        Kind::NodeInfo => {
            let user = match &c.parsed {
                Some(ParsedPayload::User(u)) => Some(u.clone()),
                _ => proto::User::decode(payload.clone()).ok(),
            };
            user.map(|u| node_identity(&u))
                .filter(|n| n.long_name.is_some() || n.short_name.is_some())
                .map(PayloadFields::Node)
                .unwrap_or_default()
        }
        Kind::Position => {
            let pos = match &c.parsed {
                Some(ParsedPayload::Position(p)) => Some(p.clone()),
                _ => proto::Position::decode(payload.clone()).ok(),
            };
            pos.and_then(|p| position_fix(&p))
                .map(PayloadFields::Position)
                .unwrap_or_default()
        }
        Kind::Telemetry => {
            let telemetry = match &c.parsed {
                Some(ParsedPayload::Telemetry(t)) => Some(t.clone()),
                _ => proto::Telemetry::decode(payload.clone()).ok(),
            };
            telemetry
                .map(|t| PayloadFields::Telemetry {
                    summary: summarize_telemetry(&t),
                })
                .unwrap_or_default()
        }
        Kind::Text => printable_text(payload)
            .or_else(|| c.text.clone())
            .map(PayloadFields::Text)
            .unwrap_or_default(),
        Kind::Traceroute => {
            let route = traceroute_route(payload);
            if route.is_empty() {
                PayloadFields::None
            } else {
                PayloadFields::Traceroute(route)
            }
        }
        Kind::NeighborInfo => match proto::NeighborInfo::decode(payload.clone()) {
            Ok(info) => PayloadFields::Neighbors(NeighborReport {
                reporter: (info.node_id != 0).then_some(info.node_id),
                neighbors: info
                    .neighbors
                    .iter()
                    .filter(|n| n.node_id != 0)
                    .map(|n| NeighborEntry {
                        node_id: n.node_id,
                        snr: Some(n.snr),
                    })
                    .collect(),
            }),
            Err(_) => PayloadFields::None,
        },
        Kind::Routing | Kind::Unknown => PayloadFields::None,
    }
}

pub fn node_identity(u: &proto::User) -> NodeIdentity {
    NodeIdentity {
        long_name: sanitize_name(&u.long_name),
        short_name: sanitize_name(&u.short_name),
        hw_model: Some(u.hw_model),
        role: Some(u.role),
    }
}

/// Both coordinates are required; fixed-point `*_i` values are degrees * 1e7.
pub fn position_fix(p: &proto::Position) -> Option<PositionFix> {
    let lat = p.latitude_i? as f64 * 1e-7;
    let lon = p.longitude_i? as f64 * 1e-7;
    Some(PositionFix {
        latitude: lat,
        longitude: lon,
        altitude: p.altitude,
    })
}

/// Route node ids in order. RouteDiscovery first, then a comma/space separated text route,
/// then packed little-endian u32s.
pub fn traceroute_route(payload: &[u8]) -> Vec<Option<u32>> {
    if let Ok(rd) = proto::RouteDiscovery::decode(payload) {
        if !rd.route.is_empty() {
            return rd.route.into_iter().map(Some).collect();
        }
    }
    if let Some(text) = printable_text(payload) {
        let route: Vec<Option<u32>> = text
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| parse_node_id(t).ok())
            .collect();
        if !route.is_empty() {
            return route;
        }
    }
    if !payload.is_empty() && payload.len() % 4 == 0 {
        return payload
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .filter(|id| *id != 0)
            .map(Some)
            .collect();
    }
    Vec::new()
}

fn fmt_percent(val: f32) -> String {
    if !val.is_finite() {
        return "na".to_string();
    }
    if val <= 1.0 {
        format!("{:.0}%", val * 100.0)
    } else {
        format!("{:.0}%", val)
    }
}

pub fn summarize_telemetry(t: &proto::Telemetry) -> String {
    use proto::telemetry::Variant;
    let Some(variant) = &t.variant else {
        return "telemetry".to_string();
    };
    let (label, parts) = match variant {
        Variant::DeviceMetrics(dm) => {
            let mut parts = Vec::new();
            if let Some(batt) = dm.battery_level {
                parts.push(format!("batt={}%", batt));
            }
            if let Some(v) = dm.voltage {
                parts.push(format!("v={:.2}V", v));
            }
            if let Some(up) = dm.uptime_seconds {
                parts.push(format!("up={}s", up));
            }
            if let Some(util) = dm.channel_utilization {
                parts.push(format!("util={}", fmt_percent(util)));
            }
            if let Some(tx) = dm.air_util_tx {
                parts.push(format!("tx={}", fmt_percent(tx)));
            }
            ("device", parts)
        }
        Variant::EnvironmentMetrics(env) => {
            let mut parts = Vec::new();
            if let Some(t) = env.temperature {
                parts.push(format!("temp={:.1}C", t));
            }
            if let Some(h) = env.relative_humidity {
                parts.push(format!("hum={:.0}%", h));
            }
            if let Some(p) = env.barometric_pressure {
                parts.push(format!("press={:.0}hPa", p));
            }
            ("env", parts)
        }
        Variant::PowerMetrics(pm) => {
            let mut parts = Vec::new();
            if let Some(v) = pm.ch1_voltage {
                parts.push(format!("ch1={:.2}V", v));
            }
            if let Some(a) = pm.ch1_current {
                parts.push(format!("ch1={:.0}mA", a));
            }
            ("power", parts)
        }
        Variant::LocalStats(ls) => (
            "local",
            vec![
                format!("up={}s", ls.uptime_seconds),
                format!("util={}", fmt_percent(ls.channel_utilization)),
                format!("rx={} bad={}", ls.num_packets_rx, ls.num_packets_rx_bad),
                format!("nodes={}/{}", ls.num_online_nodes, ls.num_total_nodes),
            ],
        ),
    };
    if parts.is_empty() {
        format!("telemetry/{}", label)
    } else {
        format!("telemetry/{} {}", label, parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<M: Message>(m: &M) -> Bytes {
        Bytes::from(m.encode_to_vec())
    }

    #[test]
    fn data_wins_over_position_when_both_parse() {
        // Position{time} is field 4 fixed32, which is also Data.dest.
        let pos = proto::Position {
            time: 1_700_000_000,
            ..Default::default()
        };
        let bytes = encode(&pos);
        assert!(proto::Position::decode(bytes.clone()).is_ok());
        let c = classify(bytes, None);
        assert!(matches!(c.parsed, Some(ParsedPayload::Data(_))));
    }

    #[test]
    fn data_wrapper_supplies_port_and_app_payload() {
        let user = proto::User {
            id: "!00000001".into(),
            long_name: "Node One".into(),
            short_name: "N1".into(),
            hw_model: 9,
            ..Default::default()
        };
        let data = proto::Data {
            portnum: proto::PortNum::NodeinfoApp as i32,
            payload: encode(&user),
            ..Default::default()
        };
        let c = classify(encode(&data), None);
        assert_eq!(c.kind, Kind::NodeInfo);
        match payload_fields(&c) {
            PayloadFields::Node(n) => {
                assert_eq!(n.long_name.as_deref(), Some("Node One"));
                assert_eq!(n.short_name.as_deref(), Some("N1"));
                assert_eq!(n.hw_model, Some(9));
            }
            other => panic!("unexpected fields {:?}", other),
        }
    }

    #[test]
    fn bare_user_classifies_as_nodeinfo() {
        let user = proto::User {
            id: "!0000beef".into(),
            long_name: "Relay".into(),
            ..Default::default()
        };
        let c = classify(encode(&user), None);
        assert!(matches!(c.parsed, Some(ParsedPayload::User(_))));
        assert_eq!(c.kind, Kind::NodeInfo);
    }

    #[test]
    fn hint_is_authoritative() {
        let text = Bytes::from_static(b"hello mesh");
        let c = classify(text, Some(proto::PortNum::TextMessageApp as i32));
        assert_eq!(c.kind, Kind::Text);
        assert!(c.parsed.is_none());
        assert_eq!(payload_fields(&c), PayloadFields::Text("hello mesh".into()));

        let c = classify(Bytes::from_static(b"x"), Some(proto::PortNum::AdminApp as i32));
        assert_eq!(c.kind, Kind::Unknown);
    }

    #[test]
    fn miss_keeps_raw_hex() {
        // 0x0f is field 1 with wire type 7, which no message accepts.
        let c = classify(Bytes::from_static(&[0x0f, 0xff]), None);
        assert_eq!(c.kind, Kind::Unknown);
        assert!(c.parsed.is_none());
        assert_eq!(c.raw_hex, "0fff");
        assert!(c.text.is_none());
    }

    #[test]
    fn printable_text_rules() {
        assert_eq!(printable_text(b"hi there\n").as_deref(), Some("hi there\n"));
        assert_eq!(printable_text(b""), None);
        assert_eq!(printable_text(&[0x68, 0x00]), None);
        assert_eq!(printable_text(&[0xff, 0xfe]), None);
    }

    #[test]
    fn position_requires_both_coordinates() {
        let p = proto::Position {
            latitude_i: Some(525_000_000),
            longitude_i: Some(134_000_000),
            altitude: Some(40),
            ..Default::default()
        };
        let fix = position_fix(&p).unwrap();
        assert!((fix.latitude - 52.5).abs() < 1e-9);
        assert!((fix.longitude - 13.4).abs() < 1e-9);
        assert_eq!(fix.altitude, Some(40));

        let half = proto::Position {
            latitude_i: Some(1),
            ..Default::default()
        };
        assert!(position_fix(&half).is_none());
    }

    #[test]
    fn traceroute_sources() {
        let rd = proto::RouteDiscovery {
            route: vec![1, 2, 3],
            ..Default::default()
        };
        assert_eq!(
            traceroute_route(&rd.encode_to_vec()),
            vec![Some(1), Some(2), Some(3)]
        );
        assert_eq!(
            traceroute_route(b"!1, Unknown, !3"),
            vec![Some(1), None, Some(3)]
        );
        let mut packed = Vec::new();
        packed.extend_from_slice(&7u32.to_le_bytes());
        packed.extend_from_slice(&0x0100_0000u32.to_le_bytes());
        assert_eq!(traceroute_route(&packed), vec![Some(7), Some(0x0100_0000)]);
        assert!(traceroute_route(&[]).is_empty());
    }

    #[test]
    fn packed_route_skips_zero_ids() {
        let mut packed = Vec::new();
        for id in [7u32, 0, 9] {
            packed.extend_from_slice(&id.to_le_bytes());
        }
        assert_eq!(traceroute_route(&packed), vec![Some(7), Some(9)]);
    }

    #[test]
    fn unparseable_printable_bytes_classify_as_text_not_unknown() {
        // 0x21 opens a fixed64 field, then 'g' carries wire type 7: every parser rejects it.
        let c = classify(Bytes::from_static(b"!a1b2 ping"), None);
        assert!(c.parsed.is_none());
        assert_eq!(c.kind, Kind::Text);
        assert_eq!(c.text.as_deref(), Some("!a1b2 ping"));
        assert_eq!(payload_fields(&c), PayloadFields::Text("!a1b2 ping".into()));
    }

    #[test]
    fn neighbor_info_extraction() {
        let info = proto::NeighborInfo {
            node_id: 0x10,
            neighbors: vec![
                proto::Neighbor {
                    node_id: 0x20,
                    snr: 6.5,
                    ..Default::default()
                },
                proto::Neighbor {
                    node_id: 0x30,
                    snr: -3.0,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let c = classify(
            encode(&info),
            Some(proto::PortNum::NeighborinfoApp as i32),
        );
        match payload_fields(&c) {
            PayloadFields::Neighbors(r) => {
                assert_eq!(r.reporter, Some(0x10));
                assert_eq!(r.neighbors.len(), 2);
                assert_eq!(r.neighbors[1].snr, Some(-3.0));
            }
            other => panic!("unexpected fields {:?}", other),
        }
    }

    #[test]
    fn telemetry_summary() {
        let t = proto::Telemetry {
            time: 0,
            variant: Some(proto::telemetry::Variant::DeviceMetrics(proto::DeviceMetrics {
                battery_level: Some(88),
                voltage: Some(4.1),
                ..Default::default()
            })),
        };
        assert_eq!(summarize_telemetry(&t), "telemetry/device batt=88% v=4.10V");
        assert_eq!(
            summarize_telemetry(&proto::Telemetry::default()),
            "telemetry"
        );
    }
}
