//! Message decoder: one MQTT `(topic, payload)` in, one classified packet out.
//!
//! Order of attempts:
//! 1. node-count topic (`.../nodes_count/<hex id>`, JSON counters)
//! 2. JSON text message (gateways with JSON output enabled)
//! 3. protobuf `ServiceEnvelope`, decrypting `encrypted` packets with the channel key
//!
//! Decoding never touches storage; the caller turns the result into store operations.

use std::collections::HashMap;

use bytes::Bytes;
use log::{debug, warn};
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::classify::{self, Classification};
use super::crypto::{self, ChannelKey, DecryptError, PacketMetadata};
use super::{
    DecodedPacket, Kind, NeighborEntry, NeighborReport, NodeCountSample, NodeIdentity,
    PayloadFields, PositionFix,
};
use crate::logutil::{escape_log, hex_snippet};
use crate::protobuf::meshtastic_generated as proto;
use crate::validation::{format_node_id, node_id_from_json, parse_node_id, sanitize_name};

pub const DEFAULT_NODE_COUNT_SEGMENT: &str = "nodes_count";

/// Which identity is recorded as the physical sender of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhysicalSenderPolicy {
    /// Always the logical sender (`from`).
    #[default]
    Sender,
    /// The MQTT gateway that uplinked the packet, when it identifies itself.
    Gateway,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is neither JSON nor a ServiceEnvelope: {0}")]
    Unrecognized(#[source] prost::DecodeError),

    #[error("JSON message is malformed: {0}")]
    Json(#[source] serde_json::Error),

    #[error("message has no usable sender")]
    MissingSender,

    #[error("service envelope carries no packet")]
    MissingPacket,

    #[error("node-count topic has a bad node id '{segment}'")]
    NodeCountTopic { segment: String },

    #[error("node-count payload is malformed: {0}")]
    NodeCountPayload(#[source] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decoded", rename_all = "snake_case")]
pub enum Decoded {
    Packet(DecodedPacket),
    NodeCount(NodeCountSample),
}

/// Fields of a JSON-format message. Node ids may be numbers or `!hex` strings.
#[derive(Debug, Deserialize)]
struct TextEnvelope {
    from: Option<Value>,
    to: Option<Value>,
    sender: Option<String>,
    timestamp: Option<i64>,
    rssi: Option<i32>,
    snr: Option<f32>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Default, Deserialize)]
struct NodeCountPayload {
    #[serde(rename = "30min", default)]
    count_30min: u64,
    #[serde(rename = "60min", default)]
    count_60min: u64,
    #[serde(rename = "120min", default)]
    count_120min: u64,
}

pub struct MessageDecoder {
    default_key: ChannelKey,
    channel_keys: HashMap<String, ChannelKey>,
    policy: PhysicalSenderPolicy,
    node_count_segment: String,
}

impl MessageDecoder {
    pub fn new(default_key: ChannelKey) -> Self {
        Self {
            default_key,
            channel_keys: HashMap::new(),
            policy: PhysicalSenderPolicy::default(),
            node_count_segment: DEFAULT_NODE_COUNT_SEGMENT.to_string(),
        }
    }

    /// Build from the `[collector]` config section, resolving every key up front.
    pub fn from_config(cfg: &crate::config::CollectorConfig) -> Result<Self, DecryptError> {
        let mut decoder = Self::new(ChannelKey::from_base64(&cfg.default_channel_key)?)
            .with_policy(cfg.physical_sender)
            .with_node_count_segment(&cfg.node_count_segment);
        for (channel, key) in &cfg.channel_keys {
            decoder = decoder.with_channel_key(channel, ChannelKey::from_base64(key)?);
        }
        Ok(decoder)
    }

    pub fn with_channel_key(mut self, channel_id: &str, key: ChannelKey) -> Self {
        self.channel_keys.insert(channel_id.to_string(), key);
        self
    }

    pub fn with_policy(mut self, policy: PhysicalSenderPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_node_count_segment(mut self, segment: &str) -> Self {
        self.node_count_segment = segment.to_string();
        self
    }

    fn key_for(&self, channel_id: &str) -> &ChannelKey {
        self.channel_keys
            .get(channel_id)
            .unwrap_or(&self.default_key)
    }

    /// Decode one message. `received_at` (unix seconds) stamps node-count samples and is
    /// the fallback timestamp for packets that carry none.
    pub fn decode(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: i64,
    ) -> Result<Decoded, DecodeError> {
        if let Some(segment) = self.node_count_target(topic) {
            return self
                .decode_node_count(segment, payload, received_at)
                .map(Decoded::NodeCount);
        }
        if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(payload) {
            return self
                .decode_json(topic, Value::Object(map), payload, received_at)
                .map(Decoded::Packet);
        }
        self.decode_envelope(topic, payload, received_at)
            .map(Decoded::Packet)
    }

    fn node_count_target<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let mut rev = topic.rsplit('/');
        let last = rev.next()?;
        let parent = rev.next()?;
        (parent == self.node_count_segment).then_some(last)
    }

    fn decode_node_count(
        &self,
        segment: &str,
        payload: &[u8],
        received_at: i64,
    ) -> Result<NodeCountSample, DecodeError> {
        let node_id = parse_node_id(segment).map_err(|_| DecodeError::NodeCountTopic {
            segment: escape_log(segment),
        })?;
        let counts: NodeCountPayload =
            serde_json::from_slice(payload).map_err(DecodeError::NodeCountPayload)?;
        Ok(NodeCountSample {
            node_id,
            timestamp: received_at,
            count_30min: counts.count_30min,
            count_60min: counts.count_60min,
            count_120min: counts.count_120min,
        })
    }

    fn decode_json(
        &self,
        topic: &str,
        doc: Value,
        raw: &[u8],
        received_at: i64,
    ) -> Result<DecodedPacket, DecodeError> {
        let env: TextEnvelope = serde_json::from_value(doc).map_err(DecodeError::Json)?;
        let sender = env
            .from
            .as_ref()
            .and_then(node_id_from_json)
            .ok_or(DecodeError::MissingSender)?;
        let kind = env.kind.as_deref().map(Kind::from_tag).unwrap_or(Kind::Unknown);
        let fields = json_fields(kind, &env.payload);
        let gateway = env.sender.as_deref().and_then(|s| parse_node_id(s).ok());

        let packet = DecodedPacket {
            topic: topic.to_string(),
            sender,
            receiver: env.to.as_ref().and_then(node_id_from_json),
            physical_sender: self.physical_sender(sender, gateway),
            timestamp: env.timestamp.filter(|t| *t > 0).unwrap_or(received_at),
            rssi: env.rssi,
            snr: env.snr,
            kind,
            fields,
            raw_hex: (kind == Kind::Unknown).then(|| hex::encode(raw)),
            decrypt_failed: false,
        };
        debug!(
            "json {} from {} on {}: {}",
            packet.kind,
            format_node_id(sender),
            escape_log(topic),
            packet.fields.summary()
        );
        Ok(packet)
    }

    fn decode_envelope(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: i64,
    ) -> Result<DecodedPacket, DecodeError> {
        let env = proto::ServiceEnvelope::decode(payload).map_err(DecodeError::Unrecognized)?;
        let packet = env.packet.ok_or(DecodeError::MissingPacket)?;
        if packet.from == 0 {
            return Err(DecodeError::MissingSender);
        }

        let mut decrypt_failed = false;
        let classification: Classification = match packet.payload_variant {
            Some(proto::mesh_packet::PayloadVariant::Encrypted(ciphertext)) => {
                let meta = PacketMetadata {
                    from: packet.from,
                    channel: packet.channel,
                    packet_id: packet.id,
                };
                let key = self.key_for(&env.channel_id);
                match crypto::decrypt(key, &meta, &ciphertext) {
                    Ok(plain) => classify::classify(Bytes::from(plain), None),
                    Err(e) => {
                        warn!(
                            "decrypt failed for packet {} from {} on channel '{}': {}",
                            packet.id,
                            format_node_id(packet.from),
                            escape_log(&env.channel_id),
                            e
                        );
                        decrypt_failed = true;
                        Classification {
                            kind: Kind::Unknown,
                            parsed: None,
                            raw_hex: hex::encode(&ciphertext),
                            app_payload: ciphertext,
                            text: None,
                        }
                    }
                }
            }
            Some(proto::mesh_packet::PayloadVariant::Decoded(data)) => {
                classify::classify(data.payload, Some(data.portnum))
            }
            None => classify::classify(Bytes::new(), None),
        };

        let fields = if decrypt_failed {
            PayloadFields::None
        } else {
            classify::payload_fields(&classification)
        };
        if classification.kind == Kind::Unknown {
            debug!(
                "unclassified payload from {} on {}: {}",
                format_node_id(packet.from),
                escape_log(topic),
                hex_snippet(&classification.app_payload, 32)
            );
        }
        let gateway = parse_node_id(&env.gateway_id).ok();

        let decoded = DecodedPacket {
            topic: topic.to_string(),
            sender: packet.from,
            receiver: (packet.to != 0).then_some(packet.to),
            physical_sender: self.physical_sender(packet.from, gateway),
            timestamp: if packet.rx_time != 0 {
                i64::from(packet.rx_time)
            } else {
                received_at
            },
            rssi: (packet.rx_rssi != 0).then_some(packet.rx_rssi),
            snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr),
            kind: classification.kind,
            fields,
            raw_hex: (classification.kind == Kind::Unknown).then_some(classification.raw_hex),
            decrypt_failed,
        };
        debug!(
            "envelope {} from {} on {}: {}",
            decoded.kind,
            format_node_id(decoded.sender),
            escape_log(topic),
            decoded.fields.summary()
        );
        Ok(decoded)
    }

    fn physical_sender(&self, sender: u32, gateway: Option<u32>) -> u32 {
        match self.policy {
            PhysicalSenderPolicy::Sender => sender,
            PhysicalSenderPolicy::Gateway => gateway.unwrap_or(sender),
        }
    }
}

fn json_str<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Value::as_str))
}

fn json_u32(obj: &Value, keys: &[&str]) -> Option<u32> {
    keys.iter().find_map(|k| {
        obj.get(*k)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    })
}

/// Interpret the `payload` member of a JSON message for its declared type.
fn json_fields(kind: Kind, payload: &Value) -> PayloadFields {
    match kind {
        Kind::NodeInfo => {
            let node = NodeIdentity {
                long_name: json_str(payload, &["longname", "long_name"]).and_then(sanitize_name),
                short_name: json_str(payload, &["shortname", "short_name"])
                    .and_then(sanitize_name),
                hw_model: json_u32(payload, &["hardware", "hw_model"]),
                role: json_u32(payload, &["role"]),
            };
            if node.long_name.is_some() || node.short_name.is_some() {
                PayloadFields::Node(node)
            } else {
                PayloadFields::None
            }
        }
        Kind::Position => {
            let fixed = |k: &str| payload.get(k).and_then(Value::as_i64).map(|v| v as f64 * 1e-7);
            let float = |k: &str| payload.get(k).and_then(Value::as_f64);
            let lat = fixed("latitude_i").or_else(|| float("latitude"));
            let lon = fixed("longitude_i").or_else(|| float("longitude"));
            match (lat, lon) {
                (Some(latitude), Some(longitude)) => PayloadFields::Position(PositionFix {
                    latitude,
                    longitude,
                    altitude: payload
                        .get("altitude")
                        .and_then(Value::as_i64)
                        .and_then(|a| i32::try_from(a).ok()),
                }),
                _ => PayloadFields::None,
            }
        }
        Kind::Text => payload
            .as_str()
            .or_else(|| json_str(payload, &["text"]))
            .filter(|t| !t.is_empty())
            .map(|t| PayloadFields::Text(t.to_string()))
            .unwrap_or_default(),
        Kind::Telemetry => match payload.as_object() {
            Some(obj) if !obj.is_empty() => {
                let mut parts: Vec<String> = obj
                    .iter()
                    .filter(|(_, v)| v.is_number())
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                parts.sort();
                PayloadFields::Telemetry {
                    summary: format!("telemetry {}", parts.join(" ")).trim_end().to_string(),
                }
            }
            _ => PayloadFields::None,
        },
        Kind::Traceroute => match payload.get("route").and_then(Value::as_array) {
            Some(route) if !route.is_empty() => {
                PayloadFields::Traceroute(route.iter().map(node_id_from_json).collect())
            }
            _ => PayloadFields::None,
        },
        Kind::NeighborInfo => match payload.get("neighbors").and_then(Value::as_array) {
            Some(list) => PayloadFields::Neighbors(NeighborReport {
                reporter: payload
                    .get("node_id")
                    .and_then(node_id_from_json)
                    .filter(|id| *id != 0),
                neighbors: list
                    .iter()
                    .filter_map(|n| {
                        let node_id = n.get("node_id").and_then(node_id_from_json)?;
                        Some(NeighborEntry {
                            node_id,
                            snr: n.get("snr").and_then(Value::as_f64).map(|s| s as f32),
                        })
                    })
                    .collect(),
            }),
            None => PayloadFields::None,
        },
        Kind::Routing | Kind::Unknown => PayloadFields::None,
    }
}
