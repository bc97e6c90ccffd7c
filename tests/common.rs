//! Test utilities & fixtures shared by the integration tests.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;

use meshcollectd::collector::Collector;
use meshcollectd::config::Config;
use meshcollectd::meshtastic::crypto::{self, ChannelKey, PacketMetadata, DEFAULT_CHANNEL_KEY};
use meshcollectd::metrics::{IngestMetrics, Snapshot};
use meshcollectd::protobuf::meshtastic_generated as proto;
use meshcollectd::storage::SledStore;
use meshcollectd::transport::InboundMessage;

/// Temp dir plus a config pointing at it and an open raw store.
pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: Config,
    pub store: SledStore,
}

pub fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_string_lossy().into_owned();
    config.logging.file = None;
    let store = SledStore::open(config.storage.raw_db_path()).expect("open store");
    Fixture { dir, config, store }
}

/// Run every message through a fresh collector and wait until all writes landed.
pub async fn ingest(fx: &Fixture, messages: Vec<InboundMessage>) -> Snapshot {
    let metrics = Arc::new(IngestMetrics::new());
    let collector =
        Collector::new(&fx.config, fx.store.clone(), metrics.clone()).expect("collector");
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let run = tokio::spawn(collector.run(rx));
    for msg in messages {
        tx.send(msg).await.expect("send");
    }
    drop(tx);
    run.await.expect("join").expect("collector run");
    metrics.snapshot()
}

pub fn json_message(topic: &str, body: &str, received_at: i64) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        payload: body.as_bytes().to_vec(),
        received_at,
    }
}

/// ServiceEnvelope carrying `data` encrypted with the default channel key.
#[allow(dead_code)]
pub fn encrypted_envelope(data: &proto::Data, from: u32, id: u32, rx_time: u32) -> Vec<u8> {
    let key = ChannelKey::from_base64(DEFAULT_CHANNEL_KEY).expect("default key");
    let meta = PacketMetadata {
        from,
        channel: 0,
        packet_id: id,
    };
    let ciphertext = crypto::encrypt(&key, &meta, &data.encode_to_vec()).expect("encrypt");
    proto::ServiceEnvelope {
        packet: Some(proto::MeshPacket {
            from,
            to: 0xffff_ffff,
            id,
            rx_time,
            payload_variant: Some(proto::mesh_packet::PayloadVariant::Encrypted(Bytes::from(
                ciphertext,
            ))),
            ..Default::default()
        }),
        channel_id: "LongFast".into(),
        gateway_id: "!00000099".into(),
    }
    .encode_to_vec()
}
