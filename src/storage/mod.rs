//! # Storage Module - Raw Mesh Records
//!
//! Everything the collector learns about the mesh is written to one sled database. Writes
//! go through the [`Store`] trait and only ever happen on the persistence worker
//! ([`worker`]); readers (distillation, status, retention) share the same `SledStore`
//! handle, which is cheap to clone.
//!
//! ## Layout
//!
//! ```text
//! data/messages/            ← sled database
//!   nodes        u32 BE node id                     → NodeRecord
//!   messages     ts u64 BE ++ seq u64 BE            → EventRecord
//!   neighbors    ts ++ node u32 BE ++ idx u32 BE    → NeighborEdge
//!   traceroutes  ts ++ seq                          → TracerouteHop
//!   nodes_count  ts ++ seq                          → NodeCountSample
//! ```
//!
//! Time-ordered trees put the timestamp first so hourly windows and retention cutoffs are
//! plain range scans. Values are bincode.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshcollectd::storage::{NodeUpdate, SledStore, Store};
//!
//! fn main() -> anyhow::Result<()> {
//!     let store = SledStore::open("./data/messages")?;
//!     store.upsert_node(&NodeUpdate {
//!         long_name: Some("Hilltop Relay".into()),
//!         last_seen: Some(1_736_000_000),
//!         ..NodeUpdate::new(0xa1b2c3d4)
//!     })?;
//!     println!("{:?}", store.get_node(0xa1b2c3d4)?);
//!     Ok(())
//! }
//! ```

pub mod errors;
pub mod retention;
pub mod worker;

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::IVec;

pub use crate::meshtastic::NodeCountSample;
use crate::meshtastic::Kind;
pub use errors::StoreError;

pub(crate) const TREE_NODES: &str = "nodes";
pub(crate) const TREE_MESSAGES: &str = "messages";
pub(crate) const TREE_NEIGHBORS: &str = "neighbors";
pub(crate) const TREE_TRACEROUTES: &str = "traceroutes";
pub(crate) const TREE_NODES_COUNT: &str = "nodes_count";

/// Known node. One record per id; created on first sighting, never deleted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: u32,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<u32>,
    pub role: Option<u32>,
    pub last_seen: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Partial node data from one packet. `None` means "not in this packet", not "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub id: u32,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    pub hw_model: Option<u32>,
    pub role: Option<u32>,
    pub last_seen: Option<i64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl NodeUpdate {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

impl NodeRecord {
    /// Coalesce an update into this record. Present fields overwrite; last_seen only
    /// moves forward.
    pub fn apply(&mut self, update: &NodeUpdate) {
        fn merge<T: Clone>(slot: &mut Option<T>, incoming: &Option<T>) {
            if incoming.is_some() {
                slot.clone_from(incoming);
            }
        }
        merge(&mut self.long_name, &update.long_name);
        merge(&mut self.short_name, &update.short_name);
        merge(&mut self.hw_model, &update.hw_model);
        merge(&mut self.role, &update.role);
        merge(&mut self.latitude, &update.latitude);
        merge(&mut self.longitude, &update.longitude);
        self.last_seen = match (self.last_seen, update.last_seen) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// One received packet. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub topic: String,
    pub sender: u32,
    pub receiver: Option<u32>,
    pub physical_sender: u32,
    pub timestamp: i64,
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
    pub kind: Kind,
    pub raw_hex: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NeighborEdge {
    pub node_id: u32,
    pub neighbor_id: u32,
    pub snr: Option<f32>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerouteHop {
    pub from_node: u32,
    pub to_node: u32,
    pub timestamp: i64,
}

/// Row counts per tree, for `status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub nodes: usize,
    pub messages: usize,
    pub neighbors: usize,
    pub traceroutes: usize,
    pub nodes_count: usize,
}

/// Write side of the raw store. Implementations are driven by the single persistence
/// worker, so they need no locking of their own.
pub trait Store: Send {
    fn upsert_node(&self, update: &NodeUpdate) -> Result<(), StoreError>;
    fn insert_event(&self, event: &EventRecord) -> Result<(), StoreError>;
    /// Replace every edge `node_id` reported at exactly `timestamp` with `edges`.
    fn replace_neighbors(
        &self,
        node_id: u32,
        timestamp: i64,
        edges: &[NeighborEdge],
    ) -> Result<(), StoreError>;
    /// All hops of one traceroute reply, written together.
    fn insert_traceroute(&self, hops: &[TracerouteHop]) -> Result<(), StoreError>;
    fn insert_node_count(&self, sample: &NodeCountSample) -> Result<(), StoreError>;
}

/// Big-endian seconds. Pre-epoch timestamps clamp to zero so ordering stays intact.
pub(crate) fn time_key(ts: i64) -> [u8; 8] {
    (ts.max(0) as u64).to_be_bytes()
}

pub(crate) fn key_time(key: &[u8], tree: &'static str) -> Result<i64, StoreError> {
    let head: [u8; 8] = key
        .get(..8)
        .and_then(|s| s.try_into().ok())
        .ok_or(StoreError::CorruptKey {
            tree,
            len: key.len(),
        })?;
    Ok(u64::from_be_bytes(head) as i64)
}

/// Sled-backed raw store.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    nodes: sled::Tree,
    messages: sled::Tree,
    neighbors: sled::Tree,
    traceroutes: sled::Tree,
    nodes_count: sled::Tree,
}

impl SledStore {
    /// Open (or create) the store rooted at `path`. sled holds a directory lock, so a second
    /// process opening the same path fails here.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        Ok(Self {
            nodes: db.open_tree(TREE_NODES)?,
            messages: db.open_tree(TREE_MESSAGES)?,
            neighbors: db.open_tree(TREE_NEIGHBORS)?,
            traceroutes: db.open_tree(TREE_TRACEROUTES)?,
            nodes_count: db.open_tree(TREE_NODES_COUNT)?,
            db,
        })
    }

    fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
        Ok(bincode::serialize(value)?)
    }

    fn deserialize<T: serde::de::DeserializeOwned>(bytes: &IVec) -> Result<T, StoreError> {
        Ok(bincode::deserialize::<T>(bytes)?)
    }

    fn sequenced_key(&self, ts: i64) -> Result<Vec<u8>, StoreError> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&time_key(ts));
        key.extend_from_slice(&self.db.generate_id()?.to_be_bytes());
        Ok(key)
    }

    fn neighbor_prefix(ts: i64, node_id: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&time_key(ts));
        key.extend_from_slice(&node_id.to_be_bytes());
        key
    }

    fn decode_all<T: serde::de::DeserializeOwned>(
        iter: impl Iterator<Item = sled::Result<(IVec, IVec)>>,
    ) -> Result<Vec<T>, StoreError> {
        let mut out = Vec::new();
        for entry in iter {
            let (_, value) = entry?;
            out.push(Self::deserialize(&value)?);
        }
        Ok(out)
    }

    pub fn get_node(&self, id: u32) -> Result<Option<NodeRecord>, StoreError> {
        match self.nodes.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        Self::decode_all(self.nodes.iter())
    }

    /// Events with `start <= timestamp < end`, in time order.
    pub fn events_between(&self, start: i64, end: i64) -> Result<Vec<EventRecord>, StoreError> {
        if end <= start {
            return Ok(Vec::new());
        }
        Self::decode_all(self.messages.range(time_key(start)..time_key(end)))
    }

    /// Timestamp of the first event at or after `floor`.
    pub fn earliest_event_since(&self, floor: i64) -> Result<Option<i64>, StoreError> {
        match self.messages.range(time_key(floor)..).next() {
            Some(entry) => {
                let (key, _) = entry?;
                Ok(Some(key_time(&key, TREE_MESSAGES)?))
            }
            None => Ok(None),
        }
    }

    pub fn events(&self) -> Result<Vec<EventRecord>, StoreError> {
        Self::decode_all(self.messages.iter())
    }

    pub fn neighbors(&self) -> Result<Vec<NeighborEdge>, StoreError> {
        Self::decode_all(self.neighbors.iter())
    }

    /// Edges `node_id` reported at exactly `timestamp`.
    pub fn neighbors_at(&self, node_id: u32, timestamp: i64) -> Result<Vec<NeighborEdge>, StoreError> {
        Self::decode_all(
            self.neighbors
                .scan_prefix(Self::neighbor_prefix(timestamp, node_id)),
        )
    }

    pub fn traceroutes(&self) -> Result<Vec<TracerouteHop>, StoreError> {
        Self::decode_all(self.traceroutes.iter())
    }

    pub fn node_counts(&self) -> Result<Vec<NodeCountSample>, StoreError> {
        Self::decode_all(self.nodes_count.iter())
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            nodes: self.nodes.len(),
            messages: self.messages.len(),
            neighbors: self.neighbors.len(),
            traceroutes: self.traceroutes.len(),
            nodes_count: self.nodes_count.len(),
        }
    }

    /// Time-keyed trees subject to retention.
    pub(crate) fn timed_trees(&self) -> [(&'static str, &sled::Tree); 4] {
        [
            (TREE_MESSAGES, &self.messages),
            (TREE_NEIGHBORS, &self.neighbors),
            (TREE_TRACEROUTES, &self.traceroutes),
            (TREE_NODES_COUNT, &self.nodes_count),
        ]
    }

    pub(crate) fn nodes_tree(&self) -> &sled::Tree {
        &self.nodes
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl Store for SledStore {
    fn upsert_node(&self, update: &NodeUpdate) -> Result<(), StoreError> {
        let mut record = self.get_node(update.id)?.unwrap_or(NodeRecord {
            id: update.id,
            ..Default::default()
        });
        record.apply(update);
        self.nodes
            .insert(update.id.to_be_bytes(), Self::serialize(&record)?)?;
        self.nodes.flush()?;
        Ok(())
    }

    fn insert_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        let key = self.sequenced_key(event.timestamp)?;
        self.messages.insert(key, Self::serialize(event)?)?;
        self.messages.flush()?;
        Ok(())
    }

    fn replace_neighbors(
        &self,
        node_id: u32,
        timestamp: i64,
        edges: &[NeighborEdge],
    ) -> Result<(), StoreError> {
        let prefix = Self::neighbor_prefix(timestamp, node_id);
        let mut batch = sled::Batch::default();
        for entry in self.neighbors.scan_prefix(&prefix) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        for (idx, edge) in edges.iter().enumerate() {
            let mut key = prefix.clone();
            key.extend_from_slice(&(idx as u32).to_be_bytes());
            batch.insert(key, Self::serialize(edge)?);
        }
        self.neighbors.apply_batch(batch)?;
        self.neighbors.flush()?;
        Ok(())
    }

    fn insert_traceroute(&self, hops: &[TracerouteHop]) -> Result<(), StoreError> {
        if hops.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for hop in hops {
            batch.insert(self.sequenced_key(hop.timestamp)?, Self::serialize(hop)?);
        }
        self.traceroutes.apply_batch(batch)?;
        self.traceroutes.flush()?;
        Ok(())
    }

    fn insert_node_count(&self, sample: &NodeCountSample) -> Result<(), StoreError> {
        let key = self.sequenced_key(sample.timestamp)?;
        self.nodes_count.insert(key, Self::serialize(sample)?)?;
        self.nodes_count.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SledStore) {
        let dir = TempDir::new().unwrap();
        let store = SledStore::open(dir.path().join("messages")).unwrap();
        (dir, store)
    }

    fn event(ts: i64, sender: u32) -> EventRecord {
        EventRecord {
            topic: "msh/test".into(),
            sender,
            receiver: None,
            physical_sender: sender,
            timestamp: ts,
            rssi: Some(-100),
            snr: Some(2.5),
            kind: Kind::Text,
            raw_hex: None,
        }
    }

    #[test]
    fn node_upsert_coalesces_and_never_regresses_last_seen() {
        let (_dir, store) = store();
        store
            .upsert_node(&NodeUpdate {
                long_name: Some("Node One".into()),
                short_name: Some("N1".into()),
                last_seen: Some(200),
                ..NodeUpdate::new(1)
            })
            .unwrap();
        store
            .upsert_node(&NodeUpdate {
                latitude: Some(1.5),
                longitude: Some(2.5),
                last_seen: Some(100),
                ..NodeUpdate::new(1)
            })
            .unwrap();
        let node = store.get_node(1).unwrap().unwrap();
        assert_eq!(node.long_name.as_deref(), Some("Node One"));
        assert_eq!(node.latitude, Some(1.5));
        assert_eq!(node.last_seen, Some(200));
        assert_eq!(store.counts().nodes, 1);
    }

    #[test]
    fn repeated_upsert_is_idempotent() {
        let (_dir, store) = store();
        let update = NodeUpdate {
            long_name: Some("Same".into()),
            hw_model: Some(43),
            last_seen: Some(10),
            ..NodeUpdate::new(7)
        };
        store.upsert_node(&update).unwrap();
        let first = store.get_node(7).unwrap();
        store.upsert_node(&update).unwrap();
        assert_eq!(store.get_node(7).unwrap(), first);
        assert_eq!(store.nodes().unwrap().len(), 1);
    }

    #[test]
    fn events_are_time_ordered_and_range_scannable() {
        let (_dir, store) = store();
        for (ts, sender) in [(300, 3), (100, 1), (200, 2), (200, 4)] {
            store.insert_event(&event(ts, sender)).unwrap();
        }
        let all: Vec<u32> = store.events().unwrap().iter().map(|e| e.sender).collect();
        assert_eq!(all, vec![1, 2, 4, 3]);
        let window = store.events_between(200, 300).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(store.earliest_event_since(150).unwrap(), Some(200));
        assert_eq!(store.earliest_event_since(301).unwrap(), None);
    }

    #[test]
    fn neighbor_replace_only_touches_same_timestamp() {
        let (_dir, store) = store();
        let edge = |n, ts| NeighborEdge {
            node_id: 1,
            neighbor_id: n,
            snr: Some(1.0),
            timestamp: ts,
        };
        store
            .replace_neighbors(1, 100, &[edge(2, 100), edge(3, 100)])
            .unwrap();
        store.replace_neighbors(1, 50, &[edge(9, 50)]).unwrap();
        store.replace_neighbors(1, 100, &[edge(4, 100)]).unwrap();

        let at_100: Vec<u32> = store
            .neighbors_at(1, 100)
            .unwrap()
            .iter()
            .map(|e| e.neighbor_id)
            .collect();
        assert_eq!(at_100, vec![4]);
        assert_eq!(store.neighbors_at(1, 50).unwrap().len(), 1);
        assert_eq!(store.neighbors().unwrap().len(), 2);
    }

    #[test]
    fn traceroute_and_node_count_rows() {
        let (_dir, store) = store();
        let hops = [
            TracerouteHop {
                from_node: 1,
                to_node: 2,
                timestamp: 5,
            },
            TracerouteHop {
                from_node: 2,
                to_node: 3,
                timestamp: 5,
            },
        ];
        store.insert_traceroute(&hops).unwrap();
        store.insert_traceroute(&[]).unwrap();
        assert_eq!(store.traceroutes().unwrap(), hops.to_vec());

        let sample = NodeCountSample {
            node_id: 9,
            timestamp: 5,
            count_30min: 1,
            count_60min: 2,
            count_120min: 3,
        };
        store.insert_node_count(&sample).unwrap();
        assert_eq!(store.node_counts().unwrap(), vec![sample]);
    }

    #[test]
    fn reopen_sees_persisted_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("messages");
        {
            let store = SledStore::open(&path).unwrap();
            store.insert_event(&event(1, 1)).unwrap();
            store.upsert_node(&NodeUpdate::new(1)).unwrap();
        }
        let store = SledStore::open(&path).unwrap();
        assert_eq!(store.counts().messages, 1);
        assert!(store.get_node(1).unwrap().is_some());
    }
}
