//! Persistence worker.
//!
//! The decode path never writes to storage itself. It hands [`StoreOp`]s to a
//! [`PersistenceHandle`], which feeds an unbounded channel drained by exactly one blocking
//! task. That task owns the store, applies operations in the order they were enqueued and
//! keeps going when a single write fails.
//!
//! Stopping is a queue item like any other: [`PersistenceHandle::shutdown`] enqueues
//! `Stop`, so everything enqueued before it is written first. Dropping every handle has the
//! same effect once the channel drains.

use std::sync::Arc;

use log::{debug, error, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{EventRecord, NeighborEdge, NodeCountSample, NodeUpdate, Store, TracerouteHop};
use crate::logutil::escape_log;
use crate::metrics::IngestMetrics;
use crate::validation::format_node_id;

/// One logical write. Multi-row operations (neighbor reports, traceroutes) are applied as
/// a single batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    InsertEvent(EventRecord),
    UpsertNode(NodeUpdate),
    ReplaceNeighbors {
        node_id: u32,
        timestamp: i64,
        edges: Vec<NeighborEdge>,
    },
    InsertTraceroute(Vec<TracerouteHop>),
    InsertNodeCount(NodeCountSample),
}

impl StoreOp {
    fn describe(&self) -> String {
        match self {
            StoreOp::InsertEvent(e) => format!(
                "event {} from {} on {}",
                e.kind,
                format_node_id(e.sender),
                escape_log(&e.topic)
            ),
            StoreOp::UpsertNode(n) => format!("node {}", format_node_id(n.id)),
            StoreOp::ReplaceNeighbors {
                node_id,
                timestamp,
                edges,
            } => format!(
                "{} neighbors of {} at {}",
                edges.len(),
                format_node_id(*node_id),
                timestamp
            ),
            StoreOp::InsertTraceroute(hops) => format!("traceroute of {} hops", hops.len()),
            StoreOp::InsertNodeCount(s) => format!("node count from {}", format_node_id(s.node_id)),
        }
    }

    fn apply<S: Store>(&self, store: &S) -> Result<(), super::StoreError> {
        match self {
            StoreOp::InsertEvent(e) => store.insert_event(e),
            StoreOp::UpsertNode(n) => store.upsert_node(n),
            StoreOp::ReplaceNeighbors {
                node_id,
                timestamp,
                edges,
            } => store.replace_neighbors(*node_id, *timestamp, edges),
            StoreOp::InsertTraceroute(hops) => store.insert_traceroute(hops),
            StoreOp::InsertNodeCount(s) => store.insert_node_count(s),
        }
    }
}

pub enum WorkerCommand {
    Op(StoreOp),
    Stats(oneshot::Sender<WorkerStats>),
    Stop,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub failed: u64,
}

#[derive(Clone, Debug)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<WorkerCommand>,
}

impl PersistenceHandle {
    /// Queue a write. Never blocks; returns false when the worker has already stopped.
    pub fn enqueue(&self, op: StoreOp) -> bool {
        match self.tx.send(WorkerCommand::Op(op)) {
            Ok(()) => true,
            Err(mpsc::error::SendError(cmd)) => {
                if let WorkerCommand::Op(op) = cmd {
                    error!("persistence worker gone; dropping {}", op.describe());
                }
                false
            }
        }
    }

    /// Counters as of every item enqueued before this call.
    pub async fn stats(&self) -> Option<WorkerStats> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WorkerCommand::Stats(tx)).is_ok() {
            rx.await.ok()
        } else {
            None
        }
    }

    /// Ask the worker to exit after draining what is already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(WorkerCommand::Stop);
    }
}

/// Start the single persistence worker. The join handle resolves to the final counters.
pub fn start_persistence_worker<S>(
    store: S,
    metrics: Arc<IngestMetrics>,
) -> (PersistenceHandle, JoinHandle<WorkerStats>)
where
    S: Store + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerCommand>();
    let handle = PersistenceHandle { tx };

    let join = tokio::task::spawn_blocking(move || {
        let mut stats = WorkerStats::default();
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                WorkerCommand::Op(op) => match op.apply(&store) {
                    Ok(()) => {
                        stats.processed += 1;
                        metrics.inc_persisted();
                    }
                    Err(e) => {
                        stats.failed += 1;
                        metrics.inc_store_write_failure();
                        error!("store write failed for {}: {}", op.describe(), e);
                    }
                },
                WorkerCommand::Stats(resp) => {
                    let _ = resp.send(stats);
                }
                WorkerCommand::Stop => {
                    debug!("persistence worker received stop");
                    break;
                }
            }
        }
        info!(
            "persistence worker finished: processed={} failed={}",
            stats.processed, stats.failed
        );
        stats
    });

    (handle, join)
}
