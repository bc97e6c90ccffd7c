//! Collector: inbound messages in, store operations out.
//!
//! The collector runs the decoder inline for every [`InboundMessage`] and hands the
//! resulting [`StoreOp`]s to the persistence worker. It never blocks on storage. The
//! [`MaintenanceScheduler`] runs alongside it and owns the periodic batch jobs
//! (distillation and retention), which share the raw store handle because sled allows a
//! database to be opened only once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::distill::{DistillReport, DistillationEngine, DistilledStore};
use crate::logutil::{escape_log, hex_snippet};
use crate::meshtastic::decoder::{Decoded, MessageDecoder};
use crate::meshtastic::{DecodedPacket, Kind, PayloadFields};
use crate::metrics::IngestMetrics;
use crate::storage::retention::{self, CleanupReport};
use crate::storage::worker::{start_persistence_worker, PersistenceHandle, StoreOp, WorkerStats};
use crate::storage::{EventRecord, NeighborEdge, NodeUpdate, SledStore, Store, TracerouteHop};
use crate::transport::InboundMessage;

/// Split one decoded packet into store operations: the event first, then the node update,
/// then kind-specific rows.
pub fn store_ops(packet: &DecodedPacket) -> Vec<StoreOp> {
    let mut ops = vec![StoreOp::InsertEvent(EventRecord {
        topic: packet.topic.clone(),
        sender: packet.sender,
        receiver: packet.receiver,
        physical_sender: packet.physical_sender,
        timestamp: packet.timestamp,
        rssi: packet.rssi,
        snr: packet.snr,
        kind: packet.kind,
        raw_hex: packet.raw_hex.clone(),
    })];

    let mut node = NodeUpdate {
        last_seen: Some(packet.timestamp),
        ..NodeUpdate::new(packet.sender)
    };
    match &packet.fields {
        PayloadFields::Node(identity) => {
            node.long_name = identity.long_name.clone();
            node.short_name = identity.short_name.clone();
            node.hw_model = identity.hw_model;
            node.role = identity.role;
        }
        PayloadFields::Position(fix) => {
            node.latitude = Some(fix.latitude);
            node.longitude = Some(fix.longitude);
        }
        _ => {}
    }
    ops.push(StoreOp::UpsertNode(node));

    match &packet.fields {
        PayloadFields::Neighbors(report) => {
            let reporter = report.reporter.unwrap_or(packet.sender);
            let edges = report
                .neighbors
                .iter()
                .map(|n| NeighborEdge {
                    node_id: reporter,
                    neighbor_id: n.node_id,
                    snr: n.snr,
                    timestamp: packet.timestamp,
                })
                .collect();
            ops.push(StoreOp::ReplaceNeighbors {
                node_id: reporter,
                timestamp: packet.timestamp,
                edges,
            });
        }
        PayloadFields::Traceroute(route) => {
            let hops: Vec<TracerouteHop> = route
                .windows(2)
                .filter_map(|pair| match (pair[0], pair[1]) {
                    (Some(from_node), Some(to_node)) => Some(TracerouteHop {
                        from_node,
                        to_node,
                        timestamp: packet.timestamp,
                    }),
                    _ => None,
                })
                .collect();
            if !hops.is_empty() {
                ops.push(StoreOp::InsertTraceroute(hops));
            }
        }
        _ => {}
    }
    ops
}

pub struct Collector {
    decoder: MessageDecoder,
    persistence: PersistenceHandle,
    worker: JoinHandle<WorkerStats>,
    metrics: Arc<IngestMetrics>,
}

impl Collector {
    /// Resolve channel keys and start the persistence worker. Must be called inside a
    /// tokio runtime.
    pub fn new<S>(config: &Config, store: S, metrics: Arc<IngestMetrics>) -> Result<Self>
    where
        S: Store + 'static,
    {
        let decoder = MessageDecoder::from_config(&config.collector)
            .map_err(|e| anyhow!("Invalid channel key configuration: {}", e))?;
        let (persistence, worker) = start_persistence_worker(store, metrics.clone());
        Ok(Self {
            decoder,
            persistence,
            worker,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    pub fn persistence(&self) -> &PersistenceHandle {
        &self.persistence
    }

    /// Decode one message and enqueue its writes. Returns the number of operations queued;
    /// zero when the message was dropped.
    pub fn handle(&self, msg: &InboundMessage) -> usize {
        self.metrics.inc_received();
        let decoded = match self
            .decoder
            .decode(&msg.topic, &msg.payload, msg.received_at)
        {
            Ok(d) => d,
            Err(e) => {
                self.metrics.inc_decode_failure();
                warn!(
                    "dropping message on {}: {} (payload {})",
                    escape_log(&msg.topic),
                    e,
                    hex_snippet(&msg.payload, 24)
                );
                return 0;
            }
        };

        let ops = match decoded {
            Decoded::NodeCount(sample) => {
                self.metrics.inc_node_count_sample();
                vec![StoreOp::InsertNodeCount(sample)]
            }
            Decoded::Packet(packet) => {
                if packet.decrypt_failed {
                    self.metrics.inc_decrypt_failure();
                }
                if packet.kind == Kind::Unknown {
                    self.metrics.inc_classification_miss();
                    debug!(
                        "unknown payload on {} kept as raw hex",
                        escape_log(&packet.topic)
                    );
                }
                store_ops(&packet)
            }
        };

        let mut queued = 0;
        for op in ops {
            if self.persistence.enqueue(op) {
                queued += 1;
            }
        }
        queued
    }

    /// Consume the inbound channel until every sender is gone, then drain the worker.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) -> Result<WorkerStats> {
        info!("collector started");
        while let Some(msg) = inbound.recv().await {
            self.handle(&msg);
        }
        info!("inbound channel closed; flushing persistence queue");
        self.finish().await
    }

    /// Send the stop sentinel and wait for everything queued so far to be written.
    pub async fn finish(self) -> Result<WorkerStats> {
        self.persistence.shutdown();
        let stats = self
            .worker
            .await
            .map_err(|e| anyhow!("persistence worker panicked: {}", e))?;
        info!("collector stopped: {}", self.metrics.snapshot());
        Ok(stats)
    }
}

fn is_due(last: Option<Instant>, every: Duration, now: Instant) -> bool {
    match last {
        None => true,
        Some(prev) => now.saturating_duration_since(prev) >= every,
    }
}

/// What one scheduler tick did.
#[derive(Debug, Default)]
pub struct MaintenanceOutcome {
    pub distill: Option<DistillReport>,
    pub retention: Option<CleanupReport>,
}

struct RetentionJob {
    store: SledStore,
    days: u32,
    batch_size: usize,
}

/// Periodic distillation and retention. Jobs run one after another on the same task, so a
/// run never overlaps the previous one.
pub struct MaintenanceScheduler {
    distill: Option<(DistillationEngine<SledStore>, Duration)>,
    retention: Option<(RetentionJob, Duration)>,
    last_distill: Option<Instant>,
    last_retention: Option<Instant>,
}

impl MaintenanceScheduler {
    pub fn new(config: &Config, raw: SledStore, distilled: DistilledStore) -> Self {
        let distill = config.distill.enabled.then(|| {
            (
                DistillationEngine::new(raw.clone(), distilled, config.distill.options()),
                Duration::from_secs(config.distill.interval_minutes.max(1) * 60),
            )
        });
        let retention = config.retention.enabled.then(|| {
            (
                RetentionJob {
                    store: raw,
                    days: config.retention.days,
                    batch_size: config.retention.batch_size,
                },
                Duration::from_secs(config.retention.interval_hours.max(1) * 3600),
            )
        });
        Self {
            distill,
            retention,
            last_distill: None,
            last_retention: None,
        }
    }

    /// Run whichever jobs are due. Blocking; call from `spawn_blocking`.
    pub fn tick(&mut self, now: Instant, wall_clock: i64) -> MaintenanceOutcome {
        let mut outcome = MaintenanceOutcome::default();
        if let Some((engine, every)) = &self.distill {
            if is_due(self.last_distill, *every, now) {
                self.last_distill = Some(now);
                match engine.run(wall_clock) {
                    Ok(report) => outcome.distill = Some(report),
                    Err(e) => error!("distillation failed: {}", e),
                }
            }
        }
        if let Some((job, every)) = &self.retention {
            if is_due(self.last_retention, *every, now) {
                self.last_retention = Some(now);
                let cutoff = retention::cutoff_for_days(wall_clock, job.days);
                match retention::cleanup(&job.store, cutoff, job.batch_size, false) {
                    Ok(report) => outcome.retention = Some(report),
                    Err(e) => error!("retention cleanup failed: {}", e),
                }
            }
        }
        outcome
    }

    /// Check for due jobs every `poll` until `shutdown` fires.
    pub async fn run(self, poll: Duration, mut shutdown: oneshot::Receiver<()>) {
        if self.distill.is_none() && self.retention.is_none() {
            info!("maintenance disabled");
            return;
        }
        let mut scheduler = self;
        let mut ticker = tokio::time::interval(poll);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut shutdown => break,
            }
            let joined = tokio::task::spawn_blocking(move || {
                let outcome = scheduler.tick(Instant::now(), chrono::Utc::now().timestamp());
                (scheduler, outcome)
            })
            .await;
            match joined {
                Ok((back, outcome)) => {
                    scheduler = back;
                    if outcome.distill.is_some() || outcome.retention.is_some() {
                        debug!("maintenance tick: {:?}", outcome);
                    }
                }
                Err(e) => {
                    error!("maintenance task panicked: {}", e);
                    return;
                }
            }
        }
        debug!("maintenance scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshtastic::{NeighborEntry, NeighborReport, NodeIdentity};

    fn packet(fields: PayloadFields, kind: Kind) -> DecodedPacket {
        DecodedPacket {
            topic: "msh/test".into(),
            sender: 1,
            receiver: Some(0),
            physical_sender: 1,
            timestamp: 1_736_000_000,
            rssi: None,
            snr: None,
            kind,
            fields,
            raw_hex: None,
            decrypt_failed: false,
        }
    }

    #[test]
    fn nodeinfo_yields_event_then_node() {
        let ops = store_ops(&packet(
            PayloadFields::Node(NodeIdentity {
                long_name: Some("Node One".into()),
                short_name: Some("N1".into()),
                hw_model: Some(1),
                role: Some(0),
            }),
            Kind::NodeInfo,
        ));
        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], StoreOp::InsertEvent(e) if e.kind == Kind::NodeInfo));
        match &ops[1] {
            StoreOp::UpsertNode(n) => {
                assert_eq!(n.id, 1);
                assert_eq!(n.long_name.as_deref(), Some("Node One"));
                assert_eq!(n.last_seen, Some(1_736_000_000));
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn traceroute_pairs_skip_unresolved_hops() {
        let ops = store_ops(&packet(
            PayloadFields::Traceroute(vec![Some(1), Some(2), None, Some(4), Some(5)]),
            Kind::Traceroute,
        ));
        match ops.last() {
            Some(StoreOp::InsertTraceroute(hops)) => {
                let pairs: Vec<(u32, u32)> =
                    hops.iter().map(|h| (h.from_node, h.to_node)).collect();
                assert_eq!(pairs, vec![(1, 2), (4, 5)]);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn neighbor_report_uses_reporter_or_sender() {
        let report = |reporter| {
            PayloadFields::Neighbors(NeighborReport {
                reporter,
                neighbors: vec![NeighborEntry {
                    node_id: 9,
                    snr: Some(3.0),
                }],
            })
        };
        let ops = store_ops(&packet(report(Some(0x42)), Kind::NeighborInfo));
        assert!(matches!(
            ops.last(),
            Some(StoreOp::ReplaceNeighbors { node_id: 0x42, edges, .. }) if edges[0].node_id == 0x42
        ));
        let ops = store_ops(&packet(report(None), Kind::NeighborInfo));
        assert!(matches!(
            ops.last(),
            Some(StoreOp::ReplaceNeighbors { node_id: 1, .. })
        ));
    }

    #[test]
    fn scheduling_interval() {
        let t0 = Instant::now();
        let every = Duration::from_secs(60);
        assert!(is_due(None, every, t0));
        assert!(!is_due(Some(t0), every, t0 + Duration::from_secs(59)));
        assert!(is_due(Some(t0), every, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn tick_runs_due_jobs_once_per_interval() {
        let dir = tempfile::tempdir().unwrap();
        let raw = SledStore::open(dir.path().join("messages")).unwrap();
        let distilled = DistilledStore::open(dir.path().join("distilled")).unwrap();
        let mut scheduler = MaintenanceScheduler::new(&Config::default(), raw, distilled);

        let t0 = Instant::now();
        let first = scheduler.tick(t0, 1_736_000_000);
        assert!(first.distill.is_some());
        assert!(first.retention.is_some());

        let again = scheduler.tick(t0 + Duration::from_secs(5), 1_736_000_005);
        assert!(again.distill.is_none());
        assert!(again.retention.is_none());

        let later = scheduler.tick(t0 + Duration::from_secs(3600), 1_736_003_600);
        assert!(later.distill.is_some());
        assert!(later.retention.is_none());
    }
}
