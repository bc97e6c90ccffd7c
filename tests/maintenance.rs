mod common;

use std::time::Instant;

use common::{fixture, ingest, json_message};
use meshcollectd::collector::MaintenanceScheduler;
use meshcollectd::distill::{DistillationEngine, DistilledStore};
use meshcollectd::storage::retention;

// 2025-01-04 14:00:00 UTC
const H: i64 = 1_735_999_200;

fn text_from(sender: u32, ts: i64) -> meshcollectd::transport::InboundMessage {
    json_message(
        "msh/EU/2/json/LongFast/!1",
        &format!(
            r#"{{"from":{},"timestamp":{},"type":"text","payload":"msg"}}"#,
            sender, ts
        ),
        ts,
    )
}

fn position_from(sender: u32, ts: i64) -> meshcollectd::transport::InboundMessage {
    json_message(
        "msh/EU/2/json/LongFast/!1",
        &format!(
            r#"{{"from":{},"timestamp":{},"type":"position","payload":{{"latitude":50.0,"longitude":8.0}}}}"#,
            sender, ts
        ),
        ts,
    )
}

#[tokio::test]
async fn distillation_over_ingested_events_is_idempotent() {
    let fx = fixture();
    ingest(
        &fx,
        vec![
            text_from(1, H + 10),
            text_from(2, H + 20),
            position_from(1, H + 30),
            text_from(3, H + 3600 + 5),
        ],
    )
    .await;

    let distilled = DistilledStore::open(fx.config.storage.distilled_db_path()).unwrap();
    let engine = DistillationEngine::new(fx.store.clone(), distilled, fx.config.distill.options());

    engine.run_window(H, H + 3600).unwrap();
    let hourly = engine.dest().hourly_counts("2025-01-04 14:00").unwrap();
    let daily = engine.dest().daily_counts("2025-01-04").unwrap();
    assert_eq!(hourly.get("text"), Some(&2));
    assert_eq!(hourly.get("position"), Some(&1));
    assert_eq!(daily.get("text"), Some(&3));

    engine.run_window(H, H + 3600).unwrap();
    assert_eq!(engine.dest().hourly_counts("2025-01-04 14:00").unwrap(), hourly);
    assert_eq!(engine.dest().daily_counts("2025-01-04").unwrap(), daily);

    let unique = engine.dest().hourly_unique("2025-01-04 14:00").unwrap().unwrap();
    assert_eq!(unique.senders, 2);
    assert_eq!(unique.physical_senders, 2);
}

#[tokio::test]
async fn retention_prunes_old_rows_but_keeps_nodes() {
    let fx = fixture();
    let now = H + 10 * 86_400;
    ingest(
        &fx,
        vec![
            text_from(1, H),
            text_from(2, now - 3600),
            json_message(
                "msh/x",
                &format!(
                    r#"{{"from":1,"timestamp":{},"type":"traceroute","payload":{{"route":["!1","!2"]}}}}"#,
                    H
                ),
                H,
            ),
        ],
    )
    .await;
    assert_eq!(fx.store.counts().messages, 3);

    let cutoff = retention::cutoff_for_days(now, 7);
    let dry = retention::cleanup(&fx.store, cutoff, 1, true).unwrap();
    assert_eq!(dry.total_deleted(), 3);
    assert_eq!(fx.store.counts().messages, 3);

    let report = retention::cleanup(&fx.store, cutoff, 1, false).unwrap();
    assert_eq!(report.total_deleted(), 3);
    assert_eq!(report.nodes_cleared, 1);
    let counts = fx.store.counts();
    assert_eq!(counts.messages, 1);
    assert_eq!(counts.traceroutes, 0);
    assert_eq!(counts.nodes, 2);
    assert_eq!(fx.store.get_node(1).unwrap().unwrap().last_seen, None);
    assert_eq!(fx.store.get_node(2).unwrap().unwrap().last_seen, Some(now - 3600));
}

#[tokio::test]
async fn scheduler_first_tick_bootstraps_distillation() {
    let fx = fixture();
    ingest(&fx, vec![text_from(1, H + 10), text_from(2, H + 7200 + 10)]).await;

    let distilled = DistilledStore::open(fx.config.storage.distilled_db_path()).unwrap();
    let mut scheduler = MaintenanceScheduler::new(&fx.config, fx.store.clone(), distilled.clone());
    let outcome = scheduler.tick(Instant::now(), H + 7200 + 60);

    let report = outcome.distill.unwrap();
    assert_eq!(report.buckets, 3);
    assert_eq!(report.events, 2);
    assert_eq!(distilled.last_distilled_hour().unwrap(), Some(H + 7200));
    // within the 7 day window, nothing pruned
    assert_eq!(outcome.retention.unwrap().total_deleted(), 0);
    assert_eq!(fx.store.counts().messages, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retention_never_undoes_concurrent_node_upserts() {
    use std::sync::Arc;

    use meshcollectd::metrics::IngestMetrics;
    use meshcollectd::storage::worker::{start_persistence_worker, StoreOp};
    use meshcollectd::storage::{NodeUpdate, Store};

    const NODES: u32 = 5_000;
    let fx = fixture();
    for id in 1..=NODES {
        fx.store
            .upsert_node(&NodeUpdate {
                last_seen: Some(10),
                ..NodeUpdate::new(id)
            })
            .unwrap();
    }

    let (handle, worker) =
        start_persistence_worker(fx.store.clone(), Arc::new(IngestMetrics::new()));
    let cleaner_store = fx.store.clone();
    let cleaner =
        std::thread::spawn(move || retention::cleanup(&cleaner_store, 1_000, 100, false));
    for id in 1..=NODES {
        handle.enqueue(StoreOp::UpsertNode(NodeUpdate {
            long_name: Some(format!("fresh{}", id)),
            last_seen: Some(5_000),
            ..NodeUpdate::new(id)
        }));
    }
    handle.shutdown();
    let stats = worker.await.unwrap();
    cleaner.join().unwrap().unwrap();
    assert_eq!(stats.failed, 0);

    let lost: Vec<u32> = fx
        .store
        .nodes()
        .unwrap()
        .into_iter()
        .filter(|n| n.last_seen != Some(5_000) || n.long_name != Some(format!("fresh{}", n.id)))
        .map(|n| n.id)
        .collect();
    assert!(lost.is_empty(), "updates overwritten for {:?}", lost);
}
