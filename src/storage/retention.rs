//! Retention cleanup: prune raw rows older than a cutoff.
//!
//! Deletes run in bounded chunks with a flush after each one so a long cleanup never holds
//! up the persistence worker for long. Node rows are kept; only their `last_seen` is
//! cleared once it falls behind the cutoff.

use log::{debug, info};
use serde::Serialize;
use sled::IVec;

use super::{key_time, NodeRecord, SledStore, StoreError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cutoff: i64,
    pub dry_run: bool,
    /// Rows removed (or that would be removed) per tree, in a fixed order.
    pub deleted: Vec<(String, usize)>,
    pub nodes_cleared: usize,
}

impl CleanupReport {
    pub fn total_deleted(&self) -> usize {
        self.deleted.iter().map(|(_, n)| n).sum()
    }
}

/// Cutoff for "keep the last `days` days" relative to `now`.
pub fn cutoff_for_days(now: i64, days: u32) -> i64 {
    now - i64::from(days) * 86_400
}

fn is_stale(record: &NodeRecord, cutoff: i64) -> bool {
    matches!(record.last_seen, Some(ts) if ts < cutoff)
}

/// Clear `last_seen` on one node without clobbering a concurrent upsert. The persistence
/// worker may rewrite the record between our read and write; on a swap conflict the
/// current value is re-checked and left alone once it is no longer stale.
fn clear_last_seen(
    nodes: &sled::Tree,
    key: &IVec,
    mut current: IVec,
    cutoff: i64,
) -> Result<bool, StoreError> {
    loop {
        let mut record: NodeRecord = bincode::deserialize(&current)?;
        if !is_stale(&record, cutoff) {
            return Ok(false);
        }
        record.last_seen = None;
        let proposed = bincode::serialize(&record)?;
        match nodes.compare_and_swap(key, Some(&current), Some(proposed))? {
            Ok(()) => return Ok(true),
            Err(conflict) => match conflict.current {
                Some(latest) => {
                    debug!("retention: node record changed underneath, re-checking");
                    current = latest;
                }
                None => return Ok(false),
            },
        }
    }
}

/// Delete rows with `timestamp < cutoff` from the time-keyed trees.
pub fn cleanup(
    store: &SledStore,
    cutoff: i64,
    batch_size: usize,
    dry_run: bool,
) -> Result<CleanupReport, StoreError> {
    let batch_size = batch_size.max(1);
    let mut report = CleanupReport {
        cutoff,
        dry_run,
        ..Default::default()
    };

    for (name, tree) in store.timed_trees() {
        let mut removed = 0usize;
        loop {
            let mut chunk = Vec::with_capacity(batch_size.min(1024));
            for entry in tree.iter().keys() {
                let key = entry?;
                if key_time(&key, name)? >= cutoff {
                    break;
                }
                chunk.push(key);
                // Dry runs never delete, so the whole stale range has to be counted in one pass.
                if !dry_run && chunk.len() >= batch_size {
                    break;
                }
            }
            if chunk.is_empty() {
                break;
            }
            removed += chunk.len();
            if dry_run {
                break;
            }
            let mut batch = sled::Batch::default();
            for key in chunk {
                batch.remove(key);
            }
            tree.apply_batch(batch)?;
            tree.flush()?;
            debug!("retention: {} chunk done ({} so far)", name, removed);
        }
        report.deleted.push((name.to_string(), removed));
    }

    let nodes = store.nodes_tree();
    for entry in nodes.iter() {
        let (key, value) = entry?;
        let record: NodeRecord = bincode::deserialize(&value)?;
        if !is_stale(&record, cutoff) {
            continue;
        }
        if dry_run || clear_last_seen(nodes, &key, value, cutoff)? {
            report.nodes_cleared += 1;
        }
    }
    if !dry_run {
        nodes.flush()?;
    }

    info!(
        "retention{}: cutoff={} deleted={} nodes_cleared={}",
        if dry_run { " (dry run)" } else { "" },
        cutoff,
        report.total_deleted(),
        report.nodes_cleared
    );
    Ok(report)
}
