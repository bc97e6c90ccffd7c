//! # Distillation - hourly and daily rollups
//!
//! Raw events are summarised into four tables kept in their own sled database
//! (`data/distilled`), so dashboards never scan the raw `messages` tree:
//!
//! ```text
//! hourly_message_counts   "YYYY-MM-DD HH:00|<type>" → u64
//! daily_message_counts    "YYYY-MM-DD|<type>"       → u64
//! hourly_unique_senders   "YYYY-MM-DD HH:00"        → UniqueSenders
//! daily_unique_senders    "YYYY-MM-DD"              → UniqueSenders
//! distill_state           "last_distilled_hour"     → i64
//! ```
//!
//! Every run reprocesses whole hours, so re-running a window or picking up late events
//! never double counts:
//! - an hour's count rows are replaced, not added to
//! - a day's count rows are recomputed as the sum of that day's hourly rows
//! - daily unique senders take the element-wise max of the hourly values
//!
//! Buckets are UTC.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::DateTime;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::storage::{EventRecord, SledStore, StoreError};

pub const HOUR_SECS: i64 = 3600;
/// 2025-01-01T00:00:00Z. Events stamped earlier come from nodes with unset clocks.
pub const DEFAULT_VALIDITY_FLOOR: i64 = 1_735_689_600;
pub const DEFAULT_HOURS_BACK: u32 = 2;

const TREE_HOURLY_COUNTS: &str = "hourly_message_counts";
const TREE_DAILY_COUNTS: &str = "daily_message_counts";
const TREE_HOURLY_UNIQUE: &str = "hourly_unique_senders";
const TREE_DAILY_UNIQUE: &str = "daily_unique_senders";
const TREE_STATE: &str = "distill_state";
const KEY_LAST_HOUR: &[u8] = b"last_distilled_hour";

pub fn hour_start(ts: i64) -> i64 {
    ts - ts.rem_euclid(HOUR_SECS)
}

fn format_utc(ts: i64, fmt: &str) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format(fmt).to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// `YYYY-MM-DD HH:00`
pub fn hour_bucket(ts: i64) -> String {
    format_utc(ts, "%Y-%m-%d %H:00")
}

/// `YYYY-MM-DD`
pub fn date_bucket(ts: i64) -> String {
    format_utc(ts, "%Y-%m-%d")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueSenders {
    pub senders: u64,
    pub physical_senders: u64,
}

impl UniqueSenders {
    fn max(self, other: UniqueSenders) -> UniqueSenders {
        UniqueSenders {
            senders: self.senders.max(other.senders),
            physical_senders: self.physical_senders.max(other.physical_senders),
        }
    }
}

/// Read side the engine needs from the raw store.
pub trait EventSource {
    /// Events with `start <= timestamp < end`.
    fn events_between(&self, start: i64, end: i64) -> Result<Vec<EventRecord>, StoreError>;
    fn earliest_event_since(&self, floor: i64) -> Result<Option<i64>, StoreError>;
}

impl EventSource for SledStore {
    fn events_between(&self, start: i64, end: i64) -> Result<Vec<EventRecord>, StoreError> {
        SledStore::events_between(self, start, end)
    }

    fn earliest_event_since(&self, floor: i64) -> Result<Option<i64>, StoreError> {
        SledStore::earliest_event_since(self, floor)
    }
}

/// Sled database holding the rollup tables.
#[derive(Clone)]
pub struct DistilledStore {
    db: sled::Db,
    hourly_counts: sled::Tree,
    daily_counts: sled::Tree,
    hourly_unique: sled::Tree,
    daily_unique: sled::Tree,
    state: sled::Tree,
}

impl DistilledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path_ref = path.as_ref();
        std::fs::create_dir_all(path_ref)?;
        let db = sled::open(path_ref)?;
        Ok(Self {
            hourly_counts: db.open_tree(TREE_HOURLY_COUNTS)?,
            daily_counts: db.open_tree(TREE_DAILY_COUNTS)?,
            hourly_unique: db.open_tree(TREE_HOURLY_UNIQUE)?,
            daily_unique: db.open_tree(TREE_DAILY_UNIQUE)?,
            state: db.open_tree(TREE_STATE)?,
            db,
        })
    }

    fn count_key(bucket: &str, kind: &str) -> Vec<u8> {
        format!("{}|{}", bucket, kind).into_bytes()
    }

    fn read_u64(bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[8 - n..].copy_from_slice(&bytes[bytes.len() - n..]);
        u64::from_be_bytes(buf)
    }

    /// Per-type counts stored under `prefix` (`"<bucket>|"`).
    fn counts_with_prefix(tree: &sled::Tree, bucket: &str) -> Result<BTreeMap<String, u64>, StoreError> {
        let prefix = format!("{}|", bucket);
        let mut out = BTreeMap::new();
        for entry in tree.scan_prefix(prefix.as_bytes()) {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key);
            if let Some(kind) = key.strip_prefix(&prefix) {
                out.insert(kind.to_string(), Self::read_u64(&value));
            }
        }
        Ok(out)
    }

    fn replace_counts(
        tree: &sled::Tree,
        bucket: &str,
        counts: &BTreeMap<String, u64>,
    ) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for entry in tree.scan_prefix(format!("{}|", bucket).as_bytes()) {
            let (key, _) = entry?;
            batch.remove(key);
        }
        for (kind, count) in counts {
            batch.insert(Self::count_key(bucket, kind), &count.to_be_bytes()[..]);
        }
        tree.apply_batch(batch)?;
        Ok(())
    }

    pub fn hourly_counts(&self, hour: &str) -> Result<BTreeMap<String, u64>, StoreError> {
        Self::counts_with_prefix(&self.hourly_counts, hour)
    }

    pub fn daily_counts(&self, date: &str) -> Result<BTreeMap<String, u64>, StoreError> {
        Self::counts_with_prefix(&self.daily_counts, date)
    }

    fn read_unique(tree: &sled::Tree, bucket: &str) -> Result<Option<UniqueSenders>, StoreError> {
        match tree.get(bucket.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn hourly_unique(&self, hour: &str) -> Result<Option<UniqueSenders>, StoreError> {
        Self::read_unique(&self.hourly_unique, hour)
    }

    pub fn daily_unique(&self, date: &str) -> Result<Option<UniqueSenders>, StoreError> {
        Self::read_unique(&self.daily_unique, date)
    }

    pub fn last_distilled_hour(&self) -> Result<Option<i64>, StoreError> {
        match self.state.get(KEY_LAST_HOUR)? {
            Some(bytes) => Ok(Some(Self::read_u64(&bytes) as i64)),
            None => Ok(None),
        }
    }

    fn set_last_distilled_hour(&self, hour: i64) -> Result<(), StoreError> {
        self.state.insert(KEY_LAST_HOUR, &(hour as u64).to_be_bytes()[..])?;
        self.state.flush()?;
        Ok(())
    }

    /// Number of hourly and daily count rows, for `status`.
    pub fn row_counts(&self) -> (usize, usize) {
        (self.hourly_counts.len(), self.daily_counts.len())
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistillOptions {
    pub hours_back: u32,
    pub validity_floor: i64,
}

impl Default for DistillOptions {
    fn default() -> Self {
        Self {
            hours_back: DEFAULT_HOURS_BACK,
            validity_floor: DEFAULT_VALIDITY_FLOOR,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DistillReport {
    pub first_hour: Option<String>,
    pub last_hour: Option<String>,
    pub buckets: usize,
    pub events: usize,
}

pub struct DistillationEngine<S: EventSource> {
    source: S,
    dest: DistilledStore,
    options: DistillOptions,
}

impl<S: EventSource> DistillationEngine<S> {
    pub fn new(source: S, dest: DistilledStore, options: DistillOptions) -> Self {
        Self {
            source,
            dest,
            options,
        }
    }

    pub fn dest(&self) -> &DistilledStore {
        &self.dest
    }

    /// Scheduled entry point. The first run (no recorded state) starts at the earliest
    /// valid event. Later runs start at the recorded hour or `hours_back` hours before the
    /// current one, whichever is earlier, so a gap between runs is caught up and late
    /// arrivals are picked up. Hours before the recorded mark are only revisited through
    /// [`run_window`](Self::run_window).
    pub fn run(&self, now: i64) -> Result<DistillReport, StoreError> {
        let current_hour = hour_start(now);
        let start = match self.dest.last_distilled_hour()? {
            Some(last) => last.min(current_hour - i64::from(self.options.hours_back) * HOUR_SECS),
            None => match self.source.earliest_event_since(self.options.validity_floor)? {
                Some(ts) => {
                    info!("distill: no previous state, starting at {}", hour_bucket(ts));
                    ts
                }
                None => {
                    info!("distill: no valid events yet");
                    return Ok(DistillReport::default());
                }
            },
        };
        let report = self.run_window(start, now)?;
        self.dest.set_last_distilled_hour(current_hour)?;
        Ok(report)
    }

    /// Process every hour from the one containing `start` through the one containing
    /// `now`, inclusive.
    pub fn run_window(&self, start: i64, now: i64) -> Result<DistillReport, StoreError> {
        let first = hour_start(start);
        let last = hour_start(now);
        let mut report = DistillReport::default();
        let mut hour = first;
        while hour <= last {
            report.events += self.process_hour(hour)?;
            report.buckets += 1;
            hour += HOUR_SECS;
        }
        if report.buckets > 0 {
            report.first_hour = Some(hour_bucket(first));
            report.last_hour = Some(hour_bucket(last));
        }
        self.dest.flush()?;
        info!(
            "distill: {} hour(s) {}..{} ({} events)",
            report.buckets,
            report.first_hour.as_deref().unwrap_or("-"),
            report.last_hour.as_deref().unwrap_or("-"),
            report.events
        );
        Ok(report)
    }

    fn process_hour(&self, hour: i64) -> Result<usize, StoreError> {
        let hour_key = hour_bucket(hour);
        let date_key = date_bucket(hour);
        let from = hour.max(self.options.validity_floor);
        let events = self.source.events_between(from, hour + HOUR_SECS)?;

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut senders = HashSet::new();
        let mut physical = HashSet::new();
        for event in &events {
            *counts.entry(event.kind.as_str().to_string()).or_default() += 1;
            senders.insert(event.sender);
            physical.insert(event.physical_sender);
        }

        DistilledStore::replace_counts(&self.dest.hourly_counts, &hour_key, &counts)?;

        let mut daily: BTreeMap<String, u64> = BTreeMap::new();
        for entry in self
            .dest
            .hourly_counts
            .scan_prefix(format!("{} ", date_key).as_bytes())
        {
            let (key, value) = entry?;
            let key = String::from_utf8_lossy(&key);
            if let Some((_, kind)) = key.split_once('|') {
                *daily.entry(kind.to_string()).or_default() += DistilledStore::read_u64(&value);
            }
        }
        DistilledStore::replace_counts(&self.dest.daily_counts, &date_key, &daily)?;

        let unique = UniqueSenders {
            senders: senders.len() as u64,
            physical_senders: physical.len() as u64,
        };
        self.dest
            .hourly_unique
            .insert(hour_key.as_bytes(), bincode::serialize(&unique)?)?;
        let merged = DistilledStore::read_unique(&self.dest.daily_unique, &date_key)?
            .map(|prev| prev.max(unique))
            .unwrap_or(unique);
        self.dest
            .daily_unique
            .insert(date_key.as_bytes(), bincode::serialize(&merged)?)?;

        debug!(
            "distill {}: {} events, {} senders, {} physical",
            hour_key,
            events.len(),
            unique.senders,
            unique.physical_senders
        );
        Ok(events.len())
    }
}
