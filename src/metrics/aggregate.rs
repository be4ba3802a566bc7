//! Per-partition running state and its immutable snapshot form.
//!
//! A [`LiveAggregate`] owns everything recorded for one dimension value:
//! the bucketized throughput, bucket-less per-host / per-client totals,
//! per-client request windows, and the retained samples that feed the
//! finalized request distributions. [`Aggregate`] is the read-only shape
//! published in snapshots and serialized to JSON.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::requests::{
    is_multi_sized, multi_sized, single_sized, Detail, MultiSizedRequests, ReqSample,
    SingleSizedRequests,
};
use super::throughput::{LiveThroughput, Throughput, ThroughputAccum};
use super::windows::{LiveRequests, RequestSegment};
use super::Operation;

// ─── Configuration ───────────────────────────────────────────────

/// How many error strings are captured verbatim.
pub(crate) const ERRORS_KEPT: usize = 10;

// ─── Live state ──────────────────────────────────────────────────

/// Running aggregate for one partition. Exclusively owned by the ingest
/// task until finalization.
#[derive(Debug, Clone, Default)]
pub struct LiveAggregate {
    lt: LiveThroughput,
    by_host: HashMap<String, ThroughputAccum>,
    by_client: HashMap<String, ThroughputAccum>,
    windows: HashMap<String, LiveRequests>,
    /// Single/multi-sized decision, made once and reused for the lifetime
    /// of this aggregate.
    multi_sized: Option<bool>,
    /// Compact per-op records retained for the finalized distributions.
    samples: Vec<ReqSample>,
    threads: HashSet<(String, u32)>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    total_requests: u64,
    total_objects: u64,
    total_bytes: u64,
    total_errors: u64,
    first_errors: Vec<String>,
    finalized: bool,
}

impl LiveAggregate {
    /// Record one operation. A no-op once the aggregate is finalized.
    pub fn add(&mut self, op: &Operation) {
        if self.finalized {
            warn!(op_type = %op.op_type, "operation after finalize, ignored");
            return;
        }

        self.total_requests += 1;
        self.total_objects += op.obj_per_op as u64;
        self.total_bytes += op.size.max(0) as u64;
        if op.is_err() {
            self.total_errors += 1;
            if self.first_errors.len() < ERRORS_KEPT {
                self.first_errors.push(op.err.clone());
            }
        }

        self.start_time = Some(match self.start_time {
            Some(s) if s <= op.start => s,
            _ => op.start,
        });
        self.end_time = Some(match self.end_time {
            Some(e) if e >= op.end => e,
            _ => op.end,
        });

        self.lt.add(op);
        self.by_host.entry(op.endpoint.clone()).or_default().add(op);
        self.by_client.entry(op.client_id.clone()).or_default().add(op);
        self.threads.insert((op.client_id.clone(), op.thread));

        let sample = ReqSample::from_op(op);
        self.windows
            .entry(op.client_id.clone())
            .or_default()
            .add(sample.clone(), &mut self.multi_sized);
        self.samples.push(sample);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests
    }

    /// Point-in-time snapshot: the bucket sequence becomes an immutable
    /// [`Throughput`], sub-maps are copied, closed request windows are
    /// flattened. The full request distributions are finalize-only.
    pub fn update(&self) -> Aggregate {
        Aggregate {
            merged_entries: 1,
            total_requests: self.total_requests,
            total_objects: self.total_objects,
            total_bytes: self.total_bytes,
            total_errors: self.total_errors,
            concurrency: self.threads.len(),
            start_time: self.start_time,
            end_time: self.end_time,
            throughput: self.lt.as_throughput(),
            throughput_by_host: self
                .by_host
                .iter()
                .map(|(k, v)| (k.clone(), v.as_throughput()))
                .collect(),
            throughput_by_client: self
                .by_client
                .iter()
                .map(|(k, v)| (k.clone(), v.as_throughput()))
                .collect(),
            request_segments: self.request_segments(),
            single_sized_requests: None,
            multi_sized_requests: None,
            first_errors: self.first_errors.clone(),
        }
    }

    /// One-way transition into the immutable final shape: the open request
    /// windows are condensed, the full distributions are computed from the
    /// retained samples, and later `add` calls become no-ops.
    pub fn finalize(&mut self) -> Aggregate {
        if !self.finalized {
            if self.lt.dropped_ops() > 0 {
                debug!(
                    dropped = self.lt.dropped_ops(),
                    "operations started before the bucket origin and were never bucketized"
                );
            }
            let mut multi = self.multi_sized;
            for ring in self.windows.values_mut() {
                ring.finalize(&mut multi);
            }
            self.multi_sized = multi;
            self.finalized = true;
        }

        let mut agg = self.update();
        if !self.samples.is_empty() {
            let is_multi = self
                .multi_sized
                .unwrap_or_else(|| is_multi_sized(&self.samples));
            if is_multi {
                agg.multi_sized_requests = multi_sized(&self.samples, Detail::Full);
            } else {
                agg.single_sized_requests = single_sized(&self.samples, Detail::Full);
            }
        }
        agg
    }

    /// Flatten every client's closed windows into one time-ordered sequence.
    fn request_segments(&self) -> Vec<RequestSegment> {
        let mut segs: Vec<RequestSegment> = Vec::new();
        for (client, ring) in &self.windows {
            for seg in ring.segments() {
                let mut seg = seg.clone();
                seg.client_id = client.clone();
                segs.push(seg);
            }
        }
        segs.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        segs
    }
}

// ─── Snapshot ────────────────────────────────────────────────────

/// Immutable per-partition snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Number of sources merged into this aggregate; 1 for a fresh one.
    pub merged_entries: u32,
    pub total_requests: u64,
    pub total_objects: u64,
    pub total_bytes: u64,
    pub total_errors: u64,
    /// Distinct `(client, thread)` pairs observed.
    pub concurrency: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub throughput: Throughput,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub throughput_by_host: BTreeMap<String, Throughput>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub throughput_by_client: BTreeMap<String, Throughput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub request_segments: Vec<RequestSegment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_sized_requests: Option<SingleSizedRequests>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_sized_requests: Option<MultiSizedRequests>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub first_errors: Vec<String>,
}

impl Aggregate {
    /// Element-wise merge of another snapshot into this one. A source with
    /// zero operations is a no-op; merging into an empty aggregate adopts
    /// the source wholesale.
    pub fn merge(&mut self, other: &Aggregate) {
        if other.total_requests == 0 {
            return;
        }
        if self.total_requests == 0 {
            *self = other.clone();
            return;
        }

        self.merged_entries += other.merged_entries;
        self.total_requests += other.total_requests;
        self.total_objects += other.total_objects;
        self.total_bytes += other.total_bytes;
        self.total_errors += other.total_errors;
        self.concurrency += other.concurrency;

        self.start_time = match (self.start_time, other.start_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.end_time = match (self.end_time, other.end_time) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        self.throughput.merge(&other.throughput);
        for (k, v) in &other.throughput_by_host {
            match self.throughput_by_host.get_mut(k) {
                Some(mine) => mine.merge(v),
                None => {
                    self.throughput_by_host.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, v) in &other.throughput_by_client {
            match self.throughput_by_client.get_mut(k) {
                Some(mine) => mine.merge(v),
                None => {
                    self.throughput_by_client.insert(k.clone(), v.clone());
                }
            }
        }

        self.request_segments
            .extend(other.request_segments.iter().cloned());
        self.request_segments.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });

        match (&mut self.single_sized_requests, &other.single_sized_requests) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, Some(theirs)) => self.single_sized_requests = Some(theirs.clone()),
            _ => {}
        }
        match (&mut self.multi_sized_requests, &other.multi_sized_requests) {
            (Some(mine), Some(theirs)) => mine.merge(theirs),
            (None, Some(theirs)) => self.multi_sized_requests = Some(theirs.clone()),
            _ => {}
        }

        for err in &other.first_errors {
            if self.first_errors.len() >= ERRORS_KEPT {
                break;
            }
            self.first_errors.push(err.clone());
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::testutil::op_at;
    use super::*;

    fn op_for(endpoint: &str, client: &str, offset_ms: i64, size: i64) -> Operation {
        let mut op = op_at(offset_ms, 100, size);
        op.endpoint = endpoint.to_owned();
        op.client_id = client.to_owned();
        op
    }

    #[test]
    fn totals_match_host_and_client_sums() {
        let mut agg = LiveAggregate::default();
        for i in 0..30i64 {
            let host = if i % 2 == 0 { "host-a" } else { "host-b" };
            let client = if i % 3 == 0 { "c1" } else { "c2" };
            agg.add(&op_for(host, client, i * 100, 1024));
        }
        let snap = agg.update();
        assert_eq!(snap.total_requests, 30);
        let by_host: u64 = snap
            .throughput_by_host
            .values()
            .map(|t| t.operations)
            .sum();
        let by_client: u64 = snap
            .throughput_by_client
            .values()
            .map(|t| t.operations)
            .sum();
        assert_eq!(by_host, snap.total_requests);
        assert_eq!(by_client, snap.total_requests);
    }

    #[test]
    fn first_errors_are_capped() {
        let mut agg = LiveAggregate::default();
        for i in 0..25i64 {
            let mut op = op_at(i * 100, 10, 0);
            op.err = format!("error {i}");
            agg.add(&op);
        }
        let snap = agg.update();
        assert_eq!(snap.total_errors, 25);
        assert_eq!(snap.first_errors.len(), ERRORS_KEPT);
        assert_eq!(snap.first_errors[0], "error 0");
        assert_eq!(snap.first_errors[9], "error 9");
    }

    #[test]
    fn concurrency_counts_distinct_threads() {
        let mut agg = LiveAggregate::default();
        for i in 0..20u32 {
            let mut op = op_at(i as i64 * 50, 10, 100);
            op.thread = i % 4;
            agg.add(&op);
        }
        assert_eq!(agg.update().concurrency, 4);
    }

    #[test]
    fn add_after_finalize_changes_nothing() {
        let mut agg = LiveAggregate::default();
        for sec in 0..10i64 {
            agg.add(&op_at(sec * 1000, 100, 1 << 20));
        }
        let final_snap = agg.finalize();
        agg.add(&op_at(11_000, 100, 1 << 20));
        let after = agg.finalize();
        assert_eq!(final_snap, after);
        assert_eq!(after.total_requests, 10);
    }

    #[test]
    fn finalize_materializes_full_distributions() {
        let mut agg = LiveAggregate::default();
        for sec in 0..12i64 {
            agg.add(&op_at(sec * 1000, 100, 1 << 20));
        }
        let live = agg.update();
        assert!(live.single_sized_requests.is_none());
        let snap = agg.finalize();
        let reqs = snap.single_sized_requests.expect("single-sized population");
        assert_eq!(reqs.requests, 12);
        assert!(reqs.dur_percentiles_millis.is_some());
        // The open window was condensed too.
        assert!(!snap.request_segments.is_empty());
        assert!(snap.request_segments.iter().all(|s| !s.skipped));
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let mut agg = LiveAggregate::default();
        for sec in 0..8i64 {
            agg.add(&op_at(sec * 1000, 100, 4096));
        }
        let a = agg.finalize();

        let mut left = Aggregate::default();
        left.merge(&a);
        assert_eq!(left, a);

        let mut right = a.clone();
        right.merge(&Aggregate::default());
        assert_eq!(right, a);
    }

    #[test]
    fn merge_disjoint_time_ranges_is_additive() {
        let mut one = LiveAggregate::default();
        let mut two = LiveAggregate::default();
        for sec in 0..10i64 {
            one.add(&op_for("host-a", "c1", sec * 1000, 1000));
            two.add(&op_for("host-b", "c2", 60_000 + sec * 1000, 3000));
        }
        let a = one.finalize();
        let b = two.finalize();

        let mut merged = a.clone();
        merged.merge(&b);
        assert_eq!(merged.total_requests, 20);
        assert_eq!(merged.total_bytes, 10 * 1000 + 10 * 3000);
        assert_eq!(merged.merged_entries, 2);
        assert_eq!(merged.start_time, a.start_time);
        assert_eq!(merged.end_time, b.end_time);
        assert_eq!(merged.throughput_by_host.len(), 2);
        assert_eq!(merged.throughput_by_client.len(), 2);

        let mut flipped = b.clone();
        flipped.merge(&a);
        assert_eq!(flipped.total_bytes, merged.total_bytes);
        assert_eq!(flipped.start_time, merged.start_time);
        assert_eq!(flipped.end_time, merged.end_time);
        assert_eq!(
            flipped.throughput.segmented.as_ref().map(|s| s.segments.len()),
            merged.throughput.segmented.as_ref().map(|s| s.segments.len())
        );
    }
}
