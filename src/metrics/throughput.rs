//! Segmented-throughput model: one-second wall-clock buckets.
//!
//! Each completed operation is apportioned across the buckets its duration
//! spans. Whole-op counters (started/ended/errors/duration sums) stick to a
//! single bucket; the fractional op/object/byte figures are split by
//! nanosecond overlap so a multi-second transfer contributes to every second
//! it was actually in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{nanos_of, nanos_to_millis, Operation};

// ─── Configuration ───────────────────────────────────────────────

/// Buckets discarded from each end of the sequence when producing a
/// snapshot. The endpoints of a run contain ramp artifacts.
pub(crate) const SEGMENT_TRIM: usize = 2;

/// Wall-clock width of one bucket.
pub(crate) const SEGMENT_DUR_MILLIS: u64 = 1_000;

const SEGMENT_NANOS: i128 = 1_000_000_000;

// ─── Live bucket state ───────────────────────────────────────────

/// Running totals for one wall-clock second.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Bucket {
    /// Fractional operation count apportioned into this second.
    pub ops: f64,
    pub objs: f64,
    pub bytes: f64,
    /// Operations whose start lies in this second.
    pub ops_started: u64,
    /// Operations whose end lies in this second.
    pub ops_ended: u64,
    /// Operations entirely within this second.
    pub full_ops: u64,
    /// Operations spanning this second but not wholly contained.
    pub partial_ops: u64,
    /// Errors, attributed to the start bucket.
    pub errors: u64,
    /// Request-duration sum, attributed to the start bucket only.
    pub req_dur_nanos: u64,
    /// TTFB sum, attributed to the start bucket only.
    pub ttfb_nanos: u64,
}

/// Contiguous sequence of one-second buckets, anchored at the unix second
/// of the first operation seen.
#[derive(Debug, Clone, Default)]
pub(crate) struct LiveThroughput {
    origin_sec: Option<i64>,
    buckets: Vec<Bucket>,
    /// Operations silently dropped because they started before the origin.
    dropped_ops: u64,
}

impl LiveThroughput {
    /// Record one operation into the bucket sequence.
    ///
    /// The first call fixes the origin second. Operations starting before
    /// the origin are dropped — shifting the origin would retroactively
    /// relabel every bucket — so ingest ordering must keep the earliest
    /// operation first.
    pub fn add(&mut self, op: &Operation) {
        let start_sec = op.start.timestamp();
        let origin = *self.origin_sec.get_or_insert(start_sec);
        if start_sec < origin {
            self.dropped_ops += 1;
            trace!(
                op_type = %op.op_type,
                start_sec,
                origin,
                "operation starts before bucket origin, dropped from throughput"
            );
            return;
        }

        let end_sec = op.end.timestamp().max(start_sec);
        let start_idx = (start_sec - origin) as usize;
        let last_idx = (end_sec - origin) as usize;
        if self.buckets.len() <= last_idx {
            self.buckets.resize(last_idx + 1, Bucket::default());
        }

        let d_nanos = (nanos_of(op.end) - nanos_of(op.start)).max(0) as u64;

        {
            let b = &mut self.buckets[start_idx];
            b.ops_started += 1;
            if op.is_err() {
                b.errors += 1;
            }
            b.req_dur_nanos += d_nanos;
            b.ttfb_nanos += op.ttfb.as_nanos() as u64;
        }
        self.buckets[last_idx].ops_ended += 1;

        if start_idx == last_idx {
            // Entirely within one second (including zero-duration ops).
            let b = &mut self.buckets[start_idx];
            b.full_ops += 1;
            b.ops += 1.0;
            b.objs += op.obj_per_op as f64;
            b.bytes += op.size as f64;
            return;
        }

        // Spans buckets: apportion by nanosecond overlap with each second.
        let op_start = nanos_of(op.start);
        let op_end = nanos_of(op.end);
        let origin_nanos = origin as i128 * SEGMENT_NANOS;
        for idx in start_idx..=last_idx {
            let bucket_start = origin_nanos + idx as i128 * SEGMENT_NANOS;
            let bucket_end = bucket_start + SEGMENT_NANOS;
            let overlap = op_end.min(bucket_end) - op_start.max(bucket_start);
            if overlap <= 0 {
                // End landed exactly on this bucket's boundary.
                continue;
            }
            let fraction = overlap as f64 / d_nanos as f64;
            let b = &mut self.buckets[idx];
            b.partial_ops += 1;
            b.ops += fraction;
            b.objs += fraction * op.obj_per_op as f64;
            b.bytes += fraction * op.size as f64;
        }
    }

    /// Operations that could not be bucketized because they started
    /// before the origin second.
    pub fn dropped_ops(&self) -> u64 {
        self.dropped_ops
    }

    #[cfg(test)]
    pub(crate) fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Immutable snapshot with the warm-up and cool-down buckets trimmed.
    /// Zero-valued when fewer than `2 * SEGMENT_TRIM + 1` buckets exist.
    pub fn as_throughput(&self) -> Throughput {
        let n = self.buckets.len();
        let origin = match self.origin_sec {
            Some(o) if n > 2 * SEGMENT_TRIM => o,
            _ => return Throughput::default(),
        };

        let trimmed = &self.buckets[SEGMENT_TRIM..n - SEGMENT_TRIM];
        let mut segments = Vec::with_capacity(trimmed.len());
        for (i, b) in trimmed.iter().enumerate() {
            let sec = origin + (SEGMENT_TRIM + i) as i64;
            let req_avg_millis = if b.ops_started > 0 {
                b.req_dur_nanos as f64 / b.ops_started as f64 / 1e6
            } else {
                0.0
            };
            segments.push(Segment {
                start: DateTime::from_timestamp(sec, 0).unwrap_or_default(),
                bps: b.bytes,
                ops: b.ops,
                objects: b.objs,
                errors: b.errors,
                ops_started: b.ops_started,
                ops_ended: b.ops_ended,
                full_ops: b.full_ops,
                partial_ops: b.partial_ops,
                req_avg_millis,
            });
        }

        let secs = segments.len() as f64;
        let bytes: f64 = segments.iter().map(|s| s.bps).sum();
        let ops: f64 = segments.iter().map(|s| s.ops).sum();
        let objects: f64 = segments.iter().map(|s| s.objects).sum();
        let operations: u64 = segments.iter().map(|s| s.ops_started).sum();
        let errors: u64 = segments.iter().map(|s| s.errors).sum();
        let (sorted_by, fastest, median, slowest) = select_extremes(&segments);

        let start_time = segments[0].start;
        let end_time = segments[segments.len() - 1].start + chrono::Duration::seconds(1);
        Throughput {
            operations,
            objects,
            bytes,
            errors,
            start_time,
            end_time,
            measure_duration_millis: segments.len() as u64 * SEGMENT_DUR_MILLIS,
            average_bps: bytes / secs,
            average_ops: ops / secs,
            segmented: Some(ThroughputSegmented {
                sorted_by,
                segment_duration_millis: SEGMENT_DUR_MILLIS,
                segments,
                fastest,
                median,
                slowest,
            }),
        }
    }
}

// ─── Bucket-less accumulator ─────────────────────────────────────

/// Per-host / per-client running totals. Same output shape as the
/// bucketized path but keeps no per-second state.
#[derive(Debug, Clone, Default)]
pub(crate) struct ThroughputAccum {
    pub operations: u64,
    pub objects: u64,
    pub bytes: u64,
    pub errors: u64,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl ThroughputAccum {
    pub fn add(&mut self, op: &Operation) {
        self.operations += 1;
        self.objects += op.obj_per_op as u64;
        self.bytes += op.size.max(0) as u64;
        if op.is_err() {
            self.errors += 1;
        }
        self.start = Some(match self.start {
            Some(s) if s <= op.start => s,
            _ => op.start,
        });
        self.end = Some(match self.end {
            Some(e) if e >= op.end => e,
            _ => op.end,
        });
    }

    pub fn as_throughput(&self) -> Throughput {
        let (start, end) = match (self.start, self.end) {
            (Some(s), Some(e)) => (s, e),
            _ => return Throughput::default(),
        };
        let dur_nanos = (nanos_of(end) - nanos_of(start)).max(0) as u64;
        let secs = dur_nanos as f64 / 1e9;
        let (average_bps, average_ops) = if secs > 0.0 {
            (self.bytes as f64 / secs, self.operations as f64 / secs)
        } else {
            (0.0, 0.0)
        };
        Throughput {
            operations: self.operations,
            objects: self.objects as f64,
            bytes: self.bytes as f64,
            errors: self.errors,
            start_time: start,
            end_time: end,
            measure_duration_millis: nanos_to_millis(dur_nanos),
            average_bps,
            average_ops,
            segmented: None,
        }
    }
}

// ─── Snapshot types ──────────────────────────────────────────────

/// One retained per-second sample in a published snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: DateTime<Utc>,
    /// Bytes per second moved during this second (fractionally apportioned).
    pub bps: f64,
    /// Fractional operations in flight during this second.
    pub ops: f64,
    pub objects: f64,
    pub errors: u64,
    pub ops_started: u64,
    pub ops_ended: u64,
    pub full_ops: u64,
    pub partial_ops: u64,
    /// Mean request duration of the operations started this second.
    pub req_avg_millis: f64,
}

/// The retained per-second samples plus the extremes selected by sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSegmented {
    /// `"bps"` when any retained second moved bytes, else `"ops"`.
    pub sorted_by: String,
    pub segment_duration_millis: u64,
    pub segments: Vec<Segment>,
    pub fastest: Segment,
    pub median: Segment,
    pub slowest: Segment,
}

/// Immutable throughput summary. Bucketized sources carry `segmented`;
/// per-host and per-client sub-aggregates do not.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Throughput {
    pub operations: u64,
    pub objects: f64,
    pub bytes: f64,
    pub errors: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub measure_duration_millis: u64,
    pub average_bps: f64,
    pub average_ops: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segmented: Option<ThroughputSegmented>,
}

impl Throughput {
    pub fn is_empty(&self) -> bool {
        self.operations == 0 && self.measure_duration_millis == 0 && self.segmented.is_none()
    }

    /// Combine another source into this one. Buckets with equal unix-second
    /// start times are summed; unmatched buckets slot in by time. The
    /// earlier origin wins the merged start.
    pub fn merge(&mut self, other: &Throughput) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() {
            *self = other.clone();
            return;
        }

        self.operations += other.operations;
        self.objects += other.objects;
        self.bytes += other.bytes;
        self.errors += other.errors;
        self.start_time = self.start_time.min(other.start_time);
        self.end_time = self.end_time.max(other.end_time);

        let merged = match (self.segmented.take(), &other.segmented) {
            (Some(a), Some(b)) => Some(merge_segmented(a, b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b.clone()),
            (None, None) => None,
        };
        match merged {
            Some(seg) => {
                self.measure_duration_millis =
                    seg.segments.len() as u64 * seg.segment_duration_millis;
                let secs = self.measure_duration_millis as f64 / 1000.0;
                let bytes: f64 = seg.segments.iter().map(|s| s.bps).sum();
                let ops: f64 = seg.segments.iter().map(|s| s.ops).sum();
                if secs > 0.0 {
                    self.average_bps = bytes / secs;
                    self.average_ops = ops / secs;
                }
                self.segmented = Some(seg);
            }
            None => {
                let dur_nanos =
                    (nanos_of(self.end_time) - nanos_of(self.start_time)).max(0) as u64;
                self.measure_duration_millis = nanos_to_millis(dur_nanos);
                let secs = dur_nanos as f64 / 1e9;
                if secs > 0.0 {
                    self.average_bps = self.bytes / secs;
                    self.average_ops = self.operations as f64 / secs;
                }
            }
        }
    }
}

// ─── Selection and merging helpers ───────────────────────────────

/// Fastest/median/slowest selection over a non-empty segment sequence:
/// sort ascending by the primary metric, then pick indices
/// `n-1`, `n/2`, and `0`.
pub(crate) fn select_extremes(segments: &[Segment]) -> (String, Segment, Segment, Segment) {
    let by_bps = segments.iter().any(|s| s.bps > 0.0);
    let mut idx: Vec<usize> = (0..segments.len()).collect();
    idx.sort_by(|&a, &b| {
        if by_bps {
            segments[a].bps.total_cmp(&segments[b].bps)
        } else {
            segments[a].ops.total_cmp(&segments[b].ops)
        }
    });
    let n = idx.len();
    (
        if by_bps { "bps" } else { "ops" }.to_owned(),
        segments[idx[n - 1]].clone(),
        segments[idx[n / 2]].clone(),
        segments[idx[0]].clone(),
    )
}

fn sum_segments(a: &Segment, b: &Segment) -> Segment {
    let started = a.ops_started + b.ops_started;
    let req_avg_millis = if started > 0 {
        (a.req_avg_millis * a.ops_started as f64 + b.req_avg_millis * b.ops_started as f64)
            / started as f64
    } else {
        0.0
    };
    Segment {
        start: a.start,
        bps: a.bps + b.bps,
        ops: a.ops + b.ops,
        objects: a.objects + b.objects,
        errors: a.errors + b.errors,
        ops_started: started,
        ops_ended: a.ops_ended + b.ops_ended,
        full_ops: a.full_ops + b.full_ops,
        partial_ops: a.partial_ops + b.partial_ops,
        req_avg_millis,
    }
}

fn merge_segmented(a: ThroughputSegmented, b: &ThroughputSegmented) -> ThroughputSegmented {
    let mut segments = Vec::with_capacity(a.segments.len() + b.segments.len());
    let mut i = 0;
    let mut j = 0;
    while i < a.segments.len() && j < b.segments.len() {
        match a.segments[i].start.cmp(&b.segments[j].start) {
            std::cmp::Ordering::Less => {
                segments.push(a.segments[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                segments.push(b.segments[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                segments.push(sum_segments(&a.segments[i], &b.segments[j]));
                i += 1;
                j += 1;
            }
        }
    }
    segments.extend_from_slice(&a.segments[i..]);
    segments.extend_from_slice(&b.segments[j..]);

    let (sorted_by, fastest, median, slowest) = select_extremes(&segments);
    ThroughputSegmented {
        sorted_by,
        segment_duration_millis: a.segment_duration_millis,
        segments,
        fastest,
        median,
        slowest,
    }
}

// ─── Tests ───────────────────────────────────────────────────────
