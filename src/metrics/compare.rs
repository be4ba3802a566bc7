//! Before/after comparison of two finalized aggregates.
//!
//! Both sides must be clean (zero errors) and carry segmented throughput;
//! anything else is a structured error, never a partial comparison.

use serde::Serialize;

use super::aggregate::Aggregate;
use super::requests::{SingleSizedRequests, Ttfb};
use super::throughput::Segment;

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    /// Comparisons require clean runs on both sides.
    #[error("{side} aggregate recorded {count} error(s)")]
    HasErrors { side: &'static str, count: u64 },
    #[error("{side} aggregate has no segmented throughput")]
    NoSegments { side: &'static str },
}

// ─── Result shape ────────────────────────────────────────────────

/// Throughput difference at one matched percentile segment.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SegmentDiff {
    pub before_bps: f64,
    pub after_bps: f64,
    pub bps_diff: f64,
    pub before_ops: f64,
    pub after_ops: f64,
    pub ops_diff: f64,
}

impl SegmentDiff {
    fn between(before: &Segment, after: &Segment) -> Self {
        Self {
            before_bps: before.bps,
            after_bps: after.bps,
            bps_diff: after.bps - before.bps,
            before_ops: before.ops,
            after_ops: after.ops,
            ops_diff: after.ops - before.ops,
        }
    }
}

/// Per-request duration differences, milliseconds, after minus before.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RequestsDiff {
    pub avg_millis: f64,
    pub best_millis: f64,
    pub worst_millis: f64,
    pub std_dev_millis: f64,
    pub p50_millis: f64,
    pub p90_millis: f64,
    pub p99_millis: f64,
}

/// TTFB differences, milliseconds, after minus before.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TtfbDiff {
    pub average_millis: f64,
    pub fastest_millis: f64,
    pub median_millis: f64,
    pub p99_millis: f64,
    pub slowest_millis: f64,
}

/// Full diff of two finalized runs of the same operation type.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Comparison {
    pub op_type: String,
    pub before_operations: u64,
    pub after_operations: u64,
    /// Measured-interval change in milliseconds.
    pub duration_diff_millis: i64,
    pub average_bps_diff: f64,
    pub average_ops_diff: f64,
    pub fastest: SegmentDiff,
    pub median: SegmentDiff,
    pub slowest: SegmentDiff,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<RequestsDiff>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttfb: Option<TtfbDiff>,
}

// ─── Compare ─────────────────────────────────────────────────────

/// Diff `after` against `before` for one operation type.
pub fn compare(
    op_type: &str,
    before: &Aggregate,
    after: &Aggregate,
) -> Result<Comparison, CompareError> {
    check_side("before", before)?;
    check_side("after", after)?;

    let (b_fast, b_med, b_slow) = extremes_by_ops(before)?;
    let (a_fast, a_med, a_slow) = extremes_by_ops(after)?;

    let requests = match (
        &before.single_sized_requests,
        &after.single_sized_requests,
    ) {
        (Some(b), Some(a)) => Some(requests_diff(b, a)),
        _ => None,
    };
    let ttfb = match (
        before.single_sized_requests.as_ref().and_then(|r| r.first_byte.as_ref()),
        after.single_sized_requests.as_ref().and_then(|r| r.first_byte.as_ref()),
    ) {
        (Some(b), Some(a)) => Some(ttfb_diff(b, a)),
        _ => None,
    };

    Ok(Comparison {
        op_type: op_type.to_owned(),
        before_operations: before.total_requests,
        after_operations: after.total_requests,
        duration_diff_millis: after.throughput.measure_duration_millis as i64
            - before.throughput.measure_duration_millis as i64,
        average_bps_diff: after.throughput.average_bps - before.throughput.average_bps,
        average_ops_diff: after.throughput.average_ops - before.throughput.average_ops,
        fastest: SegmentDiff::between(&b_fast, &a_fast),
        median: SegmentDiff::between(&b_med, &a_med),
        slowest: SegmentDiff::between(&b_slow, &a_slow),
        requests,
        ttfb,
    })
}

fn check_side(side: &'static str, agg: &Aggregate) -> Result<(), CompareError> {
    if agg.total_errors > 0 {
        return Err(CompareError::HasErrors {
            side,
            count: agg.total_errors,
        });
    }
    match &agg.throughput.segmented {
        Some(seg) if !seg.segments.is_empty() => Ok(()),
        _ => Err(CompareError::NoSegments { side }),
    }
}

/// Fastest/median/slowest by ops-per-second ascending: indices `n-1`,
/// `n/2`, and `0`.
fn extremes_by_ops(agg: &Aggregate) -> Result<(Segment, Segment, Segment), CompareError> {
    let seg = agg
        .throughput
        .segmented
        .as_ref()
        .filter(|s| !s.segments.is_empty())
        .ok_or(CompareError::NoSegments { side: "either" })?;
    let mut sorted: Vec<&Segment> = seg.segments.iter().collect();
    sorted.sort_by(|a, b| a.ops.total_cmp(&b.ops));
    let n = sorted.len();
    Ok((
        sorted[n - 1].clone(),
        sorted[n / 2].clone(),
        sorted[0].clone(),
    ))
}

fn requests_diff(before: &SingleSizedRequests, after: &SingleSizedRequests) -> RequestsDiff {
    let d = |b: u64, a: u64| a as f64 - b as f64;
    RequestsDiff {
        avg_millis: d(before.dur_avg_millis, after.dur_avg_millis),
        best_millis: d(before.fastest_millis, after.fastest_millis),
        worst_millis: d(before.slowest_millis, after.slowest_millis),
        std_dev_millis: d(before.dur_std_dev_millis, after.dur_std_dev_millis),
        p50_millis: d(before.dur_50_millis, after.dur_50_millis),
        p90_millis: d(before.dur_90_millis, after.dur_90_millis),
        p99_millis: d(before.dur_99_millis, after.dur_99_millis),
    }
}

fn ttfb_diff(before: &Ttfb, after: &Ttfb) -> TtfbDiff {
    TtfbDiff {
        average_millis: after.average_millis - before.average_millis,
        fastest_millis: after.fastest_millis - before.fastest_millis,
        median_millis: after.median_millis - before.median_millis,
        p99_millis: after.p99_millis - before.p99_millis,
        slowest_millis: after.slowest_millis - before.slowest_millis,
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::aggregate::LiveAggregate;
    use super::super::testutil::op_at;
    use super::*;

    /// Steady run: one op per second, fixed duration and size.
    fn run(secs: i64, dur_ms: i64, size: i64) -> Aggregate {
        let mut agg = LiveAggregate::default();
        for sec in 0..secs {
            let mut op = op_at(sec * 1000, dur_ms, size);
            op.ttfb = std::time::Duration::from_millis((dur_ms / 4) as u64);
            agg.add(&op);
        }
        agg.finalize()
    }

    #[test]
    fn diff_of_identical_runs_is_zero() {
        let before = run(12, 100, 1 << 20);
        let after = run(12, 100, 1 << 20);
        let cmp = compare("GET", &before, &after).unwrap();
        assert_eq!(cmp.median.bps_diff, 0.0);
        assert_eq!(cmp.fastest.ops_diff, 0.0);
        assert_eq!(cmp.duration_diff_millis, 0);
        let reqs = cmp.requests.unwrap();
        assert_eq!(reqs.avg_millis, 0.0);
        let ttfb = cmp.ttfb.unwrap();
        assert_eq!(ttfb.median_millis, 0.0);
    }

    #[test]
    fn faster_after_run_shows_positive_bps_diff() {
        let before = run(12, 200, 1 << 20);
        let after = run(12, 200, 2 << 20);
        let cmp = compare("PUT", &before, &after).unwrap();
        assert!((cmp.median.bps_diff - (1 << 20) as f64).abs() < 1e-6);
        assert!(cmp.average_bps_diff > 0.0);
        // Duration distribution is unchanged.
        assert_eq!(cmp.requests.unwrap().p50_millis, 0.0);
    }

    #[test]
    fn errors_on_either_side_refuse_comparison() {
        let clean = run(12, 100, 1024);
        let mut dirty_live = LiveAggregate::default();
        for sec in 0..12i64 {
            let mut op = op_at(sec * 1000, 100, 1024);
            if sec == 3 {
                op.err = "timeout".to_owned();
            }
            dirty_live.add(&op);
        }
        let dirty = dirty_live.finalize();

        let err = compare("GET", &dirty, &clean).unwrap_err();
        assert!(matches!(
            err,
            CompareError::HasErrors { side: "before", count: 1 }
        ));
        let err = compare("GET", &clean, &dirty).unwrap_err();
        assert!(matches!(err, CompareError::HasErrors { side: "after", .. }));
    }

    #[test]
    fn missing_segments_refuse_comparison() {
        let clean = run(12, 100, 1024);
        // Three seconds of data trim away entirely.
        let empty = run(3, 100, 1024);
        let err = compare("GET", &empty, &clean).unwrap_err();
        assert!(matches!(err, CompareError::NoSegments { side: "before" }));
    }
}
