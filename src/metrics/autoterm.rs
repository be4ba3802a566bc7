//! Convergence-based stopping.
//!
//! A background task polls the published snapshot once per second and
//! signals the operation source to stop when the tail of the segment
//! sequence is stable within a configured tolerance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::aggregate::Aggregate;
use super::collector::UpdateReq;
use super::realtime::Realtime;

// ─── Options ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct AutoTermOptions {
    /// Operation type to watch; `None` watches `Total`.
    pub op_type: Option<String>,
    /// Allowed relative deviation from the newest segment, e.g. 0.05.
    pub threshold: f64,
    /// Segments considered by each check, newest included. At least 2.
    pub want_samples: usize,
    /// No check fires before this much of the run has elapsed.
    pub min_dur: Duration,
}

impl Default for AutoTermOptions {
    fn default() -> Self {
        Self {
            op_type: None,
            threshold: 0.05,
            want_samples: 5,
            min_dur: Duration::from_secs(10),
        }
    }
}

// ─── Controller task ─────────────────────────────────────────────

/// Spawn the checker. The returned channel flips to `true` once recent
/// throughput is stable; the task then exits. Dropping every receiver
/// also stops the task.
pub(crate) fn spawn(
    updates: mpsc::Sender<UpdateReq>,
    opts: AutoTermOptions,
) -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(run(updates, opts, tx));
    rx
}

async fn run(updates: mpsc::Sender<UpdateReq>, opts: AutoTermOptions, stop: watch::Sender<bool>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if stop.is_closed() {
            return;
        }

        let Some(snap) = request_snapshot(&updates).await else {
            // Channel gone: the collector is shutting down.
            return;
        };
        let Some(snap) = snap else { continue };
        if snap.is_final {
            return;
        }

        let agg = match &opts.op_type {
            Some(op) => match snap.by_op_type.get(op) {
                Some(agg) => agg,
                None => continue,
            },
            None => &snap.total,
        };
        if is_stable(agg, &opts) {
            info!(
                op_type = opts.op_type.as_deref().unwrap_or("total"),
                threshold = opts.threshold,
                "throughput stable, requesting termination"
            );
            let _ = stop.send(true);
            return;
        }
        debug!("throughput not yet stable");
    }
}

async fn request_snapshot(
    updates: &mpsc::Sender<UpdateReq>,
) -> Option<Option<Arc<Realtime>>> {
    let (tx, mut rx) = mpsc::channel(1);
    updates.send(UpdateReq::snapshot(tx)).await.ok()?;
    rx.recv().await
}

// ─── Stability check ─────────────────────────────────────────────

/// The newest segment is the reference; the `want_samples - 1` segments
/// before it must all sit within `threshold * reference` on the primary
/// metric. BPS is primary when any retained segment moved bytes during
/// the run, OPS otherwise.
fn is_stable(agg: &Aggregate, opts: &AutoTermOptions) -> bool {
    let (Some(start), Some(end)) = (agg.start_time, agg.end_time) else {
        return false;
    };
    if (end - start).to_std().unwrap_or(Duration::ZERO) <= opts.min_dur {
        return false;
    }
    let Some(seg) = &agg.throughput.segmented else {
        return false;
    };
    let segments = &seg.segments;
    let want = opts.want_samples.max(2);
    if segments.len() < want {
        return false;
    }

    let by_bps = segments.iter().any(|s| s.bps > 0.0);
    let metric = |s: &super::throughput::Segment| if by_bps { s.bps } else { s.ops };

    let reference = metric(&segments[segments.len() - 1]);
    segments[segments.len() - want..segments.len() - 1]
        .iter()
        .all(|s| (metric(s) - reference).abs() <= opts.threshold * reference)
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::aggregate::LiveAggregate;
    use super::super::collector::Collector;
    use super::super::testutil::op_at;
    use super::*;

    const MIB: i64 = 1 << 20;

    /// `secs` seconds of steady traffic, one op per second of `size` bytes.
    fn steady_aggregate(secs: i64, size: i64) -> Aggregate {
        let mut agg = LiveAggregate::default();
        for sec in 0..secs {
            agg.add(&op_at(sec * 1000, 100, size));
        }
        agg.update()
    }

    fn opts(threshold: f64, want_samples: usize, min_dur_secs: u64) -> AutoTermOptions {
        AutoTermOptions {
            op_type: None,
            threshold,
            want_samples,
            min_dur: Duration::from_secs(min_dur_secs),
        }
    }

    #[test]
    fn stable_run_passes_the_check() {
        let agg = steady_aggregate(15, 50 * MIB);
        assert!(is_stable(&agg, &opts(0.05, 5, 10)));
    }

    #[test]
    fn short_run_is_skipped_by_min_dur() {
        let agg = steady_aggregate(15, 50 * MIB);
        assert!(!is_stable(&agg, &opts(0.05, 5, 20)));
    }

    #[test]
    fn too_few_segments_skip_the_check() {
        // 8 buckets leave 4 retained segments, fewer than wanted.
        let agg = steady_aggregate(8, MIB);
        assert!(!is_stable(&agg, &opts(0.05, 5, 1)));
    }

    #[test]
    fn zero_threshold_requires_equal_segments() {
        let agg = steady_aggregate(10, MIB);
        assert!(is_stable(&agg, &opts(0.0, 2, 1)));

        // Perturb one of the two newest retained seconds.
        let mut live = LiveAggregate::default();
        for sec in 0..10 {
            live.add(&op_at(sec * 1000, 100, MIB));
        }
        live.add(&op_at(6_500, 100, MIB));
        let agg = live.update();
        assert!(!is_stable(&agg, &opts(0.0, 2, 1)));
    }

    #[test]
    fn ops_metric_used_when_no_bytes_moved() {
        let agg = steady_aggregate(15, 0);
        assert!(is_stable(&agg, &opts(0.05, 5, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_term_cancels_a_stable_run() {
        let collector = Collector::new();
        let mut stop = collector.auto_term(opts(0.05, 5, 10));
        let tx = collector.receiver().expect("collector open");

        // Constant 50 MiB/s, one second fed per virtual second.
        let mut fed_secs = 0i64;
        for sec in 0..30i64 {
            for i in 0..10i64 {
                tx.send(op_at(sec * 1000 + i * 100, 50, 5 * MIB))
                    .await
                    .expect("ingest alive");
            }
            fed_secs = sec + 1;
            tokio::time::sleep(Duration::from_secs(1)).await;
            if *stop.borrow() {
                break;
            }
        }
        assert!(*stop.borrow(), "termination never requested");
        assert!(
            (10..=20).contains(&fed_secs),
            "terminated after {fed_secs} s of feed"
        );

        drop(tx);
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");
        assert!(snap.is_final);

        // The watch resolves changed() immediately for late subscribers.
        stop.changed().await.ok();
    }
}
