//! The live collector: a single ingest task owns all write access to the
//! aggregate tree, publishes a snapshot pointer at most once per second,
//! and a companion task serves snapshot / reset / final requests without
//! ever blocking the ingest path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use super::autoterm::{self, AutoTermOptions};
use super::realtime::{LiveRealtime, Realtime, ToolInfo};
use super::Operation;

// ─── Configuration ───────────────────────────────────────────────

/// Operation input channel depth. The producer blocks when the ingest
/// task falls this far behind.
const OPS_CHANNEL_CAP: usize = 10_000;

const UPDATE_CHANNEL_CAP: usize = 64;

/// Minimum interval between published snapshots. More frequent publishing
/// would make the clone cost dominate ingest.
const PUBLISH_INTERVAL: Duration = Duration::from_secs(1);

// ─── Requests ────────────────────────────────────────────────────

/// A consumer request to the update-server task.
#[derive(Debug)]
pub struct UpdateReq {
    /// Where to deliver a snapshot. For plain snapshot requests the send
    /// is non-blocking and dropped if the channel is full; the requester
    /// retries. May be `None` (reset-only requests).
    pub reply: Option<mpsc::Sender<Option<Arc<Realtime>>>>,
    /// Discard all aggregate state before the next operation.
    pub reset: bool,
    /// Deliver only after the stream has closed and finalization is done.
    pub finalize: bool,
}

impl UpdateReq {
    /// Latest published snapshot, delivered best-effort.
    pub fn snapshot(reply: mpsc::Sender<Option<Arc<Realtime>>>) -> Self {
        Self { reply: Some(reply), reset: false, finalize: false }
    }

    /// Discard state. No reply is sent.
    pub fn reset() -> Self {
        Self { reply: None, reset: true, finalize: false }
    }

    /// The finalized result, delivered once ingest has drained and
    /// finalized. Blocking send.
    pub fn finalized(reply: mpsc::Sender<Option<Arc<Realtime>>>) -> Self {
        Self { reply: Some(reply), reset: false, finalize: true }
    }
}

// ─── Collector ───────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CollectorConfig {
    /// Set on every ingested operation when running single-client.
    pub client_id: Option<String>,
    /// Stamped into every snapshot.
    pub tool: Option<ToolInfo>,
}

/// Owner of the ingest and update-server tasks.
///
/// Drivers obtain an operation sender via [`receiver`](Self::receiver),
/// readers pull snapshots via [`snapshot`](Self::snapshot) or the raw
/// [`updates`](Self::updates) channel, and [`close`](Self::close) plus
/// dropping all senders triggers finalization.
pub struct Collector {
    ops: Mutex<Option<mpsc::Sender<Operation>>>,
    outputs: Arc<Mutex<Vec<mpsc::Sender<Operation>>>>,
    updates: mpsc::Sender<UpdateReq>,
    latest: Arc<RwLock<Option<Arc<Realtime>>>>,
}

impl Default for Collector {
    fn default() -> Self {
        Self::new()
    }
}

impl Collector {
    pub fn new() -> Self {
        Self::with_config(CollectorConfig::default())
    }

    pub fn with_config(cfg: CollectorConfig) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel(OPS_CHANNEL_CAP);
        let (upd_tx, upd_rx) = mpsc::channel(UPDATE_CHANNEL_CAP);
        let latest = Arc::new(RwLock::new(None));
        let final_slot = Arc::new(RwLock::new(None));
        let reset = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        let outputs: Arc<Mutex<Vec<mpsc::Sender<Operation>>>> = Arc::new(Mutex::new(Vec::new()));

        tokio::spawn(update_server(
            upd_rx,
            Arc::clone(&latest),
            Arc::clone(&final_slot),
            Arc::clone(&reset),
            done_rx,
        ));
        tokio::spawn(ingest_loop(
            ops_rx,
            Arc::clone(&outputs),
            Arc::clone(&latest),
            final_slot,
            reset,
            done_tx,
            cfg,
        ));

        Self {
            ops: Mutex::new(Some(ops_tx)),
            outputs,
            updates: upd_tx,
            latest,
        }
    }

    /// Endpoint the driver sends operations to. `None` once closed.
    pub fn receiver(&self) -> Option<mpsc::Sender<Operation>> {
        self.ops.lock().clone()
    }

    /// Register a fan-out sink. Must happen before the first operation;
    /// sinks registered later are ignored.
    pub fn add_output(&self, sink: mpsc::Sender<Operation>) {
        self.outputs.lock().push(sink);
    }

    /// The raw update-request channel.
    pub fn updates(&self) -> mpsc::Sender<UpdateReq> {
        self.updates.clone()
    }

    /// Latest published snapshot, if any. Lock-free for practical purposes:
    /// readers clone the pointer and never observe a partial update.
    pub fn latest(&self) -> Option<Arc<Realtime>> {
        self.latest.read().clone()
    }

    /// Request the latest snapshot through the update channel.
    pub async fn snapshot(&self) -> Option<Arc<Realtime>> {
        let (tx, mut rx) = mpsc::channel(1);
        self.updates.send(UpdateReq::snapshot(tx)).await.ok()?;
        rx.recv().await.flatten()
    }

    /// Discard aggregate state before the next operation is applied.
    pub async fn reset(&self) {
        let _ = self.updates.send(UpdateReq::reset()).await;
    }

    /// Wait for the stream to close and return the finalized result.
    pub async fn finalized(&self) -> Option<Arc<Realtime>> {
        let (tx, mut rx) = mpsc::channel(1);
        self.updates.send(UpdateReq::finalized(tx)).await.ok()?;
        rx.recv().await.flatten()
    }

    /// Convergence-based stopping: the returned channel flips to `true`
    /// when recent throughput is stable within the configured tolerance.
    /// The operation source is expected to stop sending and drop its
    /// senders, which closes the stream and triggers finalization.
    pub fn auto_term(&self, opts: AutoTermOptions) -> watch::Receiver<bool> {
        autoterm::spawn(self.updates.clone(), opts)
    }

    /// Close the input endpoint. Once every sender handed out by
    /// [`receiver`](Self::receiver) is dropped too, ingest drains,
    /// finalizes, and answers pending final requests.
    pub fn close(&self) {
        *self.ops.lock() = None;
    }
}

// ─── Ingest task ─────────────────────────────────────────────────

async fn ingest_loop(
    mut ops: mpsc::Receiver<Operation>,
    outputs: Arc<Mutex<Vec<mpsc::Sender<Operation>>>>,
    latest: Arc<RwLock<Option<Arc<Realtime>>>>,
    final_slot: Arc<RwLock<Option<Arc<Realtime>>>>,
    reset: Arc<AtomicBool>,
    done: watch::Sender<bool>,
    cfg: CollectorConfig,
) {
    let mut live = LiveRealtime::new(cfg.tool.clone());
    let mut sinks: Option<Vec<mpsc::Sender<Operation>>> = None;
    let mut last_publish = Instant::now();
    info!("ingest started");

    while let Some(mut op) = ops.recv().await {
        if reset.swap(false, Ordering::AcqRel) {
            info!("reset requested, discarding aggregate state");
            live = LiveRealtime::new(cfg.tool.clone());
            *latest.write() = None;
            last_publish = Instant::now();
        }

        op.normalize();
        if let Some(client) = &cfg.client_id {
            op.client_id = client.clone();
        }

        // Fan-out sinks are first-class consumers: a full sink applies
        // back-pressure to ingest.
        let sinks = sinks.get_or_insert_with(|| outputs.lock().clone());
        for sink in sinks.iter() {
            if sink.send(op.clone()).await.is_err() {
                debug!("fan-out sink closed, dropping its traffic");
            }
        }

        live.add(&op);

        if last_publish.elapsed() >= PUBLISH_INTERVAL {
            *latest.write() = Some(Arc::new(live.update()));
            last_publish = Instant::now();
        }
    }

    info!("operation stream closed, finalizing");
    let snap = Arc::new(live.finalize());
    *latest.write() = Some(Arc::clone(&snap));
    *final_slot.write() = Some(snap);
    let _ = done.send(true);
}

// ─── Update-server task ──────────────────────────────────────────

async fn update_server(
    mut reqs: mpsc::Receiver<UpdateReq>,
    latest: Arc<RwLock<Option<Arc<Realtime>>>>,
    final_slot: Arc<RwLock<Option<Arc<Realtime>>>>,
    reset: Arc<AtomicBool>,
    mut done: watch::Receiver<bool>,
) {
    let mut pending_final: Vec<mpsc::Sender<Option<Arc<Realtime>>>> = Vec::new();
    let mut finished = *done.borrow();

    loop {
        tokio::select! {
            req = reqs.recv() => {
                let Some(req) = req else { break };
                if req.reset {
                    reset.store(true, Ordering::Release);
                }
                if req.finalize {
                    if let Some(reply) = req.reply {
                        if finished {
                            deliver_final(vec![reply], final_slot.read().clone());
                        } else {
                            pending_final.push(reply);
                        }
                    }
                } else if let Some(reply) = req.reply {
                    // Non-blocking: a slow requester loses this snapshot
                    // and is expected to retry.
                    let _ = reply.try_send(latest.read().clone());
                }
            }
            changed = done.changed(), if !finished => {
                // Fires once; the sender is dropped right after. The borrow
                // holds the last value either way.
                let _ = changed;
                finished = true;
                if *done.borrow() {
                    deliver_final(
                        std::mem::take(&mut pending_final),
                        final_slot.read().clone(),
                    );
                }
            }
        }
    }
}

/// Blocking sends, one at a time, off the serving loop.
fn deliver_final(
    repliers: Vec<mpsc::Sender<Option<Arc<Realtime>>>>,
    snap: Option<Arc<Realtime>>,
) {
    if repliers.is_empty() {
        return;
    }
    tokio::spawn(async move {
        for reply in repliers {
            let _ = reply.send(snap.clone()).await;
        }
    });
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::testutil::{op_at, t0};
    use super::*;

    const MIB: i64 = 1 << 20;

    async fn feed(collector: &Collector, ops: impl IntoIterator<Item = Operation>) {
        let tx = collector.receiver().expect("collector open");
        for op in ops {
            tx.send(op).await.expect("ingest alive");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_operations_finalize_empty() {
        let collector = Collector::new();
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");
        assert!(snap.is_final);
        assert_eq!(snap.total.total_requests, 0);
        assert!(snap.by_op_type.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn steady_put_stream_scenario() {
        let collector = Collector::new();
        // 3000 operations over 30 s at 100 ops/s, 1 MiB each, one endpoint.
        feed(
            &collector,
            (0..3000i64).map(|i| {
                let mut op = op_at(i * 10, 5, MIB);
                op.op_type = "PUT".to_owned();
                op
            }),
        )
        .await;
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");

        let put = &snap.by_op_type["PUT"];
        assert_eq!(put.total_requests, 3000);
        let seg = put.throughput.segmented.as_ref().expect("segments");
        assert_eq!(seg.segments.len(), 26);
        // 100 ops/s of 1 MiB with edge seconds trimmed.
        let want_bps = 100.0 * MIB as f64;
        assert!((seg.median.bps - want_bps).abs() <= want_bps * 0.02);
        assert!((put.throughput.average_bps - want_bps).abs() <= want_bps * 0.02);
    }

    #[tokio::test(start_paused = true)]
    async fn mixed_workload_scenario() {
        let collector = Collector::new();
        let mut ops = Vec::new();
        for i in 0..1000i64 {
            let mut get = op_at(i * 10, 10, 4096);
            get.op_type = "GET".to_owned();
            ops.push(get);
            let mut del = op_at(i * 10 + 5, 2, 0);
            del.op_type = "DELETE".to_owned();
            ops.push(del);
        }
        feed(&collector, ops).await;
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");

        assert_eq!(snap.by_op_type.len(), 2);
        let get = &snap.by_op_type["GET"];
        let del = &snap.by_op_type["DELETE"];
        assert!(get.single_sized_requests.is_some());
        assert!(del.single_sized_requests.is_some());
        assert_eq!(
            snap.total.total_requests,
            get.total_requests + del.total_requests
        );
    }

    #[tokio::test(start_paused = true)]
    async fn op_before_origin_counts_toward_totals_only() {
        let collector = Collector::new();
        let mut ops: Vec<Operation> =
            (0..10i64).map(|sec| op_at(10_000 + sec * 1000, 100, MIB)).collect();
        // Starts five seconds before the first operation.
        ops.push(op_at(5_000, 100, MIB));
        feed(&collector, ops).await;
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");

        assert_eq!(snap.total.total_requests, 11);
        let seg = snap.total.throughput.segmented.as_ref().unwrap();
        let bucketized: u64 = seg.segments.iter().map(|s| s.ops_started).sum();
        // The out-of-range op reached no bucket.
        assert_eq!(bucketized, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_discards_earlier_operations() {
        let collector = Collector::new();
        feed(&collector, (0..500i64).map(|i| op_at(i * 10, 5, MIB))).await;
        // Let ingest drain the queue, then let the update server flag the
        // reset before more ops arrive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        collector.reset().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        feed(
            &collector,
            (0..500i64).map(|i| op_at(5_000 + i * 10, 5, MIB)),
        )
        .await;
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");

        assert_eq!(snap.total.total_requests, 500);
        let start = snap.total.start_time.expect("has operations");
        assert!(start >= t0() + chrono::Duration::seconds(5));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_sees_every_operation() {
        let collector = Collector::new();
        let (sink_tx, mut sink_rx) = mpsc::channel(64);
        collector.add_output(sink_tx);
        feed(&collector, (0..10i64).map(|i| op_at(i * 100, 10, 100))).await;
        collector.close();
        collector.finalized().await.expect("final snapshot");

        let mut seen = 0;
        while sink_rx.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_publish_at_one_hertz() {
        let collector = Collector::new();
        let tx = collector.receiver().unwrap();

        // First batch: nothing published yet (throttle not elapsed).
        for i in 0..50i64 {
            tx.send(op_at(i * 10, 5, MIB)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(collector.latest().is_none());

        // After a second of virtual time, the next op triggers a publish.
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(op_at(600, 5, MIB)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = collector.snapshot().await.expect("published snapshot");
        assert!(!snap.is_final);
        assert_eq!(snap.total.total_requests, 51);

        drop(tx);
        collector.close();
        collector.finalized().await.expect("final snapshot");
    }

    #[tokio::test(start_paused = true)]
    async fn negative_duration_is_normalized_on_ingest() {
        let collector = Collector::new();
        let mut op = op_at(1000, 100, 100);
        op.end = op.start - chrono::Duration::milliseconds(10);
        feed(&collector, [op]).await;
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");
        assert_eq!(snap.total.total_errors, 1);
        assert_eq!(snap.total.first_errors, vec!["Negative duration"]);
    }

    #[tokio::test(start_paused = true)]
    async fn client_id_override_applies_to_all_ops() {
        let collector = Collector::with_config(CollectorConfig {
            client_id: Some("bench-7".to_owned()),
            tool: Some(ToolInfo::current()),
        });
        feed(&collector, (0..5i64).map(|i| op_at(i * 100, 10, 100))).await;
        collector.close();
        let snap = collector.finalized().await.expect("final snapshot");
        assert_eq!(snap.by_client.len(), 1);
        assert!(snap.by_client.contains_key("bench-7"));
        assert_eq!(snap.tool.as_ref().unwrap().name, env!("CARGO_PKG_NAME"));
    }

    #[tokio::test(start_paused = true)]
    async fn final_request_waits_for_stream_close() {
        let collector = Collector::new();
        let tx = collector.receiver().unwrap();

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        collector
            .updates()
            .send(UpdateReq::finalized(reply_tx))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Still streaming: no reply yet.
        assert!(reply_rx.try_recv().is_err());

        tx.send(op_at(0, 10, 100)).await.unwrap();
        drop(tx);
        collector.close();

        let snap = reply_rx.recv().await.flatten().expect("final snapshot");
        assert!(snap.is_final);
        assert_eq!(snap.total.total_requests, 1);
    }
}
