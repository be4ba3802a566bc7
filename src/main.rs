use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use rust_s3_bench::metrics::autoterm::AutoTermOptions;
use rust_s3_bench::metrics::collector::CollectorConfig;
use rust_s3_bench::metrics::realtime::ToolInfo;
use rust_s3_bench::metrics::Collector;
use rust_s3_bench::{load_generator, server};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!();
    println!("╔══════════════════════════════════════════════════╗");
    println!("║   🪣  S3 BENCHMARK AGGREGATION OBSERVATORY       ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    // ── 1. Build the collector ───────────────────────────────────
    let collector = Arc::new(Collector::with_config(CollectorConfig {
        client_id: None,
        tool: Some(ToolInfo::current()),
    }));

    // ── 2. Convergence-based stopping ────────────────────────────
    let stop = collector.auto_term(AutoTermOptions::default());

    // ── 3. Serve live snapshots ──────────────────────────────────
    let state = Arc::new(server::AppState {
        collector: Arc::clone(&collector),
    });
    let app = server::create_router(state);
    let addr = "0.0.0.0:3000";
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to port 3000 — is it already in use?");

    println!("Server listening on http://localhost:3000");
    println!("Metrics JSON    → http://localhost:3000/api/metrics");
    println!("Metrics SSE     → http://localhost:3000/api/metrics/stream");
    println!();

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server exited with error");
    });

    // ── 4. Drive a synthetic workload ────────────────────────────
    let profile = load_generator::LoadProfile::default();
    info!(?profile, "starting synthetic load");
    let ops = collector.receiver().expect("collector just built");
    load_generator::run(ops, stop, profile).await;

    // ── 5. Finalize and summarize ────────────────────────────────
    collector.close();
    let snap = collector
        .finalized()
        .await
        .expect("collector finalizes after close");

    println!();
    println!("Run {} complete", snap.id);
    println!("  operations : {}", snap.total.total_requests);
    println!("  errors     : {}", snap.total.total_errors);
    println!(
        "  avg        : {:.1} MiB/s, {:.0} ops/s",
        snap.total.throughput.average_bps / (1 << 20) as f64,
        snap.total.throughput.average_ops
    );
    if let Some(seg) = &snap.total.throughput.segmented {
        println!(
            "  median     : {:.1} MiB/s  (sorted by {})",
            seg.median.bps / (1 << 20) as f64,
            seg.sorted_by
        );
    }
    for (op, agg) in &snap.by_op_type {
        println!(
            "  {:<7} {:>8} ops, {:.1} MiB/s",
            op,
            agg.total_requests,
            agg.throughput.average_bps / (1 << 20) as f64
        );
    }
}
