use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::metrics::{Category, Categories, Operation};

// ─── Profile ─────────────────────────────────────────────────────

/// Shape of the synthetic workload driven against the collector.
#[derive(Debug, Clone)]
pub struct LoadProfile {
    /// Number of concurrent Tokio worker tasks.
    pub concurrency: u32,
    /// How long the run lasts unless stopped earlier (seconds).
    pub duration_secs: u64,
    /// Percentage of operations that are GETs (0–100); the rest split
    /// into PUT, DELETE and STAT.
    pub get_pct: u8,
    /// Payload size for GET/PUT operations.
    pub obj_size: i64,
    /// Endpoints to spread operations across.
    pub endpoints: Vec<String>,
}

impl Default for LoadProfile {
    fn default() -> Self {
        Self {
            concurrency: 16,
            duration_secs: 60,
            get_pct: 70,
            obj_size: 1 << 20,
            endpoints: vec![
                "http://127.0.0.1:9001".to_owned(),
                "http://127.0.0.1:9002".to_owned(),
            ],
        }
    }
}

// ─── Public entry point ──────────────────────────────────────────

/// Spawns `concurrency` worker tasks that feed synthetic operations into
/// `ops` until the deadline passes or `stop` flips to true. Every sender
/// clone is dropped on return, so the collector's stream closes once the
/// caller drops its own handle.
pub async fn run(
    ops: mpsc::Sender<Operation>,
    stop: watch::Receiver<bool>,
    profile: LoadProfile,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(profile.duration_secs);

    let mut handles = Vec::with_capacity(profile.concurrency as usize);
    for worker_id in 0..profile.concurrency {
        let ops = ops.clone();
        let stop = stop.clone();
        let profile = profile.clone();
        handles.push(tokio::spawn(async move {
            worker(worker_id, ops, stop, deadline, profile).await;
        }));
    }
    drop(ops);

    for h in handles {
        let _ = h.await;
    }
    info!("load generator finished");
}

// ─── Worker loop ─────────────────────────────────────────────────

async fn worker(
    id: u32,
    ops: mpsc::Sender<Operation>,
    stop: watch::Receiver<bool>,
    deadline: tokio::time::Instant,
    profile: LoadProfile,
) {
    // Each worker gets its own deterministic RNG seeded uniquely.
    let mut rng = StdRng::seed_from_u64(1000 + id as u64);

    while !*stop.borrow() && tokio::time::Instant::now() < deadline {
        let op = if rng.gen_range(0u8..100) < profile.get_pct {
            simulate_get(&mut rng, id, &profile).await
        } else {
            simulate_mutation(&mut rng, id, &profile).await
        };
        if ops.send(op).await.is_err() {
            return;
        }
    }
}

// ─── Simulated operations ────────────────────────────────────────

/// Service time for moving `size` bytes: a simulated ~400 MB/s pipe with
/// per-request jitter.
fn service_time(rng: &mut StdRng, size: i64) -> Duration {
    let base_us = (size / 400).max(100) as u64;
    Duration::from_micros(base_us + rng.gen_range(0..base_us / 4 + 200))
}

fn pick_endpoint(rng: &mut StdRng, profile: &LoadProfile) -> String {
    profile.endpoints[rng.gen_range(0..profile.endpoints.len())].clone()
}

fn pick_object(rng: &mut StdRng) -> String {
    // A bounded object pool so repeated touches occur.
    format!("bench/obj_{:05}", rng.gen_range(0..2000u32))
}

async fn simulate_get(rng: &mut StdRng, thread: u32, profile: &LoadProfile) -> Operation {
    let ranged = rng.gen_bool(0.2);
    let size = if ranged {
        profile.obj_size / rng.gen_range(2..8)
    } else {
        profile.obj_size
    };
    let dur = service_time(rng, size);
    let ttfb = dur / 5;

    let start = Utc::now();
    tokio::time::sleep(dur).await;
    Operation {
        op_type: "GET".to_owned(),
        endpoint: pick_endpoint(rng, profile),
        object: pick_object(rng),
        thread,
        size,
        categories: if ranged {
            Categories::none().with(Category::Range)
        } else {
            Categories::none()
        },
        start,
        end: Utc::now(),
        ttfb,
        ..Operation::default()
    }
}

async fn simulate_mutation(rng: &mut StdRng, thread: u32, profile: &LoadProfile) -> Operation {
    let roll = rng.gen_range(0u8..10);
    let (op_type, size, categories) = if roll < 7 {
        let multipart = profile.obj_size >= 8 << 20;
        (
            "PUT",
            profile.obj_size,
            if multipart {
                Categories::none().with(Category::Multipart)
            } else {
                Categories::none()
            },
        )
    } else if roll < 9 {
        ("DELETE", 0, Categories::none())
    } else {
        ("STAT", 0, Categories::none().with(Category::Metadata))
    };

    let dur = service_time(rng, size);
    let start = Utc::now();
    tokio::time::sleep(dur).await;
    Operation {
        op_type: op_type.to_owned(),
        endpoint: pick_endpoint(rng, profile),
        object: pick_object(rng),
        thread,
        size,
        categories,
        start,
        end: Utc::now(),
        ..Operation::default()
    }
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Collector;

    #[tokio::test(start_paused = true)]
    async fn generated_load_reaches_every_dimension() {
        let collector = Collector::new();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let profile = LoadProfile {
            concurrency: 4,
            duration_secs: 5,
            get_pct: 50,
            obj_size: 1 << 20,
            endpoints: vec!["http://a:9000".to_owned(), "http://b:9000".to_owned()],
        };
        let ops = collector.receiver().expect("collector open");
        run(ops, stop_rx, profile).await;
        collector.close();

        let snap = collector.finalized().await.expect("final snapshot");
        assert!(snap.is_final);
        assert!(snap.total.total_requests > 0);
        assert!(snap.by_op_type.contains_key("GET"));
        assert!(snap.by_op_type.contains_key("PUT"));
        assert_eq!(snap.by_host.len(), 2);
        assert!(!snap.by_obj_log2_size.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_signal_halts_workers() {
        let collector = Collector::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let profile = LoadProfile {
            duration_secs: 3600,
            ..LoadProfile::default()
        };
        let ops = collector.receiver().expect("collector open");
        let gen = tokio::spawn(run(ops, stop_rx, profile));
        tokio::time::sleep(Duration::from_secs(2)).await;
        stop_tx.send(true).expect("workers listening");
        gen.await.expect("generator exits");
        collector.close();
        assert!(collector.finalized().await.is_some());
    }
}
