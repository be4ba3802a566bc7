//! Real-time aggregation core for S3-style object-storage benchmarks.
//!
//! Workers (or the bundled synthetic [`load_generator`]) push completed
//! [`metrics::Operation`] records into a [`metrics::Collector`]; a single
//! ingest task fans each record out into `Total` plus five dimension maps,
//! publishes an immutable [`metrics::Realtime`] snapshot at most once per
//! second, and finalizes the run when the stream closes. The [`server`]
//! module exposes the latest snapshot over HTTP and SSE.

pub mod load_generator;
pub mod metrics;
pub mod server;
