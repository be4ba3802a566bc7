//! Top-level snapshot: `Total` plus the five dimension maps.
//!
//! [`LiveRealtime`] is the mutable tree the ingest task owns;
//! [`Realtime`] is the read-only shape handed to every consumer and
//! serialized to JSON under `data_version` 2.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::aggregate::{Aggregate, LiveAggregate};
use super::Operation;

/// Serialization format version. Consumers must reject anything else.
pub const DATA_VERSION: u32 = 2;

// ─── Snapshot ────────────────────────────────────────────────────

/// Name and version of the tool that produced a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub version: String,
}

impl ToolInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Complete point-in-time view of a run. Immutable once published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Realtime {
    pub data_version: u32,
    /// Random id assigned when the run starts.
    pub id: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolInfo>,
    pub total: Aggregate,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_op_type: BTreeMap<String, Aggregate>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_host: BTreeMap<String, Aggregate>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_client: BTreeMap<String, Aggregate>,
    /// Keyed by `floor(log2(size)) + 1`; zero-sized operations are absent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_obj_log2_size: BTreeMap<u32, Aggregate>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_category: BTreeMap<String, Aggregate>,
}

/// Failure to parse a serialized snapshot.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("malformed snapshot: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported data version {found}, expected {DATA_VERSION}")]
    Version { found: u32 },
}

impl Realtime {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse and validate a serialized snapshot, rejecting unknown
    /// format versions.
    pub fn from_json(data: &str) -> Result<Self, SnapshotError> {
        let rt: Realtime = serde_json::from_str(data)?;
        if rt.data_version != DATA_VERSION {
            return Err(SnapshotError::Version {
                found: rt.data_version,
            });
        }
        Ok(rt)
    }

    /// Combine another client's snapshot into this coordinator view.
    ///
    /// Every dimension map is unioned with element-wise aggregate merges.
    /// The result stays final only if this side was final and the incoming
    /// side is final too (or this side never saw an operation).
    pub fn merge(&mut self, other: &Realtime) {
        let stays_final =
            self.is_final && (other.is_final || self.total.total_requests == 0);

        self.total.merge(&other.total);
        merge_map(&mut self.by_op_type, &other.by_op_type);
        merge_map(&mut self.by_host, &other.by_host);
        merge_map(&mut self.by_client, &other.by_client);
        merge_map(&mut self.by_obj_log2_size, &other.by_obj_log2_size);
        merge_map(&mut self.by_category, &other.by_category);
        self.is_final = stays_final;
    }
}

fn merge_map<K: Ord + Clone>(mine: &mut BTreeMap<K, Aggregate>, theirs: &BTreeMap<K, Aggregate>) {
    for (k, v) in theirs {
        match mine.get_mut(k) {
            Some(agg) => agg.merge(v),
            None => {
                mine.insert(k.clone(), v.clone());
            }
        }
    }
}

// ─── Live tree ───────────────────────────────────────────────────

/// The mutable aggregate tree. A single ingest task owns all write access;
/// everyone else sees only the [`Realtime`] snapshots it hands out.
#[derive(Debug, Default)]
pub(crate) struct LiveRealtime {
    id: String,
    tool: Option<ToolInfo>,
    total: LiveAggregate,
    by_op_type: HashMap<String, LiveAggregate>,
    by_host: HashMap<String, LiveAggregate>,
    by_client: HashMap<String, LiveAggregate>,
    by_obj_log2_size: HashMap<u32, LiveAggregate>,
    by_category: HashMap<String, LiveAggregate>,
}

impl LiveRealtime {
    pub fn new(tool: Option<ToolInfo>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool,
            ..Self::default()
        }
    }

    /// Dispatch one operation into `Total` and every matching dimension
    /// slot. Dispatch is a fixed key-extraction list, applied in order.
    pub fn add(&mut self, op: &Operation) {
        self.total.add(op);
        self.by_op_type
            .entry(op.op_type.clone())
            .or_default()
            .add(op);
        self.by_host
            .entry(op.endpoint.clone())
            .or_default()
            .add(op);
        if !op.client_id.is_empty() {
            self.by_client
                .entry(op.client_id.clone())
                .or_default()
                .add(op);
        }
        if let Some(key) = op.log2_size_key() {
            self.by_obj_log2_size.entry(key).or_default().add(op);
        }
        for cat in op.categories.iter() {
            self.by_category
                .entry(cat.name().to_owned())
                .or_default()
                .add(op);
        }
    }

    pub fn update(&self) -> Realtime {
        Realtime {
            data_version: DATA_VERSION,
            id: self.id.clone(),
            is_final: false,
            tool: self.tool.clone(),
            total: self.total.update(),
            by_op_type: update_map(&self.by_op_type),
            by_host: update_map(&self.by_host),
            by_client: update_map(&self.by_client),
            by_obj_log2_size: update_map(&self.by_obj_log2_size),
            by_category: update_map(&self.by_category),
        }
    }

    pub fn finalize(&mut self) -> Realtime {
        Realtime {
            data_version: DATA_VERSION,
            id: self.id.clone(),
            is_final: true,
            tool: self.tool.clone(),
            total: self.total.finalize(),
            by_op_type: finalize_map(&mut self.by_op_type),
            by_host: finalize_map(&mut self.by_host),
            by_client: finalize_map(&mut self.by_client),
            by_obj_log2_size: finalize_map(&mut self.by_obj_log2_size),
            by_category: finalize_map(&mut self.by_category),
        }
    }
}

fn update_map<K: Ord + Clone>(live: &HashMap<K, LiveAggregate>) -> BTreeMap<K, Aggregate> {
    live.iter().map(|(k, v)| (k.clone(), v.update())).collect()
}

fn finalize_map<K: Ord + Clone>(
    live: &mut HashMap<K, LiveAggregate>,
) -> BTreeMap<K, Aggregate> {
    live.iter_mut()
        .map(|(k, v)| (k.clone(), v.finalize()))
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────
