pub mod aggregate;
pub mod autoterm;
pub mod collector;
pub mod compare;
pub mod percentiles;
pub mod realtime;
pub mod requests;
pub mod throughput;
pub mod windows;

pub use aggregate::Aggregate;
pub use collector::{Collector, UpdateReq};
pub use realtime::Realtime;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, Error as DeError};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

// ─── Operation ───────────────────────────────────────────────────

/// One completed request/response exchange recorded by a worker.
/// This is the "write" side — drivers create these and push them in.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// e.g. "GET", "PUT", "DELETE", "STAT"
    pub op_type: String,
    /// Originating client process; empty in single-process mode.
    pub client_id: String,
    /// Host the request was issued against.
    pub endpoint: String,
    /// Object key; used to detect repeated touches of the same object.
    pub object: String,
    /// Thread-local id within a client.
    pub thread: u32,
    /// Objects affected by this operation (e.g. batch deletes).
    pub obj_per_op: u32,
    /// Payload bytes moved.
    pub size: i64,
    /// Category tags set on this operation.
    pub categories: Categories,
    /// Wall-clock start, nanosecond precision.
    pub start: DateTime<Utc>,
    /// Wall-clock end, nanosecond precision.
    pub end: DateTime<Utc>,
    /// Time to first byte; zero when not applicable.
    pub ttfb: Duration,
    /// Empty on success.
    pub err: String,
}

impl Default for Operation {
    fn default() -> Self {
        Self {
            op_type: String::new(),
            client_id: String::new(),
            endpoint: String::new(),
            object: String::new(),
            thread: 0,
            obj_per_op: 1,
            size: 0,
            categories: Categories::none(),
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MIN_UTC,
            ttfb: Duration::ZERO,
            err: String::new(),
        }
    }
}

impl Operation {
    /// Wall-clock duration. Zero if the record has not been normalized
    /// and carries a negative interval.
    pub fn duration(&self) -> Duration {
        (self.end - self.start).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_err(&self) -> bool {
        !self.err.is_empty()
    }

    /// Key into the log₂-size dimension: `floor(log2(size)) + 1`.
    /// `None` for zero-sized operations — they are omitted from that map.
    pub fn log2_size_key(&self) -> Option<u32> {
        if self.size > 0 {
            Some((self.size as u64).ilog2() + 1)
        } else {
            None
        }
    }

    /// Repair a non-monotonic clock reading: an operation that claims to
    /// end before it starts is clamped to zero duration and the defect is
    /// recorded on the operation itself.
    pub(crate) fn normalize(&mut self) {
        if self.end < self.start {
            self.end = self.start;
            if !self.err.is_empty() {
                self.err.push_str("; ");
            }
            self.err.push_str("Negative duration");
        }
    }
}

// ─── Categories ──────────────────────────────────────────────────

/// A single category tag. Each variant occupies one bit in [`Categories`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    Multipart = 0,
    Range = 1,
    Versioned = 2,
    Encrypted = 3,
    Metadata = 4,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Multipart,
        Category::Range,
        Category::Versioned,
        Category::Encrypted,
        Category::Metadata,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Category::Multipart => "multipart",
            Category::Range => "range",
            Category::Versioned => "versioned",
            Category::Encrypted => "encrypted",
            Category::Metadata => "metadata",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.name() == name)
    }
}

/// Set of category tags, at most 64. Serializes as a sorted array of
/// category names and parses symmetrically back into the set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Categories(u64);

impl Categories {
    pub fn none() -> Self {
        Self(0)
    }

    pub fn with(mut self, c: Category) -> Self {
        self.set(c);
        self
    }

    pub fn set(&mut self, c: Category) {
        self.0 |= 1 << (c as u8);
    }

    pub fn contains(self, c: Category) -> bool {
        self.0 & (1 << (c as u8)) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Category> {
        Category::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl Serialize for Categories {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut names: Vec<&str> = self.iter().map(Category::name).collect();
        names.sort_unstable();
        names.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Categories {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let names = Vec::<String>::deserialize(deserializer)?;
        let mut set = Categories::none();
        for name in &names {
            let cat = Category::from_name(name)
                .ok_or_else(|| D::Error::custom(format!("unknown category {name:?}")))?;
            set.set(cat);
        }
        Ok(set)
    }
}

// ─── Time helpers ────────────────────────────────────────────────

/// Nanoseconds since the unix epoch, exact for any representable time.
pub(crate) fn nanos_of(t: DateTime<Utc>) -> i128 {
    t.timestamp() as i128 * 1_000_000_000 + t.timestamp_subsec_nanos() as i128
}

/// Round a nanosecond count to the nearest millisecond.
pub(crate) fn nanos_to_millis(nanos: u64) -> u64 {
    (nanos + 500_000) / 1_000_000
}

// ─── Tests ───────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::testutil::{op_at, t0};
    use super::*;

    #[test]
    fn normalize_repairs_negative_duration() {
        let mut op = op_at(1000, 50, 1024);
        op.end = op.start - chrono::Duration::milliseconds(10);
        op.normalize();
        assert_eq!(op.start, op.end);
        assert_eq!(op.err, "Negative duration");
        assert_eq!(op.duration(), Duration::ZERO);
    }

    #[test]
    fn normalize_appends_to_existing_error() {
        let mut op = op_at(0, 10, 0);
        op.err = "connection reset".to_owned();
        op.end = op.start - chrono::Duration::nanoseconds(1);
        op.normalize();
        assert_eq!(op.err, "connection reset; Negative duration");
    }

    #[test]
    fn normalize_keeps_valid_operations() {
        let mut op = op_at(0, 250, 1024);
        let before = op.clone();
        op.normalize();
        assert_eq!(op, before);
    }

    #[test]
    fn log2_size_key_matches_definition() {
        let mut op = op_at(0, 10, 0);
        assert_eq!(op.log2_size_key(), None);
        op.size = 1;
        assert_eq!(op.log2_size_key(), Some(1));
        op.size = 1024;
        assert_eq!(op.log2_size_key(), Some(11));
        op.size = 1025;
        assert_eq!(op.log2_size_key(), Some(11));
        op.size = 1 << 20;
        assert_eq!(op.log2_size_key(), Some(21));
    }

    #[test]
    fn categories_roundtrip_sorted() {
        let cats = Categories::none()
            .with(Category::Versioned)
            .with(Category::Multipart);
        let json = serde_json::to_string(&cats).unwrap();
        assert_eq!(json, r#"["multipart","versioned"]"#);
        let back: Categories = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cats);
    }

    #[test]
    fn categories_reject_unknown_names() {
        let err = serde_json::from_str::<Categories>(r#"["zonal"]"#);
        assert!(err.is_err());
    }

    #[test]
    fn millis_rounding_is_nearest() {
        assert_eq!(nanos_to_millis(499_999), 0);
        assert_eq!(nanos_to_millis(500_000), 1);
        assert_eq!(nanos_to_millis(1_499_999), 1);
        assert_eq!(nanos_to_millis(1_500_000), 2);
    }

    #[test]
    fn nanos_of_is_exact() {
        let t = t0() + chrono::Duration::nanoseconds(123_456_789);
        assert_eq!(nanos_of(t) - nanos_of(t0()), 123_456_789);
    }
}
