//! Per-client ring of fixed-duration request windows.
//!
//! Operations buffer into the currently open window by end time; when the
//! window rolls over, the buffer is condensed into a compact distribution
//! snapshot and the ring advances. Gaps produce explicit skipped windows so
//! the sequence stays contiguous.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::requests::{
    is_multi_sized, multi_sized, single_sized, Detail, MultiSizedRequests, ReqSample,
    SingleSizedRequests,
};

// ─── Configuration ───────────────────────────────────────────────

/// Width of one request window.
pub(crate) const WINDOW_SECS: i64 = 10;

// ─── Window snapshot ─────────────────────────────────────────────

/// One closed window in the flat per-client sequence of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSegment {
    /// Filled in when the owning aggregate materializes its rings.
    pub client_id: String,
    pub start: DateTime<Utc>,
    pub dur_millis: u64,
    /// True for a placeholder covering a window with no operations.
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_sized_requests: Option<SingleSizedRequests>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_sized_requests: Option<MultiSizedRequests>,
}

// ─── Live ring ───────────────────────────────────────────────────

/// Buffers operations for one client and condenses them window by window.
#[derive(Debug, Clone, Default)]
pub(crate) struct LiveRequests {
    curr_start: Option<DateTime<Utc>>,
    buf: Vec<ReqSample>,
    segments: Vec<RequestSegment>,
}

impl LiveRequests {
    /// Buffer one sample, rolling the window forward as needed.
    ///
    /// `multi_sized` is the owning aggregate's cached single/multi decision:
    /// set on the first non-empty window close and reused for its lifetime.
    /// A sample ending before the open window (late by up to one window) is
    /// kept in the open window.
    pub fn add(&mut self, sample: ReqSample, multi_sized: &mut Option<bool>) {
        let window = chrono::Duration::seconds(WINDOW_SECS);
        let mut curr = match self.curr_start {
            Some(c) => c,
            None => floor_second(sample.end),
        };
        while sample.end >= curr + window {
            self.close_window(curr, multi_sized);
            curr += window;
        }
        self.curr_start = Some(curr);
        self.buf.push(sample);
    }

    /// Closed windows so far, oldest first.
    pub fn segments(&self) -> &[RequestSegment] {
        &self.segments
    }

    /// Condense whatever the open window holds. Called once when the
    /// owning aggregate finalizes.
    pub fn finalize(&mut self, multi_sized: &mut Option<bool>) {
        if let Some(curr) = self.curr_start {
            if !self.buf.is_empty() {
                self.close_window(curr, multi_sized);
                self.curr_start = Some(curr + chrono::Duration::seconds(WINDOW_SECS));
            }
        }
    }

    fn close_window(&mut self, start: DateTime<Utc>, multi_sized: &mut Option<bool>) {
        let buf = std::mem::take(&mut self.buf);
        let dur_millis = (WINDOW_SECS * 1000) as u64;
        if buf.is_empty() {
            self.segments.push(RequestSegment {
                start,
                dur_millis,
                skipped: true,
                ..RequestSegment::default()
            });
            return;
        }
        let is_multi = *multi_sized.get_or_insert_with(|| is_multi_sized(&buf));
        let (single, multi) = if is_multi {
            (None, multi_sized_compact(&buf))
        } else {
            (single_sized(&buf, Detail::Compact), None)
        };
        self.segments.push(RequestSegment {
            client_id: String::new(),
            start,
            dur_millis,
            skipped: false,
            single_sized_requests: single,
            multi_sized_requests: multi,
        });
    }
}

fn multi_sized_compact(buf: &[ReqSample]) -> Option<MultiSizedRequests> {
    multi_sized(buf, Detail::Compact)
}

fn floor_second(t: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(t.timestamp(), 0).unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::super::testutil::op_at;
    use super::*;

    fn sample_ending_at(offset_ms: i64, size: i64) -> ReqSample {
        // op_at offsets the start; a 50 ms op ending at offset_ms + 50.
        ReqSample::from_op(&op_at(offset_ms, 50, size))
    }

    #[test]
    fn windows_roll_every_ten_seconds() {
        let mut ring = LiveRequests::default();
        let mut multi = None;
        for sec in 0..25 {
            ring.add(sample_ending_at(sec * 1000, 1024), &mut multi);
        }
        assert_eq!(ring.segments().len(), 2);
        let first = &ring.segments()[0];
        assert!(!first.skipped);
        assert_eq!(first.dur_millis, 10_000);
        assert_eq!(
            first.single_sized_requests.as_ref().unwrap().requests,
            10
        );
        // The open window still buffers the tail.
        ring.finalize(&mut multi);
        assert_eq!(ring.segments().len(), 3);
    }

    #[test]
    fn gaps_produce_skipped_placeholders() {
        let mut ring = LiveRequests::default();
        let mut multi = None;
        ring.add(sample_ending_at(500, 1024), &mut multi);
        ring.add(sample_ending_at(35_000, 1024), &mut multi);
        let segs = ring.segments();
        assert_eq!(segs.len(), 3);
        assert!(!segs[0].skipped);
        assert!(segs[1].skipped);
        assert!(segs[2].skipped);
        assert_eq!(segs[1].start - segs[0].start, chrono::Duration::seconds(10));
        assert!(segs[1].single_sized_requests.is_none());
    }

    #[test]
    fn late_sample_lands_in_open_window() {
        let mut ring = LiveRequests::default();
        let mut multi = None;
        ring.add(sample_ending_at(12_000, 1024), &mut multi);
        // Ends before the open window's start; reassigned rather than lost.
        ring.add(sample_ending_at(3_000, 1024), &mut multi);
        assert!(ring.segments().is_empty());
        ring.finalize(&mut multi);
        assert_eq!(ring.segments().len(), 1);
        assert_eq!(
            ring.segments()[0]
                .single_sized_requests
                .as_ref()
                .unwrap()
                .requests,
            2
        );
    }

    #[test]
    fn size_mode_is_decided_once_and_cached() {
        let mut ring = LiveRequests::default();
        let mut multi = None;
        // First window: uniform sizes → single-sized.
        for sec in 0..10 {
            ring.add(sample_ending_at(sec * 1000, 1024), &mut multi);
        }
        // Second window: wildly varied sizes. The cached decision holds.
        for sec in 10..20 {
            ring.add(sample_ending_at(sec * 1000, 1024 << (sec % 5)), &mut multi);
        }
        ring.add(sample_ending_at(21_000, 1024), &mut multi);
        assert_eq!(multi, Some(false));
        let segs = ring.segments();
        assert_eq!(segs.len(), 2);
        assert!(segs[1].single_sized_requests.is_some());
        assert!(segs[1].multi_sized_requests.is_none());
    }

    #[test]
    fn empty_ring_finalizes_to_nothing() {
        let mut ring = LiveRequests::default();
        let mut multi = None;
        ring.finalize(&mut multi);
        assert!(ring.segments().is_empty());
        assert_eq!(multi, None);
    }
}
