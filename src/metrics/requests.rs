//! Request-duration distributions over single-sized and multi-sized
//! operation populations.
//!
//! A population is "single-sized" when every observed object size sits
//! within 5% of the population mean; otherwise it is split into disjoint
//! size bins and summarized per bin as bytes-per-second percentiles.

use std::collections::BTreeMap;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::percentiles::{curve_101, quantile, SampleStats};
use super::{nanos_to_millis, Operation};

// ─── Configuration ───────────────────────────────────────────────

/// Relative size spread tolerated inside one bin / around the mean.
pub(crate) const SIZE_SPREAD: f64 = 0.05;

// ─── Samples ─────────────────────────────────────────────────────

/// Compact per-operation record retained for distribution snapshots.
#[derive(Debug, Clone)]
pub(crate) struct ReqSample {
    pub end: DateTime<Utc>,
    pub dur_nanos: u64,
    /// Zero when TTFB is not applicable to the operation type.
    pub ttfb_nanos: u64,
    pub size: i64,
    pub endpoint: String,
    pub client_id: String,
    pub object: String,
}

impl ReqSample {
    pub fn from_op(op: &Operation) -> Self {
        Self {
            end: op.end,
            dur_nanos: (super::nanos_of(op.end) - super::nanos_of(op.start)).max(0) as u64,
            ttfb_nanos: op.ttfb.as_nanos() as u64,
            size: op.size,
            endpoint: op.endpoint.clone(),
            client_id: op.client_id.clone(),
            object: op.object.clone(),
        }
    }
}

/// How much detail a snapshot carries. Live request windows stay compact;
/// finalized aggregates get the full treatment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Detail {
    /// No percentile curves, no per-host / per-client splits.
    Compact,
    /// Everything, including 101-point curves and sub-breakdowns.
    Full,
}

// Which optional pieces a particular construction includes.
#[derive(Clone, Copy)]
struct Parts {
    curve: bool,
    splits: bool,
    access: bool,
}

impl Parts {
    fn for_detail(detail: Detail) -> Self {
        match detail {
            Detail::Full => Parts { curve: true, splits: true, access: true },
            Detail::Compact => Parts { curve: false, splits: false, access: true },
        }
    }

    fn nested(self) -> Self {
        Parts { curve: self.curve, splits: false, access: false }
    }

    fn leaf() -> Self {
        Parts { curve: false, splits: false, access: false }
    }
}

// ─── Size classification ─────────────────────────────────────────

/// True when the observed sizes vary by more than [`SIZE_SPREAD`] around
/// the population mean.
pub(crate) fn is_multi_sized(samples: &[ReqSample]) -> bool {
    if samples.is_empty() {
        return false;
    }
    let mean = samples.iter().map(|s| s.size as f64).sum::<f64>() / samples.len() as f64;
    samples
        .iter()
        .any(|s| (s.size as f64 - mean).abs() > SIZE_SPREAD * mean)
}

/// Split a population into disjoint size bins: sort by size, then open a
/// new bin whenever the next size exceeds `(1 + spread) * bin_min`.
pub(crate) fn split_sizes<'a>(samples: &[&'a ReqSample], spread: f64) -> Vec<Vec<&'a ReqSample>> {
    let mut sorted: Vec<&ReqSample> = samples.to_vec();
    sorted.sort_by_key(|s| s.size);

    let mut bins: Vec<Vec<&ReqSample>> = Vec::new();
    let mut current: Vec<&ReqSample> = Vec::new();
    let mut bin_min = 0i64;
    for s in sorted {
        if !current.is_empty() && (s.size as f64) > (1.0 + spread) * bin_min as f64 {
            bins.push(std::mem::take(&mut current));
        }
        if current.is_empty() {
            bin_min = s.size;
        }
        current.push(s);
    }
    if !current.is_empty() {
        bins.push(current);
    }
    bins
}

// ─── TTFB distribution ───────────────────────────────────────────

/// Time-to-first-byte distribution. High precision: float milliseconds,
/// optionally with the full percentile-by-percent curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ttfb {
    pub requests: u64,
    pub average_millis: f64,
    pub fastest_millis: f64,
    pub p25_millis: f64,
    pub median_millis: f64,
    pub p75_millis: f64,
    pub p90_millis: f64,
    pub p99_millis: f64,
    pub slowest_millis: f64,
    pub std_dev_millis: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentiles_millis: Option<Vec<f64>>,
}

fn ttfb_of(samples: &[&ReqSample], curve: bool) -> Option<Ttfb> {
    let mut nanos: Vec<u64> = samples
        .iter()
        .filter(|s| s.ttfb_nanos > 0)
        .map(|s| s.ttfb_nanos)
        .collect();
    if nanos.is_empty() {
        return None;
    }
    nanos.sort_unstable();
    let stats = SampleStats::from_sorted(&nanos)?;
    let ms = |n: u64| n as f64 / 1e6;
    Some(Ttfb {
        requests: stats.count,
        average_millis: stats.avg_nanos / 1e6,
        fastest_millis: ms(stats.fastest),
        p25_millis: ms(stats.p25),
        median_millis: ms(stats.p50),
        p75_millis: ms(stats.p75),
        p90_millis: ms(stats.p90),
        p99_millis: ms(stats.p99),
        slowest_millis: ms(stats.slowest),
        std_dev_millis: stats.std_dev_nanos / 1e6,
        percentiles_millis: curve.then(|| curve_101(&nanos).into_iter().map(ms).collect()),
    })
}

impl Ttfb {
    /// Request-count-weighted combination; exact for counts and extremes,
    /// approximate for interior percentiles.
    pub(crate) fn merge(&mut self, other: &Ttfb) {
        let (a, b) = (self.requests as f64, other.requests as f64);
        let total = a + b;
        if total == 0.0 {
            return;
        }
        let w = |x: f64, y: f64| (x * a + y * b) / total;
        self.average_millis = w(self.average_millis, other.average_millis);
        self.p25_millis = w(self.p25_millis, other.p25_millis);
        self.median_millis = w(self.median_millis, other.median_millis);
        self.p75_millis = w(self.p75_millis, other.p75_millis);
        self.p90_millis = w(self.p90_millis, other.p90_millis);
        self.p99_millis = w(self.p99_millis, other.p99_millis);
        self.std_dev_millis = w(self.std_dev_millis, other.std_dev_millis);
        self.fastest_millis = self.fastest_millis.min(other.fastest_millis);
        self.slowest_millis = self.slowest_millis.max(other.slowest_millis);
        self.percentiles_millis = match (&self.percentiles_millis, &other.percentiles_millis) {
            (Some(x), Some(y)) if x.len() == y.len() => {
                Some(x.iter().zip(y).map(|(&p, &q)| w(p, q)).collect())
            }
            _ => None,
        };
        self.requests += other.requests;
    }
}

// ─── Single-sized ────────────────────────────────────────────────

/// Duration distribution of a population whose sizes all sit within 5%
/// of the mean. All durations in rounded milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SingleSizedRequests {
    pub requests: u64,
    /// Canonical object size (population mean).
    pub obj_size: i64,
    pub dur_avg_millis: u64,
    pub dur_std_dev_millis: u64,
    pub fastest_millis: u64,
    pub dur_50_millis: u64,
    pub dur_75_millis: u64,
    pub dur_90_millis: u64,
    pub dur_99_millis: u64,
    pub slowest_millis: u64,
    /// Percentile by integer percent, 0..=100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur_percentiles_millis: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_byte: Option<Ttfb>,
    /// First touch per object, present when objects were hit repeatedly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_access: Option<Box<SingleSizedRequests>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<Box<SingleSizedRequests>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_host: BTreeMap<String, SingleSizedRequests>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_client: BTreeMap<String, SingleSizedRequests>,
}

/// Summarize a single-sized population. `None` when empty.
pub(crate) fn single_sized(samples: &[ReqSample], detail: Detail) -> Option<SingleSizedRequests> {
    let refs: Vec<&ReqSample> = samples.iter().collect();
    build_single(&refs, Parts::for_detail(detail))
}

fn build_single(samples: &[&ReqSample], parts: Parts) -> Option<SingleSizedRequests> {
    if samples.is_empty() {
        return None;
    }
    let mut durs: Vec<u64> = samples.iter().map(|s| s.dur_nanos).collect();
    durs.sort_unstable();
    let stats = SampleStats::from_sorted(&durs)?;
    let obj_size = (samples.iter().map(|s| s.size as f64).sum::<f64>()
        / samples.len() as f64)
        .round() as i64;

    let mut out = SingleSizedRequests {
        requests: stats.count,
        obj_size,
        dur_avg_millis: (stats.avg_nanos / 1e6).round() as u64,
        dur_std_dev_millis: (stats.std_dev_nanos / 1e6).round() as u64,
        fastest_millis: nanos_to_millis(stats.fastest),
        dur_50_millis: nanos_to_millis(stats.p50),
        dur_75_millis: nanos_to_millis(stats.p75),
        dur_90_millis: nanos_to_millis(stats.p90),
        dur_99_millis: nanos_to_millis(stats.p99),
        slowest_millis: nanos_to_millis(stats.slowest),
        dur_percentiles_millis: parts
            .curve
            .then(|| curve_101(&durs).into_iter().map(nanos_to_millis).collect()),
        first_byte: ttfb_of(samples, parts.curve),
        ..SingleSizedRequests::default()
    };

    if parts.access {
        if let Some((firsts, lasts)) = access_split(samples) {
            out.first_access = build_single(&firsts, parts.nested()).map(Box::new);
            out.last_access = build_single(&lasts, parts.nested()).map(Box::new);
        }
    }
    if parts.splits {
        let (by_host, by_client) = split_groups(samples);
        out.by_host = by_host
            .into_iter()
            .filter_map(|(k, v)| build_single(&v, Parts::leaf()).map(|r| (k, r)))
            .collect();
        out.by_client = by_client
            .into_iter()
            .filter_map(|(k, v)| build_single(&v, Parts::leaf()).map(|r| (k, r)))
            .collect();
    }
    Some(out)
}

impl SingleSizedRequests {
    /// Request-count-weighted combination of two summaries, used when two
    /// snapshots are merged and the raw samples are gone. Counts and
    /// extremes are exact; interior percentiles are weighted means.
    pub(crate) fn merge(&mut self, other: &SingleSizedRequests) {
        let (a, b) = (self.requests as f64, other.requests as f64);
        let total = a + b;
        if total == 0.0 {
            return;
        }
        let w = |x: u64, y: u64| ((x as f64 * a + y as f64 * b) / total).round() as u64;
        self.obj_size = ((self.obj_size as f64 * a + other.obj_size as f64 * b) / total) as i64;
        self.dur_avg_millis = w(self.dur_avg_millis, other.dur_avg_millis);
        self.dur_std_dev_millis = w(self.dur_std_dev_millis, other.dur_std_dev_millis);
        self.dur_50_millis = w(self.dur_50_millis, other.dur_50_millis);
        self.dur_75_millis = w(self.dur_75_millis, other.dur_75_millis);
        self.dur_90_millis = w(self.dur_90_millis, other.dur_90_millis);
        self.dur_99_millis = w(self.dur_99_millis, other.dur_99_millis);
        self.fastest_millis = self.fastest_millis.min(other.fastest_millis);
        self.slowest_millis = self.slowest_millis.max(other.slowest_millis);
        self.dur_percentiles_millis =
            match (&self.dur_percentiles_millis, &other.dur_percentiles_millis) {
                (Some(x), Some(y)) if x.len() == y.len() => {
                    Some(x.iter().zip(y).map(|(&p, &q)| w(p, q)).collect())
                }
                _ => None,
            };
        match (&mut self.first_byte, &other.first_byte) {
            (Some(x), Some(y)) => x.merge(y),
            (None, Some(y)) => self.first_byte = Some(y.clone()),
            _ => {}
        }
        merge_boxed(&mut self.first_access, &other.first_access);
        merge_boxed(&mut self.last_access, &other.last_access);
        for (k, v) in &other.by_host {
            match self.by_host.get_mut(k) {
                Some(mine) => mine.merge(v),
                None => {
                    self.by_host.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, v) in &other.by_client {
            match self.by_client.get_mut(k) {
                Some(mine) => mine.merge(v),
                None => {
                    self.by_client.insert(k.clone(), v.clone());
                }
            }
        }
        self.requests += other.requests;
    }
}

fn merge_boxed(
    mine: &mut Option<Box<SingleSizedRequests>>,
    theirs: &Option<Box<SingleSizedRequests>>,
) {
    match (mine.as_deref_mut(), theirs) {
        (Some(x), Some(y)) => x.merge(y),
        (None, Some(y)) => *mine = Some(y.clone()),
        _ => {}
    }
}

// ─── Multi-sized ─────────────────────────────────────────────────

/// One disjoint size bin summarized as bytes-per-second percentiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestSizeRange {
    pub requests: u64,
    pub min_size: i64,
    /// Exclusive upper bound.
    pub max_size: i64,
    pub avg_obj_size: i64,
    pub avg_duration_millis: u64,
    pub bps_average: f64,
    pub bps_fastest: f64,
    pub bps_50: f64,
    pub bps_90: f64,
    pub bps_99: f64,
    pub bps_slowest: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps_percentiles: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_byte: Option<Ttfb>,
}

/// Size-binned distribution of a population with varied object sizes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiSizedRequests {
    pub requests: u64,
    pub avg_obj_size: i64,
    pub by_size: Vec<RequestSizeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_access: Option<Box<MultiSizedRequests>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_access: Option<Box<MultiSizedRequests>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_host: BTreeMap<String, MultiSizedRequests>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_client: BTreeMap<String, MultiSizedRequests>,
}

/// Summarize a multi-sized population. `None` when empty.
pub(crate) fn multi_sized(samples: &[ReqSample], detail: Detail) -> Option<MultiSizedRequests> {
    let refs: Vec<&ReqSample> = samples.iter().collect();
    build_multi(&refs, Parts::for_detail(detail))
}

fn build_multi(samples: &[&ReqSample], parts: Parts) -> Option<MultiSizedRequests> {
    if samples.is_empty() {
        return None;
    }
    let by_size: Vec<RequestSizeRange> = split_sizes(samples, SIZE_SPREAD)
        .into_iter()
        .filter_map(|bin| size_range(&bin, parts.curve))
        .collect();
    let avg_obj_size = (samples.iter().map(|s| s.size as f64).sum::<f64>()
        / samples.len() as f64)
        .round() as i64;

    let mut out = MultiSizedRequests {
        requests: samples.len() as u64,
        avg_obj_size,
        by_size,
        ..MultiSizedRequests::default()
    };

    if parts.access {
        if let Some((firsts, lasts)) = access_split(samples) {
            out.first_access = build_multi(&firsts, parts.nested()).map(Box::new);
            out.last_access = build_multi(&lasts, parts.nested()).map(Box::new);
        }
    }
    if parts.splits {
        let (by_host, by_client) = split_groups(samples);
        out.by_host = by_host
            .into_iter()
            .filter_map(|(k, v)| build_multi(&v, Parts::leaf()).map(|r| (k, r)))
            .collect();
        out.by_client = by_client
            .into_iter()
            .filter_map(|(k, v)| build_multi(&v, Parts::leaf()).map(|r| (k, r)))
            .collect();
    }
    Some(out)
}

fn size_range(bin: &[&ReqSample], curve: bool) -> Option<RequestSizeRange> {
    if bin.is_empty() {
        return None;
    }
    let mut bps: Vec<f64> = bin
        .iter()
        .map(|s| {
            if s.dur_nanos > 0 {
                s.size as f64 * 1e9 / s.dur_nanos as f64
            } else {
                0.0
            }
        })
        .collect();
    bps.sort_by(f64::total_cmp);

    let n = bin.len() as f64;
    let avg_dur_nanos = bin.iter().map(|s| s.dur_nanos as f64).sum::<f64>() / n;
    Some(RequestSizeRange {
        requests: bin.len() as u64,
        min_size: bin.iter().map(|s| s.size).min().unwrap_or(0),
        max_size: bin.iter().map(|s| s.size).max().unwrap_or(0) + 1,
        avg_obj_size: (bin.iter().map(|s| s.size as f64).sum::<f64>() / n).round() as i64,
        avg_duration_millis: (avg_dur_nanos / 1e6).round() as u64,
        bps_average: bps.iter().sum::<f64>() / n,
        bps_fastest: quantile(&bps, 1.0).unwrap_or(0.0),
        bps_50: quantile(&bps, 0.5).unwrap_or(0.0),
        bps_90: quantile(&bps, 0.9).unwrap_or(0.0),
        bps_99: quantile(&bps, 0.99).unwrap_or(0.0),
        bps_slowest: quantile(&bps, 0.0).unwrap_or(0.0),
        bps_percentiles: curve.then(|| curve_101(&bps)),
        first_byte: ttfb_of(bin, curve),
    })
}

impl MultiSizedRequests {
    pub(crate) fn merge(&mut self, other: &MultiSizedRequests) {
        let (a, b) = (self.requests as f64, other.requests as f64);
        let total = a + b;
        if total == 0.0 {
            return;
        }
        self.avg_obj_size =
            ((self.avg_obj_size as f64 * a + other.avg_obj_size as f64 * b) / total) as i64;
        for range in &other.by_size {
            match self
                .by_size
                .iter_mut()
                .find(|r| r.min_size == range.min_size && r.max_size == range.max_size)
            {
                Some(mine) => mine.merge(range),
                None => self.by_size.push(range.clone()),
            }
        }
        self.by_size.sort_by_key(|r| r.min_size);
        match (&mut self.first_access, &other.first_access) {
            (Some(x), Some(y)) => x.merge(y),
            (None, Some(y)) => self.first_access = Some(y.clone()),
            _ => {}
        }
        match (&mut self.last_access, &other.last_access) {
            (Some(x), Some(y)) => x.merge(y),
            (None, Some(y)) => self.last_access = Some(y.clone()),
            _ => {}
        }
        for (k, v) in &other.by_host {
            match self.by_host.get_mut(k) {
                Some(mine) => mine.merge(v),
                None => {
                    self.by_host.insert(k.clone(), v.clone());
                }
            }
        }
        for (k, v) in &other.by_client {
            match self.by_client.get_mut(k) {
                Some(mine) => mine.merge(v),
                None => {
                    self.by_client.insert(k.clone(), v.clone());
                }
            }
        }
        self.requests += other.requests;
    }
}

impl RequestSizeRange {
    fn merge(&mut self, other: &RequestSizeRange) {
        let (a, b) = (self.requests as f64, other.requests as f64);
        let total = a + b;
        if total == 0.0 {
            return;
        }
        let w = |x: f64, y: f64| (x * a + y * b) / total;
        self.avg_obj_size =
            ((self.avg_obj_size as f64 * a + other.avg_obj_size as f64 * b) / total) as i64;
        self.avg_duration_millis = ((self.avg_duration_millis as f64 * a
            + other.avg_duration_millis as f64 * b)
            / total)
            .round() as u64;
        self.bps_average = w(self.bps_average, other.bps_average);
        self.bps_50 = w(self.bps_50, other.bps_50);
        self.bps_90 = w(self.bps_90, other.bps_90);
        self.bps_99 = w(self.bps_99, other.bps_99);
        self.bps_fastest = self.bps_fastest.max(other.bps_fastest);
        self.bps_slowest = self.bps_slowest.min(other.bps_slowest);
        self.bps_percentiles = match (&self.bps_percentiles, &other.bps_percentiles) {
            (Some(x), Some(y)) if x.len() == y.len() => {
                Some(x.iter().zip(y).map(|(&p, &q)| w(p, q)).collect())
            }
            _ => None,
        };
        match (&mut self.first_byte, &other.first_byte) {
            (Some(x), Some(y)) => x.merge(y),
            (None, Some(y)) => self.first_byte = Some(y.clone()),
            _ => {}
        }
        self.requests += other.requests;
    }
}

// ─── Grouping helpers ────────────────────────────────────────────

/// First-touch / last-touch split when any `(endpoint, object)` identity
/// repeats. Samples without an object key always count as unique touches.
fn access_split<'a>(
    samples: &[&'a ReqSample],
) -> Option<(Vec<&'a ReqSample>, Vec<&'a ReqSample>)> {
    let mut first: HashMap<(&str, &str), usize> = HashMap::new();
    let mut last: HashMap<(&str, &str), usize> = HashMap::new();
    let mut unique = 0usize;
    for (i, s) in samples.iter().enumerate() {
        if s.object.is_empty() {
            unique += 1;
            continue;
        }
        first.entry((&s.endpoint, &s.object)).or_insert(i);
        last.insert((&s.endpoint, &s.object), i);
    }
    if first.len() + unique == samples.len() {
        // Every touch was the only touch.
        return None;
    }
    let mut firsts: Vec<&ReqSample> = Vec::with_capacity(first.len() + unique);
    let mut lasts: Vec<&ReqSample> = Vec::with_capacity(first.len() + unique);
    for (i, &s) in samples.iter().enumerate() {
        if s.object.is_empty() {
            firsts.push(s);
            lasts.push(s);
            continue;
        }
        let key = (s.endpoint.as_str(), s.object.as_str());
        if first.get(&key) == Some(&i) {
            firsts.push(s);
        }
        if last.get(&key) == Some(&i) {
            lasts.push(s);
        }
    }
    Some((firsts, lasts))
}

/// Per-host split when more than one endpoint was seen, else per-client
/// split when more than one client was. Groups with a single operation
/// are omitted.
fn split_groups<'a>(
    samples: &[&'a ReqSample],
) -> (
    BTreeMap<String, Vec<&'a ReqSample>>,
    BTreeMap<String, Vec<&'a ReqSample>>,
) {
    let mut hosts: BTreeMap<String, Vec<&ReqSample>> = BTreeMap::new();
    for &s in samples {
        hosts.entry(s.endpoint.clone()).or_default().push(s);
    }
    if hosts.len() > 1 {
        hosts.retain(|_, v| v.len() > 1);
        return (hosts, BTreeMap::new());
    }

    let mut clients: BTreeMap<String, Vec<&ReqSample>> = BTreeMap::new();
    for &s in samples {
        clients.entry(s.client_id.clone()).or_default().push(s);
    }
    if clients.len() > 1 {
        clients.retain(|_, v| v.len() > 1);
        return (BTreeMap::new(), clients);
    }
    (BTreeMap::new(), BTreeMap::new())
}

// ─── Tests ───────────────────────────────────────────────────────
