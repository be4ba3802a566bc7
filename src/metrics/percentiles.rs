//! Percentile math over sorted sample populations.
//!
//! Every percentile in this crate is read from the actual sorted samples,
//! never from an approximating structure: `f = 0` is the fastest entry,
//! `f = 1` the slowest, and intermediate quantiles land on the element at
//! `clamp(round(n*f), 0, n-1)`.

// ─── Index rule ──────────────────────────────────────────────────

/// Index of the `f`-quantile in a sorted population of `n` entries.
pub(crate) fn quantile_index(n: usize, f: f64) -> usize {
    if n == 0 {
        return 0;
    }
    (((n as f64) * f).round() as usize).min(n - 1)
}

/// The `f`-quantile element of a sorted slice, or `None` when empty.
pub(crate) fn quantile<T: Copy>(sorted: &[T], f: f64) -> Option<T> {
    if sorted.is_empty() {
        None
    } else {
        Some(sorted[quantile_index(sorted.len(), f)])
    }
}

/// Percentile-by-integer-percent curve: 101 entries, index `i` holding the
/// `i/100` quantile. Empty input produces an empty curve.
pub(crate) fn curve_101<T: Copy>(sorted: &[T]) -> Vec<T> {
    if sorted.is_empty() {
        return Vec::new();
    }
    (0..=100)
        .map(|i| sorted[quantile_index(sorted.len(), i as f64 / 100.0)])
        .collect()
}

// ─── Summary statistics ──────────────────────────────────────────

/// Full percentile breakdown of one sorted nanosecond population.
/// The "read" side of every request-distribution snapshot.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SampleStats {
    pub count: u64,
    pub avg_nanos: f64,
    pub std_dev_nanos: f64,
    pub fastest: u64,
    pub p25: u64,
    pub p50: u64,
    pub p75: u64,
    pub p90: u64,
    pub p99: u64,
    pub slowest: u64,
}

impl SampleStats {
    /// Extract the breakdown from an ascending-sorted population.
    /// Returns `None` for an empty population.
    pub fn from_sorted(sorted: &[u64]) -> Option<Self> {
        if sorted.is_empty() {
            return None;
        }
        let n = sorted.len();
        let avg = mean(sorted);
        Some(Self {
            count: n as u64,
            avg_nanos: avg,
            std_dev_nanos: std_dev(sorted, avg),
            fastest: sorted[0],
            p25: sorted[quantile_index(n, 0.25)],
            p50: sorted[quantile_index(n, 0.50)],
            p75: sorted[quantile_index(n, 0.75)],
            p90: sorted[quantile_index(n, 0.90)],
            p99: sorted[quantile_index(n, 0.99)],
            slowest: sorted[n - 1],
        })
    }
}

pub(crate) fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().map(|&v| v as f64).sum::<f64>() / values.len() as f64
}

/// Population standard deviation around a precomputed mean.
pub(crate) fn std_dev(values: &[u64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let var = values
        .iter()
        .map(|&v| {
            let d = v as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / values.len() as f64;
    var.sqrt()
}

// ─── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantile_index_clamps_both_ends() {
        assert_eq!(quantile_index(10, 0.0), 0);
        assert_eq!(quantile_index(10, 1.0), 9);
        assert_eq!(quantile_index(10, 0.5), 5);
        assert_eq!(quantile_index(0, 0.5), 0);
    }

    #[test]
    fn quantile_reads_sorted_population() {
        let v: Vec<u64> = (0..100).collect();
        assert_eq!(quantile(&v, 0.0), Some(0));
        assert_eq!(quantile(&v, 0.5), Some(50));
        assert_eq!(quantile(&v, 0.99), Some(99));
        assert_eq!(quantile(&v, 1.0), Some(99));
        assert_eq!(quantile::<u64>(&[], 0.5), None);
    }

    #[test]
    fn curve_has_101_points() {
        let v: Vec<u64> = (0..1000).collect();
        let c = curve_101(&v);
        assert_eq!(c.len(), 101);
        assert_eq!(c[0], 0);
        assert_eq!(c[50], 500);
        assert_eq!(c[100], 999);
        assert!(curve_101::<u64>(&[]).is_empty());
    }

    #[test]
    fn stats_on_uniform_population() {
        let v: Vec<u64> = (1..=100).collect();
        let s = SampleStats::from_sorted(&v).unwrap();
        assert_eq!(s.count, 100);
        assert_eq!(s.fastest, 1);
        assert_eq!(s.slowest, 100);
        assert_eq!(s.p50, 51);
        assert_eq!(s.p99, 100);
        assert!((s.avg_nanos - 50.5).abs() < 1e-9);
    }

    #[test]
    fn std_dev_of_constant_population_is_zero() {
        let v = vec![7u64; 32];
        let s = SampleStats::from_sorted(&v).unwrap();
        assert_eq!(s.std_dev_nanos, 0.0);
        assert_eq!(s.avg_nanos, 7.0);
    }

    #[test]
    fn empty_population_has_no_stats() {
        assert!(SampleStats::from_sorted(&[]).is_none());
    }
}
