//! Sample statistics and binning for catalog resampling

use super::misc::{interp_many, linspace};

/// Arithmetic mean, or `None` for an empty slice.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Minimum and maximum of the finite values in `values`.
pub fn finite_range(values: &[f64]) -> Option<(f64, f64)> {
    values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(None, |acc, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
}

/// Bin edges that split `values` into `n_bins` groups of (nearly) equal count.
///
/// Edges are read off the sorted sample at evenly spaced fractional ranks
/// `0, n/K, 2n/K, ..., n`, with ranks past the last sample clamped to it.
/// The first edge is truncated toward zero to an integer and the last edge
/// is nudged up by `1e-4` so the brightest and faintest samples fall strictly
/// inside the outer bins.
///
/// Returns `None` when `values` is empty or `n_bins` is zero.
///
/// # Examples
///
/// ```rust
/// use shared::algo::stats::equal_count_edges;
///
/// let mags = vec![20.5, 21.0, 21.5, 22.0, 22.5];
/// let edges = equal_count_edges(&mags, 2).unwrap();
/// assert_eq!(edges.len(), 3);
/// assert_eq!(edges[0], 20.0);
/// ```
pub fn equal_count_edges(values: &[f64], n_bins: usize) -> Option<Vec<f64>> {
    if values.is_empty() || n_bins == 0 {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();

    let mut edges = if n == 1 {
        vec![sorted[0]; n_bins + 1]
    } else {
        let last_rank = (n - 1) as f64;
        let ranks: Vec<f64> = linspace(0.0, n as f64, n_bins + 1)
            .into_iter()
            .map(|r| r.min(last_rank))
            .collect();
        let index: Vec<f64> = (0..n).map(|i| i as f64).collect();
        interp_many(&ranks, &index, &sorted).ok()?
    };

    edges[0] = edges[0].trunc();
    edges[n_bins] += 1e-4;
    Some(edges)
}

/// `n_bins + 1` equal-width edges spanning `[lo, hi]`.
pub fn equal_width_edges(lo: f64, hi: f64, n_bins: usize) -> Vec<f64> {
    if n_bins == 0 {
        return Vec::new();
    }
    linspace(lo, hi, n_bins + 1)
}

/// Index of the bin containing `value`.
///
/// Bins are half-open `[edge_i, edge_i+1)` except the last, which also
/// includes its upper edge. Values outside the edges (or NaN) map to `None`.
pub fn bin_index(value: f64, edges: &[f64]) -> Option<usize> {
    if edges.len() < 2 || !value.is_finite() {
        return None;
    }
    let last = edges.len() - 1;
    if value < edges[0] || value > edges[last] {
        return None;
    }
    if value == edges[last] {
        return Some(last - 1);
    }
    // First edge strictly greater than value bounds its bin from above
    let upper = edges.partition_point(|&e| e <= value);
    Some(upper.saturating_sub(1).min(last - 1))
}

/// Count of `values` falling in each bin defined by `edges`.
pub fn histogram(values: &[f64], edges: &[f64]) -> Vec<usize> {
    let mut counts = vec![0usize; edges.len().saturating_sub(1)];
    for &v in values {
        if let Some(i) = bin_index(v, edges) {
            counts[i] += 1;
        }
    }
    counts
}
