//! Interpolation helpers for tabulated data.
//!
//! Tabulated relations such as isochrone mass-magnitude tracks and sorted
//! magnitude samples are evaluated through these functions:
//!
//! - **Linear interpolation**: single-point lookups with input validation
//! - **Vectorized interpolation**: many lookups against one validated table
//! - **Grids**: evenly spaced sample points

use thiserror::Error;

/// Why a tabulated lookup failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterpError {
    /// Lookup point, then the table's lower and upper bound
    #[error("{0} lies outside the table range [{1}, {2}]")]
    OutOfBounds(f64, f64, f64),
    #[error("table needs at least two rows")]
    InsufficientData,
    #[error("table columns differ in length")]
    MismatchedLengths,
    #[error("table abscissae are not ascending")]
    UnsortedData,
}

/// Check that `xs`/`ys` form a usable interpolation table.
fn validate_table(xs: &[f64], ys: &[f64]) -> Result<(), InterpError> {
    if xs.len() != ys.len() {
        return Err(InterpError::MismatchedLengths);
    }
    if xs.len() < 2 {
        return Err(InterpError::InsufficientData);
    }
    if xs.windows(2).any(|w| w[1] < w[0]) {
        return Err(InterpError::UnsortedData);
    }
    Ok(())
}

/// Interpolate against a table already known to be valid.
fn interp_unchecked(x: f64, xs: &[f64], ys: &[f64]) -> Result<f64, InterpError> {
    let last = xs.len() - 1;
    if x < xs[0] || x > xs[last] {
        return Err(InterpError::OutOfBounds(x, xs[0], xs[last]));
    }

    // First row strictly above x closes the bracketing interval
    let idx = xs.partition_point(|&row| row <= x);
    if idx == 0 {
        return Ok(ys[0]);
    }
    if idx > last {
        return Ok(ys[last]);
    }

    let (x1, x2) = (xs[idx - 1], xs[idx]);
    let (y1, y2) = (ys[idx - 1], ys[idx]);
    if x2 == x1 {
        return Ok(y1);
    }
    let t = (x - x1) / (x2 - x1);
    Ok(y1 + t * (y2 - y1))
}

/// Linear interpolation of `ys(xs)` at `x`.
///
/// `xs` must be sorted ascending and match `ys` in length. Values outside
/// `[xs[0], xs[n-1]]` are rejected rather than extrapolated.
///
/// # Arguments
///
/// * `x` - Point to evaluate
/// * `xs` - Table abscissae, ascending (repeated values allowed)
/// * `ys` - Table values, one per abscissa
///
/// # Returns
///
/// * `Ok(y)` - Linearly interpolated value; exact table rows return their `ys` entry
/// * `Err(InterpError::OutOfBounds)` - `x` lies outside the table
/// * `Err(InterpError::InsufficientData)` - Fewer than two rows
/// * `Err(InterpError::MismatchedLengths)` - `xs` and `ys` differ in length
/// * `Err(InterpError::UnsortedData)` - `xs` is not ascending
///
/// # Examples
///
/// ```rust
/// use shared::algo::misc::interp;
///
/// let mass = vec![0.5, 1.0, 2.0];
/// let abs_mag = vec![8.0, 4.8, 1.6];
/// let m = interp(0.75, &mass, &abs_mag).unwrap();
/// assert!((m - 6.4).abs() < 1e-12);
/// ```
pub fn interp(x: f64, xs: &[f64], ys: &[f64]) -> Result<f64, InterpError> {
    validate_table(xs, ys)?;
    interp_unchecked(x, xs, ys)
}

/// Interpolate every point of `points` against one table.
///
/// The table is validated once. Fails on the first out-of-range point.
pub fn interp_many(points: &[f64], xs: &[f64], ys: &[f64]) -> Result<Vec<f64>, InterpError> {
    validate_table(xs, ys)?;
    points
        .iter()
        .map(|&x| interp_unchecked(x, xs, ys))
        .collect()
}

/// `n` evenly spaced values from `start` to `stop` inclusive.
///
/// `n == 1` yields `[start]`; `n == 0` yields an empty vector.
pub fn linspace(start: f64, stop: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n)
                .map(|i| {
                    if i == n - 1 {
                        stop
                    } else {
                        start + i as f64 * step
                    }
                })
                .collect()
        }
    }
}
