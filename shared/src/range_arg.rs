//! Type-safe range argument for magnitude binning.
//!
//! `RangeArg` parses `start:stop:step` from the command line (it implements
//! `FromStr`, so clap accepts it directly) and expands it into bin edges.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a `start:stop:step` range.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RangeError {
    #[error("Range must be in format 'start:stop:step'")]
    Format,
    #[error("Invalid {0} value")]
    Value(&'static str),
    #[error("Step must be positive")]
    NonPositiveStep,
    #[error("Start ({start}) must be less than stop ({stop})")]
    EmptyRange { start: f64, stop: f64 },
}

/// Parse a colon-separated `start:stop:step` specification.
///
/// Only forward ranges are accepted: bin edges must ascend.
///
/// # Examples
/// Valid: "18.0:28.0:0.5", "20:24:1"
///
/// Invalid:
/// - "18.0:28.0" - Missing step component
/// - "nan:28.0:0.5" - Bounds must be finite
/// - "18.0:28.0:0.0" - Step must be positive
/// - "28.0:18.0:0.5" - Start must precede stop
pub fn parse_range(s: &str) -> Result<(f64, f64, f64), RangeError> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return Err(RangeError::Format);
    }

    let parse = |text: &str, what: &'static str| {
        text.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or(RangeError::Value(what))
    };
    let start = parse(parts[0], "start")?;
    let stop = parse(parts[1], "stop")?;
    let step = parse(parts[2], "step")?;

    if step <= 0.0 || !step.is_finite() {
        return Err(RangeError::NonPositiveStep);
    }
    if start >= stop {
        return Err(RangeError::EmptyRange { start, stop });
    }

    Ok((start, stop, step))
}

/// Magnitude range `start:stop:step` used to build explicit bin edges.
///
/// `"18.0:28.0:0.5"` gives half-magnitude completeness bins; `"20:26:2"`
/// a coarse summary.
///
/// # Fields
///
/// * `0` - First edge (inclusive)
/// * `1` - Last edge; always emitted even when `step` does not divide the range
/// * `2` - Spacing between edges, strictly positive
///
/// Values parsed from a string are validated; a range built directly from
/// the tuple fields is checked again by [`RangeArg::edges`].
///
/// # Examples
///
/// ```rust
/// use shared::range_arg::RangeArg;
///
/// let range: RangeArg = "20:22:0.5".parse().unwrap();
/// assert_eq!(range.edges(), vec![20.0, 20.5, 21.0, 21.5, 22.0]);
/// assert!("nan:22:0.5".parse::<RangeArg>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeArg(pub f64, pub f64, pub f64);

impl FromStr for RangeArg {
    type Err = RangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, stop, step) = parse_range(s)?;
        Ok(RangeArg(start, stop, step))
    }
}

impl fmt::Display for RangeArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0, self.1, self.2)
    }
}

impl RangeArg {
    pub fn start(&self) -> f64 {
        self.0
    }

    pub fn stop(&self) -> f64 {
        self.1
    }

    pub fn step(&self) -> f64 {
        self.2
    }

    /// Bin edges from start to stop.
    ///
    /// Edges are generated as `start + i * step` (no accumulated rounding).
    /// The final edge is `stop` itself, so a step that does not divide the
    /// range evenly yields a narrower last bin.
    ///
    /// # Returns
    ///
    /// Ascending edges, or an empty vector when the bounds are not finite,
    /// the step is not positive, or `start >= stop`.
    pub fn edges(&self) -> Vec<f64> {
        let (start, stop, step) = (self.0, self.1, self.2);
        let valid = start.is_finite()
            && stop.is_finite()
            && step.is_finite()
            && step > 0.0
            && start < stop;
        if !valid {
            return Vec::new();
        }
        let mut edges = Vec::new();
        let mut i = 0usize;
        loop {
            let edge = start + i as f64 * step;
            // Treat float noise just below stop as reaching it
            if edge >= stop - step * 1e-9 {
                break;
            }
            edges.push(edge);
            i += 1;
        }
        edges.push(stop);
        edges
    }
}
