//! Luminosity-function sampling from a mass function and an isochrone
//!
//! Stellar masses are drawn by rejection sampling against the mass function,
//! converted to absolute magnitudes by interpolating an isochrone, and
//! shifted by a distance modulus.
//!
//! The proposal is piecewise log-uniform over the segments of the mass
//! function. Within one segment `m * pdf(m)` is a single power law, so its
//! maximum sits at a segment end and bounds the acceptance ratio exactly.

use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use shared::algo::interp;
use std::collections::BTreeMap;
use std::path::Path;

use super::Draft;
use crate::catalog::{Magnitudes, MAG_SUFFIX};
use crate::error::{FakeStarError, Result};

/// Rejection attempts allowed per requested star (plus a fixed floor).
const ATTEMPTS_PER_STAR: usize = 1_000;
const MIN_ATTEMPTS: usize = 10_000;

/// Initial mass function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MassFunction {
    /// `dN/dm ∝ m^slope_i` between consecutive breaks, continuous at each break.
    ///
    /// `breaks` holds the segment boundaries in solar masses, including the
    /// outer limits, so `breaks.len() == slopes.len() + 1`.
    BrokenPowerLaw { breaks: Vec<f64>, slopes: Vec<f64> },
}

impl Default for MassFunction {
    fn default() -> Self {
        Self::kroupa()
    }
}

/// One power-law piece of a mass function restricted to a mass range.
#[derive(Debug, Clone, Copy)]
struct Segment {
    lo: f64,
    hi: f64,
    slope: f64,
    coeff: f64,
}

impl Segment {
    fn pdf(&self, m: f64) -> f64 {
        self.coeff * m.powf(self.slope)
    }

    /// Upper bound of `m * pdf(m)` over the segment.
    fn envelope(&self) -> f64 {
        (self.lo * self.pdf(self.lo)).max(self.hi * self.pdf(self.hi))
    }

    /// Envelope mass under the log-uniform proposal.
    fn weight(&self) -> f64 {
        self.envelope() * (self.hi / self.lo).ln()
    }
}

impl MassFunction {
    /// Kroupa (2001) broken power law from 0.01 to 120 solar masses.
    pub fn kroupa() -> Self {
        MassFunction::BrokenPowerLaw {
            breaks: vec![0.01, 0.08, 0.5, 120.0],
            slopes: vec![-0.3, -1.3, -2.3],
        }
    }

    /// Single power law (e.g. Salpeter with slope -2.35).
    pub fn power_law(m_min: f64, m_max: f64, slope: f64) -> Self {
        MassFunction::BrokenPowerLaw {
            breaks: vec![m_min, m_max],
            slopes: vec![slope],
        }
    }

    pub fn validate(&self) -> Result<()> {
        let MassFunction::BrokenPowerLaw { breaks, slopes } = self;
        if slopes.is_empty() || breaks.len() != slopes.len() + 1 {
            return Err(FakeStarError::config(format!(
                "mass function needs one more break than slopes (got {} breaks, {} slopes)",
                breaks.len(),
                slopes.len()
            )));
        }
        if breaks[0] <= 0.0 || breaks.windows(2).any(|w| w[1] <= w[0]) {
            return Err(FakeStarError::config(
                "mass function breaks must be positive and strictly ascending",
            ));
        }
        if slopes.iter().any(|s| !s.is_finite()) {
            return Err(FakeStarError::config("mass function slopes must be finite"));
        }
        Ok(())
    }

    /// Mass range on which the function is defined.
    pub fn domain(&self) -> (f64, f64) {
        let MassFunction::BrokenPowerLaw { breaks, .. } = self;
        (breaks[0], breaks[breaks.len() - 1])
    }

    /// Continuity coefficient of every segment, first segment normalised to 1.
    fn coefficients(&self) -> Vec<f64> {
        let MassFunction::BrokenPowerLaw { breaks, slopes } = self;
        let mut coeffs = Vec::with_capacity(slopes.len());
        coeffs.push(1.0);
        for j in 1..slopes.len() {
            let b = breaks[j];
            let prev = coeffs[j - 1];
            coeffs.push(prev * b.powf(slopes[j - 1] - slopes[j]));
        }
        coeffs
    }

    /// Unnormalised probability density at mass `m`; zero outside the domain.
    pub fn pdf(&self, m: f64) -> f64 {
        let MassFunction::BrokenPowerLaw { breaks, slopes } = self;
        let (lo, hi) = self.domain();
        if !(m >= lo && m <= hi) {
            return 0.0;
        }
        let coeffs = self.coefficients();
        let j = breaks[1..]
            .iter()
            .position(|&b| m <= b)
            .unwrap_or(slopes.len() - 1);
        coeffs[j] * m.powf(slopes[j])
    }

    /// Segments clipped to `[lo, hi]`.
    fn segments(&self, lo: f64, hi: f64) -> Vec<Segment> {
        let MassFunction::BrokenPowerLaw { breaks, slopes } = self;
        let coeffs = self.coefficients();
        (0..slopes.len())
            .filter_map(|j| {
                let seg_lo = breaks[j].max(lo);
                let seg_hi = breaks[j + 1].min(hi);
                (seg_hi > seg_lo).then_some(Segment {
                    lo: seg_lo,
                    hi: seg_hi,
                    slope: slopes[j],
                    coeff: coeffs[j],
                })
            })
            .collect()
    }
}

/// Theoretical isochrone: absolute magnitude per band as a function of mass.
#[derive(Debug, Clone, PartialEq)]
pub struct Isochrone {
    /// Initial masses, ascending
    pub masses: Vec<f64>,
    /// Absolute magnitudes per band, aligned with `masses`
    pub magnitudes: BTreeMap<String, Vec<f64>>,
}

impl Isochrone {
    /// Build from unsorted rows; rows are ordered by mass.
    pub fn new(masses: Vec<f64>, magnitudes: BTreeMap<String, Vec<f64>>) -> Result<Self> {
        if masses.len() < 2 {
            return Err(FakeStarError::config(
                "isochrone needs at least two mass points",
            ));
        }
        if magnitudes.values().any(|col| col.len() != masses.len()) {
            return Err(FakeStarError::config(
                "isochrone columns differ in length",
            ));
        }

        let mut order: Vec<usize> = (0..masses.len()).collect();
        order.sort_by(|&a, &b| masses[a].total_cmp(&masses[b]));
        let masses = order.iter().map(|&i| masses[i]).collect();
        let magnitudes = magnitudes
            .into_iter()
            .map(|(band, col)| (band, order.iter().map(|&i| col[i]).collect()))
            .collect();
        Ok(Self { masses, magnitudes })
    }

    /// Load a CSV isochrone with a `mass` column and one column per band.
    ///
    /// Band columns may carry the `_VEGA` suffix; it is stripped.
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| {
                FakeStarError::config(format!("cannot read isochrone {}: {e}", path.display()))
            })?;
        let headers = rdr.headers()?.clone();
        let mass_col = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case("mass"))
            .ok_or_else(|| FakeStarError::config("isochrone lacks a mass column"))?;

        let band_cols: Vec<(usize, String)> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != mass_col)
            .map(|(i, h)| (i, h.strip_suffix(MAG_SUFFIX).unwrap_or(h).to_string()))
            .collect();

        let mut masses = Vec::new();
        let mut magnitudes: BTreeMap<String, Vec<f64>> = band_cols
            .iter()
            .map(|(_, band)| (band.clone(), Vec::new()))
            .collect();
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let parse = |col: usize| {
                record[col].parse::<f64>().map_err(|_| {
                    FakeStarError::config(format!(
                        "isochrone row {row}: non-numeric value '{}'",
                        &record[col]
                    ))
                })
            };
            masses.push(parse(mass_col)?);
            for (col, band) in &band_cols {
                let value = parse(*col)?;
                if let Some(column) = magnitudes.get_mut(band) {
                    column.push(value);
                }
            }
        }
        Self::new(masses, magnitudes)
    }

    pub fn mass_range(&self) -> (f64, f64) {
        (self.masses[0], self.masses[self.masses.len() - 1])
    }

    /// Absolute magnitude in `band` at `mass`.
    pub fn magnitude(&self, band: &str, mass: f64) -> Result<f64> {
        let column = self.magnitudes.get(band).ok_or_else(|| {
            FakeStarError::config(format!("isochrone has no {band} column"))
        })?;
        interp(mass, &self.masses, column)
            .map_err(|e| FakeStarError::sampling(format!("isochrone lookup failed: {e}")))
    }
}

/// Mass range shared by the mass function and the isochrone.
pub fn sampling_range(mass_function: &MassFunction, isochrone: &Isochrone) -> Result<(f64, f64)> {
    let (mf_lo, mf_hi) = mass_function.domain();
    let (iso_lo, iso_hi) = isochrone.mass_range();
    let lo = mf_lo.max(iso_lo);
    let hi = mf_hi.min(iso_hi);
    if lo >= hi {
        return Err(FakeStarError::sampling(format!(
            "mass function [{mf_lo}, {mf_hi}] does not overlap isochrone [{iso_lo}, {iso_hi}]"
        )));
    }
    Ok((lo, hi))
}

/// Draw `n_stars` masses from the mass function restricted to `[lo, hi]`.
pub fn sample_masses<R: Rng + ?Sized>(
    mass_function: &MassFunction,
    lo: f64,
    hi: f64,
    n_stars: usize,
    rng: &mut R,
) -> Result<Vec<f64>> {
    let segments = mass_function.segments(lo, hi);
    let weights: Vec<f64> = segments.iter().map(Segment::weight).collect();
    let total_weight: f64 = weights.iter().sum();
    if segments.is_empty() || !(total_weight > 0.0) || !total_weight.is_finite() {
        return Err(FakeStarError::sampling(format!(
            "mass function has no probability in [{lo}, {hi}]"
        )));
    }

    let budget = n_stars.saturating_mul(ATTEMPTS_PER_STAR).max(MIN_ATTEMPTS);
    let mut masses = Vec::with_capacity(n_stars);
    let mut attempts = 0usize;
    while masses.len() < n_stars {
        if attempts >= budget {
            return Err(FakeStarError::sampling(format!(
                "rejection sampling accepted {} of {} masses in {} attempts",
                masses.len(),
                n_stars,
                attempts
            )));
        }
        attempts += 1;

        // Choose a segment in proportion to its envelope weight
        let mut pick = rng.gen::<f64>() * total_weight;
        let mut seg = &segments[segments.len() - 1];
        for (s, w) in segments.iter().zip(&weights) {
            if pick < *w {
                seg = s;
                break;
            }
            pick -= w;
        }

        let m = (seg.lo * (seg.hi / seg.lo).powf(rng.gen::<f64>())).clamp(seg.lo, seg.hi);
        let u = rng.gen::<f64>() * seg.envelope();
        if u < m * seg.pdf(m) {
            masses.push(m);
        }
    }
    debug!(
        "Accepted {} masses in {} attempts over [{:.3}, {:.3}] Msun",
        n_stars, attempts, lo, hi
    );
    Ok(masses)
}

/// Draft stars from the mass function mapped through the isochrone.
pub fn draw<R: Rng + ?Sized>(
    mass_function: &MassFunction,
    isochrone: &Isochrone,
    bands: &[String],
    distance_modulus: f64,
    n_stars: usize,
    rng: &mut R,
) -> Result<Vec<Draft>> {
    mass_function.validate()?;
    for band in bands {
        if !isochrone.magnitudes.contains_key(band) {
            return Err(FakeStarError::config(format!(
                "isochrone has no column for band {band}"
            )));
        }
    }

    let (lo, hi) = sampling_range(mass_function, isochrone)?;
    let masses = sample_masses(mass_function, lo, hi, n_stars, rng)?;

    masses
        .into_iter()
        .map(|mass| {
            let mut magnitudes = Magnitudes::new();
            for band in bands {
                magnitudes.insert(
                    band.clone(),
                    isochrone.magnitude(band, mass)? + distance_modulus,
                );
            }
            Ok(Draft {
                magnitudes,
                anchor: None,
            })
        })
        .collect()
}
