//! Histogram resampling with Poisson shot noise per bin

use rand::Rng;
use rand_distr::{Distribution, Poisson};
use shared::algo::{bin_index, equal_width_edges, finite_range};

use super::Draft;
use crate::catalog::{Magnitudes, ReferenceCatalog};
use crate::error::{FakeStarError, Result};

/// Draw a synthetic population whose `band` histogram follows the reference.
///
/// Each bin's expected count is its observed count scaled by
/// `n_stars / total`; the realised count is Poisson distributed around it.
/// Drawn magnitudes are uniform within the bin. Other bands keep the
/// colour of a randomly chosen reference star from the same bin.
pub fn draw<R: Rng + ?Sized>(
    reference: &ReferenceCatalog,
    band: &str,
    bins: usize,
    n_stars: usize,
    rng: &mut R,
) -> Result<Vec<Draft>> {
    if bins == 0 {
        return Err(FakeStarError::config("histogram resampling needs at least one bin"));
    }
    let values = reference.band_values(band)?;
    let (mut lo, mut hi) = finite_range(&values).ok_or_else(|| {
        FakeStarError::sampling(format!("no finite {band} magnitudes to histogram"))
    })?;
    if hi <= lo {
        lo -= 0.5;
        hi += 0.5;
    }
    let edges = equal_width_edges(lo, hi, bins);

    let mut members: Vec<Vec<usize>> = vec![Vec::new(); bins];
    for (idx, &v) in values.iter().enumerate() {
        if let Some(b) = bin_index(v, &edges) {
            members[b].push(idx);
        }
    }
    let total: usize = members.iter().map(Vec::len).sum();
    let scale = n_stars as f64 / total as f64;

    let mut drafts = Vec::new();
    for (b, bin_members) in members.iter().enumerate() {
        if bin_members.is_empty() {
            continue;
        }
        let lambda = bin_members.len() as f64 * scale;
        if lambda <= 0.0 {
            continue;
        }
        let poisson = Poisson::new(lambda).map_err(|e| {
            FakeStarError::sampling(format!("invalid Poisson rate {lambda} for bin {b}: {e}"))
        })?;
        let count = poisson.sample(rng) as usize;

        let (bin_lo, bin_hi) = (edges[b], edges[b + 1]);
        for _ in 0..count {
            let mag = rng.gen_range(bin_lo..bin_hi);
            let donor = &reference.stars[bin_members[rng.gen_range(0..bin_members.len())]];
            let donor_ref = donor.magnitudes[band];

            let magnitudes: Magnitudes = reference
                .bands
                .iter()
                .map(|other| {
                    let value = if other == band {
                        mag
                    } else {
                        donor.magnitudes[other] - donor_ref + mag
                    };
                    (other.clone(), value)
                })
                .collect();
            drafts.push(Draft {
                magnitudes,
                anchor: None,
            });
        }
    }

    if drafts.is_empty() && n_stars > 0 {
        return Err(FakeStarError::sampling(
            "histogram resampling produced no stars",
        ));
    }
    Ok(drafts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ReferenceStar;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn catalog() -> ReferenceCatalog {
        // Luminosity function rising toward faint magnitudes
        let mut stars = Vec::new();
        for i in 0..400 {
            let b = 20.0 + 6.0 * ((i as f64 + 0.5) / 400.0).sqrt();
            let mut m = Magnitudes::new();
            m.insert("B".into(), b);
            m.insert("R".into(), b - 0.8);
            stars.push(ReferenceStar {
                chip: 1 + (i % 2) as u32,
                x: i as f64,
                y: i as f64,
                sky: None,
                magnitudes: m,
            });
        }
        ReferenceCatalog::new(vec!["B".into(), "R".into()], stars).unwrap()
    }

    #[test]
    fn test_total_count_near_target() {
        let reference = catalog();
        let mut rng = StdRng::seed_from_u64(11);
        let drafts = draw(&reference, "B", 12, 5000, &mut rng).unwrap();
        let n = drafts.len() as f64;
        // Poisson total has sigma ~ sqrt(5000) ~ 71
        assert!((n - 5000.0).abs() < 400.0, "got {n} stars");
    }

    #[test]
    fn test_magnitudes_within_range_and_colour_preserved() {
        let reference = catalog();
        let mut rng = StdRng::seed_from_u64(12);
        let drafts = draw(&reference, "B", 8, 1000, &mut rng).unwrap();
        let (lo, hi) = finite_range(&reference.band_values("B").unwrap()).unwrap();
        for d in &drafts {
            let b = d.magnitudes["B"];
            assert!(b >= lo && b <= hi);
            assert_relative_eq!(b - d.magnitudes["R"], 0.8, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_shape_follows_reference() {
        let reference = catalog();
        let mut rng = StdRng::seed_from_u64(13);
        let drafts = draw(&reference, "B", 6, 20000, &mut rng).unwrap();
        let bright = drafts.iter().filter(|d| d.magnitudes["B"] < 22.0).count();
        let faint = drafts.iter().filter(|d| d.magnitudes["B"] > 24.0).count();
        assert!(faint > bright * 2, "faint {faint} vs bright {bright}");
    }

    #[test]
    fn test_same_seed_same_draw() {
        let reference = catalog();
        let a = draw(&reference, "B", 10, 300, &mut StdRng::seed_from_u64(5)).unwrap();
        let b = draw(&reference, "B", 10, 300, &mut StdRng::seed_from_u64(5)).unwrap();
        assert_eq!(a, b);
    }
}
