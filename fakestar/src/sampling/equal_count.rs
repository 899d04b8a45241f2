//! Equal-count binning: bin-mean magnitudes replicated to the target count

use log::debug;
use shared::algo::{equal_count_edges, mean};

use super::Draft;
use crate::catalog::{Magnitudes, ReferenceCatalog};
use crate::error::{FakeStarError, Result};

/// Mean magnitudes of each non-empty equal-count bin of `band`.
///
/// Members are the stars strictly between consecutive edges.
pub fn bin_means(reference: &ReferenceCatalog, band: &str, bins: usize) -> Result<Vec<Magnitudes>> {
    let values = reference.band_values(band)?;
    let edges = equal_count_edges(&values, bins).ok_or_else(|| {
        FakeStarError::sampling(format!(
            "cannot build {bins} equal-count bins from {} stars",
            values.len()
        ))
    })?;

    let mut templates = Vec::new();
    for (i, pair) in edges.windows(2).enumerate() {
        let (lo, hi) = (pair[0], pair[1]);
        let members: Vec<usize> = values
            .iter()
            .enumerate()
            .filter(|(_, &v)| v > lo && v < hi)
            .map(|(idx, _)| idx)
            .collect();
        if members.is_empty() {
            debug!("Equal-count bin {} ({:.3}, {:.3}) is empty, skipping", i, lo, hi);
            continue;
        }

        let mut template = Magnitudes::new();
        for b in &reference.bands {
            let band_values: Vec<f64> = members
                .iter()
                .map(|&idx| reference.stars[idx].magnitudes[b])
                .collect();
            // members is non-empty so the mean exists
            template.insert(b.clone(), mean(&band_values).unwrap_or(f64::NAN));
        }
        templates.push(template);
    }

    if templates.is_empty() {
        return Err(FakeStarError::sampling(
            "every equal-count magnitude bin is empty",
        ));
    }
    Ok(templates)
}

/// Bin-mean templates repeated cyclically until `n_stars` drafts exist.
pub fn draw(reference: &ReferenceCatalog, band: &str, bins: usize, n_stars: usize) -> Result<Vec<Draft>> {
    let templates = bin_means(reference, band, bins)?;
    Ok(templates
        .iter()
        .cycle()
        .take(n_stars)
        .map(|magnitudes| Draft {
            magnitudes: magnitudes.clone(),
            anchor: None,
        })
        .collect())
}
