//! Empirical resampling: the observed catalog repeated with small magnitude jitter

use rand::Rng;

use super::Draft;
use crate::catalog::ReferenceCatalog;
use crate::error::{FakeStarError, Result};

/// Repeat the reference catalog until `n_stars` drafts exist.
///
/// Every band of every copy gets an independent uniform offset in
/// `[-max_offset, max_offset]` so replicated stars are not exact duplicates.
/// Drafts stay anchored to their source star.
pub fn draw<R: Rng + ?Sized>(
    reference: &ReferenceCatalog,
    max_offset: f64,
    n_stars: usize,
    rng: &mut R,
) -> Result<Vec<Draft>> {
    if reference.stars.is_empty() {
        return Err(FakeStarError::sampling(
            "cannot resample an empty reference catalog",
        ));
    }
    if max_offset < 0.0 || !max_offset.is_finite() {
        return Err(FakeStarError::config(format!(
            "jitter offset must be non-negative, got {max_offset}"
        )));
    }

    let drafts = (0..reference.stars.len())
        .cycle()
        .take(n_stars)
        .map(|idx| {
            let magnitudes = reference.stars[idx]
                .magnitudes
                .iter()
                .map(|(band, &mag)| {
                    let offset = if max_offset > 0.0 {
                        rng.gen_range(-max_offset..=max_offset)
                    } else {
                        0.0
                    };
                    (band.clone(), mag + offset)
                })
                .collect();
            Draft {
                magnitudes,
                anchor: Some(idx),
            }
        })
        .collect();
    Ok(drafts)
}
