//! Synthetic catalog generation
//!
//! A [`SamplingPolicy`] decides the magnitudes of the synthetic population;
//! a [`PositionSampler`] decides where each star lands. Both draw from one
//! seeded `StdRng`, so a given reference catalog, policy and seed always
//! produce the same catalog.

pub mod equal_count;
pub mod histogram;
pub mod jitter;
pub mod luminosity;
pub mod positions;

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use luminosity::{Isochrone, MassFunction};
pub use positions::{PositionMode, PositionSampler};

use crate::catalog::{Magnitudes, ReferenceCatalog, SyntheticCatalog, SyntheticStar};
use crate::error::{FakeStarError, Result};

/// Magnitudes for one synthetic star before it is placed.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub magnitudes: Magnitudes,
    /// Index of the reference star this draft was copied from, if any
    pub anchor: Option<usize>,
}

fn default_jitter() -> f64 {
    0.01
}

/// How synthetic magnitudes are drawn from the reference population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingPolicy {
    /// Bin-mean magnitudes of K equal-count bins, replicated.
    EqualCount { bins: usize },
    /// Poisson counts per histogram bin, uniform magnitudes within the bin.
    Histogram { bins: usize },
    /// The reference catalog repeated with a small uniform offset per band.
    EmpiricalJitter {
        #[serde(default = "default_jitter")]
        max_offset: f64,
    },
    /// Masses from a mass function mapped through an isochrone.
    LuminosityFunction {
        #[serde(default)]
        mass_function: MassFunction,
        isochrone_path: PathBuf,
        distance_modulus: f64,
    },
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::EqualCount { bins: 20 }
    }
}

impl SamplingPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            SamplingPolicy::EqualCount { .. } => "equal-count",
            SamplingPolicy::Histogram { .. } => "histogram",
            SamplingPolicy::EmpiricalJitter { .. } => "empirical-jitter",
            SamplingPolicy::LuminosityFunction { .. } => "luminosity-function",
        }
    }

    fn drafts(
        &self,
        reference: &ReferenceCatalog,
        reference_band: &str,
        n_stars: usize,
        rng: &mut StdRng,
    ) -> Result<Vec<Draft>> {
        match self {
            SamplingPolicy::EqualCount { bins } => {
                equal_count::draw(reference, reference_band, *bins, n_stars)
            }
            SamplingPolicy::Histogram { bins } => {
                histogram::draw(reference, reference_band, *bins, n_stars, rng)
            }
            SamplingPolicy::EmpiricalJitter { max_offset } => {
                jitter::draw(reference, *max_offset, n_stars, rng)
            }
            SamplingPolicy::LuminosityFunction {
                mass_function,
                isochrone_path,
                distance_modulus,
            } => {
                let isochrone = Isochrone::load_csv(isochrone_path)?;
                luminosity::draw(
                    mass_function,
                    &isochrone,
                    &reference.bands,
                    *distance_modulus,
                    n_stars,
                    rng,
                )
            }
        }
    }
}

/// Generate `n_stars` synthetic stars modelled on `reference`.
///
/// `reference_band` is the band the binned policies histogram. Stars are
/// numbered 0..N in generation order.
pub fn generate(
    reference: &ReferenceCatalog,
    policy: &SamplingPolicy,
    reference_band: &str,
    n_stars: usize,
    positions: &PositionSampler,
    seed: u64,
) -> Result<SyntheticCatalog> {
    if !reference.bands.iter().any(|b| b == reference_band) {
        return Err(FakeStarError::config(format!(
            "reference band {reference_band} not in catalog (available: {})",
            reference.bands.join(", ")
        )));
    }
    if reference.stars.is_empty() {
        return Err(FakeStarError::config("reference catalog has no stars"));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let drafts = policy.drafts(reference, reference_band, n_stars, &mut rng)?;

    let mut stars = Vec::with_capacity(drafts.len());
    for (id, draft) in drafts.into_iter().enumerate() {
        let anchor = draft.anchor.map(|idx| &reference.stars[idx]);
        let (chip, x, y) = positions.place(&mut rng, anchor)?;
        stars.push(SyntheticStar {
            id,
            chip,
            x,
            y,
            magnitudes: draft.magnitudes,
        });
    }

    info!(
        "Generated {} synthetic stars ({} policy, {} band, seed {})",
        stars.len(),
        policy.name(),
        reference_band,
        seed
    );
    Ok(SyntheticCatalog {
        bands: reference.bands.clone(),
        stars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::sample_catalog;

    #[test]
    fn test_generate_assigns_sequential_ids() {
        let reference = sample_catalog();
        let sampler = PositionSampler::chip_box(&reference).unwrap();
        let policy = SamplingPolicy::EmpiricalJitter { max_offset: 0.01 };
        let catalog = generate(&reference, &policy, "F475W", 9, &sampler, 42).unwrap();
        assert_eq!(catalog.len(), 9);
        let ids: Vec<usize> = catalog.stars.iter().map(|s| s.id).collect();
        assert_eq!(ids, (0..9).collect::<Vec<_>>());
        assert_eq!(catalog.bands, reference.bands);
    }

    #[test]
    fn test_generate_is_deterministic() {
        let reference = sample_catalog();
        let sampler = PositionSampler::chip_box(&reference).unwrap();
        let policy = SamplingPolicy::EqualCount { bins: 2 };
        let a = generate(&reference, &policy, "F475W", 20, &sampler, 7).unwrap();
        let b = generate(&reference, &policy, "F475W", 20, &sampler, 7).unwrap();
        let c = generate(&reference, &policy, "F475W", 20, &sampler, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_jitter_keeps_source_chip() {
        let reference = sample_catalog();
        let sampler = PositionSampler::chip_box(&reference).unwrap();
        let policy = SamplingPolicy::EmpiricalJitter { max_offset: 0.0 };
        let catalog = generate(&reference, &policy, "F814W", 8, &sampler, 1).unwrap();
        for (i, star) in catalog.stars.iter().enumerate() {
            assert_eq!(star.chip, reference.stars[i % 4].chip);
        }
    }

    #[test]
    fn test_unknown_reference_band() {
        let reference = sample_catalog();
        let sampler = PositionSampler::chip_box(&reference).unwrap();
        let err = generate(
            &reference,
            &SamplingPolicy::default(),
            "F606W",
            10,
            &sampler,
            0,
        )
        .unwrap_err();
        assert!(matches!(err, FakeStarError::Configuration(_)));
    }

    #[test]
    fn test_policy_json_tags() {
        let policy: SamplingPolicy =
            serde_json::from_str(r#"{"kind": "empirical_jitter"}"#).unwrap();
        assert_eq!(policy, SamplingPolicy::EmpiricalJitter { max_offset: 0.01 });

        let policy: SamplingPolicy = serde_json::from_str(
            r#"{"kind": "luminosity_function", "isochrone_path": "iso.csv", "distance_modulus": 24.47}"#,
        )
        .unwrap();
        match policy {
            SamplingPolicy::LuminosityFunction { mass_function, .. } => {
                assert_eq!(mass_function, MassFunction::kroupa())
            }
            other => panic!("unexpected policy {other:?}"),
        }
    }
}
