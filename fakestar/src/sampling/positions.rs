//! Placement of synthetic stars on the detector

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

use crate::catalog::{ChipBounds, ReferenceCatalog, ReferenceStar};
use crate::error::{FakeStarError, Result};
use crate::wcs::WorldToPixel;

/// Attempts to find an on-detector sky offset before giving up.
const MAX_PLACEMENT_ATTEMPTS: usize = 100;

fn default_offset_arcsec() -> f64 {
    4.0
}

/// How synthetic star positions are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PositionMode {
    /// Uniform within the observed bounding box of a chip.
    ChipBox,
    /// Small random angular offset around an observed source.
    SkyOffsets {
        #[serde(default = "default_offset_arcsec")]
        max_offset_arcsec: f64,
    },
}

impl Default for PositionMode {
    fn default() -> Self {
        PositionMode::ChipBox
    }
}

/// Position sampler bound to a reference catalog.
pub enum PositionSampler<'a> {
    ChipBox {
        chips: Vec<u32>,
        bounds: BTreeMap<u32, ChipBounds>,
    },
    SkyOffsets {
        anchors: &'a [ReferenceStar],
        wcs: &'a dyn WorldToPixel,
        max_offset_deg: f64,
    },
}

impl<'a> PositionSampler<'a> {
    /// Uniform placement within each chip's observed footprint.
    pub fn chip_box(reference: &ReferenceCatalog) -> Result<Self> {
        let chips = reference.chips();
        if chips.is_empty() {
            return Err(FakeStarError::config(
                "reference catalog is empty; no chip footprint to place stars in",
            ));
        }
        Ok(PositionSampler::ChipBox {
            chips,
            bounds: reference.chip_bounds(),
        })
    }

    /// Placement by angular offsets around reference sources.
    pub fn sky_offsets(
        reference: &'a ReferenceCatalog,
        wcs: &'a dyn WorldToPixel,
        max_offset_arcsec: f64,
    ) -> Result<Self> {
        if !reference.has_sky_coordinates() {
            return Err(FakeStarError::config(
                "sky offset placement needs RA and DEC columns in the reference catalog",
            ));
        }
        if max_offset_arcsec <= 0.0 || !max_offset_arcsec.is_finite() {
            return Err(FakeStarError::config(format!(
                "sky offset radius must be positive, got {max_offset_arcsec}"
            )));
        }
        Ok(PositionSampler::SkyOffsets {
            anchors: &reference.stars,
            wcs,
            max_offset_deg: max_offset_arcsec / 3600.0,
        })
    }

    /// Build the sampler configured by `mode`.
    ///
    /// Sky offsets need a WCS; asking for them without one is a configuration error.
    pub fn from_mode(
        mode: PositionMode,
        reference: &'a ReferenceCatalog,
        wcs: Option<&'a dyn WorldToPixel>,
    ) -> Result<Self> {
        match mode {
            PositionMode::ChipBox => Self::chip_box(reference),
            PositionMode::SkyOffsets { max_offset_arcsec } => {
                let wcs = wcs.ok_or_else(|| {
                    FakeStarError::config("sky offset placement requires a WCS")
                })?;
                Self::sky_offsets(reference, wcs, max_offset_arcsec)
            }
        }
    }

    /// Choose (chip, x, y) for one synthetic star.
    ///
    /// `anchor` ties the star to a specific reference source (its chip, and
    /// for sky offsets its sky position); otherwise one is drawn at random.
    pub fn place<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        anchor: Option<&ReferenceStar>,
    ) -> Result<(u32, f64, f64)> {
        match self {
            PositionSampler::ChipBox { chips, bounds } => {
                let chip = match anchor {
                    Some(star) => star.chip,
                    None => chips[rng.gen_range(0..chips.len())],
                };
                let bbox = bounds.get(&chip).ok_or_else(|| {
                    FakeStarError::sampling(format!("no observed footprint for chip {chip}"))
                })?;
                let (x, y) = bbox.sample(rng);
                Ok((chip, x, y))
            }
            PositionSampler::SkyOffsets {
                anchors,
                wcs,
                max_offset_deg,
            } => {
                let star = match anchor {
                    Some(star) => star,
                    None => &anchors[rng.gen_range(0..anchors.len())],
                };
                let (ra, dec) = star.sky.ok_or_else(|| {
                    FakeStarError::config("anchor star has no sky coordinates")
                })?;
                let cos_dec = dec.to_radians().cos().max(1e-6);

                for _ in 0..MAX_PLACEMENT_ATTEMPTS {
                    let r = rng.gen::<f64>() * max_offset_deg;
                    let theta = rng.gen::<f64>() * 2.0 * PI;
                    let ra_new = ra + r * theta.cos() / cos_dec;
                    let dec_new = dec + r * theta.sin();
                    if let Some((x, y)) = wcs.world_to_pixel(ra_new, dec_new) {
                        return Ok((star.chip, x, y));
                    }
                }
                Err(FakeStarError::sampling(format!(
                    "could not place a star near RA {ra:.6} Dec {dec:.6} on the detector"
                )))
            }
        }
    }
}
