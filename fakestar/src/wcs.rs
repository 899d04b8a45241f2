//! Sky to detector coordinate conversion seam.
//!
//! Real astrometric solutions come from an external WCS utility; the
//! pipeline only needs the sky-to-pixel direction when synthetic stars are
//! placed around known sky positions.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FakeStarError, Result};

/// Converts sky coordinates (degrees) to detector pixel coordinates.
pub trait WorldToPixel: Send + Sync {
    /// Pixel position of `(ra, dec)`, or `None` if it falls off the detector model.
    fn world_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)>;
}

/// Linear small-field WCS: a CD matrix about a reference point.
///
/// Offsets in RA are scaled by cos(dec) of the reference point before the
/// CD matrix is inverted, which is adequate over a few arcminutes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearWcs {
    /// Reference pixel (x, y)
    pub crpix: (f64, f64),
    /// Sky position of the reference pixel (ra, dec) in degrees
    pub crval: (f64, f64),
    /// CD matrix, degrees per pixel: [[cd1_1, cd1_2], [cd2_1, cd2_2]]
    pub cd: [[f64; 2]; 2],
}

impl LinearWcs {
    /// North-up, east-left WCS with square pixels of `scale_arcsec`.
    pub fn north_up(crpix: (f64, f64), crval: (f64, f64), scale_arcsec: f64) -> Self {
        let s = scale_arcsec / 3600.0;
        Self {
            crpix,
            crval,
            cd: [[-s, 0.0], [0.0, s]],
        }
    }

    /// Read a WCS stored as JSON (`crpix`, `crval`, `cd`).
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            FakeStarError::config(format!("cannot read WCS {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl WorldToPixel for LinearWcs {
    fn world_to_pixel(&self, ra_deg: f64, dec_deg: f64) -> Option<(f64, f64)> {
        let mut dra = ra_deg - self.crval.0;
        if dra > 180.0 {
            dra -= 360.0;
        } else if dra < -180.0 {
            dra += 360.0;
        }
        let xi = dra * self.crval.1.to_radians().cos();
        let eta = dec_deg - self.crval.1;

        let [[a, b], [c, d]] = self.cd;
        let det = a * d - b * c;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = (d * xi - b * eta) / det;
        let dy = (-c * xi + a * eta) / det;
        Some((self.crpix.0 + dx, self.crpix.1 + dy))
    }
}
