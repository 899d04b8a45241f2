//! Detection tables written by the fitting tool
//!
//! Output rows are whitespace separated numbers. Which column holds what is
//! described once by a [`DetectionLayout`]; everything downstream reads
//! named fields of [`RecoveredDetection`] instead of raw column offsets.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{FakeStarError, Result};

/// Column offsets of each photometry field inside one band block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandFieldOffsets {
    pub magnitude: usize,
    pub error: usize,
    pub snr: usize,
    pub sharpness: usize,
    pub roundness: usize,
    pub crowding: usize,
    pub flag: usize,
}

impl BandFieldOffsets {
    fn max(&self) -> usize {
        [
            self.magnitude,
            self.error,
            self.snr,
            self.sharpness,
            self.roundness,
            self.crowding,
            self.flag,
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
    }
}

/// Where each field of a detection row lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionLayout {
    pub version: u32,
    pub x_column: usize,
    pub y_column: usize,
    pub object_type_column: usize,
    /// First column of the first band block
    pub band_start: usize,
    /// Columns between consecutive band blocks
    pub band_stride: usize,
    pub offsets: BandFieldOffsets,
    pub n_bands: usize,
}

impl DetectionLayout {
    pub const DOLPHOT_FAKE_VERSION: u32 = 1;

    /// Fake-star output of DOLPHOT for `n_images` exposures.
    ///
    /// Each exposure and the two combined-filter blocks shift the per-band
    /// photometry by two columns.
    pub fn dolphot_fake(n_images: usize, n_bands: usize) -> Self {
        let shift = 2 * (n_images + 2);
        Self {
            version: Self::DOLPHOT_FAKE_VERSION,
            x_column: 2,
            y_column: 3,
            object_type_column: 10 + shift,
            band_start: 15 + shift,
            band_stride: 13,
            offsets: BandFieldOffsets {
                magnitude: 0,
                error: 2,
                snr: 4,
                sharpness: 5,
                roundness: 6,
                crowding: 7,
                flag: 8,
            },
            n_bands,
        }
    }

    /// Minimum number of fields a row must carry.
    pub fn min_fields(&self) -> usize {
        let band_end = if self.n_bands == 0 {
            0
        } else {
            self.band_start + (self.n_bands - 1) * self.band_stride + self.offsets.max() + 1
        };
        band_end
            .max(self.x_column + 1)
            .max(self.y_column + 1)
            .max(self.object_type_column + 1)
    }

    fn band_column(&self, band: usize, offset: usize) -> usize {
        self.band_start + band * self.band_stride + offset
    }

    /// Decode one row of numbers.
    pub fn decode(&self, values: &[f64]) -> RecoveredDetection {
        let bands = (0..self.n_bands)
            .map(|b| {
                let at = |offset| values[self.band_column(b, offset)];
                BandPhotometry {
                    magnitude: at(self.offsets.magnitude),
                    error: at(self.offsets.error),
                    snr: at(self.offsets.snr),
                    sharpness: at(self.offsets.sharpness),
                    roundness: at(self.offsets.roundness),
                    crowding: at(self.offsets.crowding),
                    flag: at(self.offsets.flag) as i32,
                }
            })
            .collect();
        RecoveredDetection {
            x: values[self.x_column],
            y: values[self.y_column],
            object_type: values[self.object_type_column] as i32,
            bands,
        }
    }

    /// Render a detection as a row of this layout; unused columns are zero.
    pub fn format_row(&self, detection: &RecoveredDetection) -> String {
        let mut values = vec![0.0; self.min_fields()];
        values[self.x_column] = detection.x;
        values[self.y_column] = detection.y;
        values[self.object_type_column] = detection.object_type as f64;
        for (b, phot) in detection.bands.iter().take(self.n_bands).enumerate() {
            values[self.band_column(b, self.offsets.magnitude)] = phot.magnitude;
            values[self.band_column(b, self.offsets.error)] = phot.error;
            values[self.band_column(b, self.offsets.snr)] = phot.snr;
            values[self.band_column(b, self.offsets.sharpness)] = phot.sharpness;
            values[self.band_column(b, self.offsets.roundness)] = phot.roundness;
            values[self.band_column(b, self.offsets.crowding)] = phot.crowding;
            values[self.band_column(b, self.offsets.flag)] = phot.flag as f64;
        }
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Measured photometry of one detection in one band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandPhotometry {
    pub magnitude: f64,
    pub error: f64,
    pub snr: f64,
    pub sharpness: f64,
    pub roundness: f64,
    pub crowding: f64,
    pub flag: i32,
}

/// One object reported by the fitting tool.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredDetection {
    pub x: f64,
    pub y: f64,
    pub object_type: i32,
    /// Photometry per band, in the run's band order
    pub bands: Vec<BandPhotometry>,
}

/// Read every detection in a tool output file.
///
/// An empty file means no detections. Any row that cannot be decoded makes
/// the whole file malformed; no partial result is returned.
pub fn read_detection_file(path: &Path, layout: &DetectionLayout) -> Result<Vec<RecoveredDetection>> {
    let text = fs::read_to_string(path)?;
    let min_fields = layout.min_fields();

    let mut detections = Vec::new();
    let mut row_width = None;
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let malformed = |reason: String| FakeStarError::MalformedRecord {
            path: path.to_path_buf(),
            line: i + 1,
            reason,
        };

        let values = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| malformed(format!("unparsable field: {e}")))?;

        let width = *row_width.get_or_insert(values.len());
        if values.len() != width {
            return Err(malformed(format!(
                "row has {} fields, earlier rows have {width}",
                values.len()
            )));
        }
        if values.len() < min_fields {
            return Err(malformed(format!(
                "row has {} fields, layout v{} needs {min_fields}",
                values.len(),
                layout.version
            )));
        }
        detections.push(layout.decode(&values));
    }
    Ok(detections)
}
