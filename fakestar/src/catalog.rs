//! Observed reference catalogs and synthetic star catalogs
//!
//! The reference catalog is the observed photometry the synthetic population
//! is modelled on. It is read from CSV with one row per star and columns
//! `chip`, `X`, `Y`, optional `RA`/`DEC`, and one `<BAND>_VEGA` column per
//! band. Synthetic catalogs use the same band naming so the two tables can
//! be compared directly.

use log::debug;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;

use crate::error::{FakeStarError, Result};

/// Column suffix marking a Vega magnitude column.
pub const MAG_SUFFIX: &str = "_VEGA";

/// Band name to magnitude.
pub type Magnitudes = BTreeMap<String, f64>;

/// Name of the magnitude column for `band`.
pub fn magnitude_column(band: &str) -> String {
    format!("{band}{MAG_SUFFIX}")
}

/// Parse a chip identifier, accepting integral floats such as `2.0`.
fn parse_chip(text: &str) -> Option<u32> {
    let value: f64 = text.trim().parse().ok()?;
    if value.fract() != 0.0 || value < 0.0 || value > u32::MAX as f64 {
        return None;
    }
    Some(value as u32)
}

fn parse_value(text: &str, column: &str, row: usize) -> Result<f64> {
    text.trim().parse::<f64>().map_err(|_| {
        FakeStarError::config(format!(
            "row {row}: column {column} has non-numeric value '{text}'"
        ))
    })
}

/// One star of the observed reference catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceStar {
    pub chip: u32,
    pub x: f64,
    pub y: f64,
    /// (RA, Dec) in degrees when the catalog carries sky coordinates
    pub sky: Option<(f64, f64)>,
    pub magnitudes: Magnitudes,
}

/// Observed catalog the synthetic population is drawn from.
#[derive(Debug, Clone)]
pub struct ReferenceCatalog {
    /// Band names, sorted
    pub bands: Vec<String>,
    pub stars: Vec<ReferenceStar>,
}

/// Pixel bounding box of one chip's observed sources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChipBounds {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl ChipBounds {
    fn from_point(x: f64, y: f64) -> Self {
        Self {
            x_min: x,
            x_max: x,
            y_min: y,
            y_max: y,
        }
    }

    fn include(&mut self, x: f64, y: f64) {
        self.x_min = self.x_min.min(x);
        self.x_max = self.x_max.max(x);
        self.y_min = self.y_min.min(y);
        self.y_max = self.y_max.max(y);
    }

    /// Draw a position uniformly inside the box.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, f64) {
        let draw = |rng: &mut R, lo: f64, hi: f64| {
            if hi > lo {
                rng.gen_range(lo..hi)
            } else {
                lo
            }
        };
        let x = draw(rng, self.x_min, self.x_max);
        let y = draw(rng, self.y_min, self.y_max);
        (x, y)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x_min && x <= self.x_max && y >= self.y_min && y <= self.y_max
    }
}

impl ReferenceCatalog {
    /// Build a catalog from in-memory stars. Bands are sorted.
    pub fn new(mut bands: Vec<String>, stars: Vec<ReferenceStar>) -> Result<Self> {
        if bands.is_empty() {
            return Err(FakeStarError::config(
                "reference catalog has no magnitude bands",
            ));
        }
        bands.sort();
        for (i, star) in stars.iter().enumerate() {
            for band in &bands {
                if !star.magnitudes.contains_key(band) {
                    return Err(FakeStarError::config(format!(
                        "reference star {i} has no {band} magnitude"
                    )));
                }
            }
        }
        Ok(Self { bands, stars })
    }

    /// Load a reference catalog from a CSV file.
    pub fn load_csv(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            FakeStarError::config(format!(
                "cannot open reference catalog {}: {e}",
                path.display()
            ))
        })?;
        let catalog = Self::from_reader(file)?;
        debug!(
            "Loaded {} reference stars in bands {:?} from {}",
            catalog.stars.len(),
            catalog.bands,
            path.display()
        );
        Ok(catalog)
    }

    /// Parse a reference catalog from CSV text.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = rdr.headers()?.clone();

        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
        };
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                FakeStarError::config(format!("reference catalog lacks required column {name}"))
            })
        };

        let chip_col = require("chip")?;
        let x_col = require("X")?;
        let y_col = require("Y")?;
        let sky_cols = match (find("RA"), find("DEC")) {
            (Some(ra), Some(dec)) => Some((ra, dec)),
            _ => None,
        };

        let mut band_cols: Vec<(String, usize)> = headers
            .iter()
            .enumerate()
            .filter_map(|(i, h)| {
                h.strip_suffix(MAG_SUFFIX)
                    .filter(|band| !band.is_empty())
                    .map(|band| (band.to_string(), i))
            })
            .collect();
        if band_cols.is_empty() {
            return Err(FakeStarError::config(format!(
                "reference catalog has no {MAG_SUFFIX} magnitude columns"
            )));
        }
        band_cols.sort();

        let mut stars = Vec::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let field = |col: usize| record.get(col).unwrap_or("");

            let chip = parse_chip(field(chip_col)).ok_or_else(|| {
                FakeStarError::config(format!(
                    "row {row}: invalid chip '{}'",
                    field(chip_col)
                ))
            })?;
            let x = parse_value(field(x_col), "X", row)?;
            let y = parse_value(field(y_col), "Y", row)?;
            let sky = match sky_cols {
                Some((ra, dec)) => Some((
                    parse_value(field(ra), "RA", row)?,
                    parse_value(field(dec), "DEC", row)?,
                )),
                None => None,
            };
            let mut magnitudes = Magnitudes::new();
            for (band, col) in &band_cols {
                magnitudes.insert(band.clone(), parse_value(field(*col), band, row)?);
            }

            stars.push(ReferenceStar {
                chip,
                x,
                y,
                sky,
                magnitudes,
            });
        }

        let bands = band_cols.into_iter().map(|(band, _)| band).collect();
        Self::new(bands, stars)
    }

    /// Restrict the catalog to `bands`, failing on any band not present.
    pub fn select_bands(&self, bands: &[String]) -> Result<Self> {
        if bands.is_empty() {
            return Err(FakeStarError::config("band selection is empty"));
        }
        for band in bands {
            if !self.bands.contains(band) {
                return Err(FakeStarError::config(format!(
                    "band {band} not in reference catalog (available: {})",
                    self.bands.join(", ")
                )));
            }
        }

        let stars = self
            .stars
            .iter()
            .map(|star| ReferenceStar {
                magnitudes: star
                    .magnitudes
                    .iter()
                    .filter(|(band, _)| bands.contains(band))
                    .map(|(band, mag)| (band.clone(), *mag))
                    .collect(),
                ..star.clone()
            })
            .collect();
        Self::new(bands.to_vec(), stars)
    }

    /// Sorted distinct chip identifiers.
    pub fn chips(&self) -> Vec<u32> {
        self.stars
            .iter()
            .map(|s| s.chip)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Observed bounding box per chip.
    pub fn chip_bounds(&self) -> BTreeMap<u32, ChipBounds> {
        let mut bounds: BTreeMap<u32, ChipBounds> = BTreeMap::new();
        for star in &self.stars {
            bounds
                .entry(star.chip)
                .and_modify(|b| b.include(star.x, star.y))
                .or_insert_with(|| ChipBounds::from_point(star.x, star.y));
        }
        bounds
    }

    /// Magnitudes of every star in `band`, in catalog order.
    pub fn band_values(&self, band: &str) -> Result<Vec<f64>> {
        if !self.bands.iter().any(|b| b == band) {
            return Err(FakeStarError::config(format!(
                "band {band} not in reference catalog"
            )));
        }
        Ok(self.stars.iter().map(|s| s.magnitudes[band]).collect())
    }

    /// True when every star carries sky coordinates.
    pub fn has_sky_coordinates(&self) -> bool {
        !self.stars.is_empty() && self.stars.iter().all(|s| s.sky.is_some())
    }
}

/// An injected star of known position and brightness.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticStar {
    pub id: usize,
    pub chip: u32,
    pub x: f64,
    pub y: f64,
    pub magnitudes: Magnitudes,
}

impl SyntheticStar {
    /// Magnitudes in the order of `bands`.
    pub fn magnitudes_in(&self, bands: &[String]) -> Vec<f64> {
        bands
            .iter()
            .map(|b| self.magnitudes.get(b).copied().unwrap_or(f64::NAN))
            .collect()
    }
}

/// Output of the generator: synthetic stars in generation order.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticCatalog {
    pub bands: Vec<String>,
    pub stars: Vec<SyntheticStar>,
}

impl SyntheticCatalog {
    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    /// Write `id,chip,X,Y,<BAND>_VEGA...` rows.
    pub fn save_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        let mut header = vec!["id".to_string(), "chip".into(), "X".into(), "Y".into()];
        header.extend(self.bands.iter().map(|b| magnitude_column(b)));
        wtr.write_record(&header)?;

        for star in &self.stars {
            let mut row = vec![
                star.id.to_string(),
                star.chip.to_string(),
                star.x.to_string(),
                star.y.to_string(),
            ];
            row.extend(star.magnitudes_in(&self.bands).iter().map(|m| m.to_string()));
            wtr.write_record(&row)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Read a catalog written by [`SyntheticCatalog::save_csv`].
    pub fn load_csv(path: &Path) -> Result<Self> {
        let mut rdr = csv::Reader::from_path(path)?;
        let headers = rdr.headers()?.clone();
        if headers.len() < 5 {
            return Err(FakeStarError::config(format!(
                "synthetic catalog {} has no magnitude columns",
                path.display()
            )));
        }
        let bands: Vec<String> = headers
            .iter()
            .skip(4)
            .map(|h| h.strip_suffix(MAG_SUFFIX).unwrap_or(h).to_string())
            .collect();

        let mut stars = Vec::new();
        for (row, record) in rdr.records().enumerate() {
            let record = record?;
            let id = record[0].trim().parse::<usize>().map_err(|_| {
                FakeStarError::config(format!("row {row}: invalid id '{}'", &record[0]))
            })?;
            let chip = parse_chip(&record[1])
                .ok_or_else(|| FakeStarError::config(format!("row {row}: invalid chip")))?;
            let x = parse_value(&record[2], "X", row)?;
            let y = parse_value(&record[3], "Y", row)?;
            let mut magnitudes = Magnitudes::new();
            for (i, band) in bands.iter().enumerate() {
                magnitudes.insert(band.clone(), parse_value(&record[4 + i], band, row)?);
            }
            stars.push(SyntheticStar {
                id,
                chip,
                x,
                y,
                magnitudes,
            });
        }
        Ok(Self { bands, stars })
    }
}
