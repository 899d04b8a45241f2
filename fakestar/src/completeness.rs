//! Completeness: fraction of injected stars recovered with good photometry

use log::{info, warn};
use serde::{Deserialize, Serialize};
use shared::algo::{bin_index, equal_width_edges, finite_range};
use shared::range_arg::RangeArg;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use crate::detection::RecoveredDetection;
use crate::error::{FakeStarError, Result};
use crate::matcher::MatchedRecord;

/// Thresholds a recovered detection must pass in every band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityCuts {
    /// Signal-to-noise floor (inclusive)
    pub snr_min: f64,
    /// Ceiling on sharpness squared (exclusive)
    pub sharp_sq_max: f64,
    /// Crowding ceiling (exclusive)
    pub crowd_max: f64,
    /// Photometry flag ceiling (inclusive)
    pub flag_max: i32,
    /// Required object type; `None` accepts any
    pub object_type: Option<i32>,
}

impl Default for QualityCuts {
    fn default() -> Self {
        Self {
            snr_min: 5.0,
            sharp_sq_max: 0.04,
            crowd_max: 0.5,
            flag_max: 99,
            object_type: Some(1),
        }
    }
}

impl QualityCuts {
    pub fn is_good(&self, detection: &RecoveredDetection) -> bool {
        if let Some(required) = self.object_type {
            if detection.object_type != required {
                return false;
            }
        }
        !detection.bands.is_empty()
            && detection.bands.iter().all(|b| {
                b.snr >= self.snr_min
                    && b.sharpness * b.sharpness < self.sharp_sq_max
                    && b.crowding < self.crowd_max
                    && b.flag <= self.flag_max
            })
    }
}

/// How injected magnitudes are binned.
#[derive(Debug, Clone, PartialEq)]
pub enum MagnitudeBins {
    /// Fixed ascending edges.
    Explicit(Vec<f64>),
    /// `n` equal-width bins spanning the injected magnitudes.
    EqualWidth(usize),
}

impl From<RangeArg> for MagnitudeBins {
    fn from(range: RangeArg) -> Self {
        MagnitudeBins::Explicit(range.edges())
    }
}

impl MagnitudeBins {
    /// Concrete edges for the given injected magnitudes.
    ///
    /// Equal-width bins over no finite magnitude have no edges.
    pub fn edges(&self, magnitudes: &[f64]) -> Result<Vec<f64>> {
        match self {
            MagnitudeBins::Explicit(edges) => {
                if edges.len() < 2 || edges.windows(2).any(|w| w[1] <= w[0]) {
                    return Err(FakeStarError::config(
                        "magnitude bin edges must be at least two ascending values",
                    ));
                }
                Ok(edges.clone())
            }
            MagnitudeBins::EqualWidth(n) => {
                if *n == 0 {
                    return Err(FakeStarError::config("need at least one magnitude bin"));
                }
                let Some((mut lo, mut hi)) = finite_range(magnitudes) else {
                    return Ok(Vec::new());
                };
                if hi <= lo {
                    lo -= 0.5;
                    hi += 0.5;
                }
                Ok(equal_width_edges(lo, hi, *n))
            }
        }
    }

    /// Pin equal-width bins to the span of `magnitudes`.
    ///
    /// Used with the full synthetic catalog so bins do not depend on which
    /// batches produced output.
    pub fn anchored(&self, magnitudes: &[f64]) -> Result<MagnitudeBins> {
        match self {
            MagnitudeBins::Explicit(_) => Ok(self.clone()),
            MagnitudeBins::EqualWidth(_) => {
                let edges = self.edges(magnitudes)?;
                if edges.is_empty() {
                    Ok(self.clone())
                } else {
                    Ok(MagnitudeBins::Explicit(edges))
                }
            }
        }
    }
}

/// Spatial scope of a completeness row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Region {
    All,
    Chip(u32),
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::All => write!(f, "all"),
            Region::Chip(chip) => write!(f, "chip{chip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletenessRow {
    pub region: Region,
    pub mag_lo: f64,
    pub mag_hi: f64,
    pub injected: usize,
    pub recovered: usize,
}

impl CompletenessRow {
    /// Recovered fraction, undefined for an empty bin.
    pub fn completeness(&self) -> Option<f64> {
        (self.injected > 0).then(|| self.recovered as f64 / self.injected as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletenessTable {
    pub band: String,
    pub rows: Vec<CompletenessRow>,
}

impl CompletenessTable {
    /// Rows for one region, in ascending magnitude.
    pub fn region(&self, region: Region) -> impl Iterator<Item = &CompletenessRow> {
        self.rows.iter().filter(move |r| r.region == region)
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        wtr.write_record(["region", "mag_lo", "mag_hi", "injected", "recovered", "completeness"])?;
        for row in &self.rows {
            let completeness = row
                .completeness()
                .map_or_else(|| "nan".to_string(), |c| c.to_string());
            wtr.write_record([
                row.region.to_string(),
                row.mag_lo.to_string(),
                row.mag_hi.to_string(),
                row.injected.to_string(),
                row.recovered.to_string(),
                completeness,
            ])?;
        }
        wtr.flush()?;
        Ok(())
    }
}

/// Bin injected stars by their `band` magnitude and count good recoveries.
///
/// Rows for the whole field come first; with `per_chip` each chip follows
/// in ascending order. Stars outside the bin edges are not counted.
pub fn aggregate(
    records: &[MatchedRecord],
    cuts: &QualityCuts,
    bins: &MagnitudeBins,
    band: &str,
    per_chip: bool,
) -> Result<CompletenessTable> {
    let mut magnitudes = Vec::with_capacity(records.len());
    for record in records {
        let mag = record.star.magnitudes.get(band).copied().ok_or_else(|| {
            FakeStarError::config(format!(
                "synthetic star {} has no {band} magnitude",
                record.star.id
            ))
        })?;
        magnitudes.push(mag);
    }
    let edges = bins.edges(&magnitudes)?;
    if edges.len() < 2 {
        warn!("No injected {band} magnitudes to bin, completeness table is empty");
        return Ok(CompletenessTable {
            band: band.to_string(),
            rows: Vec::new(),
        });
    }
    let n_bins = edges.len() - 1;

    let mut regions = vec![Region::All];
    if per_chip {
        let mut chips: Vec<u32> = records.iter().map(|r| r.star.chip).collect();
        chips.sort_unstable();
        chips.dedup();
        regions.extend(chips.into_iter().map(Region::Chip));
    }

    let mut counts: BTreeMap<Region, Vec<(usize, usize)>> = regions
        .iter()
        .map(|&region| (region, vec![(0, 0); n_bins]))
        .collect();

    for (record, &mag) in records.iter().zip(&magnitudes) {
        let Some(bin) = bin_index(mag, &edges) else {
            continue;
        };
        let good = record
            .detection
            .as_ref()
            .map_or(false, |d| cuts.is_good(d));

        let mut tally = |region: Region| {
            if let Some(bins) = counts.get_mut(&region) {
                bins[bin].0 += 1;
                if good {
                    bins[bin].1 += 1;
                }
            }
        };
        tally(Region::All);
        if per_chip {
            tally(Region::Chip(record.star.chip));
        }
    }

    let rows: Vec<CompletenessRow> = counts
        .into_iter()
        .flat_map(|(region, bins)| {
            let edges = &edges;
            bins.into_iter()
                .enumerate()
                .map(move |(i, (injected, recovered))| CompletenessRow {
                    region,
                    mag_lo: edges[i],
                    mag_hi: edges[i + 1],
                    injected,
                    recovered,
                })
        })
        .collect();

    let injected: usize = rows
        .iter()
        .filter(|r| r.region == Region::All)
        .map(|r| r.injected)
        .sum();
    let recovered: usize = rows
        .iter()
        .filter(|r| r.region == Region::All)
        .map(|r| r.recovered)
        .sum();
    info!(
        "Completeness in {}: {} of {} binned stars recovered with good photometry",
        band, recovered, injected
    );

    Ok(CompletenessTable {
        band: band.to_string(),
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchKey;
    use crate::catalog::{Magnitudes, SyntheticStar};
    use crate::detection::BandPhotometry;
    use approx::assert_relative_eq;
    use tempfile::TempDir;

    fn phot(snr: f64, sharp: f64, crowd: f64, flag: i32) -> BandPhotometry {
        BandPhotometry {
            magnitude: 24.0,
            error: 0.05,
            snr,
            sharpness: sharp,
            roundness: 0.0,
            crowding: crowd,
            flag,
        }
    }

    fn record(id: usize, chip: u32, mag: f64, detection: Option<RecoveredDetection>) -> MatchedRecord {
        let mut m = Magnitudes::new();
        m.insert("F814W".into(), mag);
        MatchedRecord {
            key: BatchKey::new(chip, 0),
            star: SyntheticStar {
                id,
                chip,
                x: 0.0,
                y: 0.0,
                magnitudes: m,
            },
            detection,
        }
    }

    fn good() -> Option<RecoveredDetection> {
        Some(RecoveredDetection {
            x: 0.0,
            y: 0.0,
            object_type: 1,
            bands: vec![phot(20.0, 0.05, 0.1, 0)],
        })
    }

    #[test]
    fn test_quality_cuts() {
        let cuts = QualityCuts::default();
        let det = |bands: Vec<BandPhotometry>, object_type| RecoveredDetection {
            x: 0.0,
            y: 0.0,
            object_type,
            bands,
        };
        assert!(cuts.is_good(&det(vec![phot(5.0, 0.19, 0.49, 99)], 1)));
        assert!(!cuts.is_good(&det(vec![phot(4.99, 0.0, 0.0, 0)], 1)));
        assert!(!cuts.is_good(&det(vec![phot(10.0, 0.2, 0.0, 0)], 1)));
        assert!(!cuts.is_good(&det(vec![phot(10.0, 0.0, 0.5, 0)], 1)));
        assert!(!cuts.is_good(&det(vec![phot(10.0, 0.0, 0.0, 100)], 1)));
        assert!(!cuts.is_good(&det(vec![phot(10.0, 0.0, 0.0, 0)], 2)));
        // Every band must pass
        assert!(!cuts.is_good(&det(
            vec![phot(10.0, 0.0, 0.0, 0), phot(3.0, 0.0, 0.0, 0)],
            1
        )));

        let any_type = QualityCuts {
            object_type: None,
            ..QualityCuts::default()
        };
        assert!(any_type.is_good(&det(vec![phot(10.0, 0.0, 0.0, 0)], 2)));
    }

    #[test]
    fn test_single_magnitude_fraction() {
        let records: Vec<_> = (0..100)
            .map(|i| record(i, 1, 20.0, if i < 80 { good() } else { None }))
            .collect();
        let table = aggregate(
            &records,
            &QualityCuts::default(),
            &MagnitudeBins::EqualWidth(1),
            "F814W",
            false,
        )
        .unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].completeness(), Some(0.8));
        assert_relative_eq!(table.rows[0].mag_lo, 19.5);
    }

    #[test]
    fn test_empty_bin_is_undefined() {
        let records = vec![record(0, 1, 20.2, good()), record(1, 1, 23.7, None)];
        let bins = MagnitudeBins::from(RangeArg(20.0, 24.0, 1.0));
        let table = aggregate(&records, &QualityCuts::default(), &bins, "F814W", false).unwrap();
        let values: Vec<Option<f64>> = table.rows.iter().map(|r| r.completeness()).collect();
        assert_eq!(values, vec![Some(1.0), None, None, Some(0.0)]);
        for v in values.into_iter().flatten() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_no_records_gives_undefined_rows() {
        let cuts = QualityCuts::default();
        let unbinned = aggregate(&[], &cuts, &MagnitudeBins::EqualWidth(5), "F814W", false).unwrap();
        assert!(unbinned.rows.is_empty());

        let catalog = [21.0, 22.5, 24.0];
        let bins = MagnitudeBins::EqualWidth(3).anchored(&catalog).unwrap();
        assert_eq!(bins, MagnitudeBins::Explicit(vec![21.0, 22.0, 23.0, 24.0]));

        let table = aggregate(&[], &cuts, &bins, "F814W", false).unwrap();
        assert_eq!(table.rows.len(), 3);
        assert!(table.rows.iter().all(|r| r.injected == 0 && r.completeness().is_none()));
    }

    #[test]
    fn test_invalid_range_is_rejected() {
        let bins = MagnitudeBins::from(RangeArg(f64::NAN, 24.0, 1.0));
        let err = aggregate(&[], &QualityCuts::default(), &bins, "F814W", false).unwrap_err();
        assert!(matches!(err, FakeStarError::Configuration(_)));
    }

    #[test]
    fn test_per_chip_rows() {
        let records = vec![
            record(0, 1, 21.0, good()),
            record(1, 1, 21.0, None),
            record(2, 2, 21.0, good()),
        ];
        let table = aggregate(
            &records,
            &QualityCuts::default(),
            &MagnitudeBins::EqualWidth(1),
            "F814W",
            true,
        )
        .unwrap();
        let all: Vec<_> = table.region(Region::All).collect();
        let chip1: Vec<_> = table.region(Region::Chip(1)).collect();
        let chip2: Vec<_> = table.region(Region::Chip(2)).collect();
        assert_eq!((all[0].injected, all[0].recovered), (3, 2));
        assert_eq!(chip1[0].completeness(), Some(0.5));
        assert_eq!(chip2[0].completeness(), Some(1.0));
    }

    #[test]
    fn test_write_csv_marks_undefined() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("completeness.csv");
        let table = CompletenessTable {
            band: "F814W".into(),
            rows: vec![
                CompletenessRow {
                    region: Region::All,
                    mag_lo: 20.0,
                    mag_hi: 21.0,
                    injected: 4,
                    recovered: 3,
                },
                CompletenessRow {
                    region: Region::Chip(2),
                    mag_lo: 21.0,
                    mag_hi: 22.0,
                    injected: 0,
                    recovered: 0,
                },
            ],
        };
        table.write_csv(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "region,mag_lo,mag_hi,injected,recovered,completeness");
        assert_eq!(lines[1], "all,20,21,4,3,0.75");
        assert_eq!(lines[2], "chip2,21,22,0,0,nan");
    }
}
