//! Recovery matching: joining tool detections to the injected stars
//!
//! Detections are scanned in file order. Each one claims a still-unmatched
//! star of its batch whose squared pixel distance is under the tolerance.
//! Under [`MatchPolicy::FirstUnderTolerance`] the first such star in batch
//! order wins, which reproduces historical completeness tables. Under
//! [`MatchPolicy::NearestNeighbor`] the closest one wins.

use log::{debug, info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::batch::{Batch, BatchKey, RunLayout};
use crate::catalog::{magnitude_column, SyntheticStar};
use crate::completeness::QualityCuts;
use crate::detection::{read_detection_file, DetectionLayout, RecoveredDetection};
use crate::error::{FakeStarError, Result};

/// Which eligible star a detection claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    #[default]
    FirstUnderTolerance,
    NearestNeighbor,
}

fn default_tolerance() -> f64 {
    2e-4
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Squared pixel distance under which a detection may match
    #[serde(default = "default_tolerance")]
    pub tolerance_sq: f64,
    #[serde(default)]
    pub policy: MatchPolicy,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            tolerance_sq: default_tolerance(),
            policy: MatchPolicy::default(),
        }
    }
}

/// An injected star and the detection recovered for it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedRecord {
    pub key: BatchKey,
    pub star: SyntheticStar,
    pub detection: Option<RecoveredDetection>,
}

impl MatchedRecord {
    pub fn is_recovered(&self) -> bool {
        self.detection.is_some()
    }
}

/// Matching result of a single batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchMatch {
    /// One record per injected star, in batch order
    pub records: Vec<MatchedRecord>,
    /// Detections that matched no star
    pub orphans: usize,
}

fn distance_sq(star: &SyntheticStar, detection: &RecoveredDetection) -> f64 {
    let dx = star.x - detection.x;
    let dy = star.y - detection.y;
    dx * dx + dy * dy
}

/// Match `detections` to the stars of `batch`.
pub fn match_batch(batch: &Batch, detections: &[RecoveredDetection], config: &MatchConfig) -> BatchMatch {
    let mut claimed: Vec<Option<&RecoveredDetection>> = vec![None; batch.stars.len()];
    let mut orphans = 0;

    for detection in detections {
        let eligible = batch
            .stars
            .iter()
            .enumerate()
            .filter(|(i, _)| claimed[*i].is_none())
            .map(|(i, star)| (i, distance_sq(star, detection)))
            .filter(|(_, d2)| *d2 < config.tolerance_sq);

        let chosen = match config.policy {
            MatchPolicy::FirstUnderTolerance => eligible.map(|(i, _)| i).next(),
            MatchPolicy::NearestNeighbor => eligible
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(i, _)| i),
        };

        match chosen {
            Some(i) => claimed[i] = Some(detection),
            None => {
                orphans += 1;
                warn!(
                    "Batch {}: detection at ({:.3}, {:.3}) matches no injected star",
                    batch.key, detection.x, detection.y
                );
            }
        }
    }

    let records = batch
        .stars
        .iter()
        .zip(claimed)
        .map(|(star, detection)| MatchedRecord {
            key: batch.key,
            star: star.clone(),
            detection: detection.cloned(),
        })
        .collect();
    BatchMatch { records, orphans }
}

/// Match the tool output at `path` against `batch`.
///
/// A missing output is an incomplete batch; an empty one means nothing
/// was recovered.
pub fn match_output(
    batch: &Batch,
    path: &Path,
    layout: &DetectionLayout,
    config: &MatchConfig,
) -> Result<BatchMatch> {
    if !path.exists() {
        return Err(FakeStarError::IncompleteBatch {
            key: batch.key,
            reason: format!("no output at {}", path.display()),
        });
    }
    let detections = read_detection_file(path, layout)?;
    Ok(match_batch(batch, &detections, config))
}

/// Output file excluded from aggregation because it could not be read.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscardedOutput {
    pub key: BatchKey,
    pub path: PathBuf,
    pub reason: String,
}

/// Matching result of a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSummary {
    /// Records of every usable batch, ordered by batch key then batch order
    pub records: Vec<MatchedRecord>,
    pub orphans: usize,
    pub discarded: Vec<DiscardedOutput>,
    pub incomplete: Vec<BatchKey>,
}

impl MatchSummary {
    pub fn recovered(&self) -> usize {
        self.records.iter().filter(|r| r.is_recovered()).count()
    }
}

/// Match every batch of a run in parallel.
pub fn match_run(
    run: &RunLayout,
    batches: &[Batch],
    layout: &DetectionLayout,
    config: &MatchConfig,
) -> MatchSummary {
    let mut ordered: Vec<&Batch> = batches.iter().collect();
    ordered.sort_by_key(|b| b.key);

    let results: Vec<(BatchKey, PathBuf, Result<BatchMatch>)> = ordered
        .par_iter()
        .map(|batch| {
            let path = run.output_file(batch.key);
            let result = match_output(batch, &path, layout, config);
            (batch.key, path, result)
        })
        .collect();

    let mut summary = MatchSummary::default();
    for (key, path, result) in results {
        match result {
            Ok(batch_match) => {
                summary.orphans += batch_match.orphans;
                summary.records.extend(batch_match.records);
            }
            Err(FakeStarError::IncompleteBatch { reason, .. }) => {
                debug!("Batch {} incomplete: {}", key, reason);
                summary.incomplete.push(key);
            }
            Err(e) => {
                warn!("Discarding output of batch {}: {}", key, e);
                summary.discarded.push(DiscardedOutput {
                    key,
                    path,
                    reason: e.to_string(),
                });
            }
        }
    }

    if summary.orphans > 0 {
        warn!(
            "{} detections matched no injected star",
            summary.orphans
        );
    }
    info!(
        "Matched {} injected stars: {} recovered, {} incomplete batches, {} discarded outputs",
        summary.records.len(),
        summary.recovered(),
        summary.incomplete.len(),
        summary.discarded.len()
    );
    summary
}

/// Write merged injected/recovered rows as CSV.
///
/// Unrecovered stars leave the recovered columns empty.
pub fn write_matched_csv(
    path: &Path,
    records: &[MatchedRecord],
    bands: &[String],
    cuts: &QualityCuts,
) -> Result<()> {
    const FIELDS: [&str; 7] = ["VEGA", "ERR", "SNR", "SHARP", "ROUND", "CROWD", "FLAG"];

    let mut wtr = csv::Writer::from_path(path)?;
    let mut header: Vec<String> = vec!["id".into(), "chip".into(), "batch".into(), "X".into(), "Y".into()];
    header.extend(bands.iter().map(|b| format!("{}_IN", magnitude_column(b))));
    header.extend(["recovered", "X_OUT", "Y_OUT", "TYPE"].map(String::from));
    for band in bands {
        header.extend(FIELDS.iter().map(|f| format!("{band}_{f}")));
    }
    header.push("good".into());
    wtr.write_record(&header)?;

    for record in records {
        let star = &record.star;
        let mut row = vec![
            star.id.to_string(),
            star.chip.to_string(),
            record.key.index.to_string(),
            star.x.to_string(),
            star.y.to_string(),
        ];
        row.extend(star.magnitudes_in(bands).iter().map(|m| m.to_string()));

        match &record.detection {
            Some(det) => {
                row.extend([
                    "1".to_string(),
                    det.x.to_string(),
                    det.y.to_string(),
                    det.object_type.to_string(),
                ]);
                for b in 0..bands.len() {
                    match det.bands.get(b) {
                        Some(p) => row.extend([
                            p.magnitude.to_string(),
                            p.error.to_string(),
                            p.snr.to_string(),
                            p.sharpness.to_string(),
                            p.roundness.to_string(),
                            p.crowding.to_string(),
                            p.flag.to_string(),
                        ]),
                        None => row.extend(std::iter::repeat(String::new()).take(FIELDS.len())),
                    }
                }
                row.push(u8::from(cuts.is_good(det)).to_string());
            }
            None => {
                row.push("0".into());
                row.extend(std::iter::repeat(String::new()).take(3 + bands.len() * FIELDS.len()));
                row.push("0".into());
            }
        }
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Magnitudes;
    use crate::detection::BandPhotometry;
    use std::fs;
    use tempfile::TempDir;

    fn star(id: usize, x: f64, y: f64) -> SyntheticStar {
        let mut m = Magnitudes::new();
        m.insert("F814W".into(), 22.0);
        SyntheticStar {
            id,
            chip: 1,
            x,
            y,
            magnitudes: m,
        }
    }

    fn detection(x: f64, y: f64) -> RecoveredDetection {
        RecoveredDetection {
            x,
            y,
            object_type: 1,
            bands: vec![BandPhotometry {
                magnitude: 22.01,
                error: 0.01,
                snr: 80.0,
                sharpness: 0.0,
                roundness: 0.0,
                crowding: 0.0,
                flag: 0,
            }],
        }
    }

    fn batch(stars: Vec<SyntheticStar>) -> Batch {
        Batch {
            key: BatchKey::new(1, 0),
            stars,
        }
    }

    #[test]
    fn test_matches_out_of_order_detections() {
        let b = batch(vec![star(0, 10.0, 10.0), star(1, 50.0, 50.0), star(2, 90.0, 90.0)]);
        let dets = vec![detection(90.005, 90.0), detection(10.0, 10.01)];
        let result = match_batch(&b, &dets, &MatchConfig::default());
        assert_eq!(result.orphans, 0);
        let recovered: Vec<bool> = result.records.iter().map(|r| r.is_recovered()).collect();
        assert_eq!(recovered, vec![true, false, true]);
        assert_eq!(result.records[2].detection.as_ref().unwrap().x, 90.005);
    }

    #[test]
    fn test_orphan_detection_counted() {
        let b = batch(vec![star(0, 10.0, 10.0)]);
        let dets = vec![detection(10.0, 10.0), detection(10.1, 10.0)];
        let result = match_batch(&b, &dets, &MatchConfig::default());
        assert_eq!(result.orphans, 1);
        assert!(result.records[0].is_recovered());
    }

    #[test]
    fn test_star_matched_at_most_once() {
        // Two detections on the same star: the second finds it taken.
        let b = batch(vec![star(0, 5.0, 5.0)]);
        let dets = vec![detection(5.0, 5.0), detection(5.0, 5.001)];
        let result = match_batch(&b, &dets, &MatchConfig::default());
        assert_eq!(result.orphans, 1);
        assert_eq!(result.records[0].detection.as_ref().unwrap().y, 5.0);
    }

    #[test]
    fn test_first_match_versus_nearest() {
        // Both stars are within tolerance of the detection; star 1 is closer.
        let b = batch(vec![star(0, 0.0, 0.0), star(1, 0.012, 0.0)]);
        let dets = vec![detection(0.008, 0.0)];

        let first = match_batch(&b, &dets, &MatchConfig::default());
        assert!(first.records[0].is_recovered());
        assert!(!first.records[1].is_recovered());

        let nearest = MatchConfig {
            policy: MatchPolicy::NearestNeighbor,
            ..MatchConfig::default()
        };
        let result = match_batch(&b, &dets, &nearest);
        assert!(!result.records[0].is_recovered());
        assert!(result.records[1].is_recovered());
    }

    #[test]
    fn test_matching_is_deterministic() {
        let b = batch((0..20).map(|i| star(i, i as f64 * 3.0, 7.0)).collect());
        let dets: Vec<_> = (0..20)
            .rev()
            .filter(|i| i % 3 != 0)
            .map(|i| detection(i as f64 * 3.0 + 0.005, 7.0))
            .collect();
        let a = match_batch(&b, &dets, &MatchConfig::default());
        let c = match_batch(&b, &dets, &MatchConfig::default());
        assert_eq!(a, c);
    }

    #[test]
    fn test_missing_output_is_incomplete() {
        let dir = TempDir::new().unwrap();
        let b = batch(vec![star(0, 1.0, 1.0)]);
        let layout = DetectionLayout::dolphot_fake(1, 1);
        let err = match_output(&b, &dir.path().join("nope"), &layout, &MatchConfig::default())
            .unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, FakeStarError::IncompleteBatch { .. }));
    }

    #[test]
    fn test_match_run_sorts_and_classifies() {
        let dir = TempDir::new().unwrap();
        let run = RunLayout::new(dir.path(), "complete");
        fs::create_dir_all(run.run_dir()).unwrap();
        let layout = DetectionLayout::dolphot_fake(1, 1);

        let good = Batch {
            key: BatchKey::new(1, 0),
            stars: vec![star(0, 1.0, 1.0), star(1, 2.0, 2.0)],
        };
        let empty = Batch {
            key: BatchKey::new(1, 1),
            stars: vec![star(2, 3.0, 3.0)],
        };
        let broken = Batch {
            key: BatchKey::new(2, 0),
            stars: vec![star(3, 4.0, 4.0)],
        };
        let missing = Batch {
            key: BatchKey::new(2, 1),
            stars: vec![star(4, 5.0, 5.0)],
        };
        fs::write(run.output_file(good.key), layout.format_row(&detection(1.0, 1.0))).unwrap();
        fs::write(run.output_file(empty.key), "").unwrap();
        fs::write(run.output_file(broken.key), "1 2 3\n").unwrap();

        let batches = vec![missing.clone(), broken.clone(), empty.clone(), good.clone()];
        let summary = match_run(&run, &batches, &layout, &MatchConfig::default());

        let ids: Vec<usize> = summary.records.iter().map(|r| r.star.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(summary.recovered(), 1);
        assert_eq!(summary.incomplete, vec![missing.key]);
        assert_eq!(summary.discarded.len(), 1);
        assert_eq!(summary.discarded[0].key, broken.key);
    }

    #[test]
    fn test_write_matched_csv() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("matched.csv");
        let b = batch(vec![star(0, 1.0, 1.0), star(1, 9.0, 9.0)]);
        let result = match_batch(&b, &[detection(1.0, 1.0)], &MatchConfig::default());
        write_matched_csv(&path, &result.records, &["F814W".to_string()], &QualityCuts::default())
            .unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), headers.len());
        assert_eq!(rows[1].len(), headers.len());
        let good = headers.iter().position(|h| h == "good").unwrap();
        assert_eq!(&rows[0][good], "1");
        assert_eq!(&rows[1][good], "0");
    }
}
