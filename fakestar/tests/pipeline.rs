//! End-to-end runs of the artificial star pipeline with an in-process fitting tool

use approx::assert_relative_eq;
use fakestar::batch::{partition, read_batch_file, write_run};
use fakestar::catalog::Magnitudes;
use fakestar::completeness::{MagnitudeBins, Region};
use fakestar::detection::{BandPhotometry, DetectionLayout, RecoveredDetection};
use fakestar::{
    BatchKey, FitJob, FittingTool, Pipeline, ResumeMode, RunConfig, SamplingPolicy, SyntheticCatalog,
    SyntheticStar,
};
use shared::range_arg::RangeArg;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const BANDS: [&str; 2] = ["F475W", "F814W"];

fn bands() -> Vec<String> {
    BANDS.iter().map(|b| b.to_string()).collect()
}

/// Reports every injected star at its true position unless `drop` says otherwise.
struct MockTool {
    layout: DetectionLayout,
    drop: Box<dyn Fn(BatchKey, f64) -> bool + Send + Sync>,
    empty: BTreeSet<BatchKey>,
    calls: AtomicUsize,
}

impl MockTool {
    fn new(drop: impl Fn(BatchKey, f64) -> bool + Send + Sync + 'static) -> Self {
        Self {
            layout: DetectionLayout::dolphot_fake(RunConfig::default().tool.n_images, BANDS.len()),
            drop: Box::new(drop),
            empty: BTreeSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    fn perfect() -> Self {
        Self::new(|_, _| false)
    }
}

impl FittingTool for MockTool {
    fn invoke(&self, job: &FitJob) -> io::Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.empty.contains(&job.key) {
            fs::write(&job.output_file, "")?;
            return Ok(true);
        }
        let entries = read_batch_file(&job.batch_file, BANDS.len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        // Report detections in reverse order; the matcher must not rely on it
        let rows: Vec<String> = entries
            .iter()
            .rev()
            .filter(|e| !(self.drop)(job.key, e.x))
            .map(|e| {
                let detection = RecoveredDetection {
                    x: e.x + 0.001,
                    y: e.y - 0.001,
                    object_type: 1,
                    bands: e
                        .magnitudes
                        .iter()
                        .map(|&m| BandPhotometry {
                            magnitude: m + 0.01,
                            error: 0.02,
                            snr: 50.0,
                            sharpness: 0.01,
                            roundness: 0.02,
                            crowding: 0.05,
                            flag: 0,
                        })
                        .collect(),
                };
                self.layout.format_row(&detection)
            })
            .collect();
        let mut text = rows.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        fs::write(&job.output_file, text)?;
        Ok(true)
    }
}

/// 100 stars at magnitude 20.0, ten pixels apart.
fn uniform_catalog() -> SyntheticCatalog {
    let stars = (0..100)
        .map(|i| {
            let mut m = Magnitudes::new();
            m.insert("F475W".into(), 20.0);
            m.insert("F814W".into(), 20.0);
            SyntheticStar {
                id: i,
                chip: 1 + (i % 2) as u32,
                x: 5.0 + 10.0 * i as f64,
                y: 100.0,
                magnitudes: m,
            }
        })
        .collect();
    SyntheticCatalog {
        bands: bands(),
        stars,
    }
}

fn write_reference(dir: &Path) -> std::path::PathBuf {
    let mut text = String::from("chip,X,Y,F475W_VEGA,F814W_VEGA\n");
    for i in 0..240 {
        let chip = 1 + i % 2;
        let b = 21.0 + 5.0 * ((i as f64 * 0.618).fract());
        text.push_str(&format!(
            "{chip},{},{},{b},{}\n",
            50.0 + (i * 37 % 4000) as f64,
            80.0 + (i * 53 % 2000) as f64,
            b - 1.1
        ));
    }
    let path = dir.join("reference.csv");
    fs::write(&path, text).unwrap();
    path
}

fn write_base_params(dir: &Path) {
    for chip in [1, 2] {
        fs::write(dir.join(format!("phot{chip}.param")), "Nimg=1\nFitSky=2\n").unwrap();
    }
}

fn uniform_pipeline(dir: &Path) -> Pipeline {
    let config = RunConfig {
        batch_size: 25,
        workers: 4,
        n_bins: 1,
        ..RunConfig::default()
    };
    let pipeline = Pipeline::new(dir, config).unwrap();
    let catalog = uniform_catalog();
    let batches = partition(&catalog, 25, pipeline.config.seed).unwrap();
    write_run(&pipeline.layout, &catalog, &batches, 25, pipeline.config.seed).unwrap();
    pipeline
}

fn generated_pipeline(dir: &Path, n_stars: usize) -> Pipeline {
    write_base_params(dir);
    let reference = write_reference(dir);
    let config = RunConfig {
        n_stars,
        batch_size: 40,
        workers: 3,
        policy: SamplingPolicy::EmpiricalJitter { max_offset: 0.01 },
        ..RunConfig::default()
    };
    let pipeline = Pipeline::new(dir, config).unwrap();
    pipeline.generate_from(&reference, None).unwrap();
    pipeline
}

#[test]
fn eighty_of_hundred_recovered_gives_point_eight() {
    let dir = TempDir::new().unwrap();
    let pipeline = uniform_pipeline(dir.path());

    // Drop every fifth star by position: 20 of 100
    let tool = Arc::new(MockTool::new(|_, x| ((x - 5.0) / 10.0).round() as usize % 5 == 4));
    let report = pipeline.dispatch(tool, ResumeMode::Resume, false).unwrap();
    assert_eq!(report.dispatched, 4);
    assert!(report.is_complete());

    let summary = pipeline.extract().unwrap();
    assert_eq!(summary.records.len(), 100);
    assert_eq!(summary.recovered(), 80);
    assert_eq!(summary.orphans, 0);

    let table = pipeline
        .complete(&summary, &MagnitudeBins::EqualWidth(1))
        .unwrap();
    assert_eq!(table.rows.len(), 1);
    assert_eq!(table.rows[0].injected, 100);
    assert_eq!(table.rows[0].completeness(), Some(0.8));
    assert!(pipeline.layout.completeness_file().exists());
    assert!(pipeline.layout.matched_file().exists());
}

#[test]
fn empty_output_marks_batch_unrecovered() {
    let dir = TempDir::new().unwrap();
    let pipeline = uniform_pipeline(dir.path());
    let mut mock = MockTool::perfect();
    let empty_key = BatchKey::new(1, 0);
    mock.empty.insert(empty_key);

    let report = pipeline
        .dispatch(Arc::new(mock), ResumeMode::Resume, false)
        .unwrap();
    assert_eq!(report.incomplete.len(), 1);
    assert_eq!(report.incomplete[0].key, empty_key);
    assert!(pipeline.layout.output_file(empty_key).exists());

    let summary = pipeline.extract().unwrap();
    assert_eq!(summary.records.len(), 100);
    assert!(summary.discarded.is_empty());
    for record in &summary.records {
        assert_eq!(record.is_recovered(), record.key != empty_key);
    }
    assert_eq!(summary.recovered(), 75);
}

#[test]
fn resume_after_success_dispatches_nothing() {
    let dir = TempDir::new().unwrap();
    let pipeline = generated_pipeline(dir.path(), 300);
    let tool = Arc::new(MockTool::perfect());

    let first = pipeline
        .dispatch(tool.clone(), ResumeMode::Resume, false)
        .unwrap();
    assert!(first.dispatched > 0);
    assert!(first.is_complete());

    let second = pipeline
        .dispatch(tool.clone(), ResumeMode::Resume, false)
        .unwrap();
    assert_eq!(second.dispatched, 0);
    assert_eq!(tool.calls.load(Ordering::SeqCst), first.dispatched);
}

#[test]
fn interrupted_run_resumes_missing_batches() {
    let dir = TempDir::new().unwrap();
    let pipeline = generated_pipeline(dir.path(), 200);
    pipeline
        .dispatch(Arc::new(MockTool::perfect()), ResumeMode::Resume, false)
        .unwrap();

    // Simulate a killed run: one output lost, one left as a partial file
    let (manifest, _) = pipeline.batches().unwrap();
    let keys = manifest.keys();
    fs::remove_file(pipeline.layout.output_file(keys[0])).unwrap();
    fs::rename(
        pipeline.layout.output_file(keys[1]),
        pipeline.layout.partial_output_file(keys[1]),
    )
    .unwrap();

    let tool = Arc::new(MockTool::perfect());
    let report = pipeline
        .dispatch(tool.clone(), ResumeMode::Resume, false)
        .unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(tool.calls.load(Ordering::SeqCst), 2);
    assert!(!pipeline.layout.partial_output_file(keys[1]).exists());
}

#[test]
fn generated_batches_cover_catalog_once() {
    let dir = TempDir::new().unwrap();
    let pipeline = generated_pipeline(dir.path(), 333);
    let (manifest, batches) = pipeline.batches().unwrap();

    let mut ids = BTreeSet::new();
    for batch in &batches {
        assert!(batch.stars.len() <= 40);
        for star in &batch.stars {
            assert!(ids.insert(star.id));
        }
    }
    let catalog = SyntheticCatalog::load_csv(&pipeline.layout.catalog_file()).unwrap();
    assert_eq!(ids.len(), catalog.len());
    assert_eq!(ids, (0..catalog.len()).collect());

    for chip in manifest.chips() {
        let in_batches: usize = batches
            .iter()
            .filter(|b| b.key.chip == chip)
            .map(|b| b.stars.len())
            .sum();
        let in_catalog = catalog.stars.iter().filter(|s| s.chip == chip).count();
        assert_eq!(in_batches, in_catalog);
    }

    for chip in manifest.chips() {
        let param = fs::read_to_string(pipeline.layout.param_file(chip)).unwrap();
        assert!(param.ends_with("RandomFake=1\nFakeMatch=3.0\n"));
    }
}

#[test]
fn batch_files_round_trip() {
    let dir = TempDir::new().unwrap();
    let pipeline = generated_pipeline(dir.path(), 120);
    let (manifest, batches) = pipeline.batches().unwrap();

    for batch in &batches {
        let entries = read_batch_file(&pipeline.layout.batch_file(batch.key), manifest.bands.len())
            .unwrap();
        assert_eq!(entries.len(), batch.stars.len());
        for (entry, star) in entries.iter().zip(&batch.stars) {
            assert_eq!((entry.x, entry.y), (star.x, star.y));
            assert_eq!(entry.magnitudes, star.magnitudes_in(&manifest.bands));
        }
    }
}

#[test]
fn regeneration_is_reproducible() {
    let a = TempDir::new().unwrap();
    let b = TempDir::new().unwrap();
    let first = generated_pipeline(a.path(), 150);
    let second = generated_pipeline(b.path(), 150);

    let (manifest_a, batches_a) = first.batches().unwrap();
    let (manifest_b, batches_b) = second.batches().unwrap();
    assert_eq!(manifest_a, manifest_b);
    assert_eq!(batches_a, batches_b);
}

#[test]
fn matching_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let pipeline = generated_pipeline(dir.path(), 200);
    let tool = Arc::new(MockTool::new(|key, x| key.index % 2 == 1 && x.fract() < 0.3));
    pipeline.dispatch(tool, ResumeMode::Resume, false).unwrap();

    let first = pipeline.extract().unwrap();
    let second = pipeline.extract().unwrap();
    assert_eq!(first, second);
    assert_eq!(first.records.len(), 200);
}

#[test]
fn malformed_output_is_discarded() {
    let dir = TempDir::new().unwrap();
    let pipeline = uniform_pipeline(dir.path());
    pipeline
        .dispatch(Arc::new(MockTool::perfect()), ResumeMode::Resume, false)
        .unwrap();
    let broken = BatchKey::new(2, 1);
    fs::write(pipeline.layout.output_file(broken), "1 2 3\nnot numbers\n").unwrap();

    let summary = pipeline.extract().unwrap();
    assert_eq!(summary.discarded.len(), 1);
    assert_eq!(summary.discarded[0].key, broken);
    assert_eq!(summary.records.len(), 75);
    assert!(summary.records.iter().all(|r| r.key != broken));
}

#[test]
fn completeness_bounded_and_empty_bins_undefined() {
    let dir = TempDir::new().unwrap();
    let mut pipeline = generated_pipeline(dir.path(), 400);
    pipeline.config.per_chip = true;
    let tool = Arc::new(MockTool::new(|_, x| x.fract() < 0.5));
    pipeline.dispatch(tool, ResumeMode::Resume, false).unwrap();
    let summary = pipeline.extract().unwrap();

    // Reference magnitudes span 21-26; the outer bins see no stars
    let bins = MagnitudeBins::from(RangeArg(15.0, 32.0, 1.0));
    let table = pipeline.complete(&summary, &bins).unwrap();

    let all: Vec<_> = table.region(Region::All).collect();
    assert_eq!(all.len(), 17);
    assert_eq!(all[0].injected, 0);
    assert_eq!(all[0].completeness(), None);
    assert_eq!(all[16].completeness(), None);

    let mut defined = 0;
    for row in &table.rows {
        if let Some(c) = row.completeness() {
            assert!((0.0..=1.0).contains(&c));
            defined += 1;
        }
    }
    assert!(defined > 0);
    let total: usize = all.iter().map(|r| r.injected).sum();
    assert_eq!(total, 400);
    let overall = all.iter().map(|r| r.recovered).sum::<usize>() as f64 / total as f64;
    assert_relative_eq!(overall, summary.recovered() as f64 / 400.0);
    assert!(table.region(Region::Chip(1)).count() == 17);
}

#[test]
fn run_without_output_gives_undefined_bins() {
    let dir = TempDir::new().unwrap();
    let pipeline = generated_pipeline(dir.path(), 200);

    // Nothing dispatched: every batch is incomplete
    let summary = pipeline.extract().unwrap();
    assert!(summary.records.is_empty());
    assert_eq!(summary.incomplete.len(), pipeline.batches().unwrap().1.len());

    let table = pipeline
        .complete(&summary, &MagnitudeBins::EqualWidth(4))
        .unwrap();
    assert_eq!(table.rows.len(), 4);
    assert!(table.rows[0].mag_lo >= 19.0);
    assert!(table.rows[3].mag_hi <= 27.0);
    for row in &table.rows {
        assert_eq!(row.injected, 0);
        assert_eq!(row.completeness(), None);
    }
    let text = fs::read_to_string(pipeline.layout.completeness_file()).unwrap();
    assert_eq!(text.lines().filter(|l| l.ends_with(",nan")).count(), 4);
}
