//! Batch partitioning and the on-disk run layout
//!
//! Every batch is addressed by a [`BatchKey`]. File names are derived from
//! keys by [`RunLayout`] and are never parsed back; the manifest records
//! which keys exist and which synthetic stars each batch holds.

use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::catalog::{SyntheticCatalog, SyntheticStar};
use crate::error::{FakeStarError, Result};

/// Control tokens leading every batch file line.
const LINE_PREFIX: &str = "0 1";

/// Name of the batch manifest inside a run directory.
pub const MANIFEST_FILE: &str = "batches.json";

/// Name of the synthetic catalog inside a run directory.
pub const CATALOG_FILE: &str = "synthetic.csv";

/// Address of one batch: the chip it belongs to and its sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchKey {
    pub chip: u32,
    pub index: usize,
}

impl BatchKey {
    pub fn new(chip: u32, index: usize) -> Self {
        Self { chip, index }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chip {} #{:04}", self.chip, self.index)
    }
}

/// A group of synthetic stars processed by one tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub key: BatchKey,
    pub stars: Vec<SyntheticStar>,
}

/// File naming for one run.
///
/// Parameter profiles live in the working directory next to the base
/// photometry; batch and output files live in the run directory.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    pub work_dir: PathBuf,
    pub run: String,
}

impl RunLayout {
    pub fn new(work_dir: impl Into<PathBuf>, run: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
            run: run.into(),
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.work_dir.join(&self.run)
    }

    pub fn batch_file(&self, key: BatchKey) -> PathBuf {
        self.run_dir()
            .join(format!("fake{}.list{:04}", key.chip, key.index))
    }

    pub fn output_file(&self, key: BatchKey) -> PathBuf {
        self.run_dir()
            .join(format!("output{}.fake{:04}", key.chip, key.index))
    }

    /// Scratch file the tool writes to before the output is committed.
    pub fn partial_output_file(&self, key: BatchKey) -> PathBuf {
        let mut path = self.output_file(key).into_os_string();
        path.push(".partial");
        PathBuf::from(path)
    }

    /// Run-specific parameter profile for `chip`.
    pub fn param_file(&self, chip: u32) -> PathBuf {
        self.work_dir.join(format!("phot{chip}.{}.param", self.run))
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.run_dir().join(MANIFEST_FILE)
    }

    pub fn catalog_file(&self) -> PathBuf {
        self.run_dir().join(CATALOG_FILE)
    }

    pub fn matched_file(&self) -> PathBuf {
        self.run_dir().join("matched.csv")
    }

    pub fn completeness_file(&self) -> PathBuf {
        self.run_dir().join("completeness.csv")
    }
}

/// Split a synthetic catalog into batches of at most `batch_size` stars.
///
/// The catalog is shuffled with `seed`, then grouped by chip (ascending).
/// Each chip's stars keep their shuffled order and are cut into contiguous
/// batches numbered from 0. The last batch of a chip may be short.
pub fn partition(catalog: &SyntheticCatalog, batch_size: usize, seed: u64) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(FakeStarError::config("batch size must be positive"));
    }

    let mut order: Vec<usize> = (0..catalog.stars.len()).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);

    let mut per_chip: BTreeMap<u32, Vec<SyntheticStar>> = BTreeMap::new();
    for idx in order {
        let star = &catalog.stars[idx];
        per_chip.entry(star.chip).or_default().push(star.clone());
    }

    let mut batches = Vec::new();
    for (chip, stars) in per_chip {
        for (index, chunk) in stars.chunks(batch_size).enumerate() {
            batches.push(Batch {
                key: BatchKey::new(chip, index),
                stars: chunk.to_vec(),
            });
        }
    }
    debug!(
        "Partitioned {} stars into {} batches of up to {}",
        catalog.stars.len(),
        batches.len(),
        batch_size
    );
    Ok(batches)
}

/// Write a batch as `0 1 x y mag...` lines, magnitudes in `bands` order.
pub fn write_batch_file(path: &Path, stars: &[SyntheticStar], bands: &[String]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for star in stars {
        write!(out, "{} {} {}", LINE_PREFIX, star.x, star.y)?;
        for mag in star.magnitudes_in(bands) {
            write!(out, " {mag}")?;
        }
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Position and magnitudes of one batch file line.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    pub x: f64,
    pub y: f64,
    pub magnitudes: Vec<f64>,
}

/// Parse a batch file written by [`write_batch_file`].
pub fn read_batch_file(path: &Path, n_bands: usize) -> Result<Vec<BatchEntry>> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut entries = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |reason: String| FakeStarError::MalformedRecord {
            path: path.to_path_buf(),
            line: i + 1,
            reason,
        };

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 + n_bands {
            return Err(malformed(format!(
                "expected {} fields, found {}",
                4 + n_bands,
                fields.len()
            )));
        }
        let values = fields[2..]
            .iter()
            .map(|f| f.parse::<f64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| malformed(e.to_string()))?;
        entries.push(BatchEntry {
            x: values[0],
            y: values[1],
            magnitudes: values[2..].to_vec(),
        });
    }
    Ok(entries)
}

/// Ordered synthetic ids of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: BatchKey,
    pub ids: Vec<usize>,
}

/// Index of every batch in a run, stored as `batches.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub run: String,
    pub bands: Vec<String>,
    pub batch_size: usize,
    pub seed: u64,
    pub batches: Vec<ManifestEntry>,
}

impl BatchManifest {
    pub fn new(run: &str, bands: &[String], batch_size: usize, seed: u64, batches: &[Batch]) -> Self {
        Self {
            run: run.to_string(),
            bands: bands.to_vec(),
            batch_size,
            seed,
            batches: batches
                .iter()
                .map(|b| ManifestEntry {
                    key: b.key,
                    ids: b.stars.iter().map(|s| s.id).collect(),
                })
                .collect(),
        }
    }

    pub fn keys(&self) -> Vec<BatchKey> {
        self.batches.iter().map(|b| b.key).collect()
    }

    pub fn chips(&self) -> Vec<u32> {
        let mut chips: Vec<u32> = self.batches.iter().map(|b| b.key.chip).collect();
        chips.dedup();
        chips
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            FakeStarError::config(format!(
                "cannot read batch manifest {}: {e}",
                path.display()
            ))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Rebuild the batches from the manifest and the synthetic catalog.
    pub fn resolve(&self, catalog: &SyntheticCatalog) -> Result<Vec<Batch>> {
        let by_id: BTreeMap<usize, &SyntheticStar> =
            catalog.stars.iter().map(|s| (s.id, s)).collect();
        self.batches
            .iter()
            .map(|entry| {
                let stars = entry
                    .ids
                    .iter()
                    .map(|id| {
                        by_id.get(id).map(|s| (*s).clone()).ok_or_else(|| {
                            FakeStarError::config(format!(
                                "batch {} names synthetic star {id} missing from the catalog",
                                entry.key
                            ))
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Batch {
                    key: entry.key,
                    stars,
                })
            })
            .collect()
    }
}

/// Write the synthetic catalog, every batch file and the manifest.
pub fn write_run(
    layout: &RunLayout,
    catalog: &SyntheticCatalog,
    batches: &[Batch],
    batch_size: usize,
    seed: u64,
) -> Result<BatchManifest> {
    fs::create_dir_all(layout.run_dir())?;
    catalog.save_csv(&layout.catalog_file())?;
    for batch in batches {
        write_batch_file(&layout.batch_file(batch.key), &batch.stars, &catalog.bands)?;
    }
    let manifest = BatchManifest::new(&layout.run, &catalog.bands, batch_size, seed, batches);
    manifest.save(&layout.manifest_file())?;
    info!(
        "Wrote {} batches for {} stars to {}",
        batches.len(),
        catalog.len(),
        layout.run_dir().display()
    );
    Ok(manifest)
}

/// Reload the batches of an existing run.
pub fn load_run(layout: &RunLayout) -> Result<(BatchManifest, Vec<Batch>)> {
    let manifest = BatchManifest::load(&layout.manifest_file())?;
    let catalog = SyntheticCatalog::load_csv(&layout.catalog_file())?;
    let batches = manifest.resolve(&catalog)?;
    Ok((manifest, batches))
}
