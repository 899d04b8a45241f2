//! Stage drivers shared by the binary and integration tests
//!
//! Stages communicate only through the run directory: `generate` writes the
//! synthetic catalog, batch files and manifest; `dispatch` fills in tool
//! outputs; `extract` and `complete` read them back.

use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::batch::{load_run, partition, write_run, Batch, BatchManifest, RunLayout};
use crate::catalog::ReferenceCatalog;
use crate::completeness::{aggregate, CompletenessTable, MagnitudeBins};
use crate::config::RunConfig;
use crate::detection::DetectionLayout;
use crate::error::Result;
use crate::matcher::{match_run, write_matched_csv, MatchSummary};
use crate::orchestrator::{write_fake_params, FittingTool, Orchestrator, ResumeMode, RunReport};
use crate::sampling::{generate, PositionSampler};
use crate::wcs::WorldToPixel;

/// One run of the artificial star test rooted at a working directory.
pub struct Pipeline {
    pub layout: RunLayout,
    pub config: RunConfig,
}

impl Pipeline {
    pub fn new(work_dir: impl Into<PathBuf>, config: RunConfig) -> Result<Self> {
        config.validate()?;
        let layout = RunLayout::new(work_dir, config.run_name.clone());
        Ok(Self { layout, config })
    }

    /// Draw the synthetic catalog and write batches, manifest and parameter profiles.
    pub fn generate(
        &self,
        reference: &ReferenceCatalog,
        wcs: Option<&dyn WorldToPixel>,
    ) -> Result<BatchManifest> {
        let reference = match &self.config.bands {
            Some(bands) => reference.select_bands(bands)?,
            None => reference.clone(),
        };
        let band = self.config.reference_band(&reference.bands)?;
        let sampler = PositionSampler::from_mode(self.config.positions, &reference, wcs)?;
        let catalog = generate(
            &reference,
            &self.config.policy,
            &band,
            self.config.n_stars,
            &sampler,
            self.config.seed,
        )?;

        let batches = partition(&catalog, self.config.batch_size, self.config.seed)?;
        let manifest = write_run(
            &self.layout,
            &catalog,
            &batches,
            self.config.batch_size,
            self.config.seed,
        )?;
        write_fake_params(&self.layout, &self.config.tool, &manifest.chips())?;
        Ok(manifest)
    }

    /// Load the reference catalog from CSV and generate.
    pub fn generate_from(&self, reference_csv: &Path, wcs: Option<&dyn WorldToPixel>) -> Result<BatchManifest> {
        let reference = ReferenceCatalog::load_csv(reference_csv)?;
        self.generate(&reference, wcs)
    }

    /// Run the fitting tool over every pending batch.
    pub fn dispatch(&self, tool: Arc<dyn FittingTool>, mode: ResumeMode, progress: bool) -> Result<RunReport> {
        let manifest = BatchManifest::load(&self.layout.manifest_file())?;
        Orchestrator::new(
            self.layout.clone(),
            self.config.tool.clone(),
            tool,
            self.config.workers,
        )
        .with_progress(progress)
        .run(&manifest.keys(), mode)
    }

    /// Batches of the run as written by [`Pipeline::generate`].
    pub fn batches(&self) -> Result<(BatchManifest, Vec<Batch>)> {
        load_run(&self.layout)
    }

    pub fn detection_layout(&self, n_bands: usize) -> DetectionLayout {
        DetectionLayout::dolphot_fake(self.config.tool.n_images, n_bands)
    }

    /// Match every output and write `matched.csv`.
    pub fn extract(&self) -> Result<MatchSummary> {
        let (manifest, batches) = self.batches()?;
        let layout = self.detection_layout(manifest.bands.len());
        let summary = match_run(&self.layout, &batches, &layout, &self.config.matching);
        write_matched_csv(
            &self.layout.matched_file(),
            &summary.records,
            &manifest.bands,
            &self.config.quality,
        )?;
        Ok(summary)
    }

    /// Aggregate matched records into `completeness.csv`.
    ///
    /// Equal-width bins span the whole synthetic catalog, so batches
    /// without output still show up as undefined bins.
    pub fn complete(&self, summary: &MatchSummary, bins: &MagnitudeBins) -> Result<CompletenessTable> {
        let (manifest, batches) = self.batches()?;
        let band = self.config.reference_band(&manifest.bands)?;
        let injected: Vec<f64> = batches
            .iter()
            .flat_map(|b| &b.stars)
            .filter_map(|star| star.magnitudes.get(&band).copied())
            .collect();
        let bins = bins.anchored(&injected)?;
        let table = aggregate(
            &summary.records,
            &self.config.quality,
            &bins,
            &band,
            self.config.per_chip,
        )?;
        table.write_csv(&self.layout.completeness_file())?;
        info!(
            "Wrote {} completeness rows to {}",
            table.rows.len(),
            self.layout.completeness_file().display()
        );
        Ok(table)
    }
}

/// Log the end-of-run summary of dispatch and matching.
pub fn log_report(report: Option<&RunReport>, summary: Option<&MatchSummary>) {
    if let Some(report) = report {
        info!(
            "Fitting: {} dispatched, {} completed, {} incomplete",
            report.dispatched,
            report.completed,
            report.incomplete.len()
        );
        for batch in &report.incomplete {
            warn!("  incomplete {}: {}", batch.key, batch.reason);
        }
    }
    if let Some(summary) = summary {
        info!(
            "Matching: {} injected, {} recovered, {} orphan detections",
            summary.records.len(),
            summary.recovered(),
            summary.orphans
        );
        if !summary.incomplete.is_empty() {
            warn!("  {} batches without output", summary.incomplete.len());
        }
        for discarded in &summary.discarded {
            warn!(
                "  discarded {}: {}",
                discarded.path.display(),
                discarded.reason
            );
        }
    }
}
