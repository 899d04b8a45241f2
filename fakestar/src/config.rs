//! Run configuration stored as JSON

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::completeness::QualityCuts;
use crate::error::{FakeStarError, Result};
use crate::matcher::MatchConfig;
use crate::orchestrator::{ResumeMode, ToolConfig};
use crate::sampling::{PositionMode, SamplingPolicy};

/// Seed of the historical batch shuffle.
pub const DEFAULT_SEED: u64 = 1442291549;

/// Settings of one artificial star run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run name, also the run directory
    pub run_name: String,
    pub n_stars: usize,
    pub batch_size: usize,
    pub workers: usize,
    pub policy: SamplingPolicy,
    /// Magnitude bins of the completeness table
    pub n_bins: usize,
    pub seed: u64,
    pub quality: QualityCuts,
    pub resume: ResumeMode,
    pub matching: MatchConfig,
    pub tool: ToolConfig,
    /// Bands to inject; all catalog bands when unset
    pub bands: Option<Vec<String>>,
    /// Band the generator bins on and completeness is reported in; first band when unset
    pub completeness_band: Option<String>,
    pub per_chip: bool,
    pub positions: PositionMode,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_name: "complete".to_string(),
            n_stars: 60_000,
            batch_size: 100,
            workers: 30,
            policy: SamplingPolicy::default(),
            n_bins: 20,
            seed: DEFAULT_SEED,
            quality: QualityCuts::default(),
            resume: ResumeMode::default(),
            matching: MatchConfig::default(),
            tool: ToolConfig::default(),
            bands: None,
            completeness_band: None,
            per_chip: false,
            positions: PositionMode::default(),
        }
    }
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            FakeStarError::config(format!("cannot read run config {}: {e}", path.display()))
        })?;
        let config: RunConfig = serde_json::from_str(&text)?;
        config.validate()?;
        debug!("Loaded run config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.run_name.is_empty() || self.run_name.contains(['/', '\\']) {
            return Err(FakeStarError::config(format!(
                "run name '{}' must be a plain directory name",
                self.run_name
            )));
        }
        if self.batch_size == 0 {
            return Err(FakeStarError::config("batch_size must be positive"));
        }
        if self.workers == 0 {
            return Err(FakeStarError::config("workers must be positive"));
        }
        if self.n_bins == 0 {
            return Err(FakeStarError::config("n_bins must be positive"));
        }
        if !(self.matching.tolerance_sq > 0.0) {
            return Err(FakeStarError::config("match tolerance must be positive"));
        }
        if let Some(bands) = &self.bands {
            if bands.is_empty() {
                return Err(FakeStarError::config("band selection is empty"));
            }
        }
        match &self.policy {
            SamplingPolicy::EqualCount { bins } | SamplingPolicy::Histogram { bins } if *bins == 0 => {
                Err(FakeStarError::config("sampling policy needs at least one bin"))
            }
            _ => Ok(()),
        }
    }

    /// Band used for generator binning and the completeness table.
    pub fn reference_band(&self, available: &[String]) -> Result<String> {
        match &self.completeness_band {
            Some(band) if available.contains(band) => Ok(band.clone()),
            Some(band) => Err(FakeStarError::config(format!(
                "completeness band {band} not among {}",
                available.join(", ")
            ))),
            None => available
                .first()
                .cloned()
                .ok_or_else(|| FakeStarError::config("no bands available")),
        }
    }
}
