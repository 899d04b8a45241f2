//! Artificial star tests for crowded-field photometry.
//!
//! Synthetic stars modelled on an observed catalog are split into batches,
//! injected and re-measured by an external fitting tool, matched back to
//! their detections, and reduced to a completeness table per magnitude bin.

pub mod batch;
pub mod catalog;
pub mod completeness;
pub mod config;
pub mod detection;
pub mod error;
pub mod matcher;
pub mod orchestrator;
pub mod pipeline;
pub mod sampling;
pub mod wcs;

pub use batch::{Batch, BatchKey, BatchManifest, RunLayout};
pub use catalog::{ReferenceCatalog, SyntheticCatalog, SyntheticStar};
pub use completeness::{CompletenessTable, MagnitudeBins, QualityCuts};
pub use config::RunConfig;
pub use detection::{DetectionLayout, RecoveredDetection};
pub use error::{FakeStarError, Result};
pub use matcher::{MatchConfig, MatchPolicy, MatchSummary, MatchedRecord};
pub use orchestrator::{ExternalTool, FitJob, FittingTool, ResumeMode, RunReport};
pub use pipeline::Pipeline;
pub use sampling::SamplingPolicy;
