//! Shared components and utilities for artificial star test pipelines.
//!
//! This crate holds infrastructure that is independent of any particular
//! photometry package: tabulated interpolation, sample binning, range
//! arguments for the command line, and a bounded worker pool.

pub mod algo;
pub mod range_arg;
pub mod worker_pool;
