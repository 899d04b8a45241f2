//! Numerical helpers for catalog resampling
//!
//! Interpolation over tabulated relations and the binning statistics used
//! when building synthetic star catalogs.

pub mod misc;
pub mod stats;

pub use misc::{interp, interp_many, linspace, InterpError};
pub use stats::{bin_index, equal_count_edges, equal_width_edges, finite_range, histogram, mean};
