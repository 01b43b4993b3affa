pub mod buffer2;
pub mod file_utils;
pub mod log_setup;

pub use buffer2::Buffer2;

/// Distance below which two points are treated as coincident.
pub const EPSILON: f64 = 1e-6;
