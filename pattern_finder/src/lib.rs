//! Locates user-drawn star patterns ("asterisms") in georeferenced rasters.
//!
//! Leaves first: [`raster`] loads pixels and georeferencing, [`coords`]
//! maps pattern points into pixel space, [`star_detection`] finds stars,
//! [`matching`] fits the pattern to them and [`render`] draws overlays.
//! [`search`] runs all of it over the files of a catalog dataset.

pub mod config;
pub mod coords;
pub mod matching;
pub mod raster;
pub mod render;
pub mod search;
pub mod star_detection;

#[cfg(test)]
mod testing;

pub use config::ServiceConfig;
pub use search::{PatternSearch, SearchRunRequest, SearchRunResponse};
