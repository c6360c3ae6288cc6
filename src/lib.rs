//! SARdine-AM: antemeridian-safe Sentinel-1 backscatter preparation
//!
//! Scenes whose footprint straddles 180 degrees longitude are densified,
//! split into per-hemisphere pixel windows, processed window by window with an
//! external radar engine and merged back into one mosaic per hemisphere and
//! polarization. Other scenes take a single pass through the same engine.

pub mod config;
pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use config::ProcessingConfig;
pub use types::{
    DemReferences, GroundControlPoint, Hemisphere, MosaicLayer, MosaicResult, Polarization,
    ProcessingTask, ProductKind, SarError, SarResult, SceneMetadata, SubsetWindow, TiePoint,
};

pub use crate::core::pipeline::{SceneReport, ScenePipeline};
pub use io::{SafeProduct, TiePointGridReader};
