//! Process one Sentinel-1 GRD scene into per-hemisphere backscatter mosaics
//!
//! Usage:
//! ```text
//! sardine-am S1A_IW_GRDH_1SDV_...zip --out-dir ./ard --east-dem east.tif --west-dem west.tif
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use sardine_am::config::ProcessingConfig;
use sardine_am::core::pipeline::ScenePipeline;
use sardine_am::types::DemReferences;
use std::path::PathBuf;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(
    name = "sardine-am",
    about = "Antemeridian-safe Sentinel-1 backscatter preparation",
    long_about = None
)]
struct Args {
    /// Scene as a .SAFE directory or .zip archive
    scene: PathBuf,

    /// Directory receiving the scene's mosaics
    #[arg(short, long, default_value = ".")]
    out_dir: PathBuf,

    /// JSON processing configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Elevation model for the eastern hemisphere
    #[arg(long)]
    east_dem: Option<PathBuf>,

    /// Elevation model for the western hemisphere
    #[arg(long)]
    west_dem: Option<PathBuf>,

    /// Engine executable, overrides the configuration
    #[arg(long)]
    gpt: Option<PathBuf>,

    /// Row blocks per hemisphere, overrides the configuration
    #[arg(long)]
    chunks: Option<usize>,

    /// Dense grid size N, overrides the configuration
    #[arg(long)]
    grid_points: Option<usize>,

    /// Keep the scene workspace after processing
    #[arg(long)]
    keep_workspace: bool,

    /// Also produce layover/shadow mask mosaics
    #[arg(long)]
    layover_shadow_mask: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProcessingConfig::from_json_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => ProcessingConfig::default(),
    };
    if let Some(gpt) = args.gpt {
        config.engine.executable = gpt;
    }
    if let Some(chunks) = args.chunks {
        config.splitter.chunks = chunks;
    }
    if let Some(grid_points) = args.grid_points {
        config.densify.grid_points = grid_points;
    }
    config.keep_workspace |= args.keep_workspace;
    config.layover_shadow_mask |= args.layover_shadow_mask;
    config.validate().context("invalid configuration")?;

    let dems = DemReferences {
        east: args.east_dem,
        west: args.west_dem,
    };

    let pipeline = ScenePipeline::new(config, dems);
    let report = pipeline
        .process(&args.scene, &args.out_dir)
        .with_context(|| format!("processing {}", args.scene.display()))?;

    log::info!(
        "{}: crossing={}, {} tasks ({} failed), {} mosaics",
        report.scene,
        report.crossing,
        report.tasks.len(),
        report.failed_tasks(),
        report.mosaics.len()
    );
    for mosaic in &report.mosaics {
        println!("{}", mosaic.path.display());
    }
    Ok(())
}
