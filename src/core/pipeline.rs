//! Scene-level controller: extent check, densification, chunked or single-pass
//! engine runs and mosaic assembly inside a scoped workspace

use crate::config::ProcessingConfig;
use crate::core::antemeridian::{scene_hemisphere, AntemeridianSplitter};
use crate::core::densify::{DenseGrid, GridDensifier};
use crate::core::engine::{GptEngine, ProcessingEngine};
use crate::core::geometry::PointTransform;
use crate::core::graph::ProcessingGraph;
use crate::core::mosaic::{GdalWarpMerger, MosaicAssembler, RasterMerger};
use crate::core::orchestrator::{ProcessingGraphOrchestrator, TaskOutcome};
use crate::io::safe::SafeProduct;
use crate::types::{
    DemReferences, Hemisphere, LogContext, MosaicLayer, MosaicResult, Polarization, ProcessingTask,
    ProductKind, SarError, SarResult, SceneMetadata,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Converts a mosaic into a cloud-optimized raster
pub trait CogConverter: Send + Sync {
    fn convert(&self, raster: &Path, nodata: f64) -> SarResult<PathBuf>;
}

/// Writes a dataset metadata record for a finished product directory
pub trait MetadataRecordBuilder: Send + Sync {
    fn build(&self, product_dir: &Path, metadata: &SceneMetadata) -> SarResult<PathBuf>;
}

/// Publishes finished files
pub trait Uploader: Send + Sync {
    fn upload(&self, paths: &[PathBuf], destination: &str) -> SarResult<()>;
}

/// Everything that happened to one scene
#[derive(Debug, Clone)]
pub struct SceneReport {
    pub scene: String,
    pub crossing: bool,
    pub tasks: Vec<TaskOutcome>,
    pub mosaics: Vec<MosaicResult>,
    /// Files handed to the downstream stages (converted rasters and records)
    pub products: Vec<PathBuf>,
    /// Workspace left on disk when `keep_workspace` is set
    pub workspace: Option<PathBuf>,
}

impl SceneReport {
    pub fn failed_tasks(&self) -> usize {
        self.tasks.iter().filter(|t| !t.succeeded()).count()
    }
}

/// Runs scenes through the antemeridian-safe chain
pub struct ScenePipeline {
    config: ProcessingConfig,
    dems: DemReferences,
    engine: Option<Box<dyn ProcessingEngine>>,
    merger: Box<dyn RasterMerger>,
    transforms: Option<(Arc<dyn PointTransform>, Arc<dyn PointTransform>)>,
    cog_converter: Option<Box<dyn CogConverter>>,
    metadata_builder: Option<Box<dyn MetadataRecordBuilder>>,
    uploader: Option<(Box<dyn Uploader>, String)>,
    abort: Arc<AtomicBool>,
}

impl ScenePipeline {
    /// Pipeline with the subprocess engine and the GDAL merger
    pub fn new(config: ProcessingConfig, dems: DemReferences) -> Self {
        Self {
            config,
            dems,
            engine: None,
            merger: Box::new(GdalWarpMerger),
            transforms: None,
            cog_converter: None,
            metadata_builder: None,
            uploader: None,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_engine(mut self, engine: Box<dyn ProcessingEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_merger(mut self, merger: Box<dyn RasterMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Replace the GDAL geographic/projected transforms used for densification
    pub fn with_point_transforms(
        mut self,
        forward: Arc<dyn PointTransform>,
        inverse: Arc<dyn PointTransform>,
    ) -> Self {
        self.transforms = Some((forward, inverse));
        self
    }

    pub fn with_cog_converter(mut self, converter: Box<dyn CogConverter>) -> Self {
        self.cog_converter = Some(converter);
        self
    }

    pub fn with_metadata_builder(mut self, builder: Box<dyn MetadataRecordBuilder>) -> Self {
        self.metadata_builder = Some(builder);
        self
    }

    pub fn with_uploader(mut self, uploader: Box<dyn Uploader>, destination: impl Into<String>) -> Self {
        self.uploader = Some((uploader, destination.into()));
        self
    }

    /// Flag that stops the scene between tasks and kills a running engine
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    fn check_abort(&self, ctx: &LogContext, stage: &str) -> SarResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(SarError::Aborted(format!("{} aborted before {}", ctx, stage)));
        }
        Ok(())
    }

    fn workspace(&self) -> SarResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sardine-am-");
        let dir = match &self.config.workspace_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    fn densifier(&self, ctx: &LogContext) -> SarResult<GridDensifier> {
        match &self.transforms {
            Some((forward, inverse)) => Ok(GridDensifier::with_transforms(
                self.config.densify.clone(),
                Arc::clone(forward),
                Arc::clone(inverse),
                ctx.clone(),
            )),
            None => GridDensifier::new(self.config.densify.clone(), ctx.clone()),
        }
    }

    fn template(&self) -> SarResult<ProcessingGraph> {
        match &self.config.graph_template {
            Some(path) => ProcessingGraph::from_file(path),
            None => ProcessingGraph::base(),
        }
    }

    /// Process one scene (`.SAFE` directory or `.zip`) into mosaics under `out_dir`
    pub fn process(&self, scene_path: &Path, out_dir: &Path) -> SarResult<SceneReport> {
        self.config.validate()?;
        let workspace = self.workspace()?;
        log::info!(
            "Processing {} in workspace {}",
            scene_path.display(),
            workspace.path().display()
        );

        let result = self.process_in(scene_path, out_dir, workspace.path());

        let kept = if self.config.keep_workspace {
            let path = workspace.into_path();
            log::info!("Keeping workspace {}", path.display());
            Some(path)
        } else {
            // TempDir removes the workspace on drop
            None
        };

        result.map(|mut report| {
            report.workspace = kept;
            report
        })
    }

    fn process_in(&self, scene_path: &Path, out_dir: &Path, workspace: &Path) -> SarResult<SceneReport> {
        let product = SafeProduct::open(scene_path, workspace)?;
        let metadata = product.read_metadata()?;
        let ctx = LogContext::new(product.product_name());
        let scene_name = metadata.output_name();
        log::info!(
            "{} Scene {} ({}x{}, polarizations {:?})",
            ctx,
            scene_name,
            metadata.dimensions.samples,
            metadata.dimensions.lines,
            metadata.polarizations
        );

        let task_dir = workspace.join("tasks");
        let graph_dir = workspace.join("graphs");
        std::fs::create_dir_all(&task_dir)?;
        std::fs::create_dir_all(&graph_dir)?;

        let splitter = AntemeridianSplitter::new(self.config.splitter.clone(), ctx.clone());
        let crossing = splitter.is_crossing(&metadata.aoi)?;

        self.check_abort(&ctx, "planning")?;
        let tasks = if crossing {
            let dense = self.densify_annotations(&product, &metadata, &ctx)?;
            splitter.plan(&dense.gcps, metadata.dimensions, &self.dems, &task_dir)?
        } else {
            let hemisphere = scene_hemisphere(&metadata.aoi)?;
            log::info!("{} Single-pass processing in the {} hemisphere", ctx, hemisphere);
            vec![ProcessingTask {
                hemisphere,
                window: None,
                dem: self.dems.for_hemisphere(hemisphere).map(Path::to_path_buf),
                output_path: task_dir.join(&scene_name),
            }]
        };

        self.check_abort(&ctx, "engine runs")?;
        let default_engine;
        let engine: &dyn ProcessingEngine = match &self.engine {
            Some(engine) => engine.as_ref(),
            None => {
                default_engine = GptEngine::with_abort_flag(
                    self.config.engine.clone(),
                    Arc::clone(&self.abort),
                    ctx.clone(),
                );
                &default_engine
            }
        };
        let mut orchestrator = ProcessingGraphOrchestrator::new(
            self.template()?,
            engine,
            product.manifest_path(),
            &graph_dir,
            ctx.clone(),
        )
        .with_policy(self.config.failure_policy)
        .with_polarizations(&metadata.polarizations)
        .with_abort_flag(Arc::clone(&self.abort));
        if self.config.layover_shadow_mask {
            orchestrator = orchestrator.with_layover_shadow_mask()?;
        }
        let outcomes = orchestrator.run_all(&tasks)?;

        self.check_abort(&ctx, "mosaicking")?;
        let scene_out = out_dir.join(&scene_name);
        let mut layers: Vec<MosaicLayer> =
            metadata.polarizations.iter().copied().map(MosaicLayer::from).collect();
        if self.config.layover_shadow_mask {
            layers.push(MosaicLayer::LayoverShadowMask);
        }
        let mosaics = self.assemble(&scene_name, &layers, &outcomes, &scene_out, &ctx)?;

        let products = self.publish(&mosaics, &scene_out, &metadata, &ctx)?;

        log::info!(
            "{} Scene finished: {} tasks ({} failed), {} mosaics",
            ctx,
            outcomes.len(),
            outcomes.iter().filter(|o| !o.succeeded()).count(),
            mosaics.len()
        );

        Ok(SceneReport {
            scene: scene_name,
            crossing,
            tasks: outcomes,
            mosaics,
            products,
            workspace: None,
        })
    }

    /// Densify every annotation grid of the workspace copy; the reference
    /// polarization's grid drives the split
    fn densify_annotations(
        &self,
        product: &SafeProduct,
        metadata: &SceneMetadata,
        ctx: &LogContext,
    ) -> SarResult<DenseGrid> {
        let densifier = self.densifier(ctx)?;
        let annotations = product.annotation_files()?;
        let reference = if annotations.contains_key(&Polarization::VV) {
            Some(Polarization::VV)
        } else {
            metadata
                .polarizations
                .iter()
                .copied()
                .find(|p| annotations.contains_key(p))
        };

        let mut reference_grid = None;
        for (polarization, path) in &annotations {
            let grid = densifier.densify_file(path, self.config.writeback)?;
            if Some(*polarization) == reference || reference_grid.is_none() {
                reference_grid = Some(grid);
            }
        }
        reference_grid.ok_or_else(|| {
            SarError::Densification("No annotation grid could be densified".to_string())
        })
    }

    fn assemble(
        &self,
        scene_name: &str,
        layers: &[MosaicLayer],
        outcomes: &[TaskOutcome],
        scene_out: &Path,
        ctx: &LogContext,
    ) -> SarResult<Vec<MosaicResult>> {
        let assembler = MosaicAssembler::new(self.config.mosaic.clone(), self.merger.as_ref(), ctx.clone());
        let mut mosaics = Vec::new();

        for hemisphere in Hemisphere::ALL {
            for &layer in layers {
                let product = match layer {
                    MosaicLayer::Backscatter(_) => ProductKind::Backscatter,
                    MosaicLayer::LayoverShadowMask => ProductKind::LayoverShadowMask,
                };
                let outputs: Vec<PathBuf> = outcomes
                    .iter()
                    .filter(|o| o.succeeded() && o.product == product && o.task.hemisphere == hemisphere)
                    .map(|o| o.task.output_path.clone())
                    .collect();
                if outputs.is_empty() {
                    continue;
                }
                if let Some(mosaic) = assembler.assemble(scene_name, hemisphere, layer, &outputs, scene_out)? {
                    mosaics.push(mosaic);
                }
            }
        }
        Ok(mosaics)
    }

    fn publish(
        &self,
        mosaics: &[MosaicResult],
        scene_out: &Path,
        metadata: &SceneMetadata,
        ctx: &LogContext,
    ) -> SarResult<Vec<PathBuf>> {
        let mut products: Vec<PathBuf> = Vec::new();
        if mosaics.is_empty() {
            return Ok(products);
        }

        for mosaic in mosaics {
            match &self.cog_converter {
                Some(converter) => {
                    products.push(converter.convert(&mosaic.path, self.config.mosaic.nodata)?)
                }
                None => products.push(mosaic.path.clone()),
            }
        }
        if let Some(builder) = &self.metadata_builder {
            products.push(builder.build(scene_out, metadata)?);
        }
        if let Some((uploader, destination)) = &self.uploader {
            log::info!("{} Uploading {} files to {}", ctx, products.len(), destination);
            uploader.upload(&products, destination)?;
        }
        Ok(products)
    }
}
