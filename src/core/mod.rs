//! Core processing modules

pub mod antemeridian;
pub mod densify;
pub mod engine;
pub mod geometry;
pub mod graph;
pub mod interpolation;
pub mod mosaic;
pub mod orchestrator;
pub mod pipeline;

// Re-export main types
pub use antemeridian::{AntemeridianSplitter, DatelineSide, GcpRow, HemisphereGroup, RowBlock, SplitterParams};
pub use densify::{DenseGrid, DensifyParams, GridDensifier};
pub use engine::{EngineParams, ExecutionResult, GptEngine, ProcessingEngine};
pub use geometry::{GdalPointTransform, ParallelReprojector, PointTransform};
pub use graph::{GraphNode, OperatorParameters, ParameterSet, ProcessingGraph};
pub use interpolation::CubicInterpolator;
pub use mosaic::{GdalWarpMerger, MosaicAssembler, MosaicParams, RasterMerger};
pub use orchestrator::{ProcessingGraphOrchestrator, TaskFailurePolicy, TaskOutcome, TaskStatus};
pub use pipeline::{CogConverter, MetadataRecordBuilder, SceneReport, ScenePipeline, Uploader};
