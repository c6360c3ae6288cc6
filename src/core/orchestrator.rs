//! Per-task graph construction and sequential engine execution

use crate::core::engine::{ExecutionResult, ProcessingEngine};
use crate::core::graph::{
    GraphNode, OperatorParameters, ProcessingGraph, READ_OPERATOR, SUBSET_OPERATOR,
    TERRAIN_CORRECTION_OPERATOR, TERRAIN_FLATTENING_OPERATOR, WRITE_OPERATOR,
};
use crate::types::{LogContext, Polarization, ProcessingTask, ProductKind, SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reader format for SAFE products
pub const READ_FORMAT: &str = "SENTINEL-1";
/// Writer format of task outputs; band files end in `.img`
pub const WRITE_FORMAT: &str = "ENVI";
/// Parameter naming the polarizations an operator keeps
pub const SELECTED_POLARISATIONS: &str = "selectedPolarisations";

/// What a failed task means for the rest of the scene
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailurePolicy {
    /// Log the failure and keep going with the remaining tasks
    #[default]
    BestEffort,
    /// Stop at the first failed task
    FailFast,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    Succeeded,
    Failed { reason: String },
}

/// Terminal state of one task.
///
/// For the mask pass `task.output_path` is the mask output.
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub task: ProcessingTask,
    pub product: ProductKind,
    pub status: TaskStatus,
    pub execution: Option<ExecutionResult>,
    pub graph_file: Option<PathBuf>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }

    fn failed(task: &ProcessingTask, product: ProductKind, reason: String) -> Self {
        Self {
            task: task.clone(),
            product,
            status: TaskStatus::Failed { reason },
            execution: None,
            graph_file: None,
        }
    }
}

/// Builds a graph per task from a template and runs the engine on it
pub struct ProcessingGraphOrchestrator<'a> {
    template: ProcessingGraph,
    mask_template: Option<ProcessingGraph>,
    polarizations: Vec<Polarization>,
    engine: &'a dyn ProcessingEngine,
    manifest: PathBuf,
    workspace: PathBuf,
    policy: TaskFailurePolicy,
    abort: Arc<AtomicBool>,
    ctx: LogContext,
}

impl<'a> ProcessingGraphOrchestrator<'a> {
    pub fn new(
        template: ProcessingGraph,
        engine: &'a dyn ProcessingEngine,
        manifest: impl Into<PathBuf>,
        workspace: impl Into<PathBuf>,
        ctx: LogContext,
    ) -> Self {
        Self {
            template,
            mask_template: None,
            polarizations: Vec::new(),
            engine,
            manifest: manifest.into(),
            workspace: workspace.into(),
            policy: TaskFailurePolicy::default(),
            abort: Arc::new(AtomicBool::new(false)),
            ctx,
        }
    }

    pub fn with_policy(mut self, policy: TaskFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Restrict polarization-aware operators to the scene's bands
    pub fn with_polarizations(mut self, polarizations: &[Polarization]) -> Self {
        self.polarizations = polarizations.to_vec();
        self
    }

    /// Follow every successful task with a layover/shadow mask run derived
    /// from the same template
    pub fn with_layover_shadow_mask(mut self) -> SarResult<Self> {
        self.mask_template = Some(self.template.layover_shadow_mask()?);
        Ok(self)
    }

    /// Share a scene-level abort flag, typically the engine's
    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    /// Location of the serialized graph for a task
    pub fn graph_path(&self, task: &ProcessingTask) -> PathBuf {
        self.graph_path_for(&task.output_path)
    }

    fn graph_path_for(&self, output: &Path) -> PathBuf {
        let stem = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "graph".to_string());
        self.workspace.join(format!("{}.xml", stem))
    }

    /// Template with the task's input, window, DEM and output injected
    pub fn build_graph(&self, task: &ProcessingTask) -> SarResult<ProcessingGraph> {
        self.build_from(&self.template, task, &task.output_path)
    }

    /// Mask variant of the task graph, writing to the task's mask output
    pub fn build_mask_graph(&self, task: &ProcessingTask) -> SarResult<ProcessingGraph> {
        let template = self
            .mask_template
            .as_ref()
            .ok_or_else(|| SarError::Graph("Layover/shadow mask pass is not enabled".to_string()))?;
        self.build_from(template, task, &task.mask_output_path())
    }

    fn build_from(
        &self,
        template: &ProcessingGraph,
        task: &ProcessingTask,
        output: &Path,
    ) -> SarResult<ProcessingGraph> {
        let mut graph = template.clone();

        let read_id = {
            let read = graph
                .node_by_operator_mut(READ_OPERATOR)
                .ok_or_else(|| SarError::Graph("Template has no Read node".to_string()))?;
            match &mut read.parameters {
                OperatorParameters::Read(p) => {
                    p.file = Some(self.manifest.clone());
                    p.format_name = Some(READ_FORMAT.to_string());
                }
                other => return Err(mismatch(&read.id, other)),
            }
            read.id.clone()
        };

        if !self.polarizations.is_empty() {
            let selected = self
                .polarizations
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            for node in graph.nodes.iter_mut() {
                if let OperatorParameters::Generic(p) = &mut node.parameters {
                    if p.get(SELECTED_POLARISATIONS).is_some() {
                        p.set(SELECTED_POLARISATIONS, selected.as_str());
                    }
                }
            }
        }

        if let Some(window) = &task.window {
            match graph.node_by_operator_mut(SUBSET_OPERATOR) {
                Some(subset) => match &mut subset.parameters {
                    OperatorParameters::Subset(p) => {
                        p.region = Some(window.region());
                        p.geo_region = None;
                        p.copy_metadata = true;
                    }
                    other => return Err(mismatch(&subset.id, other)),
                },
                None => graph = graph.insert_after(&read_id, GraphNode::subset(window))?,
            }
        }

        if let Some(dem) = &task.dem {
            for node in graph.nodes.iter_mut().filter(|n| {
                n.operator == TERRAIN_FLATTENING_OPERATOR || n.operator == TERRAIN_CORRECTION_OPERATOR
            }) {
                match &mut node.parameters {
                    OperatorParameters::TerrainFlattening(p) | OperatorParameters::TerrainCorrection(p) => {
                        p.external_dem_file = Some(dem.clone());
                    }
                    other => return Err(mismatch(&node.id, other)),
                }
            }
        }

        let write = graph
            .node_by_operator_mut(WRITE_OPERATOR)
            .ok_or_else(|| SarError::Graph("Template has no Write node".to_string()))?;
        match &mut write.parameters {
            OperatorParameters::Write(p) => {
                p.file = Some(output.to_path_buf());
                p.format_name = WRITE_FORMAT.to_string();
            }
            other => return Err(mismatch(&write.id, other)),
        }

        graph.validate_for_execution()?;
        Ok(graph)
    }

    /// Run one task. Only an abort is returned as an error.
    pub fn run_task(&self, task: &ProcessingTask) -> SarResult<TaskOutcome> {
        self.run(task, ProductKind::Backscatter)
    }

    /// Run the layover/shadow mask pass of a task
    pub fn run_mask_task(&self, task: &ProcessingTask) -> SarResult<TaskOutcome> {
        self.run(task, ProductKind::LayoverShadowMask)
    }

    fn run(&self, task: &ProcessingTask, product: ProductKind) -> SarResult<TaskOutcome> {
        let (label, built, target) = match product {
            ProductKind::Backscatter => (task.label(), self.build_graph(task), task.clone()),
            ProductKind::LayoverShadowMask => (
                format!("{}:lsm", task.label()),
                self.build_mask_graph(task),
                ProcessingTask { output_path: task.mask_output_path(), ..task.clone() },
            ),
        };
        let ctx = self.ctx.with_task(label);
        log::info!("{} Task started -> {}", ctx, target.output_path.display());

        let graph = match built {
            Ok(graph) => graph,
            Err(e) => {
                log::warn!("{} Task failed: {}", ctx, e);
                return Ok(TaskOutcome::failed(&target, product, e.to_string()));
            }
        };

        let graph_file = self.graph_path_for(&target.output_path);
        if let Err(e) = graph.write_to(&graph_file) {
            log::warn!("{} Task failed writing {}: {}", ctx, graph_file.display(), e);
            return Ok(TaskOutcome::failed(&target, product, e.to_string()));
        }
        log::debug!("{} Graph written to {}", ctx, graph_file.display());

        let execution = match self.engine.execute(&graph_file) {
            Ok(execution) => execution,
            Err(e) => {
                log::warn!("{} Task failed: {}", ctx, e);
                return Ok(TaskOutcome {
                    graph_file: Some(graph_file),
                    ..TaskOutcome::failed(&target, product, e.to_string())
                });
            }
        };

        if execution.aborted || self.abort.load(Ordering::SeqCst) {
            remove_partial_output(&target.output_path);
            return Err(SarError::Aborted(format!("{} aborted during task", ctx)));
        }

        let status = match execution.failure_reason() {
            None => {
                log::info!("{} Task succeeded in {:.1?}", ctx, execution.elapsed);
                TaskStatus::Succeeded
            }
            Some(reason) => {
                if execution.timed_out {
                    remove_partial_output(&target.output_path);
                }
                log::warn!("{} Task failed: {}", ctx, reason);
                TaskStatus::Failed { reason }
            }
        };

        Ok(TaskOutcome {
            task: target,
            product,
            status,
            execution: Some(execution),
            graph_file: Some(graph_file),
        })
    }

    /// Run tasks one at a time in order. With the mask pass enabled each
    /// successful task is directly followed by its mask run.
    pub fn run_all(&self, tasks: &[ProcessingTask]) -> SarResult<Vec<TaskOutcome>> {
        let mut outcomes = Vec::with_capacity(tasks.len());
        for (index, task) in tasks.iter().enumerate() {
            self.check_abort(index, tasks.len())?;
            let outcome = self.run_task(task)?;
            let masked = outcome.succeeded() && self.mask_template.is_some();
            self.push_outcome(&mut outcomes, outcome)?;

            if masked {
                self.check_abort(index, tasks.len())?;
                let mask = self.run_mask_task(task)?;
                self.push_outcome(&mut outcomes, mask)?;
            }
        }

        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        log::info!(
            "{} {} tasks finished, {} failed",
            self.ctx,
            outcomes.len(),
            failed
        );
        Ok(outcomes)
    }
}

impl ProcessingGraphOrchestrator<'_> {
    fn check_abort(&self, done: usize, total: usize) -> SarResult<()> {
        if self.abort.load(Ordering::SeqCst) {
            return Err(SarError::Aborted(format!(
                "{} aborted after {} of {} tasks",
                self.ctx, done, total
            )));
        }
        Ok(())
    }

    fn push_outcome(&self, outcomes: &mut Vec<TaskOutcome>, outcome: TaskOutcome) -> SarResult<()> {
        if let (TaskStatus::Failed { reason }, TaskFailurePolicy::FailFast) =
            (&outcome.status, self.policy)
        {
            return Err(SarError::ProcessingEngine(format!(
                "Task {} failed: {}",
                outcome.task.label(),
                reason
            )));
        }
        outcomes.push(outcome);
        Ok(())
    }
}

fn mismatch(node_id: &str, parameters: &OperatorParameters) -> SarError {
    SarError::Graph(format!(
        "Node {} carries unexpected parameters {:?}",
        node_id, parameters
    ))
}

fn remove_partial_output(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        return;
    };
    match result {
        Ok(()) => log::info!("Removed partial output {}", path.display()),
        Err(e) => log::warn!("Could not remove partial output {}: {}", path.display(), e),
    }
}
