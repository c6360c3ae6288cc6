//! Scene processing configuration, loaded from JSON

use crate::core::antemeridian::SplitterParams;
use crate::core::densify::DensifyParams;
use crate::core::engine::EngineParams;
use crate::core::mosaic::MosaicParams;
use crate::core::orchestrator::TaskFailurePolicy;
use crate::types::{SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration for one pipeline run.
///
/// Every section falls back to its defaults, so a partial JSON file such as
/// `{"splitter": {"chunks": 24}}` is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub densify: DensifyParams,
    pub splitter: SplitterParams,
    pub engine: EngineParams,
    pub mosaic: MosaicParams,
    pub failure_policy: TaskFailurePolicy,
    /// Engine graph template; the embedded recipe is used when unset
    pub graph_template: Option<PathBuf>,
    /// Persist the densified grid into the workspace copy of the annotation
    /// files read by the engine
    pub writeback: bool,
    /// Also run the layover/shadow mask pass and mosaic its output
    pub layover_shadow_mask: bool,
    /// Parent directory for scene workspaces (system temp dir when unset)
    pub workspace_root: Option<PathBuf>,
    /// Leave the scene workspace on disk after processing
    pub keep_workspace: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            densify: DensifyParams::default(),
            splitter: SplitterParams::default(),
            engine: EngineParams::default(),
            mosaic: MosaicParams::default(),
            failure_policy: TaskFailurePolicy::default(),
            graph_template: None,
            writeback: true,
            layover_shadow_mask: false,
            workspace_root: None,
            keep_workspace: false,
        }
    }
}

impl ProcessingConfig {
    /// Load and validate a JSON configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        log::info!("Loading processing configuration: {}", path.as_ref().display());
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(content: &str) -> SarResult<Self> {
        let config: ProcessingConfig = serde_json::from_str(content)
            .map_err(|e| SarError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SarResult<()> {
        if self.densify.grid_points < 2 {
            return Err(SarError::Config("densify.grid_points must be at least 2".to_string()));
        }
        if self.densify.workers == 0 {
            return Err(SarError::Config("densify.workers must be positive".to_string()));
        }
        if self.splitter.chunks == 0 {
            return Err(SarError::Config("splitter.chunks must be positive".to_string()));
        }
        if !(self.splitter.crossing_threshold_deg > 0.0) {
            return Err(SarError::Config(
                "splitter.crossing_threshold_deg must be positive".to_string(),
            ));
        }
        if self.engine.timeout_secs == Some(0) {
            return Err(SarError::Config("engine.timeout_secs must be positive".to_string()));
        }
        if self.engine.max_attempts == 0 {
            return Err(SarError::Config("engine.max_attempts must be at least 1".to_string()));
        }
        if self.mosaic.band_extension.trim_start_matches('.').is_empty() {
            return Err(SarError::Config("mosaic.band_extension must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = ProcessingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.densify.grid_points, 250);
        assert_eq!(config.densify.workers, 4);
        assert_eq!(config.splitter.chunks, 6);
        assert_eq!(config.splitter.row_overlap, 10);
        assert_eq!(config.splitter.crossing_threshold_deg, 10.0);
        assert_eq!(config.engine.max_attempts, 1);
        assert!(config.mosaic.skip_ambiguous_outputs);
        assert_eq!(config.failure_policy, TaskFailurePolicy::BestEffort);
        assert!(config.writeback);
        assert!(!config.layover_shadow_mask);
    }

    #[test]
    fn test_partial_json() {
        let config = ProcessingConfig::from_json_str(
            r#"{"splitter": {"chunks": 24}, "engine": {"executable": "/usr/local/bin/gpt"}, "failure_policy": "fail_fast"}"#,
        )
        .unwrap();
        assert_eq!(config.splitter.chunks, 24);
        assert_eq!(config.splitter.row_overlap, 10);
        assert_eq!(config.engine.executable, PathBuf::from("/usr/local/bin/gpt"));
        assert_eq!(config.failure_policy, TaskFailurePolicy::FailFast);

        let masked = ProcessingConfig::from_json_str(r#"{"layover_shadow_mask": true}"#).unwrap();
        assert!(masked.layover_shadow_mask);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(ProcessingConfig::from_json_str(r#"{"densify": {"workers": 0}}"#).is_err());
        assert!(ProcessingConfig::from_json_str(r#"{"splitter": {"chunks": 0}}"#).is_err());
        assert!(ProcessingConfig::from_json_str(r#"{"engine": {"max_attempts": 0}}"#).is_err());
        assert!(ProcessingConfig::from_json_str(r#"{"engine": {"timeout_secs": 0}}"#).is_err());
        assert!(ProcessingConfig::from_json_str("not json").is_err());
    }
}
