//! Pipeline configuration persistence: a single `PipelineConfig` document
//! loaded from and saved to a JSON file at a caller-supplied path. This
//! crate has no app data directory of its own to default to — the host
//! owns that — so every function here takes the config file path
//! explicitly rather than resolving one from a global.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::accumulate::AccumulatorConfig;
use crate::domain::align::AlignerConfig;
use crate::domain::detect::DetectorConfig;
use crate::domain::solve::SolverConfig;
use crate::error::{Error, Result};

/// Bundles every component's tunable parameters into one serializable
/// document, so the whole pipeline's configuration can be loaded and saved
/// as a single unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub solver: SolverConfig,
    pub aligner: AlignerConfig,
    pub accumulator: AccumulatorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: DetectorConfig::default(),
            solver: SolverConfig::default(),
            aligner: AlignerConfig::default(),
            accumulator: AccumulatorConfig::default(),
        }
    }
}

/// Load a [`PipelineConfig`] from `path`. A missing or malformed file is not
/// an error here — callers get the defaults instead — but an existing,
/// unreadable-for-other-reasons path is surfaced as [`Error::InvalidInput`].
pub fn load_from_path(path: &Path) -> Result<PipelineConfig> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents).unwrap_or_default()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PipelineConfig::default()),
        Err(e) => Err(Error::InvalidInput(format!("reading config {:?}: {}", path, e))),
    }
}

/// Serialize `config` to `path` as pretty-printed JSON, creating the parent
/// directory if needed.
pub fn save_to_path(path: &Path, config: &PipelineConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::AllocationFailure(format!("creating config dir {:?}: {}", parent, e)))?;
    }
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| Error::InvalidInput(format!("serializing config: {}", e)))?;
    std::fs::write(path, json)
        .map_err(|e| Error::AllocationFailure(format!("writing config {:?}: {}", path, e)))?;
    Ok(())
}
