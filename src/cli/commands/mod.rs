//! CLI command implementations

pub mod cache;
pub mod config;
pub mod matrix;
pub mod run;

pub use cache::execute as cache;
pub use config::execute as config;
pub use matrix::execute as matrix;
pub use run::execute as run;

use crate::error::{RiggerError, RiggerResult};
use crate::pipeline::PipelineDefinition;
use std::path::{Path, PathBuf};

/// Explicit `--pipeline` path, or the nearest `rigger.toml` above the cwd
pub(crate) fn pipeline_path(explicit: Option<&Path>) -> RiggerResult<PathBuf> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let cwd = std::env::current_dir()
                .map_err(|e| RiggerError::io("getting current directory", e))?;
            PipelineDefinition::discover(&cwd)?
        }
    };
    std::path::absolute(&path)
        .map_err(|e| RiggerError::io(format!("resolving {}", path.display()), e))
}
