//! Pipeline definition, triggering and execution
//!
//! A push selects the test pipeline. A published release selects the release
//! pipeline, which additionally builds one artifact per cell, gathers them
//! through the exchange and publishes the collection.

pub mod definition;
pub mod report;
pub mod runner;
pub mod trigger;

pub use definition::{PipelineDefinition, PIPELINE_FILE};
pub use report::{CollectionSummary, PipelineReport};
pub use runner::{PipelineRunner, RunnerOptions};
pub use trigger::{PipelineKind, TriggerEvent};
