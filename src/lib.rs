//! Rigger - matrix build, test and release orchestration
//!
//! Expands a package's build matrix into cells, runs conditional steps in
//! each cell with cached dependency installs, and on a published release
//! gathers one retagged artifact per cell and publishes the collection.

pub mod artifact;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod matrix;
pub mod pipeline;
pub mod publish;
pub mod step;
pub mod ui;

pub use error::{RiggerError, RiggerResult};
