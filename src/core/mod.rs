//! Core domain models
//!
//! Pipelines, their steps and step registry, and the project-scoped
//! records (assets, jobs, logs) the reconcilers work on.

pub mod config;
pub mod context;
pub mod pipeline;
pub mod records;
pub mod registry;
pub mod state;

pub use context::*;
pub use pipeline::*;
pub use records::*;
pub use registry::*;
pub use state::*;
