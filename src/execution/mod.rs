//! Pipeline execution: the engine, its work queue and the control surface

pub mod control;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod queue;
pub mod worker;

pub use control::PipelineControl;
pub use dispatch::{DispatchError, JobDispatcher};
pub use engine::{EngineError, PipelineEngine};
pub use executor::{StepExecutor, StepOutcome};
pub use queue::{RetryPolicy, UnitError, UnitHandler, WorkQueue, WorkUnit};
pub use worker::ConductorHandler;
