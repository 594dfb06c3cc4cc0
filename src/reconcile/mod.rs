//! Reconciliation of external task results and stale state

pub mod callback;
pub mod stale;
pub mod webhook;

pub use callback::finish_awaiting_step;
pub use stale::{diagnose, diagnose_pipeline, PipelineVerdict, ProjectVerdict, StaleReconciler, SweepReport};
pub use webhook::{ReconcileError, ReconcileOutcome, TaskReport, WebhookReconciler};
