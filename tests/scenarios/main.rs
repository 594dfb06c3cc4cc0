//! End-to-end scenarios over an in-memory runtime with scripted providers

mod helpers;

mod chain;
mod failure_handling;
mod reconciliation;
mod stale_sweep;
