//! Work queue - a pool of tokio workers pulling units of work
//!
//! A unit that fails with a retryable error goes back on the queue after a
//! backoff delay until its attempts run out; then the handler's exhaustion
//! hook decides what failing for good means for that unit.

use crate::core::config::QueueConfig;
use crate::reconcile::TaskReport;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One unit of work
#[derive(Debug, Clone, PartialEq)]
pub enum WorkUnit {
    /// Execute the current step of a pipeline (and, in auto mode, the rest)
    RunPipeline { pipeline_id: Uuid },
    /// Fold one task report into persisted state
    Reconcile(TaskReport),
}

impl std::fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkUnit::RunPipeline { pipeline_id } => write!(f, "run pipeline {}", pipeline_id),
            WorkUnit::Reconcile(report) => write!(f, "reconcile task {}", report.task_id),
        }
    }
}

/// Failure of a unit, classified by the handler
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct UnitError {
    pub retryable: bool,
    pub message: String,
}

impl UnitError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }
}

/// Processes units pulled off the queue
#[async_trait]
pub trait UnitHandler: Send + Sync {
    async fn handle(&self, unit: &WorkUnit) -> Result<(), UnitError>;

    /// Called once when a retryable unit used up its attempts
    async fn exhausted(&self, unit: &WorkUnit, error: &UnitError);
}

/// How often and how patiently a unit is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub backoff: Duration,
    pub exponential: bool,
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, after `attempt` attempts failed
    pub fn delay(&self, attempt: u32) -> Duration {
        if self.exponential {
            let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
            self.backoff.saturating_mul(factor)
        } else {
            self.backoff
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(10),
            exponential: true,
        }
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            exponential: config.exponential,
        }
    }
}

#[derive(Debug)]
struct Queued {
    unit: WorkUnit,
    attempt: u32,
}

/// Units that are queued, running, or waiting out a backoff
#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// The queue and its worker pool
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<Queued>,
    outstanding: Arc<Outstanding>,
    shutdown: CancellationToken,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawn `workers` tasks that feed units to `handler`
    pub fn start(handler: Arc<dyn UnitHandler>, workers: usize, policy: RetryPolicy) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let outstanding = Arc::new(Outstanding::default());
        let shutdown = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|index| {
                let worker = Worker {
                    index,
                    handler: handler.clone(),
                    policy,
                    receiver: receiver.clone(),
                    sender: sender.clone(),
                    outstanding: outstanding.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!("Work queue started with {} workers", workers.max(1));
        Self {
            sender,
            outstanding,
            shutdown,
            workers: std::sync::Mutex::new(handles),
        }
    }

    pub fn from_config(handler: Arc<dyn UnitHandler>, config: &QueueConfig) -> Self {
        Self::start(handler, config.workers, RetryPolicy::from(config))
    }

    pub fn enqueue(&self, unit: WorkUnit) -> Result<()> {
        debug!("Queueing {}", unit);
        self.outstanding.add();
        self.sender.send(Queued { unit, attempt: 1 }).map_err(|_| {
            self.outstanding.done();
            anyhow!("work queue is shut down")
        })
    }

    /// Units not yet finished for good
    pub fn pending(&self) -> usize {
        self.outstanding.count.load(Ordering::SeqCst)
    }

    /// Wait until every queued unit, retries included, has finished
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.outstanding.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop the workers; units still queued are dropped
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

struct Worker {
    index: usize,
    handler: Arc<dyn UnitHandler>,
    policy: RetryPolicy,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Queued>>>,
    sender: mpsc::UnboundedSender<Queued>,
    outstanding: Arc<Outstanding>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                queued = async { self.receiver.lock().await.recv().await } => queued,
            };
            let Some(queued) = next else {
                debug!(worker = self.index, "Worker stopping");
                return;
            };
            self.process(queued).await;
        }
    }

    async fn process(&self, queued: Queued) {
        let Queued { unit, attempt } = queued;
        debug!(worker = self.index, attempt, "Handling {}", unit);

        match self.handler.handle(&unit).await {
            Ok(()) => self.outstanding.done(),
            Err(e) if e.retryable && attempt < self.policy.max_attempts => {
                let delay = self.policy.delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    unit, attempt, self.policy.max_attempts, delay, e
                );
                self.requeue(Queued { unit, attempt: attempt + 1 }, delay);
            }
            Err(e) if e.retryable => {
                error!("{} gave up after {} attempts: {}", unit, attempt, e);
                self.handler.exhausted(&unit, &e).await;
                self.outstanding.done();
            }
            Err(e) => {
                error!("{} failed: {}", unit, e);
                self.outstanding.done();
            }
        }
    }

    /// Put a unit back after `delay` without holding this worker
    fn requeue(&self, queued: Queued, delay: Duration) {
        let sender = self.sender.clone();
        let outstanding = self.outstanding.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => outstanding.done(),
                _ = tokio::time::sleep(delay) => {
                    if sender.send(queued).is_err() {
                        outstanding.done();
                    }
                }
            }
        });
    }
}
