//! Pipeline events: durable logs plus best-effort live publication
//!
//! Every pipeline gets its own broadcast topic, obtained from a [`TopicHub`].
//! Observers subscribe to a topic and must tolerate gaps: a lagging receiver
//! drops events and should re-fetch the pipeline from the store.

use crate::core::{LogType, PipelineLog, StepId, StepStatus};
use crate::persistence::Store;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

const TOPIC_CAPACITY: usize = 256;

/// Event published on a pipeline's topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress {
        step: StepId,
        value: u8,
        status: StepStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Log {
        agent_type: String,
        log_type: LogType,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    StepCompleted {
        step: StepId,
        result: Value,
        next_step: Option<StepId>,
    },
}

/// Publishing handle for one pipeline
#[derive(Debug, Clone)]
pub struct PipelineTopic {
    pipeline_id: Uuid,
    sender: broadcast::Sender<PipelineEvent>,
}

impl PipelineTopic {
    pub fn pipeline_id(&self) -> Uuid {
        self.pipeline_id
    }

    /// Publish without waiting; nobody listening is not an error
    pub fn publish(&self, event: PipelineEvent) {
        if self.sender.send(event).is_err() {
            debug!(pipeline_id = %self.pipeline_id, "No subscribers for pipeline event");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

/// Registry of per-pipeline topics
#[derive(Debug, Default)]
pub struct TopicHub {
    topics: Mutex<HashMap<Uuid, broadcast::Sender<PipelineEvent>>>,
}

impl TopicHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or open) the topic of a pipeline
    pub fn topic(&self, pipeline_id: Uuid) -> PipelineTopic {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        let sender = topics
            .entry(pipeline_id)
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone();
        PipelineTopic { pipeline_id, sender }
    }

    pub fn subscribe(&self, pipeline_id: Uuid) -> broadcast::Receiver<PipelineEvent> {
        self.topic(pipeline_id).subscribe()
    }

    /// Drop a finished pipeline's topic; existing receivers see the channel close
    pub fn close(&self, pipeline_id: Uuid) {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics.remove(&pipeline_id);
    }
}

/// Writes pipeline logs and publishes events
///
/// A log row is stored before its event is published. Progress updates go
/// through here and nowhere else.
#[derive(Clone)]
pub struct EventEmitter {
    store: Arc<dyn Store>,
    hub: Arc<TopicHub>,
}

impl EventEmitter {
    pub fn new(store: Arc<dyn Store>, hub: Arc<TopicHub>) -> Self {
        Self { store, hub }
    }

    pub fn hub(&self) -> &Arc<TopicHub> {
        &self.hub
    }

    pub fn topic(&self, pipeline_id: Uuid) -> PipelineTopic {
        self.hub.topic(pipeline_id)
    }

    /// Append a pipeline log, then publish it
    pub async fn emit(
        &self,
        topic: &PipelineTopic,
        agent_type: &str,
        log_type: LogType,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Result<()> {
        let log = PipelineLog::new(topic.pipeline_id(), agent_type, log_type, message, data);
        self.store.append_log(&log).await?;
        topic.publish(PipelineEvent::Log {
            agent_type: log.agent_type,
            log_type: log.log_type,
            message: log.message,
            data: log.data,
        });
        Ok(())
    }

    /// Record progress of the running step, then publish it
    pub async fn progress(
        &self,
        topic: &PipelineTopic,
        step: StepId,
        value: u8,
        message: Option<String>,
    ) -> Result<()> {
        let value = value.min(100);
        self.store
            .update_step_progress(topic.pipeline_id(), step, value)
            .await?;
        topic.publish(PipelineEvent::Progress {
            step,
            value,
            status: StepStatus::Running,
            message,
        });
        Ok(())
    }

    /// Store partial work of the running step; nothing is published
    pub async fn checkpoint(&self, topic: &PipelineTopic, step: StepId, checkpoint: &Value) -> Result<bool> {
        self.store
            .save_step_checkpoint(topic.pipeline_id(), step, checkpoint)
            .await
    }

    /// Publish a step status change recorded elsewhere
    pub fn step_status(
        &self,
        topic: &PipelineTopic,
        step: StepId,
        status: StepStatus,
        value: u8,
        message: Option<String>,
    ) {
        topic.publish(PipelineEvent::Progress {
            step,
            value,
            status,
            message,
        });
    }

    pub fn step_completed(
        &self,
        topic: &PipelineTopic,
        step: StepId,
        result: Value,
        next_step: Option<StepId>,
    ) {
        topic.publish(PipelineEvent::StepCompleted {
            step,
            result,
            next_step,
        });
    }

    /// Reporter scoped to one step of one pipeline
    pub fn reporter(&self, pipeline_id: Uuid, step: StepId) -> StepReporter {
        StepReporter {
            emitter: self.clone(),
            topic: self.topic(pipeline_id),
            step,
        }
    }
}

/// Step-scoped event sink handed to agents
///
/// Failures are logged and swallowed so reporting never fails a step.
#[derive(Clone)]
pub struct StepReporter {
    emitter: EventEmitter,
    topic: PipelineTopic,
    step: StepId,
}

impl StepReporter {
    pub fn step(&self) -> StepId {
        self.step
    }

    pub async fn log(&self, log_type: LogType, message: impl Into<String>, data: Option<Value>) {
        if let Err(e) = self
            .emitter
            .emit(&self.topic, self.step.as_str(), log_type, message, data)
            .await
        {
            warn!(step = %self.step, error = %e, "Failed to record step log");
        }
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogType::Info, message, None).await;
    }

    pub async fn thinking(&self, message: impl Into<String>) {
        self.log(LogType::Thinking, message, None).await;
    }

    pub async fn progress(&self, value: u8, message: impl Into<String>) {
        if let Err(e) = self
            .emitter
            .progress(&self.topic, self.step, value, Some(message.into()))
            .await
        {
            warn!(step = %self.step, error = %e, "Failed to record step progress");
        }
    }

    /// Save partial work so a retried attempt can skip it
    pub async fn checkpoint(&self, checkpoint: &Value) {
        match self.emitter.checkpoint(&self.topic, self.step, checkpoint).await {
            Ok(true) => {}
            Ok(false) => debug!(step = %self.step, "Step no longer running, checkpoint dropped"),
            Err(e) => warn!(step = %self.step, error = %e, "Failed to save step checkpoint"),
        }
    }
}
