//! Scripted collaborators for unit tests

use crate::agent::{AgentResources, ProviderHandle};
use crate::provider::{PollConfig, Provider, ProviderError, TaskRequest, TaskStatus};
use crate::storage::{ObjectStore, StorageError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a submitted task will do
#[derive(Debug, Clone)]
pub enum Behavior {
    Complete(Value),
    Fail(String),
    SubmitError(ProviderError),
    NeverFinish,
}

/// Provider whose tasks follow a script, one behavior per submission
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    tasks: Mutex<HashMap<String, Behavior>>,
    requests: Mutex<Vec<TaskRequest>>,
}

impl MockProvider {
    pub fn new(name: &str, fallback: Behavior) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            tasks: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn completing(name: &str, output: Value) -> Self {
        Self::new(name, Behavior::Complete(output))
    }

    pub fn then(self, behavior: Behavior) -> Self {
        self.script.lock().unwrap().push_back(behavior);
        self
    }

    pub fn requests(&self) -> Vec<TaskRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &TaskRequest) -> Result<String, ProviderError> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Behavior::SubmitError(e) = behavior {
            return Err(e);
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(request.clone());
        let task_id = format!("{}-{}", self.name, requests.len());
        self.tasks.lock().unwrap().insert(task_id.clone(), behavior);
        Ok(task_id)
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let behavior = self.tasks.lock().unwrap().get(task_id).cloned();
        Ok(match behavior {
            Some(Behavior::Complete(output)) => TaskStatus {
                state: "done".to_string(),
                output: Some(output),
                error: None,
            },
            Some(Behavior::Fail(message)) => TaskStatus {
                state: "failed".to_string(),
                output: None,
                error: Some(message),
            },
            _ => TaskStatus {
                state: "processing".to_string(),
                output: None,
                error: None,
            },
        })
    }
}

/// Object store kept in memory
#[derive(Default)]
pub struct MemoryObjectStore {
    pub objects: Mutex<HashMap<String, Vec<u8>>>,
    pub fail_uploads: Mutex<Option<StorageError>>,
}

impl MemoryObjectStore {
    pub fn upload_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, bytes: Vec<u8>, path: &str, _content_type: &str) -> Result<String, StorageError> {
        if let Some(err) = self.fail_uploads.lock().unwrap().clone() {
            return Err(err);
        }
        self.objects.lock().unwrap().insert(path.to_string(), bytes);
        Ok(format!("mem://{}", path))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        Ok(format!("bytes of {}", url).into_bytes())
    }
}

pub fn fast_poll() -> PollConfig {
    PollConfig::new(Duration::from_millis(1), 5)
}

pub fn resources(
    llm: Arc<MockProvider>,
    music: Arc<MockProvider>,
    image: Arc<MockProvider>,
    renderer: Arc<MockProvider>,
    storage: Arc<MemoryObjectStore>,
) -> AgentResources {
    AgentResources {
        llm: ProviderHandle::new(llm, fast_poll()),
        music: ProviderHandle::new(music, fast_poll()),
        image: ProviderHandle::new(image, fast_poll()),
        renderer,
        storage,
        callback_url: Some("https://hooks.example.com/render".to_string()),
    }
}

pub fn reporter(pipeline_id: uuid::Uuid, step: crate::core::StepId) -> crate::events::StepReporter {
    crate::events::EventEmitter::new(
        Arc::new(crate::persistence::InMemoryStore::new()),
        Arc::new(crate::events::TopicHub::new()),
    )
    .reporter(pipeline_id, step)
}

/// Engine over an in-memory store with one draft project
pub async fn engine(
    resources: AgentResources,
) -> (
    Arc<crate::execution::PipelineEngine>,
    Arc<crate::persistence::InMemoryStore>,
    crate::core::Project,
) {
    use crate::persistence::Store;

    let store = Arc::new(crate::persistence::InMemoryStore::new());
    let project = crate::core::Project::new("test project");
    store.insert_project(&project).await.unwrap();
    let engine = crate::execution::PipelineEngine::new(
        store.clone(),
        Arc::new(crate::events::TopicHub::new()),
        crate::execution::StepExecutor::new(resources),
    );
    (Arc::new(engine), store, project)
}

/// Running slideshow whose composition step waits on `task_id`
pub fn waiting_slideshow(project_id: uuid::Uuid, task_id: &str) -> crate::core::Pipeline {
    use crate::core::{Pipeline, PipelineMode, PipelineType, RunConfig, StepId};

    let now = chrono::Utc::now();
    let mut pipeline = Pipeline::new(project_id, PipelineType::Slideshow, PipelineMode::Auto, RunConfig::new("x"));
    pipeline.start(now).unwrap();
    while pipeline.current_step != Some(StepId::Composition) {
        let step = pipeline.current_step.unwrap();
        pipeline.begin_step(step, now).unwrap();
        pipeline.complete_step(step, serde_json::json!({}), now).unwrap();
    }
    pipeline.begin_step(StepId::Composition, now).unwrap();
    pipeline
        .set_checkpoint(
            StepId::Composition,
            serde_json::json!({"render_task_id": task_id, "status": "rendering"}),
        )
        .unwrap();
    pipeline
        .await_callback(StepId::Composition, task_id.to_string(), now)
        .unwrap();
    pipeline
}

pub fn theme_output() -> Value {
    serde_json::json!({"title": "Low Tide", "concept": "gulls over a harbour", "mood": "calm", "keywords": ["sea"]})
}
