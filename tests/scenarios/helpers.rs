//! Test utilities for conductor scenarios

use async_trait::async_trait;
use conductor::agent::{AgentResources, ProviderHandle};
use conductor::cli::Runtime;
use conductor::core::config::ConductorConfig;
use conductor::core::{Pipeline, PipelineStatus, Project, StepId, StepStatus};
use conductor::persistence::{InMemoryStore, Store};
use conductor::provider::{PollConfig, Provider, ProviderError, TaskRequest, TaskStatus};
use conductor::storage::{ObjectStore, StorageError};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Statuses one submitted task reports, in order; the last one repeats
pub type Script = Result<Vec<TaskStatus>, ProviderError>;

pub fn running() -> TaskStatus {
    TaskStatus {
        state: "processing".to_string(),
        output: None,
        error: None,
    }
}

pub fn done(output: Value) -> TaskStatus {
    TaskStatus {
        state: "success".to_string(),
        output: Some(output),
        error: None,
    }
}

pub fn failed(message: &str) -> TaskStatus {
    TaskStatus {
        state: "error".to_string(),
        output: None,
        error: Some(message.to_string()),
    }
}

/// Provider that plays back scripted status sequences
///
/// Each submission takes the next script, or the fallback once the scripts
/// run out. Task ids are `<name>-<n>`.
pub struct ScriptedProvider {
    name: String,
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    tasks: Mutex<HashMap<String, VecDeque<TaskStatus>>>,
    submitted: Mutex<Vec<TaskRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: &str, fallback: Script) -> Self {
        Self {
            name: name.to_string(),
            scripts: Mutex::new(VecDeque::new()),
            fallback,
            tasks: Mutex::new(HashMap::new()),
            submitted: Mutex::new(Vec::new()),
        }
    }

    /// Tasks finish after one in-progress poll
    pub fn finishing(name: &str, output: Value) -> Self {
        Self::new(name, Ok(vec![running(), done(output)]))
    }

    /// Accepts tasks that never leave the running state
    pub fn stalled(name: &str) -> Self {
        Self::new(name, Ok(vec![running()]))
    }

    pub fn then(self, script: Script) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn submissions(&self) -> Vec<TaskRequest> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn submit(&self, request: &TaskRequest) -> Result<String, ProviderError> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let statuses = script?;

        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.clone());
        let task_id = format!("{}-{}", self.name, submitted.len());
        self.tasks
            .lock()
            .unwrap()
            .insert(task_id.clone(), statuses.into_iter().collect());
        Ok(task_id)
    }

    async fn status(&self, task_id: &str) -> Result<TaskStatus, ProviderError> {
        let mut tasks = self.tasks.lock().unwrap();
        let statuses = tasks
            .get_mut(task_id)
            .ok_or_else(|| ProviderError::Rejected {
                status: 404,
                message: format!("unknown task {}", task_id),
            })?;
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().cloned()
        };
        status.ok_or_else(|| ProviderError::Malformed("empty script".to_string()))
    }
}

/// Object store that records every upload
#[derive(Default)]
pub struct RecordingObjectStore {
    uploads: Mutex<Vec<String>>,
}

impl RecordingObjectStore {
    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObjectStore for RecordingObjectStore {
    async fn upload(&self, _bytes: Vec<u8>, path: &str, _content_type: &str) -> Result<String, StorageError> {
        self.uploads.lock().unwrap().push(path.to_string());
        Ok(format!("https://cdn.example.com/{}", path))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, StorageError> {
        Ok(url.as_bytes().to_vec())
    }
}

pub fn theme() -> Value {
    json!({"title": "Low Tide", "concept": "gulls over a harbour", "mood": "calm", "keywords": ["sea"]})
}

pub fn scenes() -> Value {
    json!({"scenes": [{"prompt": "fog over the pier"}, {"prompt": "boats at dawn"}]})
}

pub fn track() -> Value {
    json!({"url": "https://music.example.com/tmp/track.mp3", "duration_secs": 60})
}

/// Collaborators of one scenario
pub struct Providers {
    pub llm: Arc<ScriptedProvider>,
    pub music: Arc<ScriptedProvider>,
    pub image: Arc<ScriptedProvider>,
    pub renderer: Arc<ScriptedProvider>,
    pub storage: Arc<RecordingObjectStore>,
}

impl Providers {
    /// Every provider succeeds; the renderer only ever reports back by webhook
    pub fn happy() -> Self {
        Self {
            llm: Arc::new(
                ScriptedProvider::finishing("llm", theme())
                    .then(Ok(vec![done(theme())]))
                    .then(Ok(vec![done(scenes())])),
            ),
            music: Arc::new(ScriptedProvider::finishing("music", track())),
            image: Arc::new(ScriptedProvider::finishing(
                "image",
                json!({"url": "https://img.example.com/tmp/frame.png"}),
            )),
            renderer: Arc::new(ScriptedProvider::stalled("renderer")),
            storage: Arc::new(RecordingObjectStore::default()),
        }
    }

    pub fn with_music(mut self, music: ScriptedProvider) -> Self {
        self.music = Arc::new(music);
        self
    }

    fn resources(&self) -> AgentResources {
        let poll = PollConfig::new(Duration::from_millis(1), 20);
        AgentResources {
            llm: ProviderHandle::new(self.llm.clone(), poll),
            music: ProviderHandle::new(self.music.clone(), poll),
            image: ProviderHandle::new(self.image.clone(), poll),
            renderer: self.renderer.clone(),
            storage: self.storage.clone(),
            callback_url: Some("https://hooks.example.com/render".to_string()),
        }
    }
}

/// Runtime over an in-memory store with fast retries, plus one draft project
pub async fn runtime(providers: &Providers) -> (Runtime, Project) {
    let mut config = ConductorConfig::default();
    config.queue.workers = 2;
    config.queue.max_attempts = 3;
    config.queue.backoff_ms = 5;
    config.queue.exponential = false;

    let store = Arc::new(InMemoryStore::new());
    let project = Project::new("harbour short");
    store.insert_project(&project).await.unwrap();

    (Runtime::from_parts(config, store, providers.resources()), project)
}

pub async fn reload(runtime: &Runtime, pipeline_id: uuid::Uuid) -> Pipeline {
    runtime.engine.load(pipeline_id).await.unwrap()
}

pub fn assert_pipeline_completed(pipeline: &Pipeline) {
    assert_eq!(
        pipeline.status,
        PipelineStatus::Completed,
        "pipeline ended {:?}: {:?}",
        pipeline.status,
        pipeline.error_message
    );
    assert!(pipeline.error_message.is_none());
}

pub fn assert_step_status(pipeline: &Pipeline, step: StepId, expected: StepStatus) {
    let state = pipeline
        .step_state(step)
        .unwrap_or_else(|| panic!("step {} not in pipeline", step));
    assert_eq!(state.status(), expected, "step {}", step);
}
