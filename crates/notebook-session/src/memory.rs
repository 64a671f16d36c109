//! In-process stand-in for a Jupyter server.
//!
//! [`MemoryJupyter`] implements both collaborator traits against plain
//! in-memory state. Replies can be scripted per code string, failures can
//! be injected per operation, and [`MemoryJupyter::hold`] parks an execution
//! until the test releases it, which makes in-flight states observable.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::api::{ApiError, ContentStore, KernelService};
use crate::protocol::{
    ContentEntry, ContentModel, ContentType, ExecuteRequest, KernelModel, ServerStatus,
};

/// Gate for one parked execution.
#[derive(Clone, Default)]
pub struct HeldExecution {
    arrived: Arc<Notify>,
    release: Arc<Notify>,
}

impl HeldExecution {
    /// Wait until the execution has reached the server.
    pub async fn arrived(&self) {
        self.arrived.notified().await;
    }

    /// Let the parked execution produce its reply.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Clone)]
enum Reply {
    Fixed(Value),
    /// A `text/plain` result stamped with the kernel's counter.
    Result(String),
}

struct StoredContent {
    content: Value,
    created: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    kernels: Vec<KernelModel>,
    counters: HashMap<String, u32>,
    next_kernel: u64,
    replies: HashMap<String, Reply>,
    holds: HashMap<String, HeldExecution>,
    executed: Vec<(String, String)>,
    unreachable: HashSet<String>,
    fail_start: Option<ApiError>,
    fail_list: Option<ApiError>,
    fail_execute: Option<ApiError>,
    fail_contents: Option<ApiError>,
    contents: HashMap<String, StoredContent>,
}

/// In-memory implementation of [`KernelService`] and [`ContentStore`].
#[derive(Default)]
pub struct MemoryJupyter {
    state: Mutex<State>,
}

fn clean_path(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

fn entry_for(path: &str, stored: &StoredContent) -> ContentEntry {
    ContentEntry {
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        path: path.to_string(),
        content_type: if path.ends_with(".ipynb") {
            ContentType::Notebook
        } else {
            ContentType::File
        },
        last_modified: Some(stored.last_modified),
        created: Some(stored.created),
        writable: true,
    }
}

/// Strictly later than `previous`, so every write is observable.
fn next_timestamp(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match previous {
        Some(prev) if now <= prev => prev + Duration::milliseconds(1),
        _ => now,
    }
}

impl MemoryJupyter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A `{"content": ...}` reply with a single `text/plain` result.
    pub fn result_reply(text: &str, execution_count: u32) -> Value {
        json!({"content": {"data": {"text/plain": text}, "execution_count": execution_count}})
    }

    /// A `{"content": ...}` reply with printed text only.
    pub fn text_reply(text: &str) -> Value {
        json!({"content": {"text": text}})
    }

    /// Add a kernel that already exists on the server, as if started by
    /// another client.
    pub fn add_kernel(&self, name: &str) -> KernelModel {
        let mut state = self.state();
        state.next_kernel += 1;
        let mut model = KernelModel::new(format!("kernel-{}", state.next_kernel), name);
        model.execution_state = Some("idle".to_string());
        state.kernels.push(model.clone());
        model
    }

    /// Remove a kernel behind the client's back.
    pub fn remove_kernel(&self, kernel_id: &str) {
        self.state().kernels.retain(|k| k.id != kernel_id);
    }

    pub fn set_execution_state(&self, kernel_id: &str, execution_state: &str) {
        if let Some(kernel) = self.state().kernels.iter_mut().find(|k| k.id == kernel_id) {
            kernel.execution_state = Some(execution_state.to_string());
        }
    }

    pub fn kernel_ids(&self) -> Vec<String> {
        self.state().kernels.iter().map(|k| k.id.clone()).collect()
    }

    /// Reply with `reply` whenever `code` is executed.
    pub fn respond_to(&self, code: &str, reply: Value) {
        self.state()
            .replies
            .insert(code.to_string(), Reply::Fixed(reply));
    }

    /// Reply with a result carrying the kernel's own execution counter.
    pub fn respond_with_result(&self, code: &str, text: &str) {
        self.state()
            .replies
            .insert(code.to_string(), Reply::Result(text.to_string()));
    }

    /// Park the next execution of `code` until released.
    pub fn hold(&self, code: &str) -> HeldExecution {
        let held = HeldExecution::default();
        self.state().holds.insert(code.to_string(), held.clone());
        held
    }

    pub fn fail_next_start(&self, error: ApiError) {
        self.state().fail_start = Some(error);
    }

    pub fn fail_list_kernels(&self, error: Option<ApiError>) {
        self.state().fail_list = error;
    }

    /// Make every execution fail with `error` (or stop failing).
    pub fn fail_execute(&self, error: Option<ApiError>) {
        self.state().fail_execute = error;
    }

    pub fn fail_contents(&self, error: Option<ApiError>) {
        self.state().fail_contents = error;
    }

    /// Make probes and executions for a kernel fail with a network error.
    pub fn set_unreachable(&self, kernel_id: &str, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(kernel_id.to_string());
        } else {
            state.unreachable.remove(kernel_id);
        }
    }

    /// `(kernel id, code)` for every execution that reached the server.
    pub fn executed(&self) -> Vec<(String, String)> {
        self.state().executed.clone()
    }

    pub fn insert_notebook(&self, path: &str, content: Value) {
        let path = clean_path(path);
        let mut state = self.state();
        let previous = state.contents.get(&path).map(|c| c.last_modified);
        let now = next_timestamp(previous);
        state.contents.insert(
            path,
            StoredContent {
                content,
                created: now,
                last_modified: now,
            },
        );
    }

    pub fn notebook(&self, path: &str) -> Option<Value> {
        self.state()
            .contents
            .get(&clean_path(path))
            .map(|c| c.content.clone())
    }

    /// Touch a file as another writer would.
    pub fn modify_externally(&self, path: &str) {
        if let Some(stored) = self.state().contents.get_mut(&clean_path(path)) {
            stored.last_modified = next_timestamp(Some(stored.last_modified));
        }
    }

    fn check_contents(&self) -> Result<(), ApiError> {
        match &self.state().fail_contents {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl KernelService for MemoryJupyter {
    async fn status(&self) -> Result<ServerStatus, ApiError> {
        let state = self.state();
        Ok(ServerStatus {
            kernels: state.kernels.len() as u32,
            ..Default::default()
        })
    }

    async fn list_kernels(&self) -> Result<Vec<KernelModel>, ApiError> {
        let state = self.state();
        match &state.fail_list {
            Some(error) => Err(error.clone()),
            None => Ok(state.kernels.clone()),
        }
    }

    async fn get_kernel(&self, kernel_id: &str) -> Result<KernelModel, ApiError> {
        let state = self.state();
        if state.unreachable.contains(kernel_id) {
            return Err(ApiError::Network("connection refused".to_string()));
        }
        state
            .kernels
            .iter()
            .find(|k| k.id == kernel_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("/api/kernels/{}", kernel_id)))
    }

    async fn start_kernel(&self, kernel_name: &str) -> Result<KernelModel, ApiError> {
        if let Some(error) = self.state().fail_start.take() {
            return Err(error);
        }
        Ok(self.add_kernel(kernel_name))
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        let before = state.kernels.len();
        state.kernels.retain(|k| k.id != kernel_id);
        if state.kernels.len() == before {
            return Err(ApiError::NotFound(format!("/api/kernels/{}", kernel_id)));
        }
        state.counters.remove(kernel_id);
        Ok(())
    }

    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, ApiError> {
        let mut state = self.state();
        state.counters.remove(kernel_id);
        let kernel = state
            .kernels
            .iter_mut()
            .find(|k| k.id == kernel_id)
            .ok_or_else(|| ApiError::NotFound(format!("/api/kernels/{}", kernel_id)))?;
        kernel.execution_state = Some("idle".to_string());
        Ok(kernel.clone())
    }

    async fn execute(&self, kernel_id: &str, request: &ExecuteRequest) -> Result<Value, ApiError> {
        let (count, reply, held) = {
            let mut state = self.state();
            state
                .executed
                .push((kernel_id.to_string(), request.code.clone()));
            if state.unreachable.contains(kernel_id) {
                return Err(ApiError::Network("connection refused".to_string()));
            }
            if !state.kernels.iter().any(|k| k.id == kernel_id) {
                return Err(ApiError::NotFound(format!("/api/kernels/{}", kernel_id)));
            }
            if let Some(error) = &state.fail_execute {
                return Err(error.clone());
            }
            let counter = state.counters.entry(kernel_id.to_string()).or_insert(0);
            *counter += 1;
            let count = *counter;
            (
                count,
                state.replies.get(&request.code).cloned(),
                state.holds.remove(&request.code),
            )
        };

        if let Some(held) = held {
            held.arrived.notify_one();
            held.release.notified().await;
        }

        Ok(match reply {
            Some(Reply::Fixed(value)) => value,
            Some(Reply::Result(text)) => Self::result_reply(&text, count),
            None => json!({"content": {"status": "ok"}}),
        })
    }
}

#[async_trait]
impl ContentStore for MemoryJupyter {
    async fn list(&self, dir: &str) -> Result<Vec<ContentEntry>, ApiError> {
        self.check_contents()?;
        let dir = clean_path(dir);
        let state = self.state();

        let mut entries = Vec::new();
        let mut subdirs = BTreeSet::new();
        for (path, stored) in &state.contents {
            let rest = if dir.is_empty() {
                Some(path.as_str())
            } else {
                path.strip_prefix(&format!("{}/", dir))
            };
            let Some(rest) = rest else { continue };
            match rest.split_once('/') {
                Some((sub, _)) => {
                    subdirs.insert(sub.to_string());
                }
                None => entries.push(entry_for(path, stored)),
            }
        }
        if !dir.is_empty() && entries.is_empty() && subdirs.is_empty() {
            return Err(ApiError::NotFound(format!("/api/contents/{}", dir)));
        }

        entries.extend(subdirs.into_iter().map(|name| ContentEntry {
            path: if dir.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", dir, name)
            },
            name,
            content_type: ContentType::Directory,
            last_modified: None,
            created: None,
            writable: true,
        }));
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn read(&self, path: &str) -> Result<ContentModel, ApiError> {
        self.check_contents()?;
        let path = clean_path(path);
        let state = self.state();
        let stored = state
            .contents
            .get(&path)
            .ok_or_else(|| ApiError::NotFound(format!("/api/contents/{}", path)))?;
        Ok(ContentModel {
            entry: entry_for(&path, stored),
            format: Some("json".to_string()),
            content: stored.content.clone(),
        })
    }

    async fn stat(&self, path: &str) -> Result<ContentEntry, ApiError> {
        self.check_contents()?;
        let path = clean_path(path);
        let state = self.state();
        state
            .contents
            .get(&path)
            .map(|stored| entry_for(&path, stored))
            .ok_or_else(|| ApiError::NotFound(format!("/api/contents/{}", path)))
    }

    async fn write(&self, path: &str, content: &Value) -> Result<ContentEntry, ApiError> {
        self.check_contents()?;
        let path = clean_path(path);
        if path.is_empty() {
            return Err(ApiError::Http {
                status: 400,
                message: "empty path".to_string(),
            });
        }
        let mut state = self.state();
        let previous = state.contents.get(&path);
        let last_modified = next_timestamp(previous.map(|c| c.last_modified));
        let created = previous.map(|c| c.created).unwrap_or(last_modified);
        let stored = StoredContent {
            content: content.clone(),
            created,
            last_modified,
        };
        let entry = entry_for(&path, &stored);
        state.contents.insert(path, stored);
        Ok(entry)
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.check_contents()?;
        let path = clean_path(path);
        match self.state().contents.remove(&path) {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(format!("/api/contents/{}", path))),
        }
    }
}
