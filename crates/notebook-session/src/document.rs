//! Document store for the open notebook.
//!
//! Holds the ordered cells of one notebook, each with its source lines and
//! last known outputs, and loads/saves them through a [`ContentStore`].
//! Notebooks are read and written as nbformat v4 JSON.
//!
//! Saving never silently overwrites somebody else's changes: the store
//! remembers the server's `last_modified` for the file and refuses to save
//! with [`DocumentError::SaveConflict`] if it moved. The caller resolves the
//! conflict explicitly, by reloading or by calling [`DocumentStore::overwrite`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::api::{ApiError, ContentStore};
use crate::output::Output;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    Code,
    /// Markdown on the wire. Raw cells also load as prose.
    Prose,
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellKind::Code => write!(f, "code"),
            CellKind::Prose => write!(f, "prose"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub id: String,
    pub kind: CellKind,
    /// Source lines, each but the last ending in `\n`.
    pub source: Vec<String>,
    pub outputs: Vec<Output>,
    /// Session execution counter at the cell's last run.
    pub execution_count: Option<u32>,
    pub metadata: Map<String, Value>,
}

impl Cell {
    pub fn new(kind: CellKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            source: Vec::new(),
            outputs: Vec::new(),
            execution_count: None,
            metadata: Map::new(),
        }
    }

    pub fn source_text(&self) -> String {
        self.source.concat()
    }

    pub fn set_source(&mut self, source: &str) {
        self.source = source_to_lines(source);
    }

    pub fn is_code(&self) -> bool {
        self.kind == CellKind::Code
    }
}

/// Partial update for [`DocumentStore::update_cell`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellUpdate {
    pub source: Option<String>,
    pub kind: Option<CellKind>,
}

impl CellUpdate {
    pub fn source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            kind: None,
        }
    }

    pub fn kind(kind: CellKind) -> Self {
        Self {
            source: None,
            kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notebook {
    pub id: String,
    /// `None` for a scratch notebook that has never been saved.
    pub path: Option<String>,
    pub cells: Vec<Cell>,
    pub metadata: Map<String, Value>,
    pub nbformat: u32,
    pub nbformat_minor: u32,
}

impl Notebook {
    /// An unsaved notebook with no cells.
    pub fn scratch() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: None,
            cells: Vec::new(),
            metadata: Map::new(),
            nbformat: 4,
            nbformat_minor: 5,
        }
    }

    pub fn find_cell_index(&self, cell_id: &str) -> Option<usize> {
        self.cells.iter().position(|c| c.id == cell_id)
    }

    pub fn cell(&self, cell_id: &str) -> Option<&Cell> {
        self.cells.iter().find(|c| c.id == cell_id)
    }

    fn cell_mut(&mut self, cell_id: &str) -> Option<&mut Cell> {
        self.cells.iter_mut().find(|c| c.id == cell_id)
    }

    /// Parse nbformat v4 JSON.
    pub fn from_json(path: Option<String>, value: &Value) -> Result<Self, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "notebook is not a JSON object".to_string())?;

        let nbformat = obj.get("nbformat").and_then(Value::as_u64).unwrap_or(4);
        if nbformat != 4 {
            return Err(format!("unsupported nbformat {}", nbformat));
        }
        // Cells always carry ids here, which needs 4.5.
        let nbformat_minor = obj
            .get("nbformat_minor")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .max(5);

        let cells = match obj.get("cells") {
            Some(Value::Array(cells)) => cells.iter().filter_map(cell_from_json).collect(),
            None | Some(Value::Null) => Vec::new(),
            Some(_) => return Err("cells is not an array".to_string()),
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            path,
            cells,
            metadata: obj
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            nbformat: nbformat as u32,
            nbformat_minor: nbformat_minor as u32,
        })
    }

    /// Serialize as nbformat v4 JSON, outputs included.
    pub fn to_json(&self) -> Value {
        json!({
            "cells": self.cells.iter().map(cell_to_json).collect::<Vec<_>>(),
            "metadata": self.metadata,
            "nbformat": self.nbformat,
            "nbformat_minor": self.nbformat_minor,
        })
    }
}

/// Convert source string to nbformat's Vec<String> (lines with newlines).
fn source_to_lines(source: &str) -> Vec<String> {
    if source.is_empty() {
        return Vec::new();
    }
    source.split_inclusive('\n').map(|s| s.to_string()).collect()
}

fn source_from_json(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => source_to_lines(s),
        Some(Value::Array(parts)) => {
            source_to_lines(&parts.iter().filter_map(Value::as_str).collect::<String>())
        }
        _ => Vec::new(),
    }
}

fn cell_from_json(value: &Value) -> Option<Cell> {
    let obj = value.as_object()?;
    let kind = match obj.get("cell_type").and_then(Value::as_str) {
        Some("code") => CellKind::Code,
        Some("markdown") | Some("raw") => CellKind::Prose,
        other => {
            warn!("[documents] Skipping cell with type {:?}", other);
            return None;
        }
    };

    let id = obj
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut outputs = Vec::new();
    if kind == CellKind::Code {
        for raw in obj
            .get("outputs")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            match serde_json::from_value::<Output>(raw.clone()) {
                Ok(output) => outputs.push(output),
                Err(e) => warn!("[documents] Skipping unreadable output in cell {}: {}", id, e),
            }
        }
    }

    Some(Cell {
        id,
        kind,
        source: source_from_json(obj.get("source")),
        outputs,
        execution_count: obj
            .get("execution_count")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok()),
        metadata: obj
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    })
}

fn cell_to_json(cell: &Cell) -> Value {
    match cell.kind {
        CellKind::Code => json!({
            "cell_type": "code",
            "id": cell.id,
            "metadata": cell.metadata,
            "source": cell.source,
            "outputs": cell
                .outputs
                .iter()
                .filter_map(|o| serde_json::to_value(o).ok())
                .collect::<Vec<_>>(),
            "execution_count": cell.execution_count,
        }),
        CellKind::Prose => json!({
            "cell_type": "markdown",
            "id": cell.id,
            "metadata": cell.metadata,
            "source": cell.source,
        }),
    }
}

/// Error type for document operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DocumentError {
    #[error("{path} was changed on the server since it was loaded; reload it or overwrite")]
    SaveConflict {
        path: String,
        local: Option<DateTime<Utc>>,
        remote: Option<DateTime<Utc>>,
    },

    #[error("No notebook is open")]
    NotLoaded,

    #[error("Notebook has no path")]
    NoPath,

    #[error("Cell not found: {0}")]
    CellNotFound(String),

    #[error("Invalid notebook {path}: {reason}")]
    Invalid { path: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] ApiError),
}

#[derive(Default)]
struct DocumentState {
    notebook: Option<Notebook>,
    /// Server timestamp of the file as of the last load or save.
    last_modified: Option<DateTime<Utc>>,
    dirty: bool,
    /// Bumped by every mutation, so a save can tell whether it captured
    /// the latest edits.
    revision: u64,
}

impl DocumentState {
    fn notebook_mut(&mut self) -> Result<&mut Notebook, DocumentError> {
        self.notebook.as_mut().ok_or(DocumentError::NotLoaded)
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.revision += 1;
    }
}

/// Shared handle to the open notebook. Clones share state.
#[derive(Clone)]
pub struct DocumentStore {
    contents: Arc<dyn ContentStore>,
    state: Arc<RwLock<DocumentState>>,
}

impl DocumentStore {
    pub fn new(contents: Arc<dyn ContentStore>) -> Self {
        Self {
            contents,
            state: Arc::new(RwLock::new(DocumentState::default())),
        }
    }

    pub fn contents(&self) -> &Arc<dyn ContentStore> {
        &self.contents
    }

    /// Snapshot of the open notebook.
    pub async fn notebook(&self) -> Option<Notebook> {
        self.state.read().await.notebook.clone()
    }

    pub async fn path(&self) -> Option<String> {
        self.state
            .read()
            .await
            .notebook
            .as_ref()
            .and_then(|nb| nb.path.clone())
    }

    pub async fn is_dirty(&self) -> bool {
        self.state.read().await.dirty
    }

    pub async fn cell(&self, cell_id: &str) -> Option<Cell> {
        self.state
            .read()
            .await
            .notebook
            .as_ref()
            .and_then(|nb| nb.cell(cell_id).cloned())
    }

    pub async fn cells(&self) -> Vec<Cell> {
        self.state
            .read()
            .await
            .notebook
            .as_ref()
            .map(|nb| nb.cells.clone())
            .unwrap_or_default()
    }

    /// Replace whatever is open with an empty, unsaved notebook.
    pub async fn open_scratch(&self) -> Notebook {
        let notebook = Notebook::scratch();
        let mut state = self.state.write().await;
        *state = DocumentState {
            notebook: Some(notebook.clone()),
            ..Default::default()
        };
        notebook
    }

    /// Insert a new empty cell at `position` (default: the end). Positions
    /// past the end append.
    pub async fn add_cell(
        &self,
        kind: CellKind,
        position: Option<usize>,
    ) -> Result<Cell, DocumentError> {
        let mut state = self.state.write().await;
        let notebook = state.notebook_mut()?;
        let cell = Cell::new(kind);
        let index = position
            .unwrap_or(notebook.cells.len())
            .min(notebook.cells.len());
        notebook.cells.insert(index, cell.clone());
        state.touch();
        Ok(cell)
    }

    /// Apply a partial update. Turning a code cell into prose drops its
    /// outputs and execution count.
    pub async fn update_cell(
        &self,
        cell_id: &str,
        update: CellUpdate,
    ) -> Result<Cell, DocumentError> {
        let mut state = self.state.write().await;
        let cell = state
            .notebook_mut()?
            .cell_mut(cell_id)
            .ok_or_else(|| DocumentError::CellNotFound(cell_id.to_string()))?;

        if let Some(source) = &update.source {
            cell.set_source(source);
        }
        if let Some(kind) = update.kind {
            if kind == CellKind::Prose {
                cell.outputs.clear();
                cell.execution_count = None;
            }
            cell.kind = kind;
        }
        let updated = cell.clone();
        state.touch();
        Ok(updated)
    }

    /// Remove a cell. Removing the last remaining cell is allowed.
    pub async fn delete_cell(&self, cell_id: &str) -> Result<Cell, DocumentError> {
        let mut state = self.state.write().await;
        let notebook = state.notebook_mut()?;
        let index = notebook
            .find_cell_index(cell_id)
            .ok_or_else(|| DocumentError::CellNotFound(cell_id.to_string()))?;
        let removed = notebook.cells.remove(index);
        state.touch();
        Ok(removed)
    }

    /// Drop a cell's outputs ahead of a new run. Returns the execution count
    /// it had, which is kept until the run reports a new one.
    pub async fn clear_outputs(&self, cell_id: &str) -> Result<Option<u32>, DocumentError> {
        let mut state = self.state.write().await;
        let cell = state
            .notebook_mut()?
            .cell_mut(cell_id)
            .ok_or_else(|| DocumentError::CellNotFound(cell_id.to_string()))?;
        cell.outputs.clear();
        let previous = cell.execution_count;
        state.touch();
        Ok(previous)
    }

    /// Replace a cell's outputs with the results of a run.
    pub async fn apply_outputs(
        &self,
        cell_id: &str,
        outputs: Vec<Output>,
        execution_count: Option<u32>,
    ) -> Result<(), DocumentError> {
        let mut state = self.state.write().await;
        let cell = state
            .notebook_mut()?
            .cell_mut(cell_id)
            .ok_or_else(|| DocumentError::CellNotFound(cell_id.to_string()))?;
        cell.outputs = outputs;
        if execution_count.is_some() {
            cell.execution_count = execution_count;
        }
        state.touch();
        Ok(())
    }

    /// Fetch a notebook and make it the open one. On failure the previously
    /// open notebook stays.
    pub async fn load(&self, path: &str) -> Result<Notebook, DocumentError> {
        let model = self.contents.read(path).await?;
        let notebook = Notebook::from_json(Some(model.entry.path.clone()), &model.content)
            .map_err(|reason| DocumentError::Invalid {
                path: path.to_string(),
                reason,
            })?;

        info!(
            "[documents] Loaded {} ({} cells)",
            model.entry.path,
            notebook.cells.len()
        );
        let mut state = self.state.write().await;
        let revision = state.revision + 1;
        *state = DocumentState {
            notebook: Some(notebook.clone()),
            last_modified: model.entry.last_modified,
            dirty: false,
            revision,
        };
        Ok(notebook)
    }

    /// Write the open notebook back, unless the file changed on the server
    /// since it was loaded.
    pub async fn save(&self) -> Result<(), DocumentError> {
        self.save_inner(true).await
    }

    /// Write the open notebook back without the conflict check.
    pub async fn overwrite(&self) -> Result<(), DocumentError> {
        self.save_inner(false).await
    }

    async fn save_inner(&self, check_conflict: bool) -> Result<(), DocumentError> {
        let (path, body, known, revision) = {
            let state = self.state.read().await;
            let notebook = state.notebook.as_ref().ok_or(DocumentError::NotLoaded)?;
            let path = notebook.path.clone().ok_or(DocumentError::NoPath)?;
            (path, notebook.to_json(), state.last_modified, state.revision)
        };

        // A file loaded without a timestamp still conflicts once the
        // server reports one.
        if check_conflict {
            let (exists, remote) = match self.contents.stat(&path).await {
                Ok(entry) => (true, entry.last_modified),
                Err(ApiError::NotFound(_)) => (false, None),
                Err(e) => return Err(e.into()),
            };
            if !exists || remote != known {
                warn!("[documents] Save conflict on {}", path);
                return Err(DocumentError::SaveConflict {
                    path,
                    local: known,
                    remote,
                });
            }
        }

        let entry = self.contents.write(&path, &body).await?;
        debug!("[documents] Saved {}", path);

        let mut state = self.state.write().await;
        let still_open = state
            .notebook
            .as_ref()
            .is_some_and(|nb| nb.path.as_deref() == Some(path.as_str()));
        if still_open {
            state.last_modified = entry.last_modified;
            if state.revision == revision {
                state.dirty = false;
            }
        }
        Ok(())
    }

    /// Forget the open notebook.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        let revision = state.revision + 1;
        *state = DocumentState {
            revision,
            ..Default::default()
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryJupyter;
    use crate::output::StreamChannel;
    use crate::protocol::{empty_notebook_json, ContentEntry, ContentModel};
    use async_trait::async_trait;

    async fn store_with(path: &str, content: Value) -> (Arc<MemoryJupyter>, DocumentStore) {
        let server = Arc::new(MemoryJupyter::new());
        server.insert_notebook(path, content);
        let store = DocumentStore::new(server.clone());
        store.load(path).await.unwrap();
        (server, store)
    }

    fn sample_notebook() -> Value {
        json!({
            "cells": [
                {
                    "cell_type": "code",
                    "id": "c1",
                    "metadata": {"tags": ["setup"]},
                    "source": ["import os\n", "print(os.name)"],
                    "outputs": [
                        {"output_type": "stream", "name": "stdout", "text": ["posix\n"]}
                    ],
                    "execution_count": 4
                },
                {
                    "cell_type": "markdown",
                    "id": "m1",
                    "metadata": {},
                    "source": "# Title\nSome text"
                },
                {
                    "cell_type": "raw",
                    "metadata": {},
                    "source": "raw"
                }
            ],
            "metadata": {"kernelspec": {"name": "python3"}},
            "nbformat": 4,
            "nbformat_minor": 4
        })
    }

    #[test]
    fn test_source_to_lines_handles_empty_string() {
        assert!(source_to_lines("").is_empty());
    }

    #[test]
    fn test_source_to_lines_preserves_trailing_newline() {
        assert_eq!(source_to_lines("a\nb\n"), vec!["a\n", "b\n"]);
        assert_eq!(source_to_lines("a\nb"), vec!["a\n", "b"]);
    }

    #[test]
    fn test_from_json() {
        let notebook = Notebook::from_json(Some("a.ipynb".into()), &sample_notebook()).unwrap();
        assert_eq!(notebook.cells.len(), 3);
        assert_eq!(notebook.nbformat_minor, 5);
        assert_eq!(notebook.metadata["kernelspec"]["name"], "python3");

        let code = &notebook.cells[0];
        assert_eq!(code.kind, CellKind::Code);
        assert_eq!(code.source_text(), "import os\nprint(os.name)");
        assert_eq!(code.execution_count, Some(4));
        assert_eq!(
            code.outputs,
            vec![Output::stream(StreamChannel::Stdout, "posix\n")]
        );
        assert_eq!(code.metadata["tags"][0], "setup");

        let prose = &notebook.cells[1];
        assert_eq!(prose.kind, CellKind::Prose);
        assert_eq!(prose.source, vec!["# Title\n", "Some text"]);

        let raw = &notebook.cells[2];
        assert_eq!(raw.kind, CellKind::Prose);
        assert!(!raw.id.is_empty());
    }

    #[test]
    fn test_from_json_skips_bad_outputs_and_cells() {
        let value = json!({
            "cells": [
                {"cell_type": "code", "id": "c1", "source": "", "outputs": [
                    {"output_type": "mystery"},
                    {"output_type": "display_data", "data": {"text/plain": "ok"}, "metadata": {}}
                ]},
                {"cell_type": "heading", "source": "old"}
            ],
            "metadata": {},
            "nbformat": 4,
            "nbformat_minor": 5
        });
        let notebook = Notebook::from_json(None, &value).unwrap();
        assert_eq!(notebook.cells.len(), 1);
        assert_eq!(notebook.cells[0].outputs.len(), 1);
    }

    #[test]
    fn test_from_json_rejects_other_major_versions() {
        let value = json!({"cells": [], "metadata": {}, "nbformat": 3, "nbformat_minor": 0});
        assert!(Notebook::from_json(None, &value).is_err());
        assert!(Notebook::from_json(None, &json!([])).is_err());
    }

    #[test]
    fn test_to_json_shape() {
        let notebook = Notebook::from_json(None, &sample_notebook()).unwrap();
        let value = notebook.to_json();
        assert_eq!(value["nbformat"], 4);
        assert_eq!(value["cells"][0]["cell_type"], "code");
        assert_eq!(value["cells"][0]["outputs"][0]["output_type"], "stream");
        assert_eq!(value["cells"][1]["cell_type"], "markdown");
        assert!(value["cells"][1].get("outputs").is_none());
        assert_eq!(value["cells"][2]["cell_type"], "markdown");
    }

    #[tokio::test]
    async fn test_operations_require_open_notebook() {
        let store = DocumentStore::new(Arc::new(MemoryJupyter::new()));
        assert!(matches!(
            store.add_cell(CellKind::Code, None).await,
            Err(DocumentError::NotLoaded)
        ));
        assert!(matches!(store.save().await, Err(DocumentError::NotLoaded)));
    }

    #[tokio::test]
    async fn test_add_cell_positions() {
        let store = DocumentStore::new(Arc::new(MemoryJupyter::new()));
        store.open_scratch().await;

        let a = store.add_cell(CellKind::Code, None).await.unwrap();
        let b = store.add_cell(CellKind::Prose, Some(0)).await.unwrap();
        let c = store.add_cell(CellKind::Code, Some(99)).await.unwrap();

        let ids: Vec<_> = store.cells().await.into_iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id, a.id, c.id]);
        assert!(store.is_dirty().await);
    }

    #[tokio::test]
    async fn test_update_cell() {
        let (_server, store) = store_with("a.ipynb", sample_notebook()).await;

        let cell = store
            .update_cell("c1", CellUpdate::source("x = 1\ny = 2"))
            .await
            .unwrap();
        assert_eq!(cell.source, vec!["x = 1\n", "y = 2"]);
        assert_eq!(cell.outputs.len(), 1);

        let cell = store
            .update_cell("c1", CellUpdate::kind(CellKind::Prose))
            .await
            .unwrap();
        assert_eq!(cell.kind, CellKind::Prose);
        assert!(cell.outputs.is_empty());
        assert!(cell.execution_count.is_none());

        assert!(matches!(
            store.update_cell("nope", CellUpdate::default()).await,
            Err(DocumentError::CellNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_last_cell_is_allowed() {
        let store = DocumentStore::new(Arc::new(MemoryJupyter::new()));
        store.open_scratch().await;
        let cell = store.add_cell(CellKind::Code, None).await.unwrap();

        store.delete_cell(&cell.id).await.unwrap();
        assert!(store.cells().await.is_empty());
        assert!(matches!(
            store.delete_cell(&cell.id).await,
            Err(DocumentError::CellNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_and_apply_outputs() {
        let (_server, store) = store_with("a.ipynb", sample_notebook()).await;

        let previous = store.clear_outputs("c1").await.unwrap();
        assert_eq!(previous, Some(4));
        let cell = store.cell("c1").await.unwrap();
        assert!(cell.outputs.is_empty());
        assert_eq!(cell.execution_count, Some(4));

        store
            .apply_outputs("c1", vec![Output::failure("E", "m")], None)
            .await
            .unwrap();
        assert_eq!(store.cell("c1").await.unwrap().execution_count, Some(4));

        store
            .apply_outputs("c1", vec![Output::stream(StreamChannel::Stdout, "x")], Some(9))
            .await
            .unwrap();
        let cell = store.cell("c1").await.unwrap();
        assert_eq!(cell.outputs.len(), 1);
        assert_eq!(cell.execution_count, Some(9));
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrip() {
        let (_server, store) = store_with("work/a.ipynb", sample_notebook()).await;
        let added = store.add_cell(CellKind::Code, None).await.unwrap();
        store
            .update_cell(&added.id, CellUpdate::source("1 + 1"))
            .await
            .unwrap();
        store
            .apply_outputs(&added.id, vec![Output::completed(5)], Some(5))
            .await
            .unwrap();

        let before = store.notebook().await.unwrap();
        store.save().await.unwrap();
        assert!(!store.is_dirty().await);

        let after = store.load("work/a.ipynb").await.unwrap();
        assert_eq!(after.cells, before.cells);
        assert_eq!(after.metadata, before.metadata);
    }

    #[tokio::test]
    async fn test_save_conflict() {
        let (server, store) = store_with("a.ipynb", sample_notebook()).await;
        store.add_cell(CellKind::Code, None).await.unwrap();
        server.modify_externally("a.ipynb");

        let err = store.save().await.unwrap_err();
        assert!(matches!(err, DocumentError::SaveConflict { ref path, .. } if path == "a.ipynb"));
        assert!(store.is_dirty().await);

        store.overwrite().await.unwrap();
        assert!(!store.is_dirty().await);
        // After overwriting, ordinary saves work again.
        store.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_conflict_when_deleted_remotely() {
        let (server, store) = store_with("a.ipynb", sample_notebook()).await;
        server.delete("a.ipynb").await.unwrap();
        assert!(matches!(
            store.save().await,
            Err(DocumentError::SaveConflict { remote: None, .. })
        ));
    }

    /// Hides `last_modified` on reads, and on every entry when `everywhere`.
    struct WithoutTimestamps {
        inner: Arc<MemoryJupyter>,
        everywhere: bool,
    }

    impl WithoutTimestamps {
        fn strip(&self, mut entry: ContentEntry) -> ContentEntry {
            if self.everywhere {
                entry.last_modified = None;
            }
            entry
        }
    }

    #[async_trait]
    impl ContentStore for WithoutTimestamps {
        async fn list(&self, dir: &str) -> Result<Vec<ContentEntry>, ApiError> {
            self.inner.list(dir).await
        }

        async fn read(&self, path: &str) -> Result<ContentModel, ApiError> {
            let mut model = self.inner.read(path).await?;
            model.entry.last_modified = None;
            Ok(model)
        }

        async fn stat(&self, path: &str) -> Result<ContentEntry, ApiError> {
            Ok(self.strip(self.inner.stat(path).await?))
        }

        async fn write(&self, path: &str, content: &Value) -> Result<ContentEntry, ApiError> {
            Ok(self.strip(self.inner.write(path, content).await?))
        }

        async fn delete(&self, path: &str) -> Result<(), ApiError> {
            self.inner.delete(path).await
        }
    }

    #[tokio::test]
    async fn test_save_conflict_without_known_timestamp() {
        let server = Arc::new(MemoryJupyter::new());
        server.insert_notebook("a.ipynb", sample_notebook());
        let store = DocumentStore::new(Arc::new(WithoutTimestamps {
            inner: server.clone(),
            everywhere: false,
        }));
        store.load("a.ipynb").await.unwrap();
        store.add_cell(CellKind::Code, None).await.unwrap();

        assert!(matches!(
            store.save().await,
            Err(DocumentError::SaveConflict {
                local: None,
                remote: Some(_),
                ..
            })
        ));
        assert_eq!(server.notebook("a.ipynb"), Some(sample_notebook()));

        // Overwriting records the server's timestamp, so saves work again.
        store.overwrite().await.unwrap();
        store.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_save_when_server_has_no_timestamps() {
        let server = Arc::new(MemoryJupyter::new());
        server.insert_notebook("a.ipynb", sample_notebook());
        let store = DocumentStore::new(Arc::new(WithoutTimestamps {
            inner: server.clone(),
            everywhere: true,
        }));
        store.load("a.ipynb").await.unwrap();
        store.add_cell(CellKind::Code, None).await.unwrap();

        store.save().await.unwrap();
        assert!(!store.is_dirty().await);
        assert_ne!(server.notebook("a.ipynb"), Some(sample_notebook()));
    }

    #[tokio::test]
    async fn test_scratch_has_no_path() {
        let store = DocumentStore::new(Arc::new(MemoryJupyter::new()));
        store.open_scratch().await;
        assert!(matches!(store.save().await, Err(DocumentError::NoPath)));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_open_notebook() {
        let (_server, store) = store_with("a.ipynb", sample_notebook()).await;
        assert!(matches!(
            store.load("missing.ipynb").await,
            Err(DocumentError::Storage(ApiError::NotFound(_)))
        ));
        assert_eq!(store.path().await.as_deref(), Some("a.ipynb"));
    }

    #[tokio::test]
    async fn test_invalid_notebook() {
        let (server, store) = store_with("a.ipynb", empty_notebook_json()).await;
        server.insert_notebook("bad.ipynb", json!("not a notebook"));
        assert!(matches!(
            store.load("bad.ipynb").await,
            Err(DocumentError::Invalid { .. })
        ));
    }

    #[tokio::test]
    async fn test_close() {
        let (_server, store) = store_with("a.ipynb", sample_notebook()).await;
        store.close().await;
        assert!(store.notebook().await.is_none());
        assert!(store.path().await.is_none());
    }
}
