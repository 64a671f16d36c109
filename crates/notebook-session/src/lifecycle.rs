//! Lifecycle controller.
//!
//! Turns user intents ("new notebook", "delete notebook", "new kernel", ...)
//! into document store and registry calls. After every creation, deletion
//! or restart both listings are refreshed. Those refreshes are best effort:
//! the operation itself already succeeded, so refresh failures are logged
//! and swallowed.

use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use tokio::sync::RwLock;

use crate::api::ApiError;
use crate::document::{DocumentError, DocumentStore, Notebook};
use crate::protocol::{empty_notebook_json, ContentEntry, ServerStatus};
use crate::session::{Session, SessionError, SessionRegistry};

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Default)]
struct Listing {
    dir: String,
    notebooks: Vec<ContentEntry>,
}

pub struct LifecycleController {
    registry: Arc<SessionRegistry>,
    documents: DocumentStore,
    listing: RwLock<Listing>,
}

fn join_path(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

impl LifecycleController {
    pub fn new(registry: Arc<SessionRegistry>, documents: DocumentStore) -> Self {
        Self {
            registry,
            documents,
            listing: RwLock::new(Listing::default()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// Check the server is up, then load both listings.
    pub async fn connect(&self) -> Result<ServerStatus, LifecycleError> {
        let status = self.registry.service().status().await?;
        info!(
            "[lifecycle] Connected: {} kernels, {} connections",
            status.kernels, status.connections
        );
        self.refresh_all().await;
        Ok(status)
    }

    /// Notebooks from the last listing.
    pub async fn list_notebooks(&self) -> Vec<ContentEntry> {
        self.listing.read().await.notebooks.clone()
    }

    /// Re-list the current directory, keeping only notebooks.
    pub async fn refresh_notebooks(&self) -> Result<Vec<ContentEntry>, LifecycleError> {
        let dir = self.listing.read().await.dir.clone();
        let notebooks: Vec<ContentEntry> = self
            .documents
            .contents()
            .list(&dir)
            .await?
            .into_iter()
            .filter(ContentEntry::is_notebook)
            .collect();

        let mut listing = self.listing.write().await;
        if listing.dir == dir {
            listing.notebooks = notebooks.clone();
        }
        Ok(notebooks)
    }

    /// Switch the listing to `dir` and list it.
    pub async fn browse(&self, dir: &str) -> Result<Vec<ContentEntry>, LifecycleError> {
        {
            let mut listing = self.listing.write().await;
            listing.dir = dir.trim_matches('/').to_string();
            listing.notebooks.clear();
        }
        self.refresh_notebooks().await
    }

    /// Refresh sessions and notebooks, logging failures.
    pub async fn refresh_all(&self) {
        let (sessions, notebooks) =
            futures::future::join(self.registry.refresh(), self.refresh_notebooks()).await;
        if let Err(e) = sessions {
            warn!("[lifecycle] Session refresh failed: {}", e);
        }
        if let Err(e) = notebooks {
            warn!("[lifecycle] Notebook refresh failed: {}", e);
        }
    }

    /// Create `notebook_<millis>.ipynb` in `dir` and open it.
    pub async fn new_notebook(&self, dir: &str) -> Result<Notebook, LifecycleError> {
        let name = format!("notebook_{}.ipynb", Utc::now().timestamp_millis());
        let path = join_path(dir, &name);

        self.documents
            .contents()
            .write(&path, &empty_notebook_json())
            .await?;
        info!("[lifecycle] Created {}", path);

        let notebook = self.documents.load(&path).await?;
        self.refresh_all().await;
        Ok(notebook)
    }

    pub async fn open_notebook(&self, path: &str) -> Result<Notebook, LifecycleError> {
        Ok(self.documents.load(path).await?)
    }

    /// Delete a notebook, closing it first if it is the open one.
    pub async fn delete_notebook(&self, path: &str) -> Result<(), LifecycleError> {
        self.documents.contents().delete(path).await?;
        info!("[lifecycle] Deleted {}", path);

        if self.documents.path().await.as_deref() == Some(path.trim_matches('/')) {
            self.documents.close().await;
        }
        self.refresh_all().await;
        Ok(())
    }

    pub async fn new_kernel(&self, language_hint: Option<&str>) -> Result<Session, LifecycleError> {
        let session = self.registry.start_session(language_hint).await?;
        self.refresh_all().await;
        Ok(session)
    }

    pub async fn stop_kernel(&self, id: &str) -> Result<(), LifecycleError> {
        self.registry.stop_session(id).await?;
        self.refresh_all().await;
        Ok(())
    }

    pub async fn restart_kernel(&self, id: &str) -> Result<Session, LifecycleError> {
        let session = self.registry.restart_session(id).await?;
        self.refresh_all().await;
        Ok(session)
    }
}
