//! Collaborator traits for the remote server.
//!
//! The core never talks HTTP directly. It holds these traits as
//! `Arc<dyn …>` so the registry, document store and coordinator can run
//! against [`crate::http::JupyterClient`] in production and
//! [`crate::memory::MemoryJupyter`] in tests.

use async_trait::async_trait;

use crate::protocol::{
    ContentEntry, ContentModel, ExecuteRequest, KernelModel, ServerStatus,
};

/// Error type for calls to the remote server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Kernel ("session") half of the server API.
#[async_trait]
pub trait KernelService: Send + Sync {
    /// Server liveness and summary counters.
    async fn status(&self) -> Result<ServerStatus, ApiError>;

    async fn list_kernels(&self) -> Result<Vec<KernelModel>, ApiError>;

    /// Fetch a single kernel. Doubles as the liveness probe before execution.
    async fn get_kernel(&self, kernel_id: &str) -> Result<KernelModel, ApiError>;

    async fn start_kernel(&self, kernel_name: &str) -> Result<KernelModel, ApiError>;

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ApiError>;

    async fn restart_kernel(&self, kernel_id: &str) -> Result<KernelModel, ApiError>;

    /// Run code and return the raw, loosely shaped reply.
    ///
    /// The reply is normalized by [`crate::output::parse_execute_reply`].
    async fn execute(
        &self,
        kernel_id: &str,
        request: &ExecuteRequest,
    ) -> Result<serde_json::Value, ApiError>;
}

/// Notebook storage half of the server API, keyed by path.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// List a directory (`""` for the root).
    async fn list(&self, dir: &str) -> Result<Vec<ContentEntry>, ApiError>;

    /// Read a notebook including its body.
    async fn read(&self, path: &str) -> Result<ContentModel, ApiError>;

    /// Read only the entry (no body), used for conflict checks.
    async fn stat(&self, path: &str) -> Result<ContentEntry, ApiError>;

    /// Write a notebook body, creating the file if needed.
    async fn write(
        &self,
        path: &str,
        content: &serde_json::Value,
    ) -> Result<ContentEntry, ApiError>;

    async fn delete(&self, path: &str) -> Result<(), ApiError>;
}
