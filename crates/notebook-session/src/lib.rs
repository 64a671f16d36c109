//! notebook-session - Client-side notebook execution against a Jupyter server.
//!
//! This crate keeps track of remote kernels ("sessions"), holds the open
//! notebook document, and routes code cells to kernels, folding the loosely
//! shaped execution replies back into ordered cell outputs.
//!
//! The pieces, leaf first:
//! - [`session::SessionRegistry`] is the single source of truth for kernel
//!   lifecycle state.
//! - [`document::DocumentStore`] owns the cells of the open notebook and
//!   loads/saves them through a [`api::ContentStore`].
//! - [`coordinator::ExecutionCoordinator`] binds the two together and runs
//!   cells, one in flight per cell.
//! - [`lifecycle::LifecycleController`] turns "new notebook" / "new kernel"
//!   style intents into registry and document calls.
//!
//! The remote server sits behind the [`api::KernelService`] and
//! [`api::ContentStore`] traits. [`http::JupyterClient`] speaks the Jupyter
//! REST API; [`memory::MemoryJupyter`] is an in-process stand-in.

pub mod api;
pub mod coordinator;
pub mod document;
pub mod http;
pub mod lifecycle;
pub mod memory;
pub mod output;
pub mod poller;
pub mod protocol;
pub mod session;
pub mod settings;

pub use api::{ApiError, ContentStore, KernelService};
pub use coordinator::{ExecuteError, ExecutionCoordinator, ExecutionOutcome};
pub use document::{Cell, CellKind, CellUpdate, DocumentError, DocumentStore, Notebook};
pub use lifecycle::{LifecycleController, LifecycleError};
pub use output::{Output, StreamChannel, EXECUTION_ERROR, SESSION_DIED};
pub use session::{LifecycleState, Session, SessionError, SessionEvent, SessionRegistry};
pub use settings::ClientSettings;
