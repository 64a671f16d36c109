//! Execution coordinator.
//!
//! Runs code cells from the [`DocumentStore`] on sessions from the
//! [`SessionRegistry`] and writes the normalized replies back onto the
//! cells.
//!
//! Rules:
//! - At most one execution per cell is in flight. A second request for the
//!   same cell fails with [`ExecuteError::ExecutionInProgress`] and leaves
//!   the first one alone.
//! - Executions on different cells are sent in the order requested and
//!   applied in the order their replies arrive. Ordering between them is
//!   the server's business.
//! - Sessions are referenced by id only. If the session is stopped,
//!   restarted or dies while a cell is running, the reply is discarded and
//!   the cell gets a single `SessionDied` failure.
//! - Remote failures become a single `ExecutionError` failure on the cell;
//!   they are not returned as errors and not retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::api::ApiError;
use crate::document::{DocumentError, DocumentStore};
use crate::output::{normalize_reply, Output, EXECUTION_ERROR, SESSION_DIED};
use crate::protocol::ExecuteRequest;
use crate::session::{LifecycleState, SessionError, SessionEvent, SessionRegistry};

/// Reasons an execution request is turned down before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error("No session selected, or the session cannot accept code")]
    NoSessionSelected,

    #[error("Cell {0} is already executing")]
    ExecutionInProgress(String),

    #[error("Session {id} is unreachable: {reason}")]
    SessionUnreachable { id: String, reason: String },

    #[error("Cell not found: {0}")]
    CellNotFound(String),

    #[error("Cell {0} is not a code cell")]
    NotCodeCell(String),
}

/// What happened to an accepted execution. Whatever it is, it has already
/// been written to the cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed {
        execution_count: u32,
        outputs: Vec<Output>,
        unknown_fragments: usize,
    },
    /// The remote call failed; recorded as an `ExecutionError` failure.
    Failed { message: String },
    /// The session went away mid-flight; recorded as a `SessionDied` failure.
    SessionDied,
}

type InFlight = Mutex<HashMap<String, String>>;

fn lock(in_flight: &InFlight) -> MutexGuard<'_, HashMap<String, String>> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a cell's in-flight claim and releases it on every exit path.
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    cell_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.cell_id);
    }
}

pub struct ExecutionCoordinator {
    registry: Arc<SessionRegistry>,
    documents: DocumentStore,
    selected: Mutex<Option<String>>,
    /// cell id -> session id
    in_flight: InFlight,
}

impl ExecutionCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, documents: DocumentStore) -> Self {
        Self {
            registry,
            documents,
            selected: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn documents(&self) -> &DocumentStore {
        &self.documents
    }

    /// Bind (or unbind) the session used when `execute` gets none.
    pub fn select_session(&self, session_id: Option<String>) {
        debug!("[coordinator] Selected session {:?}", session_id);
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = session_id;
    }

    pub fn selected_session(&self) -> Option<String> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_executing(&self, cell_id: &str) -> bool {
        lock(&self.in_flight).contains_key(cell_id)
    }

    pub fn executing_cells(&self) -> Vec<String> {
        let mut cells: Vec<_> = lock(&self.in_flight).keys().cloned().collect();
        cells.sort();
        cells
    }

    fn claim(&self, cell_id: &str, session_id: &str) -> Result<InFlightGuard<'_>, ExecuteError> {
        let mut in_flight = lock(&self.in_flight);
        if in_flight.contains_key(cell_id) {
            return Err(ExecuteError::ExecutionInProgress(cell_id.to_string()));
        }
        in_flight.insert(cell_id.to_string(), session_id.to_string());
        Ok(InFlightGuard {
            in_flight: &self.in_flight,
            cell_id: cell_id.to_string(),
        })
    }

    fn session_has_work(&self, session_id: &str) -> bool {
        lock(&self.in_flight).values().any(|s| s == session_id)
    }

    /// Run a code cell on `session_id`, or on the selected session.
    ///
    /// Returns an error only when the request is turned down up front; in
    /// that case the cell is untouched. Once accepted, every outcome is
    /// recorded on the cell and also returned.
    pub async fn execute(
        &self,
        cell_id: &str,
        session_id: Option<&str>,
    ) -> Result<ExecutionOutcome, ExecuteError> {
        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => self
                .selected_session()
                .ok_or(ExecuteError::NoSessionSelected)?,
        };
        let session = self
            .registry
            .get(&session_id)
            .await
            .ok_or(ExecuteError::NoSessionSelected)?;
        if !session.state.accepts_execution() {
            debug!(
                "[coordinator] Session {} is {}, not accepting code",
                session_id, session.state
            );
            return Err(ExecuteError::NoSessionSelected);
        }

        let cell = self
            .documents
            .cell(cell_id)
            .await
            .ok_or_else(|| ExecuteError::CellNotFound(cell_id.to_string()))?;
        if !cell.is_code() {
            return Err(ExecuteError::NotCodeCell(cell_id.to_string()));
        }

        let guard = self.claim(cell_id, &session_id)?;
        let mut events = self.registry.subscribe();

        let probed = match self.registry.probe(&session_id).await {
            Ok(state) => state,
            Err(e) => {
                let reason = match e {
                    SessionError::Unreachable { reason, .. } => reason,
                    other => other.to_string(),
                };
                warn!(
                    "[coordinator] Session {} failed liveness probe: {}",
                    session_id, reason
                );
                return Err(ExecuteError::SessionUnreachable {
                    id: session_id,
                    reason,
                });
            }
        };
        // The server may know better than the registry did a moment ago.
        if !probed.accepts_execution() {
            debug!(
                "[coordinator] Session {} is {} on the server, not accepting code",
                session_id, probed
            );
            return Err(ExecuteError::NoSessionSelected);
        }

        let previous_count = self
            .documents
            .clear_outputs(cell_id)
            .await
            .map_err(|_| ExecuteError::CellNotFound(cell_id.to_string()))?;
        self.registry
            .observe(&session_id, LifecycleState::Busy)
            .await;

        info!(
            "[coordinator] Executing cell {} on session {}",
            cell_id, session_id
        );
        let request = ExecuteRequest::new(cell.source_text());
        let service = self.registry.service().clone();

        let reply = tokio::select! {
            reply = service.execute(&session_id, &request) => Some(reply),
            _ = session_lost(&mut events, &self.registry, &session_id) => None,
        };

        // A 404 means the kernel is gone from the server.
        if let Some(Err(ApiError::NotFound(_))) = &reply {
            self.registry
                .observe(&session_id, LifecycleState::Dead)
                .await;
        }

        let abandoned = match reply {
            None => true,
            Some(_) => {
                orphaned_since(&mut events, &session_id)
                    || !is_alive(&self.registry, &session_id).await
            }
        };

        let outcome = match reply {
            Some(Err(e)) if !abandoned => {
                let message = e.to_string();
                warn!("[coordinator] Execution of cell {} failed: {}", cell_id, message);
                self.record(cell_id, vec![Output::failure(EXECUTION_ERROR, &message)], None)
                    .await;
                ExecutionOutcome::Failed { message }
            }
            Some(Ok(reply)) if !abandoned => {
                let normalized = normalize_reply(&reply, previous_count);
                debug!(
                    "[coordinator] Cell {} produced {} outputs (count {})",
                    cell_id,
                    normalized.outputs.len(),
                    normalized.execution_count
                );
                self.record(
                    cell_id,
                    normalized.outputs.clone(),
                    Some(normalized.execution_count),
                )
                .await;
                ExecutionOutcome::Completed {
                    execution_count: normalized.execution_count,
                    outputs: normalized.outputs,
                    unknown_fragments: normalized.unknown_fragments,
                }
            }
            // Whatever the abandoned request returns is discarded.
            _ => {
                warn!(
                    "[coordinator] Session {} went away while cell {} was executing",
                    session_id, cell_id
                );
                let failure = Output::failure(
                    SESSION_DIED,
                    format!("Session {} died before the cell finished", session_id),
                );
                self.record(cell_id, vec![failure], None).await;
                ExecutionOutcome::SessionDied
            }
        };

        drop(guard);
        if outcome != ExecutionOutcome::SessionDied && !self.session_has_work(&session_id) {
            self.registry
                .observe(&session_id, LifecycleState::Idle)
                .await;
        }
        Ok(outcome)
    }

    async fn record(&self, cell_id: &str, outputs: Vec<Output>, execution_count: Option<u32>) {
        match self
            .documents
            .apply_outputs(cell_id, outputs, execution_count)
            .await
        {
            Ok(()) => {}
            Err(DocumentError::CellNotFound(_)) => {
                warn!(
                    "[coordinator] Cell {} was removed while executing; dropping its outputs",
                    cell_id
                );
            }
            Err(e) => warn!("[coordinator] Could not record outputs for {}: {}", cell_id, e),
        }
    }
}

async fn is_alive(registry: &SessionRegistry, session_id: &str) -> bool {
    matches!(registry.state_of(session_id).await, Some(state) if state != LifecycleState::Dead)
}

/// Resolves once `session_id` is stopped, restarted or dead.
async fn session_lost(
    events: &mut broadcast::Receiver<SessionEvent>,
    registry: &SessionRegistry,
    session_id: &str,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.orphans(session_id) => return,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!("[coordinator] Missed {} session events", skipped);
                if !is_alive(registry, session_id).await {
                    return;
                }
            }
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

/// Whether any already-delivered event orphaned `session_id`.
fn orphaned_since(events: &mut broadcast::Receiver<SessionEvent>, session_id: &str) -> bool {
    loop {
        match events.try_recv() {
            Ok(event) if event.orphans(session_id) => return true,
            Ok(_) | Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return false,
        }
    }
}
