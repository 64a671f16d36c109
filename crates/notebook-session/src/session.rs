//! Session registry.
//!
//! The registry is the single source of truth for which kernels exist and
//! what state they are in. Everything else refers to sessions by id and
//! asks the registry; nothing keeps its own copy of lifecycle state.
//!
//! State changes go out on a broadcast channel so that in-flight executions
//! can notice when their session is stopped, restarted or dies.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::api::{ApiError, KernelService};
use crate::protocol::{kernel_name_for_language, KernelModel};
use crate::settings::DEFAULT_KERNEL;

/// Lifecycle of a remote kernel.
///
/// `starting -> idle <-> busy`, and any state can become `dead`. `dead` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Starting,
    Idle,
    Busy,
    Dead,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Busy => write!(f, "busy"),
            LifecycleState::Dead => write!(f, "dead"),
        }
    }
}

impl LifecycleState {
    /// Map a server `execution_state` onto the lifecycle. Unknown values
    /// (e.g. `unknown`) give `None` and leave the local state alone.
    pub fn from_execution_state(state: &str) -> Option<Self> {
        match state {
            "starting" | "restarting" | "autorestarting" => Some(LifecycleState::Starting),
            "idle" => Some(LifecycleState::Idle),
            "busy" => Some(LifecycleState::Busy),
            "dead" | "terminating" => Some(LifecycleState::Dead),
            _ => None,
        }
    }

    /// Whether code may be sent to a session in this state.
    pub fn accepts_execution(self) -> bool {
        matches!(self, LifecycleState::Idle | LifecycleState::Busy)
    }
}

/// A kernel known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    /// Kernelspec name, e.g. `python3`.
    pub name: String,
    pub language: String,
    pub state: LifecycleState,
}

impl Session {
    fn from_model(model: &KernelModel, state: LifecycleState) -> Self {
        Self {
            id: model.id.clone(),
            name: model.name.clone(),
            language: model.language(),
            state,
        }
    }
}

/// Registry change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Added(Session),
    StateChanged { id: String, state: LifecycleState },
    Restarted { id: String },
    Removed { id: String },
    Died { id: String },
}

impl SessionEvent {
    /// Whether this event abandons executions running on `session_id`.
    pub fn orphans(&self, session_id: &str) -> bool {
        match self {
            SessionEvent::Restarted { id }
            | SessionEvent::Removed { id }
            | SessionEvent::Died { id } => id == session_id,
            SessionEvent::StateChanged { id, state } => {
                id == session_id && *state == LifecycleState::Dead
            }
            SessionEvent::Added(_) => false,
        }
    }
}

/// Error type for registry operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to start session: {0}")]
    Start(#[source] ApiError),

    #[error("Failed to stop session {id}: {source}")]
    Stop { id: String, source: ApiError },

    #[error("Failed to restart session {id}: {source}")]
    Restart { id: String, source: ApiError },

    #[error("Failed to refresh sessions: {0}")]
    Refresh(#[source] ApiError),

    #[error("Session {id} is unreachable: {reason}")]
    Unreachable { id: String, reason: String },

    #[error("Session {id} is still {state}")]
    NotReady { id: String, state: LifecycleState },
}

const EVENT_CAPACITY: usize = 64;

/// Tracks known sessions and their lifecycle state.
pub struct SessionRegistry {
    service: Arc<dyn KernelService>,
    sessions: RwLock<Vec<Session>>,
    events: broadcast::Sender<SessionEvent>,
    default_kernel: String,
}

impl SessionRegistry {
    pub fn new(service: Arc<dyn KernelService>) -> Self {
        Self::with_default_kernel(service, DEFAULT_KERNEL)
    }

    /// `default_kernel` is started when `start_session` gets no language.
    pub fn with_default_kernel(
        service: Arc<dyn KernelService>,
        default_kernel: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            service,
            sessions: RwLock::new(Vec::new()),
            events,
            default_kernel: default_kernel.into(),
        }
    }

    pub fn service(&self) -> &Arc<dyn KernelService> {
        &self.service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        self.sessions.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.iter().find(|s| s.id == id).cloned()
    }

    pub async fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.get(id).await.map(|s| s.state)
    }

    /// Start a kernel for `language_hint` (or the default kernel).
    ///
    /// The new session is `starting`; it turns `idle` once a later refresh
    /// or probe sees the server report readiness.
    pub async fn start_session(&self, language_hint: Option<&str>) -> Result<Session, SessionError> {
        let kernel_name = language_hint
            .map(kernel_name_for_language)
            .unwrap_or_else(|| self.default_kernel.clone());

        info!("[registry] Starting {} session", kernel_name);
        let model = self
            .service
            .start_kernel(&kernel_name)
            .await
            .map_err(SessionError::Start)?;

        let session = Session::from_model(&model, LifecycleState::Starting);
        {
            let mut sessions = self.sessions.write().await;
            sessions.retain(|s| s.id != session.id);
            sessions.push(session.clone());
        }
        info!("[registry] Session {} started ({})", session.id, session.name);
        self.emit(SessionEvent::Added(session.clone()));
        Ok(session)
    }

    /// Shut a kernel down and forget it.
    ///
    /// The remote call is made even for ids the registry does not know; on
    /// failure the registry is left as it was.
    pub async fn stop_session(&self, id: &str) -> Result<(), SessionError> {
        info!("[registry] Stopping session {}", id);
        self.service
            .shutdown_kernel(id)
            .await
            .map_err(|source| SessionError::Stop {
                id: id.to_string(),
                source,
            })?;

        let removed = {
            let mut sessions = self.sessions.write().await;
            let before = sessions.len();
            sessions.retain(|s| s.id != id);
            sessions.len() != before
        };
        if removed {
            self.emit(SessionEvent::Removed { id: id.to_string() });
        }
        Ok(())
    }

    /// Restart a kernel. The session goes back to `starting`.
    ///
    /// Executions running on the session are orphaned; the coordinator
    /// learns about it through [`SessionEvent::Restarted`].
    pub async fn restart_session(&self, id: &str) -> Result<Session, SessionError> {
        info!("[registry] Restarting session {}", id);
        let model = self
            .service
            .restart_kernel(id)
            .await
            .map_err(|source| SessionError::Restart {
                id: id.to_string(),
                source,
            })?;

        let (session, added) = {
            let mut sessions = self.sessions.write().await;
            match sessions.iter_mut().find(|s| s.id == id) {
                Some(existing) => {
                    existing.state = LifecycleState::Starting;
                    (existing.clone(), false)
                }
                None => {
                    let session = Session::from_model(&model, LifecycleState::Starting);
                    sessions.push(session.clone());
                    (session, true)
                }
            }
        };

        if added {
            self.emit(SessionEvent::Added(session.clone()));
        } else {
            self.emit(SessionEvent::Restarted { id: id.to_string() });
        }
        Ok(session)
    }

    /// Re-fetch the kernel list and reconcile.
    ///
    /// - sessions the server no longer lists are removed
    /// - sessions already dead locally are evicted
    /// - unknown kernels are added (as `idle` unless the server says otherwise)
    /// - a reported `execution_state` overrides the local state
    /// - kernels the server reports dead are announced and evicted
    pub async fn refresh(&self) -> Result<Vec<Session>, SessionError> {
        let models = self
            .service
            .list_kernels()
            .await
            .map_err(SessionError::Refresh)?;

        let mut events = Vec::new();
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let mut next = Vec::with_capacity(models.len());

            for model in &models {
                let reported = model
                    .execution_state
                    .as_deref()
                    .and_then(LifecycleState::from_execution_state);

                match sessions.iter().find(|s| s.id == model.id) {
                    Some(existing) if existing.state == LifecycleState::Dead => {
                        events.push(SessionEvent::Removed {
                            id: existing.id.clone(),
                        });
                    }
                    Some(existing) => {
                        let mut session = existing.clone();
                        if let Some(state) = reported {
                            if state != session.state {
                                session.state = state;
                                events.push(SessionEvent::StateChanged {
                                    id: session.id.clone(),
                                    state,
                                });
                            }
                        }
                        next.push(session);
                    }
                    None => {
                        let session = Session::from_model(
                            model,
                            reported.unwrap_or(LifecycleState::Idle),
                        );
                        events.push(SessionEvent::Added(session.clone()));
                        next.push(session);
                    }
                }
            }

            for gone in sessions.iter().filter(|s| !models.iter().any(|m| m.id == s.id)) {
                events.push(SessionEvent::Removed {
                    id: gone.id.clone(),
                });
            }

            next.retain(|s| {
                if s.state == LifecycleState::Dead {
                    events.push(SessionEvent::Died { id: s.id.clone() });
                    false
                } else {
                    true
                }
            });

            *sessions = next;
            sessions.clone()
        };

        debug!(
            "[registry] Refreshed: {} sessions, {} changes",
            snapshot.len(),
            events.len()
        );
        for event in events {
            self.emit(event);
        }
        Ok(snapshot)
    }

    /// Ask the server about one session and record what it says.
    ///
    /// Fails with `Unreachable` when the server cannot be asked, does not
    /// know the kernel, or reports it dead.
    pub async fn probe(&self, id: &str) -> Result<LifecycleState, SessionError> {
        let unreachable = |reason: String| SessionError::Unreachable {
            id: id.to_string(),
            reason,
        };

        let model = match self.service.get_kernel(id).await {
            Ok(model) => model,
            Err(ApiError::NotFound(_)) => {
                self.observe(id, LifecycleState::Dead).await;
                return Err(unreachable("kernel no longer exists".to_string()));
            }
            Err(e) => return Err(unreachable(e.to_string())),
        };

        let reported = model
            .execution_state
            .as_deref()
            .and_then(LifecycleState::from_execution_state);
        if let Some(state) = reported {
            self.observe(id, state).await;
        }

        let state = match self.state_of(id).await {
            Some(state) => state,
            None => reported.unwrap_or(LifecycleState::Idle),
        };
        if state == LifecycleState::Dead {
            return Err(unreachable("session is dead".to_string()));
        }
        Ok(state)
    }

    /// Record an observed state. Returns whether anything changed.
    ///
    /// Observations for unknown sessions are ignored, and a dead session
    /// stays dead.
    pub async fn observe(&self, id: &str, state: LifecycleState) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.iter_mut().find(|s| s.id == id) else {
                return false;
            };
            if session.state == state || session.state == LifecycleState::Dead {
                return false;
            }
            session.state = state;
        }

        debug!("[registry] Session {} is now {}", id, state);
        self.emit(SessionEvent::StateChanged {
            id: id.to_string(),
            state,
        });
        if state == LifecycleState::Dead {
            warn!("[registry] Session {} died", id);
            self.emit(SessionEvent::Died { id: id.to_string() });
        }
        true
    }

    /// Poll one session until it leaves `starting`.
    pub async fn await_ready(
        &self,
        id: &str,
        interval: Duration,
        attempts: u32,
    ) -> Result<Session, SessionError> {
        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::time::sleep(interval).await;
            }
            if self.probe(id).await? != LifecycleState::Starting {
                return self.get(id).await.ok_or_else(|| SessionError::Unreachable {
                    id: id.to_string(),
                    reason: "session is not registered".to_string(),
                });
            }
        }
        Err(SessionError::NotReady {
            id: id.to_string(),
            state: LifecycleState::Starting,
        })
    }
}
