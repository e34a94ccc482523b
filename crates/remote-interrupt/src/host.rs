//! Host application lifecycle events.
//!
//! The host (a notebook front end, a daemon, a test) owns the sessions and
//! tells us what happens to them through [`HostEvent`]s on a broadcast
//! channel. [`SessionHub`] is an in-process [`SessionSource`] that embedders
//! drive directly.

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::session::{KernelInfo, SessionHandle, SessionId, SessionStatus};

/// Events fired by the host application.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// The user switched to this session (or it became visible again).
    SessionBecameCurrent(SessionHandle),
    /// A session's kernel connection/lifecycle status changed.
    StatusChanged {
        session_id: SessionId,
        status: SessionStatus,
    },
    /// A different kernel was bound to the session.
    KernelChanged {
        session_id: SessionId,
        kernel: Option<KernelInfo>,
    },
    /// The session was closed.
    SessionClosed { session_id: SessionId },
}

impl HostEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            HostEvent::SessionBecameCurrent(session) => session.id(),
            HostEvent::StatusChanged { session_id, .. }
            | HostEvent::KernelChanged { session_id, .. }
            | HostEvent::SessionClosed { session_id } => session_id,
        }
    }
}

/// Where the tracker gets sessions and their events from.
#[async_trait]
pub trait SessionSource: Send + Sync {
    /// Subscribe to lifecycle events from now on.
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;

    /// All sessions the host currently has open.
    fn open_sessions(&self) -> Vec<SessionHandle>;

    /// Resolves once the host finished restoring previously open sessions.
    async fn restored(&self);
}

/// Handle to a running listener. The listener stops when the handle is
/// disposed or dropped.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the listener.
    pub fn dispose(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Default capacity of the host event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// In-process session source.
pub struct SessionHub {
    sessions: StdMutex<Vec<SessionHandle>>,
    events: broadcast::Sender<HostEvent>,
    restored: watch::Sender<bool>,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionHub {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (restored, _) = watch::channel(false);
        Self {
            sessions: StdMutex::new(Vec::new()),
            events,
            restored,
        }
    }

    fn sessions(&self) -> std::sync::MutexGuard<'_, Vec<SessionHandle>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: HostEvent) {
        debug!("[host] {} for session {}", event_name(&event), event.session_id());
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Register an open session without selecting it.
    pub fn open(&self, session: SessionHandle) {
        let mut sessions = self.sessions();
        sessions.retain(|s| !s.same_session(&session));
        sessions.push(session);
    }

    pub fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions()
            .iter()
            .find(|s| s.id() == session_id)
            .cloned()
    }

    /// Bring a session to the foreground. Returns false for unknown ids.
    pub fn select(&self, session_id: &SessionId) -> bool {
        let selected = {
            let sessions = self.sessions();
            let mut selected = None;
            for session in sessions.iter() {
                let is_target = session.id() == session_id;
                session.set_visible(is_target);
                if is_target {
                    selected = Some(session.clone());
                }
            }
            selected
        };
        match selected {
            Some(session) => {
                self.emit(HostEvent::SessionBecameCurrent(session));
                true
            }
            None => false,
        }
    }

    pub fn set_status(&self, session_id: &SessionId, status: SessionStatus) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        session.set_status(status);
        self.emit(HostEvent::StatusChanged {
            session_id: session_id.clone(),
            status,
        });
        true
    }

    pub fn change_kernel(&self, session_id: &SessionId, kernel: Option<KernelInfo>) -> bool {
        let Some(session) = self.get(session_id) else {
            return false;
        };
        session.set_kernel(kernel.clone());
        self.emit(HostEvent::KernelChanged {
            session_id: session_id.clone(),
            kernel,
        });
        true
    }

    pub fn close(&self, session_id: &SessionId) -> bool {
        let removed = {
            let mut sessions = self.sessions();
            let before = sessions.len();
            sessions.retain(|s| s.id() != session_id);
            before != sessions.len()
        };
        if removed {
            self.emit(HostEvent::SessionClosed {
                session_id: session_id.clone(),
            });
        }
        removed
    }

    /// Signal that restoring previously open sessions is complete.
    pub fn mark_restored(&self) {
        self.restored.send_replace(true);
    }
}

fn event_name(event: &HostEvent) -> &'static str {
    match event {
        HostEvent::SessionBecameCurrent(_) => "session_became_current",
        HostEvent::StatusChanged { .. } => "status_changed",
        HostEvent::KernelChanged { .. } => "kernel_changed",
        HostEvent::SessionClosed { .. } => "session_closed",
    }
}

#[async_trait]
impl SessionSource for SessionHub {
    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn open_sessions(&self) -> Vec<SessionHandle> {
        self.sessions().clone()
    }

    async fn restored(&self) {
        let mut rx = self.restored.subscribe();
        // The sender lives as long as the hub we borrow
        let _ = rx.wait_for(|restored| *restored).await;
    }
}
