//! Host-side session model.
//!
//! A session is one open notebook bound to one kernel. The host application
//! owns sessions and mutates them; this crate only reads them and waits on
//! their readiness. State lives in a `tokio::sync::watch` channel so waiters
//! wake as soon as the host flips a session to connected.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Stable session identifier.
///
/// This is the host's session id, not a window or tab label: labels can
/// point at the wrong notebook right after a restore with several tabs open.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection/lifecycle status of a session's kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Kernel is starting or the websocket is connecting
    #[default]
    Connecting,
    /// Kernel is up and reachable
    Connected,
    /// Kernel restart in progress
    Restarting,
    /// Connection to the kernel dropped
    Disconnected,
    /// Kernel died and will not come back
    Dead,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Connected => write!(f, "connected"),
            SessionStatus::Restarting => write!(f, "restarting"),
            SessionStatus::Disconnected => write!(f, "disconnected"),
            SessionStatus::Dead => write!(f, "dead"),
        }
    }
}

/// The kernel currently bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    /// Kernel id assigned by the notebook server
    pub id: String,
    /// Display name from the kernelspec (e.g. "SSH gpu-node:python3")
    pub display_name: String,
    /// Jupyter connection file, needed for the introspection side channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_file: Option<PathBuf>,
}

impl KernelInfo {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            connection_file: None,
        }
    }

    pub fn with_connection_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.connection_file = Some(path.into());
        self
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub kernel: Option<KernelInfo>,
    pub status: SessionStatus,
    /// Whether the session's panel is the foreground one
    pub visible: bool,
}

impl SessionSnapshot {
    /// A session is ready once a kernel is bound and connected.
    pub fn is_ready(&self) -> bool {
        self.kernel.is_some() && self.status == SessionStatus::Connected
    }
}

struct SessionInner {
    id: SessionId,
    path: String,
    state: watch::Sender<SessionSnapshot>,
}

/// Cheaply cloneable handle to a host session.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl SessionHandle {
    pub fn new(id: impl Into<SessionId>, path: impl Into<String>) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::default());
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                path: path.into(),
                state,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn kernel(&self) -> Option<KernelInfo> {
        self.inner.state.borrow().kernel.clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.state.borrow().status
    }

    pub fn is_visible(&self) -> bool {
        self.inner.state.borrow().visible
    }

    pub fn set_kernel(&self, kernel: Option<KernelInfo>) {
        self.inner.state.send_modify(|state| state.kernel = kernel);
    }

    pub fn set_status(&self, status: SessionStatus) {
        self.inner.state.send_modify(|state| state.status = status);
    }

    pub fn set_visible(&self, visible: bool) {
        self.inner.state.send_modify(|state| state.visible = visible);
    }

    /// Wait until the session has a connected kernel, returning that kernel.
    pub async fn ready(&self) -> KernelInfo {
        let mut rx = self.inner.state.subscribe();
        loop {
            {
                let state = rx.borrow_and_update();
                if let (true, Some(kernel)) = (state.is_ready(), state.kernel.as_ref()) {
                    return kernel.clone();
                }
            }
            // The sender lives in `inner`, which we hold, so this cannot fail
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Two handles are the same session when they share the session id.
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        self.inner.id == other.inner.id
    }
}
