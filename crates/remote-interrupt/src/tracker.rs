//! Tracks the current session and keeps its remote identity up to date.
//!
//! State machine per tracked session:
//!
//! ```text
//!   Unbound ──select──▶ AwaitingReady ──resolution──▶ Bound
//!      ▲                    ▲                           │
//!      │                    └──restart / kernel change──┤
//!      └──────────────disconnect / close────────────────┘
//! ```
//!
//! Invalidation happens synchronously inside the event handler. Resolution
//! runs on a spawned task that remembers the generation it started under;
//! when it completes it writes only if the tracker is still on that
//! generation and session, so a late result never resurrects a stale pid.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::broadcast::error::RecvError;

use crate::host::{HostEvent, SessionSource, Subscription};
use crate::identity::{RemoteIdentity, ResolutionOutcome};
use crate::introspect::ReadinessSignal;
use crate::resolver::IdentityResolver;
use crate::session::{KernelInfo, SessionHandle, SessionId, SessionStatus};

/// Pause between "session ready" and the introspection request, giving the
/// remote kernel's environment time to come up.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on waiting for a selected session to become ready.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub settle_delay: Duration,
    pub ready_timeout: Duration,
    /// Ask the kernel (heartbeat) before falling back to `settle_delay`
    pub use_readiness_probe: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            use_readiness_probe: true,
        }
    }
}

/// Tracker lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerState {
    /// No session tracked
    Unbound,
    /// Session selected, waiting for it to be ready and resolved
    AwaitingReady { session_id: SessionId },
    /// Resolution attempted (the identity may still be empty)
    Bound { session_id: SessionId },
}

struct Tracked {
    state: TrackerState,
    identity: RemoteIdentity,
    generation: u64,
    /// Kept across a disconnect so a reconnect can rebind it
    session: Option<SessionHandle>,
}

impl Tracked {
    fn tracks(&self, session_id: &SessionId) -> bool {
        self.session.as_ref().is_some_and(|s| s.id() == session_id)
    }
}

/// Owner of the "current identity" slot read by the interrupt trigger.
#[derive(Clone)]
pub struct SessionTracker {
    resolver: Arc<IdentityResolver>,
    config: TrackerConfig,
    tracked: Arc<StdMutex<Tracked>>,
}

impl SessionTracker {
    pub fn new(resolver: Arc<IdentityResolver>, config: TrackerConfig) -> Self {
        Self {
            resolver,
            config,
            tracked: Arc::new(StdMutex::new(Tracked {
                state: TrackerState::Unbound,
                identity: RemoteIdentity::empty(),
                generation: 0,
                session: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    /// Latest identity of the tracked session (empty if unknown).
    pub fn current_identity(&self) -> RemoteIdentity {
        self.lock().identity.clone()
    }

    pub fn state(&self) -> TrackerState {
        self.lock().state.clone()
    }

    pub fn current_session(&self) -> Option<SessionHandle> {
        self.lock().session.clone()
    }

    /// Non-blocking resolution view of the tracked session.
    pub fn outcome(&self) -> ResolutionOutcome {
        let tracked = self.lock();
        match (&tracked.state, tracked.identity.is_complete()) {
            (_, true) => ResolutionOutcome::Resolved(tracked.identity.clone()),
            (TrackerState::AwaitingReady { .. }, false) => ResolutionOutcome::Pending,
            _ => ResolutionOutcome::Unavailable,
        }
    }

    /// Start listening to `source`.
    ///
    /// Waits for the host to finish restoring, adopts whichever open session
    /// is visible, then follows live events until the returned subscription
    /// is dropped.
    pub fn attach(&self, source: Arc<dyn SessionSource>) -> Subscription {
        let tracker = self.clone();
        Subscription::new(tokio::spawn(async move { tracker.run(source).await }))
    }

    async fn run(&self, source: Arc<dyn SessionSource>) {
        source.restored().await;
        let mut events = source.subscribe();

        // The host's "current" pointer is not trustworthy right after a
        // restore with several sessions open; the visible one is.
        self.adopt_visible(source.as_ref());

        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(
                        "[tracker] Missed {} host events, dropping cache and rescanning",
                        skipped
                    );
                    self.resolver.invalidate_all();
                    self.adopt_visible(source.as_ref());
                }
                Err(RecvError::Closed) => {
                    info!("[tracker] Host event stream closed");
                    break;
                }
            }
        }
    }

    fn adopt_visible(&self, source: &dyn SessionSource) {
        match source.open_sessions().into_iter().find(|s| s.is_visible()) {
            Some(session) => {
                debug!("[tracker] Adopting visible session {}", session.id());
                self.session_became_current(session);
            }
            None => debug!("[tracker] No visible session"),
        }
    }

    /// Apply one host event. Invalidation takes effect before this returns.
    pub fn handle_event(&self, event: HostEvent) {
        match event {
            HostEvent::SessionBecameCurrent(session) => self.session_became_current(session),
            HostEvent::StatusChanged { session_id, status } => {
                self.status_changed(&session_id, status)
            }
            HostEvent::KernelChanged { session_id, kernel } => {
                self.kernel_changed(&session_id, kernel)
            }
            HostEvent::SessionClosed { session_id } => self.session_closed(&session_id),
        }
    }

    /// Track `session` and resolve its identity once it is ready.
    pub fn session_became_current(&self, session: SessionHandle) {
        let generation = {
            let mut tracked = self.lock();
            tracked.generation += 1;
            tracked.identity = RemoteIdentity::unresolved(display_name(session.kernel()));
            tracked.state = TrackerState::AwaitingReady {
                session_id: session.id().clone(),
            };
            tracked.session = Some(session.clone());
            tracked.generation
        };
        info!(
            "[tracker] Session {} ({}) became current",
            session.id(),
            session.path()
        );
        self.spawn_resolution(session, generation);
    }

    fn status_changed(&self, session_id: &SessionId, status: SessionStatus) {
        debug!("[tracker] Session {} status: {}", session_id, status);
        match status {
            SessionStatus::Restarting => {
                self.resolver.invalidate(session_id);
                self.rebind(session_id);
            }
            SessionStatus::Disconnected | SessionStatus::Dead => {
                self.resolver.invalidate(session_id);
                let mut tracked = self.lock();
                if tracked.tracks(session_id) {
                    tracked.generation += 1;
                    tracked.identity = RemoteIdentity::empty();
                    tracked.state = TrackerState::Unbound;
                    info!("[tracker] Session {} {}, identity cleared", session_id, status);
                }
            }
            SessionStatus::Connected => {
                let session = {
                    let tracked = self.lock();
                    // Pending resolutions are left alone. A resolution that
                    // ended without an identity starts over.
                    let reconnect = tracked.tracks(session_id)
                        && match tracked.state {
                            TrackerState::Unbound => true,
                            TrackerState::Bound { .. } => !tracked.identity.is_complete(),
                            TrackerState::AwaitingReady { .. } => false,
                        };
                    if reconnect {
                        tracked.session.clone()
                    } else {
                        None
                    }
                };
                if let Some(session) = session {
                    self.session_became_current(session);
                }
            }
            SessionStatus::Connecting => {}
        }
    }

    fn kernel_changed(&self, session_id: &SessionId, kernel: Option<KernelInfo>) {
        debug!(
            "[tracker] Session {} kernel changed to {:?}",
            session_id,
            kernel.as_ref().map(|k| k.id.as_str())
        );
        self.resolver.invalidate(session_id);
        self.rebind(session_id);
    }

    fn session_closed(&self, session_id: &SessionId) {
        self.resolver.remove(session_id);
        let mut tracked = self.lock();
        if tracked.tracks(session_id) {
            tracked.generation += 1;
            tracked.identity = RemoteIdentity::empty();
            tracked.state = TrackerState::Unbound;
            tracked.session = None;
            info!("[tracker] Session {} closed", session_id);
        }
    }

    /// Restart resolution for the tracked session after its kernel changed.
    fn rebind(&self, session_id: &SessionId) {
        let session = {
            let tracked = self.lock();
            if !tracked.tracks(session_id) {
                return;
            }
            tracked.session.clone()
        };
        if let Some(session) = session {
            self.session_became_current(session);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn spawn_resolution(&self, session: SessionHandle, generation: u64) {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.resolve_when_ready(session, generation).await });
    }

    async fn resolve_when_ready(&self, session: SessionHandle, generation: u64) {
        let kernel = match tokio::time::timeout(self.config.ready_timeout, session.ready()).await
        {
            Ok(kernel) => kernel,
            Err(_) => {
                warn!(
                    "[tracker] Session {} not ready after {:?}",
                    session.id(),
                    self.config.ready_timeout
                );
                self.apply(generation, session.id(), ResolutionOutcome::Unavailable);
                return;
            }
        };

        if !self.is_current(generation) {
            debug!("[tracker] Session {} superseded before resolution", session.id());
            return;
        }

        self.settle(&session, &kernel).await;

        if !self.is_current(generation) {
            debug!("[tracker] Session {} superseded while settling", session.id());
            return;
        }

        let outcome = self.resolver.resolve(&session).await;
        self.apply(generation, session.id(), outcome);
    }

    /// Give a freshly started remote kernel time before introspecting it.
    async fn settle(&self, session: &SessionHandle, kernel: &KernelInfo) {
        if !self.resolver.scheme().needs_introspection()
            || self.resolver.cached(session.id()).is_some()
        {
            return;
        }

        if self.config.use_readiness_probe {
            let signal = self.resolver.introspector().probe_ready(kernel).await;
            if signal == ReadinessSignal::Ready {
                debug!("[tracker] Kernel {} answered readiness probe", kernel.id);
                return;
            }
        }

        tokio::time::sleep(self.config.settle_delay).await;
    }

    /// Write a resolution result if it still belongs to the tracked session.
    fn apply(&self, generation: u64, session_id: &SessionId, outcome: ResolutionOutcome) -> bool {
        let mut tracked = self.lock();
        if tracked.generation != generation || !tracked.tracks(session_id) {
            debug!(
                "[tracker] Discarding stale resolution for session {}",
                session_id
            );
            return false;
        }

        match outcome {
            ResolutionOutcome::Resolved(identity) => {
                info!("[tracker] Session {} resolved: {}", session_id, identity);
                tracked.identity = identity;
            }
            ResolutionOutcome::Pending | ResolutionOutcome::Unavailable => {
                info!("[tracker] Session {} has no remote identity", session_id);
            }
        }
        tracked.state = TrackerState::Bound {
            session_id: session_id.clone(),
        };
        true
    }
}

fn display_name(kernel: Option<KernelInfo>) -> String {
    kernel.map(|k| k.display_name).unwrap_or_default()
}
