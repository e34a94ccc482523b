//! Session → remote identity resolution with a per-session cache.
//!
//! The cache is keyed by [`SessionId`] and owned here; the tracker only asks
//! for invalidation. Each session id carries an epoch that changes on every
//! invalidation, so an introspection that started before a restart cannot
//! write its (now wrong) pid into the cache when it finally completes.
//!
//! Concurrent resolutions for the same session share one in-flight
//! introspection. The introspection runs on its own task, so a caller that
//! gives up waiting does not stall the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use log::{debug, info, warn};

use crate::error::IntrospectionError;
use crate::identity::{AddressingScheme, RemoteIdentity, ResolutionOutcome};
use crate::introspect::{introspect, HostPid, KernelIntrospector};
use crate::session::{KernelInfo, SessionHandle, SessionId};

/// Default upper bound on one introspection round trip.
pub const DEFAULT_INTROSPECTION_TIMEOUT: Duration = Duration::from_secs(10);

type PendingOutcome = Shared<BoxFuture<'static, ResolutionOutcome>>;

struct InFlight {
    epoch: u64,
    outcome: PendingOutcome,
}

#[derive(Default)]
struct CacheState {
    /// Resolved identities: session_id -> identity
    entries: HashMap<SessionId, RemoteIdentity>,
    /// Current epoch per session id
    epochs: HashMap<SessionId, u64>,
    next_epoch: u64,
    in_flight: HashMap<SessionId, InFlight>,
}

impl CacheState {
    fn epoch_for(&mut self, session_id: &SessionId) -> u64 {
        if let Some(epoch) = self.epochs.get(session_id) {
            return *epoch;
        }
        self.bump(session_id)
    }

    fn bump(&mut self, session_id: &SessionId) -> u64 {
        self.next_epoch += 1;
        self.epochs.insert(session_id.clone(), self.next_epoch);
        self.next_epoch
    }
}

fn lock(state: &StdMutex<CacheState>) -> MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves and caches the remote identity of sessions.
pub struct IdentityResolver {
    introspector: Arc<dyn KernelIntrospector>,
    scheme: AddressingScheme,
    introspection_timeout: Duration,
    state: Arc<StdMutex<CacheState>>,
}

impl IdentityResolver {
    pub fn new(introspector: Arc<dyn KernelIntrospector>, scheme: AddressingScheme) -> Self {
        Self {
            introspector,
            scheme,
            introspection_timeout: DEFAULT_INTROSPECTION_TIMEOUT,
            state: Arc::new(StdMutex::new(CacheState::default())),
        }
    }

    pub fn with_introspection_timeout(mut self, timeout: Duration) -> Self {
        self.introspection_timeout = timeout;
        self
    }

    pub fn scheme(&self) -> AddressingScheme {
        self.scheme
    }

    pub fn introspector(&self) -> &Arc<dyn KernelIntrospector> {
        &self.introspector
    }

    /// Resolve the remote identity of `session`.
    ///
    /// A cached identity is returned without contacting the kernel.
    pub async fn resolve(&self, session: &SessionHandle) -> ResolutionOutcome {
        let Some(kernel) = session.kernel() else {
            debug!("[resolver] Session {} has no kernel", session.id());
            return ResolutionOutcome::Unavailable;
        };

        if !self.scheme.needs_introspection() {
            if kernel.id.is_empty() {
                return ResolutionOutcome::Unavailable;
            }
            return ResolutionOutcome::Resolved(RemoteIdentity::from_kernel_id(
                kernel.id,
                kernel.display_name,
            ));
        }

        let session_id = session.id().clone();
        let pending = {
            let mut state = lock(&self.state);
            if let Some(identity) = state.entries.get(&session_id) {
                debug!("[resolver] Cache hit for session {}: {}", session_id, identity);
                return ResolutionOutcome::Resolved(identity.clone());
            }

            let epoch = state.epoch_for(&session_id);
            match state.in_flight.get(&session_id) {
                Some(in_flight) if in_flight.epoch == epoch => {
                    debug!(
                        "[resolver] Joining in-flight introspection for session {}",
                        session_id
                    );
                    in_flight.outcome.clone()
                }
                _ => {
                    let outcome = self.spawn_introspection(session_id.clone(), epoch, kernel);
                    state.in_flight.insert(
                        session_id,
                        InFlight {
                            epoch,
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        pending.await
    }

    fn spawn_introspection(
        &self,
        session_id: SessionId,
        epoch: u64,
        kernel: KernelInfo,
    ) -> PendingOutcome {
        let introspector = self.introspector.clone();
        let state = self.state.clone();
        let timeout = self.introspection_timeout;
        let scheme = self.scheme;

        info!(
            "[resolver] Introspecting kernel {} ('{}') for session {}",
            kernel.id, kernel.display_name, session_id
        );

        let task = tokio::spawn(async move {
            let result = tokio::time::timeout(timeout, introspect(introspector.as_ref(), &kernel))
                .await
                .unwrap_or(Err(IntrospectionError::Timeout));

            let outcome = match result {
                Ok(HostPid { host, pid }) => {
                    let mut identity =
                        RemoteIdentity::from_host_pid(host, pid, kernel.display_name.clone());
                    if scheme == AddressingScheme::Both {
                        identity = identity.with_kernel_id(kernel.id.clone());
                    }
                    ResolutionOutcome::Resolved(identity)
                }
                Err(e) => {
                    warn!(
                        "[resolver] Introspection failed for session {} ({}): {}",
                        session_id,
                        e.kind(),
                        e
                    );
                    ResolutionOutcome::Unavailable
                }
            };

            commit(&state, &session_id, epoch, outcome)
        });

        async move { task.await.unwrap_or(ResolutionOutcome::Unavailable) }
            .boxed()
            .shared()
    }

    /// Drop the cached identity of a session whose kernel restarted, changed
    /// or disconnected. In-flight introspections for it become stale.
    pub fn invalidate(&self, session_id: &SessionId) {
        let mut state = lock(&self.state);
        let had_entry = state.entries.remove(session_id).is_some();
        state.in_flight.remove(session_id);
        state.bump(session_id);
        if had_entry {
            info!("[resolver] Invalidated cache entry for session {}", session_id);
        }
    }

    /// Drop every cached identity, e.g. after missing host events.
    pub fn invalidate_all(&self) {
        let mut state = lock(&self.state);
        let dropped = state.entries.len();
        state.entries.clear();
        state.in_flight.clear();
        let ids: Vec<SessionId> = state.epochs.keys().cloned().collect();
        for session_id in &ids {
            state.bump(session_id);
        }
        info!("[resolver] Invalidated all {} cache entries", dropped);
    }

    /// Forget a closed session entirely.
    pub fn remove(&self, session_id: &SessionId) {
        let mut state = lock(&self.state);
        state.entries.remove(session_id);
        state.in_flight.remove(session_id);
        state.epochs.remove(session_id);
        debug!("[resolver] Removed session {}", session_id);
    }

    pub fn cached(&self, session_id: &SessionId) -> Option<RemoteIdentity> {
        lock(&self.state).entries.get(session_id).cloned()
    }

    /// Non-blocking view of a session's resolution state.
    pub fn poll(&self, session_id: &SessionId) -> ResolutionOutcome {
        let state = lock(&self.state);
        if let Some(identity) = state.entries.get(session_id) {
            ResolutionOutcome::Resolved(identity.clone())
        } else if state.in_flight.contains_key(session_id) {
            ResolutionOutcome::Pending
        } else {
            ResolutionOutcome::Unavailable
        }
    }

    pub fn cache_len(&self) -> usize {
        lock(&self.state).entries.len()
    }
}

/// Record an introspection result unless the session was invalidated while
/// it ran.
fn commit(
    state: &StdMutex<CacheState>,
    session_id: &SessionId,
    epoch: u64,
    outcome: ResolutionOutcome,
) -> ResolutionOutcome {
    let mut state = lock(state);
    if state
        .in_flight
        .get(session_id)
        .is_some_and(|in_flight| in_flight.epoch == epoch)
    {
        state.in_flight.remove(session_id);
    }

    if state.epochs.get(session_id) != Some(&epoch) {
        debug!(
            "[resolver] Discarding stale introspection for session {}",
            session_id
        );
        return ResolutionOutcome::Unavailable;
    }

    if let ResolutionOutcome::Resolved(identity) = &outcome {
        info!("[resolver] Resolved session {}: {}", session_id, identity);
        state.entries.insert(session_id.clone(), identity.clone());
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStatus;
    use crate::test_support::FakeIntrospector;

    fn connected_session(id: &str, display_name: &str) -> SessionHandle {
        let session = SessionHandle::new(id, format!("{id}.ipynb"));
        session.set_kernel(Some(KernelInfo::new(format!("kernel-{id}"), display_name)));
        session.set_status(SessionStatus::Connected);
        session
    }

    #[tokio::test]
    async fn test_resolve_and_cache() {
        let fake = Arc::new(FakeIntrospector::ok("gpu-node-3", 4821));
        let resolver = IdentityResolver::new(fake.clone(), AddressingScheme::HostPid);
        let session = connected_session("s1", "SSH gpu");

        let outcome = resolver.resolve(&session).await;
        assert_eq!(
            outcome,
            ResolutionOutcome::Resolved(RemoteIdentity::from_host_pid(
                "gpu-node-3",
                4821,
                "SSH gpu"
            ))
        );
        assert_eq!(fake.calls(), 1);
        assert_eq!(fake.last_code().as_deref(), Some("import os"));

        // Re-selecting must not go back to the kernel
        let again = resolver.resolve(&session).await;
        assert_eq!(again, outcome);
        assert_eq!(fake.calls(), 1);
        assert_eq!(resolver.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_introspection_is_not_cached() {
        let fake = Arc::new(FakeIntrospector::host_missing(4821));
        let resolver = IdentityResolver::new(fake.clone(), AddressingScheme::HostPid);
        let session = connected_session("s1", "SSH gpu");

        assert_eq!(
            resolver.resolve(&session).await,
            ResolutionOutcome::Unavailable
        );
        assert!(resolver.cached(session.id()).is_none());

        // Next attempt goes back to the kernel
        resolver.resolve(&session).await;
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn test_kernel_id_scheme_skips_introspection() {
        let fake = Arc::new(FakeIntrospector::ok("h", 1));
        let resolver = IdentityResolver::new(fake.clone(), AddressingScheme::KernelId);
        let session = connected_session("s1", "SSH gpu");

        let outcome = resolver.resolve(&session).await;
        assert_eq!(
            outcome,
            ResolutionOutcome::Resolved(RemoteIdentity::from_kernel_id("kernel-s1", "SSH gpu"))
        );
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn test_both_scheme_carries_kernel_id() {
        let fake = Arc::new(FakeIntrospector::ok("h", 12));
        let resolver = IdentityResolver::new(fake, AddressingScheme::Both);
        let session = connected_session("s1", "SSH gpu");

        let identity = resolver.resolve(&session).await.identity().cloned().unwrap();
        assert_eq!(identity.host.as_deref(), Some("h"));
        assert_eq!(identity.pid, Some(12));
        assert_eq!(identity.kernel_id.as_deref(), Some("kernel-s1"));
    }

    #[tokio::test]
    async fn test_session_without_kernel() {
        let fake = Arc::new(FakeIntrospector::ok("h", 1));
        let resolver = IdentityResolver::new(fake.clone(), AddressingScheme::HostPid);
        let session = SessionHandle::new("s1", "a.ipynb");
        assert_eq!(
            resolver.resolve(&session).await,
            ResolutionOutcome::Unavailable
        );
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_are_coalesced() {
        let (fake, gate) = FakeIntrospector::gated("h", 5);
        let fake = Arc::new(fake);
        let resolver = Arc::new(IdentityResolver::new(fake.clone(), AddressingScheme::HostPid));
        let session = connected_session("s1", "SSH gpu");

        let first = {
            let (resolver, session) = (resolver.clone(), session.clone());
            tokio::spawn(async move { resolver.resolve(&session).await })
        };
        let second = {
            let (resolver, session) = (resolver.clone(), session.clone());
            tokio::spawn(async move { resolver.resolve(&session).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(resolver.poll(session.id()), ResolutionOutcome::Pending);

        gate.add_permits(10);
        let (a, b) = (first.await.unwrap(), second.await.unwrap());
        assert!(a.is_resolved());
        assert_eq!(a, b);
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_during_introspection_discards_result() {
        let (fake, gate) = FakeIntrospector::gated("old-host", 100);
        let fake = Arc::new(fake);
        let resolver = Arc::new(IdentityResolver::new(fake.clone(), AddressingScheme::HostPid));
        let session = connected_session("s1", "SSH gpu");

        let pending = {
            let (resolver, session) = (resolver.clone(), session.clone());
            tokio::spawn(async move { resolver.resolve(&session).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        resolver.invalidate(session.id());
        gate.add_permits(10);

        assert_eq!(pending.await.unwrap(), ResolutionOutcome::Unavailable);
        assert!(resolver.cached(session.id()).is_none());

        // A fresh resolution after the restart reaches the kernel again
        fake.set_ok("new-host", 200);
        let identity = resolver.resolve(&session).await.identity().cloned().unwrap();
        assert_eq!(identity.pid, Some(200));
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_and_remove() {
        let fake = Arc::new(FakeIntrospector::ok("h", 1));
        let resolver = IdentityResolver::new(fake.clone(), AddressingScheme::HostPid);
        let session = connected_session("s1", "SSH gpu");

        resolver.resolve(&session).await;
        assert!(resolver.cached(session.id()).is_some());

        resolver.invalidate(session.id());
        assert!(resolver.cached(session.id()).is_none());
        assert_eq!(resolver.poll(session.id()), ResolutionOutcome::Unavailable);

        resolver.resolve(&session).await;
        resolver.remove(session.id());
        assert_eq!(resolver.cache_len(), 0);
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_every_session() {
        let fake = Arc::new(FakeIntrospector::ok("h", 1));
        let resolver = IdentityResolver::new(fake.clone(), AddressingScheme::HostPid);
        let a = connected_session("a", "SSH a");
        let b = connected_session("b", "SSH b");

        resolver.resolve(&a).await;
        resolver.resolve(&b).await;
        assert_eq!(resolver.cache_len(), 2);

        resolver.invalidate_all();
        assert_eq!(resolver.cache_len(), 0);
        assert!(resolver.resolve(&a).await.is_resolved());
        assert_eq!(fake.calls(), 3);
    }

    #[tokio::test]
    async fn test_introspection_timeout() {
        let (fake, _gate) = FakeIntrospector::gated("h", 1);
        let resolver = IdentityResolver::new(Arc::new(fake), AddressingScheme::HostPid)
            .with_introspection_timeout(Duration::from_millis(20));
        let session = connected_session("s1", "SSH gpu");
        assert_eq!(
            resolver.resolve(&session).await,
            ResolutionOutcome::Unavailable
        );
        assert!(resolver.cached(session.id()).is_none());
    }
}
