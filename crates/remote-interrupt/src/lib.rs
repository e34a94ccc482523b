//! Interrupt kernels that run on remote hosts over SSH.
//!
//! A notebook session bound to a remote kernel cannot be interrupted with a
//! local signal. This crate works out *which* remote process a session
//! belongs to and asks the notebook server's `/interrupt` endpoint to signal
//! it.
//!
//! - [`SessionTracker`] follows the host's session lifecycle events and keeps
//!   the current session's [`RemoteIdentity`] up to date.
//! - [`IdentityResolver`] introspects kernels (pid and host through a silent
//!   `execute_request`) and caches the result per session.
//! - [`InterruptClient`] sends the interrupt request.
//! - [`InterruptTrigger`] turns a click into a dispatch and a [`Feedback`].

pub mod dispatch;
pub mod error;
pub mod host;
pub mod identity;
pub mod introspect;
pub mod resolver;
pub mod session;
pub mod settings;
pub mod tracker;
pub mod trigger;

#[cfg(test)]
mod test_support;

pub use dispatch::{InterruptClient, InterruptReceipt};
pub use error::{FailureKind, InterruptError, IntrospectionError, GENERIC_FAILURE_MESSAGE};
pub use host::{HostEvent, SessionHub, SessionSource, Subscription};
pub use identity::{AddressingScheme, RemoteIdentity, ResolutionOutcome};
pub use introspect::{JupyterIntrospector, KernelIntrospector, ReadinessSignal};
pub use resolver::IdentityResolver;
pub use session::{KernelInfo, SessionHandle, SessionId, SessionStatus};
pub use settings::Settings;
pub use tracker::{SessionTracker, TrackerConfig, TrackerState};
pub use trigger::{Feedback, InterruptTrigger};
