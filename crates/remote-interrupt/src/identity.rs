//! Addressing information for a remote kernel process.
//!
//! A [`RemoteIdentity`] is either empty (nothing is known about the remote
//! process) or complete for at least one addressing scheme:
//! - `host` + `pid` (the kernel reported them through code execution)
//! - `kernel_id` (the backend looks the process up itself)
//!
//! Anything in between is partial and must never be cached or dispatched.

use serde::{Deserialize, Serialize};

/// Display-name prefix carried by kernels launched through ssh_ipykernel.
pub const DEFAULT_REMOTE_MARKER: &str = "SSH";

/// How a session's remote process is addressed on the interrupt endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AddressingScheme {
    /// Ask the kernel for its pid and host via code execution.
    HostPid,
    /// Send the kernel id and let the backend find the process.
    #[default]
    KernelId,
    /// Send both parameter sets (backend migration period).
    Both,
}

impl AddressingScheme {
    /// Whether this scheme needs the kernel introspection round trip.
    pub fn needs_introspection(self) -> bool {
        matches!(self, AddressingScheme::HostPid | AddressingScheme::Both)
    }
}

impl std::fmt::Display for AddressingScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressingScheme::HostPid => write!(f, "host_pid"),
            AddressingScheme::KernelId => write!(f, "kernel_id"),
            AddressingScheme::Both => write!(f, "both"),
        }
    }
}

impl std::str::FromStr for AddressingScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host_pid" | "host-pid" | "legacy" => Ok(AddressingScheme::HostPid),
            "kernel_id" | "kernel-id" | "id" => Ok(AddressingScheme::KernelId),
            "both" => Ok(AddressingScheme::Both),
            other => Err(format!("unknown addressing scheme: {other}")),
        }
    }
}

/// Addressing information for one remote kernel process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_id: Option<String>,
    /// Kernel display name, used to recognise remote kernels.
    #[serde(default)]
    pub display_name: String,
}

impl RemoteIdentity {
    /// An identity with no addressing information.
    pub fn empty() -> Self {
        Self::default()
    }

    /// An empty identity that still remembers which kernel it belongs to.
    pub fn unresolved(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            ..Self::default()
        }
    }

    pub fn from_host_pid(
        host: impl Into<String>,
        pid: u32,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            host: Some(host.into()),
            pid: Some(pid),
            kernel_id: None,
            display_name: display_name.into(),
        }
    }

    pub fn from_kernel_id(kernel_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            host: None,
            pid: None,
            kernel_id: Some(kernel_id.into()),
            display_name: display_name.into(),
        }
    }

    /// Attach a kernel id to an identity resolved through host/pid.
    pub fn with_kernel_id(mut self, kernel_id: impl Into<String>) -> Self {
        let kernel_id = kernel_id.into();
        if !kernel_id.is_empty() {
            self.kernel_id = Some(kernel_id);
        }
        self
    }

    fn has_host_pid(&self) -> bool {
        self.pid.is_some() && self.host.as_deref().is_some_and(|h| !h.is_empty())
    }

    fn has_kernel_id(&self) -> bool {
        self.kernel_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// True when no addressing field is set (display name is ignored).
    pub fn is_empty(&self) -> bool {
        self.host.is_none() && self.pid.is_none() && self.kernel_id.is_none()
    }

    /// True when at least one addressing scheme is fully populated and no
    /// host/pid half is dangling.
    pub fn is_complete(&self) -> bool {
        let host_pid_partial = (self.host.is_some() || self.pid.is_some()) && !self.has_host_pid();
        !host_pid_partial && (self.has_host_pid() || self.has_kernel_id())
    }

    /// Whether the kernel's display name carries the remote marker.
    pub fn is_remote_kernel(&self, marker: &str) -> bool {
        !marker.is_empty() && self.display_name.starts_with(marker)
    }

    /// Query parameters for the interrupt endpoint, in `host`, `pid`, `id`
    /// order. Only populated fields are included.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::with_capacity(3);
        if self.has_host_pid() {
            if let (Some(host), Some(pid)) = (&self.host, self.pid) {
                pairs.push(("host", host.clone()));
                pairs.push(("pid", pid.to_string()));
            }
        }
        if let Some(id) = self.kernel_id.as_ref().filter(|id| !id.is_empty()) {
            pairs.push(("id", id.clone()));
        }
        pairs
    }
}

impl std::fmt::Display for RemoteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "<unresolved '{}'>", self.display_name);
        }
        let mut parts = Vec::new();
        if let Some(host) = &self.host {
            parts.push(format!("host={host}"));
        }
        if let Some(pid) = self.pid {
            parts.push(format!("pid={pid}"));
        }
        if let Some(id) = &self.kernel_id {
            parts.push(format!("id={id}"));
        }
        write!(f, "{} '{}'", parts.join(" "), self.display_name)
    }
}

/// Result of asking for a session's identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    Resolved(RemoteIdentity),
    /// An introspection for the session is still in flight.
    Pending,
    /// Not a remote kernel, or the introspection failed.
    Unavailable,
}

impl ResolutionOutcome {
    pub fn identity(&self) -> Option<&RemoteIdentity> {
        match self {
            ResolutionOutcome::Resolved(identity) => Some(identity),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, ResolutionOutcome::Resolved(_))
    }
}
