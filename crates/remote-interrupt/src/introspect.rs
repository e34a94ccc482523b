//! Kernel introspection side channel.
//!
//! ssh_ipykernel exports the remote host as `SSH_IPYKERNEL_HOST` in the
//! kernel's environment. Running a silent execute request with two user
//! expressions gives back the kernel's pid and that host, which is all the
//! legacy interrupt endpoint needs.
//!
//! The reply shape is the standard Jupyter one:
//!
//! ```json
//! {"status": "ok",
//!  "user_expressions": {
//!     "pid":  {"status": "ok", "data": {"text/plain": "4821"}},
//!     "host": {"status": "ok", "data": {"text/plain": "'gpu-node-3'"}}}}
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use jupyter_protocol::media::MediaType;
use jupyter_protocol::{
    ConnectionInfo, ExecuteReply, ExecuteRequest, ExpressionResult, JupyterMessage,
    JupyterMessageContent, ReplyStatus,
};
use log::debug;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::IntrospectionError;
use crate::session::KernelInfo;

/// Code submitted alongside the user expressions.
pub const INTROSPECTION_CODE: &str = "import os";

/// Environment variable ssh_ipykernel sets on the remote side.
pub const HOST_ENV_VAR: &str = "SSH_IPYKERNEL_HOST";

const PID_EXPRESSION: &str = "pid";
const HOST_EXPRESSION: &str = "host";

/// The user expressions that read pid and host from the kernel.
pub fn introspection_expressions() -> HashMap<String, String> {
    HashMap::from([
        (PID_EXPRESSION.to_string(), "os.getpid()".to_string()),
        (
            HOST_EXPRESSION.to_string(),
            format!("os.environ['{HOST_ENV_VAR}']"),
        ),
    ])
}

/// The parts of an `execute_reply` the resolver cares about.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntrospectionReply {
    pub status: String,
    pub user_expressions: HashMap<String, Value>,
}

impl IntrospectionReply {
    /// Build from a JSON `execute_reply` content object.
    ///
    /// Missing or `null` user expressions become an empty map.
    pub fn from_json(value: &Value) -> Self {
        let status = value
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let user_expressions = value
            .get("user_expressions")
            .and_then(Value::as_object)
            .map(|map| map.clone().into_iter().collect())
            .unwrap_or_default();
        Self {
            status,
            user_expressions,
        }
    }

    /// Build from a typed `execute_reply`, keeping only the plain text of
    /// each expression result.
    pub fn from_execute_reply(reply: &ExecuteReply) -> Self {
        let status = match reply.status {
            ReplyStatus::Ok => "ok",
            ReplyStatus::Error => "error",
            ReplyStatus::Aborted => "aborted",
        };
        let user_expressions = reply
            .user_expressions
            .iter()
            .flatten()
            .map(|(name, result)| (name.clone(), expression_value(result)))
            .collect();
        Self {
            status: status.to_string(),
            user_expressions,
        }
    }
}

fn expression_value(result: &ExpressionResult) -> Value {
    match result {
        ExpressionResult::Ok { data, .. } => {
            let plain = data.content.iter().find_map(|media| {
                if let MediaType::Plain(text) = media {
                    Some(text.clone())
                } else {
                    None
                }
            });
            match plain {
                Some(text) => json!({"status": "ok", "data": {"text/plain": text}}),
                None => json!({"status": "ok", "data": {}}),
            }
        }
        ExpressionResult::Error { ename, evalue, .. } => {
            json!({"status": "error", "ename": ename, "evalue": evalue})
        }
    }
}

/// Whether a kernel answered a readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessSignal {
    Ready,
    NotReady,
    /// The introspector cannot tell; callers fall back to a fixed delay.
    Unsupported,
}

/// Executes code inside a kernel without touching the visible notebook.
#[async_trait]
pub trait KernelIntrospector: Send + Sync {
    /// Run `code` with `silent = true` and `store_history = false`,
    /// evaluating `user_expressions` afterwards.
    async fn execute_silent(
        &self,
        kernel: &KernelInfo,
        code: &str,
        user_expressions: HashMap<String, String>,
    ) -> Result<IntrospectionReply, IntrospectionError>;

    /// Ask the kernel whether it is ready to execute code.
    async fn probe_ready(&self, _kernel: &KernelInfo) -> ReadinessSignal {
        ReadinessSignal::Unsupported
    }
}

/// Host and pid read back from a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPid {
    pub host: String,
    pub pid: u32,
}

/// Run the pid/host introspection against `kernel`.
pub async fn introspect(
    introspector: &dyn KernelIntrospector,
    kernel: &KernelInfo,
) -> Result<HostPid, IntrospectionError> {
    let reply = introspector
        .execute_silent(kernel, INTROSPECTION_CODE, introspection_expressions())
        .await?;
    parse_reply(&reply)
}

/// Extract host and pid from an introspection reply.
///
/// Either both fields come out or the whole reply is rejected.
pub fn parse_reply(reply: &IntrospectionReply) -> Result<HostPid, IntrospectionError> {
    if reply.status != "ok" {
        return Err(IntrospectionError::ExecutionStatus(reply.status.clone()));
    }

    let pid_text = expression_text(reply, PID_EXPRESSION)?;
    let pid = pid_text
        .trim()
        .parse::<u32>()
        .map_err(|e| IntrospectionError::Expression {
            name: PID_EXPRESSION.to_string(),
            reason: format!("'{pid_text}' is not a pid: {e}"),
        })?;

    let host_text = expression_text(reply, HOST_EXPRESSION)?;
    let host = unquote(host_text.trim());
    if host.is_empty() {
        return Err(IntrospectionError::Expression {
            name: HOST_EXPRESSION.to_string(),
            reason: "empty host".to_string(),
        });
    }

    Ok(HostPid {
        host: host.to_string(),
        pid,
    })
}

/// Text representation of one user expression result.
fn expression_text(reply: &IntrospectionReply, name: &str) -> Result<String, IntrospectionError> {
    let value = reply
        .user_expressions
        .get(name)
        .ok_or_else(|| IntrospectionError::Expression {
            name: name.to_string(),
            reason: "missing from reply".to_string(),
        })?;

    // Some message libraries flatten expression results to their plain text
    if let Some(text) = value.as_str() {
        return Ok(text.to_string());
    }

    if let Some(status) = value.get("status").and_then(Value::as_str) {
        if status != "ok" {
            let ename = value.get("ename").and_then(Value::as_str).unwrap_or(status);
            let evalue = value.get("evalue").and_then(Value::as_str).unwrap_or("");
            return Err(IntrospectionError::Expression {
                name: name.to_string(),
                reason: format!("{ename}: {evalue}").trim_end_matches(": ").to_string(),
            });
        }
    }

    value
        .get("data")
        .and_then(|data| data.get("text/plain"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            IntrospectionError::MalformedReply(format!("no text/plain data for '{name}'"))
        })
}

/// Strip one leading and one trailing quote character, if present.
///
/// Python's repr of a string arrives as `'node-7'`.
pub fn unquote(text: &str) -> &str {
    let is_quote = |c: char| c == '\'' || c == '"';
    let text = text.strip_prefix(is_quote).unwrap_or(text);
    text.strip_suffix(is_quote).unwrap_or(text)
}

/// Introspector speaking the Jupyter wire protocol to a kernel's shell
/// channel, using the kernel's connection file.
pub struct JupyterIntrospector {
    heartbeat_timeout: Duration,
}

impl Default for JupyterIntrospector {
    fn default() -> Self {
        Self::new()
    }
}

impl JupyterIntrospector {
    pub fn new() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }
}

async fn read_connection_info(path: &Path) -> Result<ConnectionInfo, IntrospectionError> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content)
        .map_err(|e| IntrospectionError::MalformedReply(format!("connection file: {e}")))
}

fn kernel_err(e: impl std::fmt::Display) -> IntrospectionError {
    IntrospectionError::Kernel(e.to_string())
}

#[async_trait]
impl KernelIntrospector for JupyterIntrospector {
    async fn execute_silent(
        &self,
        kernel: &KernelInfo,
        code: &str,
        user_expressions: HashMap<String, String>,
    ) -> Result<IntrospectionReply, IntrospectionError> {
        let path = kernel
            .connection_file
            .as_deref()
            .ok_or(IntrospectionError::NoConnection)?;
        let connection_info = read_connection_info(path).await?;

        let session_id = Uuid::new_v4().to_string();
        let identity = runtimelib::peer_identity_for_session(&session_id).map_err(kernel_err)?;
        let shell = runtimelib::create_client_shell_connection_with_identity(
            &connection_info,
            &session_id,
            identity,
        )
        .await
        .map_err(kernel_err)?;
        let (mut shell_writer, mut shell_reader) = shell.split();

        let mut request = ExecuteRequest::new(code.to_string());
        request.silent = true;
        request.store_history = false;
        request.user_expressions = Some(user_expressions);

        let message: JupyterMessage = request.into();
        let msg_id = message.header.msg_id.clone();
        shell_writer.send(message).await.map_err(kernel_err)?;
        debug!(
            "[introspect] Sent silent execute_request to kernel {}: msg_id={}",
            kernel.id, msg_id
        );

        loop {
            let msg = shell_reader.read().await.map_err(kernel_err)?;
            let is_ours = msg.parent_header.as_ref().map(|h| h.msg_id.as_str())
                == Some(msg_id.as_str());
            if !is_ours {
                continue;
            }
            if let JupyterMessageContent::ExecuteReply(reply) = msg.content {
                return Ok(IntrospectionReply::from_execute_reply(&reply));
            }
        }
    }

    async fn probe_ready(&self, kernel: &KernelInfo) -> ReadinessSignal {
        let Some(path) = kernel.connection_file.as_deref() else {
            return ReadinessSignal::Unsupported;
        };
        let Ok(connection_info) = read_connection_info(path).await else {
            return ReadinessSignal::NotReady;
        };

        let heartbeat = tokio::time::timeout(self.heartbeat_timeout, async {
            let mut hb = runtimelib::create_client_heartbeat_connection(&connection_info).await?;
            hb.single_heartbeat().await
        })
        .await;

        if matches!(heartbeat, Ok(Ok(()))) {
            ReadinessSignal::Ready
        } else {
            ReadinessSignal::NotReady
        }
    }
}
