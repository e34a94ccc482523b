//! Client for the remote interrupt endpoint.
//!
//! The endpoint lives next to the notebook server at `<base>/interrupt` and
//! takes the kernel address as query parameters (`host` + `pid`, `id`, or
//! all three). It answers `{"code": N}` where zero means the kernel was
//! signalled.

use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use url::Url;

use crate::error::InterruptError;
use crate::identity::{RemoteIdentity, DEFAULT_REMOTE_MARKER};

/// Default timeout for one interrupt request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Path of the interrupt endpoint relative to the server base URL.
pub const INTERRUPT_PATH: &str = "interrupt";

/// Successful interrupt acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptReceipt {
    pub code: i64,
    pub identity: RemoteIdentity,
}

/// Sends interrupt requests for remote kernels.
#[derive(Debug, Clone)]
pub struct InterruptClient {
    http: reqwest::Client,
    endpoint: Url,
    token: Option<String>,
    remote_marker: String,
    request_timeout: Duration,
}

impl InterruptClient {
    /// Create a client for the server at `base_url`.
    pub fn new(base_url: &str) -> Result<Self, InterruptError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: endpoint_url(base_url)?,
            token: None,
            remote_marker: DEFAULT_REMOTE_MARKER.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Send `Authorization: token <token>` with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        let token = token.into();
        self.token = (!token.is_empty()).then_some(token);
        self
    }

    /// Display-name prefix that identifies remote kernels.
    pub fn with_remote_marker(mut self, marker: impl Into<String>) -> Self {
        self.remote_marker = marker.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn remote_marker(&self) -> &str {
        &self.remote_marker
    }

    /// Full request URL for `identity`.
    pub fn request_url(&self, identity: &RemoteIdentity) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in identity.query_pairs() {
                query.append_pair(key, &value);
            }
        }
        url
    }

    /// Ask the backend to interrupt the kernel behind `identity`.
    ///
    /// Non-remote and unresolved identities are rejected without a request.
    pub async fn interrupt(
        &self,
        identity: &RemoteIdentity,
    ) -> Result<InterruptReceipt, InterruptError> {
        if !identity.is_remote_kernel(&self.remote_marker) {
            debug!(
                "[dispatch] Refusing non-remote kernel '{}'",
                identity.display_name
            );
            return Err(InterruptError::NotRemoteKernel {
                display_name: identity.display_name.clone(),
            });
        }
        if !identity.is_complete() {
            debug!("[dispatch] Refusing unresolved identity {}", identity);
            return Err(InterruptError::Unresolved);
        }

        let url = self.request_url(identity);
        info!("[dispatch] Interrupting {} via {}", identity, url.path());

        let mut request = self.http.get(url).timeout(self.request_timeout);
        if let Some(token) = &self.token {
            request = request.header(reqwest::header::AUTHORIZATION, format!("token {token}"));
        }

        let response = request.send().await.map_err(|e| {
            warn!("[dispatch] Request failed: {}", e);
            InterruptError::Transport(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!("[dispatch] Endpoint returned HTTP {}", status);
            return Err(InterruptError::HttpStatus {
                status: status.as_u16(),
            });
        }

        let body = response.text().await?;
        let code = parse_code(&body)?;
        info!("[dispatch] Endpoint returned code {}", code);

        if code != 0 {
            return Err(InterruptError::Application { code });
        }

        Ok(InterruptReceipt {
            code,
            identity: identity.clone(),
        })
    }
}

/// `<base>/interrupt`, keeping any path prefix of the base URL.
fn endpoint_url(base_url: &str) -> Result<Url, InterruptError> {
    let mut base = Url::parse(base_url.trim())?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);
    Ok(base.join(INTERRUPT_PATH)?)
}

fn parse_code(body: &str) -> Result<i64, InterruptError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| InterruptError::MalformedResponse(format!("not JSON: {e}")))?;
    value
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| InterruptError::MalformedResponse(format!("missing integer code in {value}")))
}
