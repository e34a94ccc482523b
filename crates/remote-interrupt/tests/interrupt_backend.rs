//! Integration tests against a fake interrupt endpoint.
//!
//! Each test starts a small hyper server on a random local port that records
//! incoming requests and answers with a fixed status and body.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use remote_interrupt::introspect::IntrospectionReply;
use remote_interrupt::{
    AddressingScheme, Feedback, IdentityResolver, InterruptClient, InterruptError,
    InterruptTrigger, IntrospectionError, KernelInfo, KernelIntrospector, RemoteIdentity,
    SessionHandle, SessionHub, SessionStatus, SessionTracker, TrackerConfig,
    GENERIC_FAILURE_MESSAGE,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::sleep;

#[derive(Debug, Clone)]
struct Recorded {
    uri: String,
    authorization: Option<String>,
}

struct Backend {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl Backend {
    fn base_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

/// Start a fake backend answering every request with `status` and `body`.
async fn start_backend(status: StatusCode, body: &'static str) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let recorded = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorded = recorded.clone();
                    async move {
                        recorded.lock().unwrap().push(Recorded {
                            uri: req.uri().to_string(),
                            authorization: req
                                .headers()
                                .get(AUTHORIZATION)
                                .and_then(|v| v.to_str().ok())
                                .map(String::from),
                        });
                        let response = Response::builder()
                            .status(status)
                            .header(CONTENT_TYPE, "application/json")
                            .body(Full::new(Bytes::from(body)))
                            .unwrap();
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new().serve_connection(io, service).await;
            });
        }
    });

    Backend { addr, requests }
}

/// Kernel that always reports the same host and pid.
struct StaticKernel {
    host: &'static str,
    pid: u32,
}

#[async_trait]
impl KernelIntrospector for StaticKernel {
    async fn execute_silent(
        &self,
        _kernel: &KernelInfo,
        _code: &str,
        _user_expressions: HashMap<String, String>,
    ) -> Result<IntrospectionReply, IntrospectionError> {
        Ok(IntrospectionReply::from_json(&json!({
            "status": "ok",
            "user_expressions": {
                "pid": {"status": "ok", "data": {"text/plain": self.pid.to_string()}},
                "host": {"status": "ok", "data": {"text/plain": format!("'{}'", self.host)}}
            }
        })))
    }
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_interrupt_by_host_and_pid() {
    let backend = start_backend(StatusCode::OK, r#"{"code": 0}"#).await;
    let client = InterruptClient::new(&backend.base_url()).unwrap();

    let identity = RemoteIdentity::from_host_pid("gpu-node-3", 4821, "SSH gpu-node-3");
    let receipt = client.interrupt(&identity).await.unwrap();
    assert_eq!(receipt.code, 0);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].uri, "/interrupt?host=gpu-node-3&pid=4821");
    assert!(requests[0].authorization.is_none());
}

#[tokio::test]
async fn test_interrupt_by_kernel_id() {
    let backend = start_backend(StatusCode::OK, r#"{"code": 0}"#).await;
    let client = InterruptClient::new(&backend.base_url()).unwrap();

    let identity = RemoteIdentity::from_kernel_id("5f2c-k1", "SSH gpu-node-3");
    client.interrupt(&identity).await.unwrap();
    assert_eq!(backend.requests()[0].uri, "/interrupt?id=5f2c-k1");
}

#[tokio::test]
async fn test_token_is_sent() {
    let backend = start_backend(StatusCode::OK, r#"{"code": 0}"#).await;
    let client = InterruptClient::new(&backend.base_url())
        .unwrap()
        .with_token("s3cret");

    let identity = RemoteIdentity::from_host_pid("h", 1, "SSH h");
    client.interrupt(&identity).await.unwrap();
    assert_eq!(
        backend.requests()[0].authorization.as_deref(),
        Some("token s3cret")
    );
}

#[tokio::test]
async fn test_nonzero_code_is_application_failure() {
    let backend = start_backend(StatusCode::OK, r#"{"code": 17}"#).await;
    let client = InterruptClient::new(&backend.base_url()).unwrap();

    let identity = RemoteIdentity::from_host_pid("gpu-node-3", 4821, "SSH gpu-node-3");
    let err = client.interrupt(&identity).await.unwrap_err();
    assert!(matches!(err, InterruptError::Application { code: 17 }));
    assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
}

#[tokio::test]
async fn test_http_error_status() {
    let backend = start_backend(StatusCode::INTERNAL_SERVER_ERROR, "oops").await;
    let client = InterruptClient::new(&backend.base_url()).unwrap();

    let identity = RemoteIdentity::from_host_pid("h", 1, "SSH h");
    let err = client.interrupt(&identity).await.unwrap_err();
    assert!(matches!(err, InterruptError::HttpStatus { status: 500 }));
    assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
}

#[tokio::test]
async fn test_non_json_body_is_malformed() {
    let backend = start_backend(StatusCode::OK, "<html>login</html>").await;
    let client = InterruptClient::new(&backend.base_url()).unwrap();

    let identity = RemoteIdentity::from_host_pid("h", 1, "SSH h");
    let err = client.interrupt(&identity).await.unwrap_err();
    assert!(matches!(err, InterruptError::MalformedResponse(_)));
}

#[tokio::test]
async fn test_unreachable_backend_is_transport_failure() {
    // Bind then drop to get a port nobody listens on
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let client = InterruptClient::new(&format!("http://{addr}/"))
        .unwrap()
        .with_timeout(Duration::from_secs(2));

    let identity = RemoteIdentity::from_host_pid("h", 1, "SSH h");
    let err = client.interrupt(&identity).await.unwrap_err();
    assert!(matches!(err, InterruptError::Transport(_)));
    assert_eq!(err.user_message(), GENERIC_FAILURE_MESSAGE);
}

#[tokio::test]
async fn test_each_click_sends_its_own_request() {
    let backend = start_backend(StatusCode::OK, r#"{"code": 0}"#).await;
    let client = InterruptClient::new(&backend.base_url()).unwrap();

    let identity = RemoteIdentity::from_host_pid("h", 1, "SSH h");
    let (a, b) = tokio::join!(client.interrupt(&identity), client.interrupt(&identity));
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(backend.requests().len(), 2);
}

#[tokio::test]
async fn test_local_kernel_sends_nothing() {
    let backend = start_backend(StatusCode::OK, r#"{"code": 0}"#).await;
    let client = InterruptClient::new(&backend.base_url()).unwrap();

    let identity = RemoteIdentity::from_host_pid("h", 1, "Python 3 (ipykernel)");
    let err = client.interrupt(&identity).await.unwrap_err();
    assert!(matches!(err, InterruptError::NotRemoteKernel { .. }));
    assert_eq!(err.user_message(), "This is not a remote kernel");

    sleep(Duration::from_millis(20)).await;
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn test_select_resolve_and_click() {
    let backend = start_backend(StatusCode::OK, r#"{"code": 0}"#).await;

    let resolver = Arc::new(IdentityResolver::new(
        Arc::new(StaticKernel {
            host: "gpu-node-3",
            pid: 4821,
        }),
        AddressingScheme::HostPid,
    ));
    let tracker = SessionTracker::new(
        resolver,
        TrackerConfig {
            settle_delay: Duration::from_millis(5),
            ..TrackerConfig::default()
        },
    );
    let trigger = InterruptTrigger::new(
        tracker.clone(),
        InterruptClient::new(&backend.base_url()).unwrap(),
    );

    let hub = Arc::new(SessionHub::new());
    let session = SessionHandle::new("s1", "analysis.ipynb");
    session.set_kernel(Some(KernelInfo::new("k1", "SSH gpu-node-3")));
    hub.open(session);

    let subscription = tracker.attach(hub.clone());
    hub.mark_restored();
    assert!(wait_until(Duration::from_secs(2), || subscription.is_active()).await);
    // Give the listener time to subscribe after the restore signal
    sleep(Duration::from_millis(50)).await;

    hub.select(&"s1".into());
    hub.set_status(&"s1".into(), SessionStatus::Connected);
    assert!(wait_until(Duration::from_secs(5), || tracker.current_identity().is_complete()).await);

    let feedback = trigger.activate().await;
    assert_eq!(
        feedback,
        Feedback::Success {
            message: "Interrupted SSH gpu-node-3".to_string()
        }
    );
    assert_eq!(
        backend.requests()[0].uri,
        "/interrupt?host=gpu-node-3&pid=4821"
    );

    // After a disconnect the next click is refused locally
    hub.set_status(&"s1".into(), SessionStatus::Disconnected);
    assert!(wait_until(Duration::from_secs(2), || tracker.current_identity().is_empty()).await);
    assert!(trigger.activate().await.is_error());
    assert_eq!(backend.requests().len(), 1);

    subscription.dispose();
}
