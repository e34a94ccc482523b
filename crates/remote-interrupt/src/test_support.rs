//! In-memory kernel introspector for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::error::IntrospectionError;
use crate::introspect::{IntrospectionReply, KernelIntrospector, ReadinessSignal};
use crate::session::KernelInfo;

pub(crate) fn ok_reply(host: &str, pid: u32) -> Value {
    json!({
        "status": "ok",
        "user_expressions": {
            "pid": {"status": "ok", "data": {"text/plain": pid.to_string()}, "metadata": {}},
            "host": {"status": "ok", "data": {"text/plain": format!("'{host}'")}, "metadata": {}}
        }
    })
}

pub(crate) struct FakeIntrospector {
    reply: StdMutex<Value>,
    calls: AtomicUsize,
    last_code: StdMutex<Option<String>>,
    gate: Option<Arc<Semaphore>>,
    readiness: StdMutex<ReadinessSignal>,
}

impl FakeIntrospector {
    fn with_reply(reply: Value, gate: Option<Arc<Semaphore>>) -> Self {
        Self {
            reply: StdMutex::new(reply),
            calls: AtomicUsize::new(0),
            last_code: StdMutex::new(None),
            gate,
            readiness: StdMutex::new(ReadinessSignal::Unsupported),
        }
    }

    pub(crate) fn ok(host: &str, pid: u32) -> Self {
        Self::with_reply(ok_reply(host, pid), None)
    }

    /// Reply where the host expression raised a KeyError.
    pub(crate) fn host_missing(pid: u32) -> Self {
        Self::with_reply(
            json!({
                "status": "ok",
                "user_expressions": {
                    "pid": {"status": "ok", "data": {"text/plain": pid.to_string()}},
                    "host": {"status": "error", "ename": "KeyError", "evalue": "'SSH_IPYKERNEL_HOST'"}
                }
            }),
            None,
        )
    }

    /// Each execution waits for one permit on the returned semaphore.
    pub(crate) fn gated(host: &str, pid: u32) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        (Self::with_reply(ok_reply(host, pid), Some(gate.clone())), gate)
    }

    pub(crate) fn set_ok(&self, host: &str, pid: u32) {
        *self.reply.lock().unwrap() = ok_reply(host, pid);
    }

    pub(crate) fn set_readiness(&self, signal: ReadinessSignal) {
        *self.readiness.lock().unwrap() = signal;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_code(&self) -> Option<String> {
        self.last_code.lock().unwrap().clone()
    }
}

#[async_trait]
impl KernelIntrospector for FakeIntrospector {
    async fn execute_silent(
        &self,
        _kernel: &KernelInfo,
        code: &str,
        _user_expressions: HashMap<String, String>,
    ) -> Result<IntrospectionReply, IntrospectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_code.lock().unwrap() = Some(code.to_string());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| IntrospectionError::Kernel(e.to_string()))?
                .forget();
        }
        let reply = self.reply.lock().unwrap().clone();
        Ok(IntrospectionReply::from_json(&reply))
    }

    async fn probe_ready(&self, _kernel: &KernelInfo) -> ReadinessSignal {
        *self.readiness.lock().unwrap()
    }
}
