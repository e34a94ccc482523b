//! Interrupt button behaviour.

use std::sync::Mutex as StdMutex;

use log::{info, warn};
use serde::Serialize;

use crate::dispatch::{InterruptClient, InterruptReceipt};
use crate::error::InterruptError;
use crate::tracker::SessionTracker;

/// Title of every error notification.
pub const ERROR_TITLE: &str = "Error interrupting remote kernel";

/// What the UI should show after a click.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Feedback {
    /// Nothing to show (no click yet)
    Neutral,
    Success { message: String },
    Error { title: String, message: String },
}

impl Feedback {
    fn from_result(result: &Result<InterruptReceipt, InterruptError>) -> Self {
        match result {
            Ok(receipt) => Feedback::Success {
                message: format!("Interrupted {}", receipt.identity.display_name),
            },
            Err(e) => Feedback::Error {
                title: ERROR_TITLE.to_string(),
                message: e.user_message().to_string(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Feedback::Error { .. })
    }
}

/// Turns a click into an interrupt of the tracked session's kernel.
pub struct InterruptTrigger {
    tracker: SessionTracker,
    client: InterruptClient,
    last: StdMutex<Feedback>,
}

impl InterruptTrigger {
    pub fn new(tracker: SessionTracker, client: InterruptClient) -> Self {
        Self {
            tracker,
            client,
            last: StdMutex::new(Feedback::Neutral),
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Feedback from the most recent activation.
    pub fn last_feedback(&self) -> Feedback {
        self.last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Handle a click: dispatch for the current identity and report back.
    pub async fn activate(&self) -> Feedback {
        let result = self.activate_raw().await;
        let feedback = Feedback::from_result(&result);
        *self
            .last
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = feedback.clone();
        feedback
    }

    /// Like [`activate`](Self::activate) but keeps the structured error.
    pub async fn activate_raw(&self) -> Result<InterruptReceipt, InterruptError> {
        let identity = self.tracker.current_identity();
        let result = self.client.interrupt(&identity).await;
        match &result {
            Ok(receipt) => info!("[trigger] Interrupted {}", receipt.identity),
            Err(e) => warn!("[trigger] Interrupt failed ({}): {}", e.kind(), e),
        }
        result
    }
}
