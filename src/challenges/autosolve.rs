//! Client for the connected automated token service.
//!
//! Requests go out over a channel keyed by task id; answers come back
//! out-of-band on a separate channel and are matched purely by that id.
//! The transport bridging the channels to a real socket lives outside the
//! engine.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::challenges::{ChallengeAnswer, ChallengeKind, ChallengeRequest};
use crate::tasks::TaskId;

/// Outbound solve request. `task_id` is the only correlation key.
#[derive(Debug, Clone)]
pub struct AutosolveRequest {
    pub task_id: TaskId,
    pub url: String,
    pub site_key: Option<String>,
    pub kind: ChallengeKind,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub action: Option<String>,
    pub min_score: Option<f64>,
    pub render_params: Vec<(String, String)>,
}

impl AutosolveRequest {
    pub fn from_challenge(request: &ChallengeRequest, proxy: Option<String>) -> Self {
        Self {
            task_id: request.task_id.clone(),
            url: request.url.clone(),
            site_key: request.site_key.clone(),
            kind: request.kind,
            user_agent: request.user_agent.clone(),
            proxy,
            action: None,
            min_score: None,
            render_params: Vec::new(),
        }
    }
}

/// Inbound answer correlated by task id.
#[derive(Debug, Clone)]
pub struct AutosolveAnswer {
    pub task_id: TaskId,
    pub answer: ChallengeAnswer,
}

/// Handle to the automated token service connection.
pub struct AutosolveClient {
    connected: AtomicBool,
    outbound: mpsc::UnboundedSender<AutosolveRequest>,
}

impl AutosolveClient {
    /// Create a client plus the receiver end the transport drains.
    pub fn channel() -> (Arc<Self>, mpsc::UnboundedReceiver<AutosolveRequest>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                connected: AtomicBool::new(false),
                outbound,
            }),
            rx,
        )
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Send a request; returns `false` when disconnected or the transport
    /// side has gone away.
    pub fn request(&self, request: AutosolveRequest) -> bool {
        self.is_connected() && self.outbound.send(request).is_ok()
    }
}
