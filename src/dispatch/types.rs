//! Messages and snapshots exchanged with the dispatch worker
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ControllerError;
use crate::serial::{Request, SessionOutcome};

/// What the worker hands back for one submission
#[derive(Debug)]
pub struct SessionReport {
    pub transaction_id: String,
    pub outcome: SessionOutcome,
    /// Time spent waiting behind other sessions
    pub queued_for: Duration,
}

pub(crate) struct Submission {
    pub transaction_id: String,
    pub request: Request,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    /// Fired when the worker commits to running the session
    pub started: oneshot::Sender<()>,
    pub responder: oneshot::Sender<Result<SessionReport, ControllerError>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub port: String,
    pub transport_open: bool,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub failed: u64,
    pub rejected_busy: u64,
    pub expired_in_queue: u64,
    pub retries: u64,
    pub corrupt_frames: u64,
    pub reopen_attempts: u64,
    pub session_last_latency_ms: Option<u64>,
    pub session_min_latency_ms: Option<u64>,
    pub session_max_latency_ms: Option<u64>,
    pub session_avg_latency_ms: Option<f64>,
    pub session_latency_samples: u64,
}

impl MetricsSnapshot {
    pub(crate) fn record_latency(&mut self, latency_ms: u64) {
        self.session_last_latency_ms = Some(latency_ms);
        self.session_min_latency_ms = Some(match self.session_min_latency_ms {
            Some(m) => m.min(latency_ms),
            None => latency_ms,
        });
        self.session_max_latency_ms = Some(match self.session_max_latency_ms {
            Some(m) => m.max(latency_ms),
            None => latency_ms,
        });
        self.session_latency_samples += 1;
        let samples = self.session_latency_samples as f64;
        self.session_avg_latency_ms = Some(match self.session_avg_latency_ms {
            Some(avg) => (avg * (samples - 1.0) + latency_ms as f64) / samples,
            None => latency_ms as f64,
        });
    }
}
