use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::types::*;
use crate::error::ControllerError;
use crate::serial::protocol::CommCounter;
use crate::serial::{
    Command, CommandSession, Frame, FrameCodec, Request, SerialError, SerialInterface, SessionOutcome,
    SessionPolicy,
};

/// How long one idle read waits before the worker looks at its queues again
const IDLE_READ: Duration = Duration::from_millis(50);

/// Bounded reopen after the transport dies
#[derive(Debug, Clone)]
pub struct ReopenPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for ReopenPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl ReopenPolicy {
    fn worst_case(&self) -> Duration {
        self.delay * self.attempts
    }
}

/// Cheap to clone; every clone feeds the same worker.
#[derive(Clone)]
pub struct DispatchHandle {
    cmd_tx: mpsc::Sender<Submission>,
    shutdown_tx: mpsc::Sender<oneshot::Sender<()>>,
    health_rx: watch::Receiver<HealthSnapshot>,
    metrics_rx: watch::Receiver<MetricsSnapshot>,
    rejected_busy: Arc<AtomicU64>,
    submit_timeout: Duration,
    session_budget: Duration,
}

impl DispatchHandle {
    /// Run `request` as the next session on the wire.
    ///
    /// Fails fast with `ControllerBusy` when the queue is full, and with
    /// `ControllerBusy` as soon as the submission has waited `submit_timeout`
    /// without starting. A session that has started always runs to its own end.
    pub async fn submit(
        &self,
        transaction_id: impl Into<String>,
        request: Request,
    ) -> Result<SessionReport, ControllerError> {
        let transaction_id = transaction_id.into();
        let (started, mut started_rx) = oneshot::channel();
        let (responder, response_rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + self.submit_timeout;
        let submission = Submission {
            transaction_id: transaction_id.clone(),
            request,
            enqueued_at: now,
            deadline,
            started,
            responder,
        };

        match self.cmd_tx.try_send(submission) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.rejected_busy.fetch_add(1, Ordering::Relaxed);
                log::warn!("[{}] dispatch queue full, rejecting", transaction_id);
                return Err(ControllerError::ControllerBusy("dispatch queue full".to_string()));
            }
            Err(TrySendError::Closed(_)) => {
                return Err(ControllerError::TransportUnavailable(
                    "dispatch worker stopped".to_string(),
                ))
            }
        }

        // An Err from `started_rx` means the worker answered without starting
        // a session; the answer is already waiting on `response_rx`.
        let waited_out = tokio::select! {
            biased;
            _ = &mut started_rx => false,
            _ = tokio::time::sleep_until(deadline) => {
                started_rx.close();
                started_rx.try_recv().is_err()
            }
        };
        if waited_out {
            log::warn!(
                "[{}] not started within {:?}, giving up",
                transaction_id,
                self.submit_timeout
            );
            return Err(ControllerError::ControllerBusy(format!(
                "not started within {:?}",
                self.submit_timeout
            )));
        }

        match tokio::time::timeout(self.session_budget, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ControllerError::TransportUnavailable(
                "dispatch worker dropped the request".to_string(),
            )),
            Err(_) => {
                log::error!(
                    "[{}] no result within {:?} of starting",
                    transaction_id,
                    self.session_budget
                );
                Err(ControllerError::TransportError(format!(
                    "no result within {:?}",
                    self.session_budget
                )))
            }
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        self.health_rx.borrow().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut metrics = self.metrics_rx.borrow().clone();
        metrics.rejected_busy = self.rejected_busy.load(Ordering::Relaxed);
        metrics
    }

    /// Stop the worker after the in-flight session and close the transport.
    /// Submissions still queued are answered with `TransportUnavailable`.
    pub async fn shutdown(&self) {
        let (done, done_rx) = oneshot::channel();
        if self.shutdown_tx.send(done).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

pub struct DispatchBuilder {
    interface: SerialInterface,
    codec: FrameCodec,
    policy: SessionPolicy,
    reopen: ReopenPolicy,
    queue_depth: usize,
    submit_timeout: Duration,
    sync_with_vmc: bool,
}

impl DispatchBuilder {
    pub fn new(interface: SerialInterface) -> Self {
        Self {
            interface,
            codec: FrameCodec::default(),
            policy: SessionPolicy::default(),
            reopen: ReopenPolicy::default(),
            queue_depth: 16,
            submit_timeout: Duration::from_secs(30),
            sync_with_vmc: true,
        }
    }

    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn reopen(mut self, reopen: ReopenPolicy) -> Self {
        self.reopen = reopen;
        self
    }

    /// Submissions allowed to wait behind the one in flight
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    pub fn submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Send REQUEST_SYNC whenever the transport opens and whenever the VMC asks for it
    pub fn sync_with_vmc(mut self, enabled: bool) -> Self {
        self.sync_with_vmc = enabled;
        self
    }

    /// Open the transport and spawn the worker. Must be called from within
    /// a tokio runtime. A port that fails to open leaves the worker running
    /// disconnected; the next submission retries the open.
    pub fn build(mut self) -> DispatchHandle {
        let mut last_error = None;
        if !self.interface.is_open() {
            if let Err(e) = self.interface.open() {
                log::warn!("Starting without {}: {}", self.interface.port_name(), e);
                last_error = Some(e.to_string());
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(self.queue_depth);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let health = HealthSnapshot {
            port: self.interface.port_name(),
            transport_open: self.interface.is_open(),
            last_error,
        };
        let (health_tx, health_rx) = watch::channel(health);
        let (metrics_tx, metrics_rx) = watch::channel(MetricsSnapshot::default());
        let session_budget =
            self.policy.worst_case() + self.reopen.worst_case() + self.policy.attempt_timeout;

        let worker = DispatchWorker {
            sync_pending: self.sync_with_vmc && self.interface.is_open(),
            interface: self.interface,
            codec: self.codec,
            policy: self.policy,
            reopen: self.reopen,
            sync_with_vmc: self.sync_with_vmc,
            comm: CommCounter::new(),
            metrics: MetricsSnapshot::default(),
            health_tx,
            metrics_tx,
        };
        tokio::spawn(worker.run(cmd_rx, shutdown_rx));

        DispatchHandle {
            cmd_tx,
            shutdown_tx,
            health_rx,
            metrics_rx,
            rejected_busy: Arc::new(AtomicU64::new(0)),
            submit_timeout: self.submit_timeout,
            session_budget,
        }
    }
}

/// Sole owner of the serial transport.
struct DispatchWorker {
    interface: SerialInterface,
    codec: FrameCodec,
    policy: SessionPolicy,
    reopen: ReopenPolicy,
    sync_with_vmc: bool,
    sync_pending: bool,
    comm: CommCounter,
    metrics: MetricsSnapshot,
    health_tx: watch::Sender<HealthSnapshot>,
    metrics_tx: watch::Sender<MetricsSnapshot>,
}

impl DispatchWorker {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Submission>,
        mut shutdown_rx: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        log::info!("Dispatch worker started for {}", self.interface.port_name());

        loop {
            if self.sync_pending && self.interface.is_open() {
                self.sync_pending = false;
                self.sync().await;
                continue;
            }

            let idle = self.interface.is_open();
            tokio::select! {
                biased;
                done = shutdown_rx.recv() => {
                    cmd_rx.close();
                    while let Ok(pending) = cmd_rx.try_recv() {
                        let _ = pending.responder.send(Err(ControllerError::TransportUnavailable(
                            "controller shutting down".to_string(),
                        )));
                    }
                    self.close_transport();
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                    break;
                }
                submission = cmd_rx.recv() => match submission {
                    Some(submission) => self.execute(submission).await,
                    None => break,
                },
                frame = idle_frame(&mut self.interface, &self.codec), if idle => {
                    self.on_idle_frame(frame).await;
                }
            }
        }

        self.close_transport();
        log::info!("Dispatch worker stopped");
    }

    async fn execute(&mut self, submission: Submission) {
        self.metrics.submitted += 1;
        let started = Instant::now();
        let queued_for = started - submission.enqueued_at;

        if started > submission.deadline {
            self.metrics.expired_in_queue += 1;
            self.publish_metrics();
            log::warn!(
                "[{}] waited {:?} in queue without starting, giving up",
                submission.transaction_id,
                queued_for
            );
            let _ = submission.responder.send(Err(ControllerError::ControllerBusy(format!(
                "waited {:?} in queue",
                queued_for
            ))));
            return;
        }

        if submission.started.send(()).is_err() {
            self.metrics.expired_in_queue += 1;
            self.publish_metrics();
            log::warn!("[{}] caller gave up before start, skipping", submission.transaction_id);
            return;
        }

        if !self.interface.is_open() && !self.reopen_transport().await {
            let reason = self
                .health_tx
                .borrow()
                .last_error
                .clone()
                .unwrap_or_else(|| "transport closed".to_string());
            let _ = submission
                .responder
                .send(Err(ControllerError::TransportUnavailable(reason)));
            return;
        }

        let mut session = CommandSession::new(
            submission.transaction_id.clone(),
            submission.request,
            self.comm.next(),
        );
        let outcome = session.run(&mut self.interface, &self.codec, &self.policy).await;

        self.metrics.retries += u64::from(outcome.attempts().saturating_sub(1));
        self.metrics.corrupt_frames += u64::from(session.corrupt_frames());
        self.metrics.record_latency(started.elapsed().as_millis() as u64);
        let device_fault = match &outcome {
            SessionOutcome::Completed { .. } => {
                self.metrics.completed += 1;
                false
            }
            SessionOutcome::TimedOut { .. } => {
                self.metrics.timed_out += 1;
                false
            }
            SessionOutcome::Failed { error, .. } => {
                self.metrics.failed += 1;
                self.health_tx.send_modify(|h| h.last_error = Some(error.to_string()));
                error.is_device_fault()
            }
        };
        self.publish_metrics();

        let _ = submission.responder.send(Ok(SessionReport {
            transaction_id: submission.transaction_id,
            outcome,
            queued_for,
        }));

        if device_fault {
            self.close_transport();
            self.reopen_transport().await;
        }
    }

    /// REQUEST_SYNC on behalf of the controller itself, never a caller.
    async fn sync(&mut self) {
        let comm = self.comm.next();
        let mut session = CommandSession::new(format!("sync_{}", comm), Request::Sync, comm);
        match session.run(&mut self.interface, &self.codec, &self.policy).await {
            SessionOutcome::Completed { .. } => log::info!("Synchronised with VMC"),
            SessionOutcome::TimedOut { attempts } => {
                log::warn!("VMC did not acknowledge sync after {} attempt(s)", attempts)
            }
            SessionOutcome::Failed { error, .. } => {
                self.health_tx.send_modify(|h| h.last_error = Some(error.to_string()));
                if error.is_device_fault() {
                    self.close_transport();
                }
            }
        }
    }

    /// Traffic seen between sessions: POLLs, VMC-initiated syncs, stray reports.
    async fn on_idle_frame(&mut self, frame: Result<Option<Frame>, SerialError>) {
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => return self.idle_fault(e),
        };

        match Command::from_code(frame.command) {
            Some(Command::Ack) => return,
            Some(Command::Poll) => {}
            Some(Command::RequestSync) => {
                log::info!("VMC requested synchronisation");
                self.sync_pending = self.sync_with_vmc;
            }
            other => log::debug!(
                "Unsolicited frame 0x{:02X} ({:?}) while idle: {}",
                frame.command,
                other,
                hex::encode(&frame.payload)
            ),
        }

        if self.policy.acknowledge_reports {
            let ack = self.codec.encode(&Frame::new(Command::Ack.code(), Vec::new()));
            let written = match ack {
                Ok(bytes) => self.interface.write(&bytes).await,
                Err(e) => Err(SerialError::from(e)),
            };
            if let Err(e) = written {
                self.idle_fault(e);
            }
        }
    }

    /// The next submission reopens the transport.
    fn idle_fault(&mut self, error: SerialError) {
        log::warn!("Idle traffic on {} failed: {}", self.interface.port_name(), error);
        self.health_tx.send_modify(|h| h.last_error = Some(error.to_string()));
        if error.is_device_fault() {
            self.close_transport();
        }
    }

    async fn reopen_transport(&mut self) -> bool {
        for attempt in 1..=self.reopen.attempts {
            self.metrics.reopen_attempts += 1;
            match self.interface.open() {
                Ok(()) => {
                    log::info!("Transport reopened on attempt {}", attempt);
                    self.health_tx.send_modify(|h| h.transport_open = true);
                    self.sync_pending = self.sync_with_vmc;
                    self.publish_metrics();
                    return true;
                }
                Err(e) => {
                    log::warn!(
                        "Reopen {}/{} of {} failed: {}",
                        attempt,
                        self.reopen.attempts,
                        self.interface.port_name(),
                        e
                    );
                    self.health_tx.send_modify(|h| {
                        h.transport_open = false;
                        h.last_error = Some(e.to_string());
                    });
                    if attempt < self.reopen.attempts {
                        tokio::time::sleep(self.reopen.delay).await;
                    }
                }
            }
        }
        self.publish_metrics();
        false
    }

    fn close_transport(&mut self) {
        self.interface.close();
        self.health_tx.send_modify(|h| h.transport_open = false);
    }

    fn publish_metrics(&self) {
        let _ = self.metrics_tx.send(self.metrics.clone());
    }
}

/// One bounded read while nothing is queued. Timeouts and corrupt frames
/// yield `None`.
async fn idle_frame(
    interface: &mut SerialInterface,
    codec: &FrameCodec,
) -> Result<Option<Frame>, SerialError> {
    let deadline = Instant::now() + IDLE_READ;
    match interface.read_until(|buf| codec.boundary(buf), deadline).await {
        Ok(raw) => match codec.decode(&raw) {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                log::debug!("Dropping corrupt idle frame {}: {}", hex::encode(&raw), e);
                Ok(None)
            }
        },
        Err(SerialError::Timeout) => Ok(None),
        Err(e) => Err(e),
    }
}
