use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::codec::{CorruptFrame, Frame, FrameCodec};
use super::interface::SerialInterface;
use super::protocol::{Command, Expectation, Request, StatusReport, DISPENSE_IN_PROGRESS};
use super::SerialError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Created,
    Sent,
    AwaitingResponse,
    Completed,
    Failed,
    TimedOut,
}

/// Retry and timing rules for one command/response exchange.
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub max_attempts: u32,
    /// How long to wait for a reply after each write
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    /// Added to `retry_delay` for every further retry (linear backoff)
    pub retry_backoff: Duration,
    /// Deadline granted after each "dispensing" progress report
    pub progress_timeout: Duration,
    /// Hold each write until the VMC polls
    pub wait_for_poll: bool,
    /// ACK polls and reports the VMC sends while a session is waiting
    pub acknowledge_reports: bool,
    /// Only accept reports that echo this session's communication number
    pub match_comm_number: bool,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(1000),
            retry_delay: Duration::from_millis(200),
            retry_backoff: Duration::ZERO,
            progress_timeout: Duration::from_secs(30),
            wait_for_poll: true,
            acknowledge_reports: true,
            match_comm_number: true,
        }
    }
}

impl SessionPolicy {
    /// Pause before attempt number `attempt` (the first retry is attempt 2).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.retry_delay + self.retry_backoff * attempt.saturating_sub(2)
    }

    /// Hard upper bound on one session. Progress reports extend the
    /// deadline, but never past this.
    pub fn worst_case(&self) -> Duration {
        let per_attempt = if self.wait_for_poll {
            self.attempt_timeout * 2
        } else {
            self.attempt_timeout
        };
        let delays: Duration = (2..=self.max_attempts).map(|a| self.delay_before(a)).sum();
        per_attempt * self.max_attempts + delays + self.progress_timeout
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// The VMC answered; for reports `frame` is the terminal report
    Completed { frame: Frame, attempts: u32 },
    /// No usable answer within `max_attempts`
    TimedOut { attempts: u32 },
    /// The transport broke; not retried
    Failed { error: SerialError, attempts: u32 },
}

impl SessionOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            SessionOutcome::Completed { attempts, .. }
            | SessionOutcome::TimedOut { attempts }
            | SessionOutcome::Failed { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug)]
enum RetryReason {
    Timeout,
    Corrupt(CorruptFrame),
}

#[derive(Debug)]
enum Wait {
    Reply(Frame),
    Retry(RetryReason),
    Fatal(SerialError),
}

/// One logical command and its reply.
///
/// Correlation is positional: with a single session in flight, the next
/// matching frame on the wire belongs to it. Frames that cannot be the
/// reply (polls, other commands, reports for another aisle) are acknowledged
/// and skipped.
pub struct CommandSession {
    transaction_id: String,
    request: Request,
    comm_number: u8,
    state: SessionState,
    attempt_count: u32,
    deadline: Option<Instant>,
    hard_deadline: Option<Instant>,
    accepted: bool,
    corrupt_frames: u32,
}

impl CommandSession {
    pub fn new(transaction_id: impl Into<String>, request: Request, comm_number: u8) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            request,
            comm_number,
            state: SessionState::Created,
            attempt_count: 0,
            deadline: None,
            hard_deadline: None,
            accepted: false,
            corrupt_frames: 0,
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn corrupt_frames(&self) -> u32 {
        self.corrupt_frames
    }

    /// Drive the exchange to a terminal state.
    pub async fn run(
        &mut self,
        transport: &mut SerialInterface,
        codec: &FrameCodec,
        policy: &SessionPolicy,
    ) -> SessionOutcome {
        let encoded = match codec.encode(&self.request.to_frame(self.comm_number)) {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(SerialError::from(e)),
        };
        if let Err(e) = transport.discard_input() {
            return self.fail(e);
        }
        let hard_deadline = Instant::now() + policy.worst_case();
        self.hard_deadline = Some(hard_deadline);

        loop {
            self.attempt_count += 1;
            match self.attempt(transport, codec, policy, &encoded).await {
                Wait::Reply(frame) => {
                    self.state = SessionState::Completed;
                    log::debug!(
                        "[{}] {:?} completed after {} attempt(s)",
                        self.transaction_id,
                        self.request.command(),
                        self.attempt_count
                    );
                    return SessionOutcome::Completed {
                        frame,
                        attempts: self.attempt_count,
                    };
                }
                Wait::Fatal(error) => return self.fail(error),
                Wait::Retry(reason) => {
                    let resend_unsafe = self.accepted && !self.request.is_idempotent();
                    let out_of_time = Instant::now() >= hard_deadline;
                    if self.attempt_count >= policy.max_attempts || resend_unsafe || out_of_time {
                        self.state = SessionState::TimedOut;
                        log::warn!(
                            "[{}] {:?} timed out after {} attempt(s) ({:?})",
                            self.transaction_id,
                            self.request.command(),
                            self.attempt_count,
                            reason
                        );
                        return SessionOutcome::TimedOut {
                            attempts: self.attempt_count,
                        };
                    }

                    let delay = policy.delay_before(self.attempt_count + 1);
                    log::warn!(
                        "[{}] {:?} attempt {}/{} failed ({:?}), retrying in {:?}",
                        self.transaction_id,
                        self.request.command(),
                        self.attempt_count,
                        policy.max_attempts,
                        reason,
                        delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn attempt(
        &mut self,
        transport: &mut SerialInterface,
        codec: &FrameCodec,
        policy: &SessionPolicy,
        encoded: &[u8],
    ) -> Wait {
        if policy.wait_for_poll {
            if let Err(wait) = self.await_poll(transport, codec, policy).await {
                return wait;
            }
        }

        if let Err(e) = transport.write(encoded).await {
            return Wait::Fatal(e);
        }
        self.state = SessionState::Sent;
        log::debug!(
            "[{}] {:?} sent, comm #{} (attempt {}/{})",
            self.transaction_id,
            self.request.command(),
            self.comm_number,
            self.attempt_count,
            policy.max_attempts
        );

        self.state = SessionState::AwaitingResponse;
        self.deadline = Some(self.cap(Instant::now() + policy.attempt_timeout));
        self.await_reply(transport, codec, policy).await
    }

    async fn await_poll(
        &mut self,
        transport: &mut SerialInterface,
        codec: &FrameCodec,
        policy: &SessionPolicy,
    ) -> Result<(), Wait> {
        let deadline = self.cap(Instant::now() + policy.attempt_timeout);
        loop {
            let frame = self.next_frame(transport, codec, deadline).await?;
            if frame.command == Command::Poll.code() {
                return Ok(());
            }
            if policy.acknowledge_reports && frame.command != Command::Ack.code() {
                Self::acknowledge(transport, codec).await.map_err(Wait::Fatal)?;
            }
        }
    }

    async fn await_reply(
        &mut self,
        transport: &mut SerialInterface,
        codec: &FrameCodec,
        policy: &SessionPolicy,
    ) -> Wait {
        let expectation = self.request.expectation();
        loop {
            let deadline = self.deadline.unwrap_or_else(Instant::now);
            let frame = match self.next_frame(transport, codec, deadline).await {
                Ok(frame) => frame,
                // A dispense already under way must not be re-sent; keep listening.
                Err(Wait::Retry(RetryReason::Corrupt(_)))
                    if self.accepted && !self.request.is_idempotent() =>
                {
                    continue
                }
                Err(wait) => return wait,
            };

            let command = Command::from_code(frame.command);
            if command == Some(Command::Ack) {
                if expectation == Expectation::Ack {
                    return Wait::Reply(frame);
                }
                if !self.accepted {
                    log::debug!("[{}] accepted by VMC", self.transaction_id);
                    self.accepted = true;
                }
                continue;
            }

            if policy.acknowledge_reports {
                if let Err(e) = Self::acknowledge(transport, codec).await {
                    return Wait::Fatal(e);
                }
            }

            match (expectation, command) {
                (Expectation::Report { command: expected, aisle }, Some(cmd)) if cmd == expected => {
                    let Some(aisle) = aisle else {
                        return Wait::Reply(frame);
                    };
                    match StatusReport::parse(&frame.payload) {
                        Some(report)
                            if report.aisle == aisle
                                && (!policy.match_comm_number || report.comm_number == self.comm_number) =>
                        {
                            if cmd == Command::DispensingStatus && report.code == DISPENSE_IN_PROGRESS {
                                self.accepted = true;
                                self.deadline = Some(self.cap(Instant::now() + policy.progress_timeout));
                                log::info!("[{}] aisle {} dispensing", self.transaction_id, aisle);
                                continue;
                            }
                            return Wait::Reply(frame);
                        }
                        Some(report) if report.aisle == aisle => log::debug!(
                            "[{}] ignoring stale {:?} for aisle {} (comm #{}, expected #{})",
                            self.transaction_id,
                            cmd,
                            aisle,
                            report.comm_number,
                            self.comm_number
                        ),
                        Some(report) => log::debug!(
                            "[{}] ignoring {:?} for aisle {} (waiting on {})",
                            self.transaction_id,
                            cmd,
                            report.aisle,
                            aisle
                        ),
                        None => log::warn!(
                            "[{}] malformed {:?} payload: {}",
                            self.transaction_id,
                            cmd,
                            hex::encode(&frame.payload)
                        ),
                    }
                }
                (_, Some(Command::Poll)) => {}
                (_, other) => log::debug!(
                    "[{}] ignoring unsolicited frame 0x{:02X} ({:?})",
                    self.transaction_id,
                    frame.command,
                    other
                ),
            }
        }
    }

    fn cap(&self, deadline: Instant) -> Instant {
        match self.hard_deadline {
            Some(hard) => deadline.min(hard),
            None => deadline,
        }
    }

    async fn next_frame(
        &mut self,
        transport: &mut SerialInterface,
        codec: &FrameCodec,
        deadline: Instant,
    ) -> Result<Frame, Wait> {
        let raw = match transport.read_until(|buf| codec.boundary(buf), deadline).await {
            Ok(raw) => raw,
            Err(SerialError::Timeout) => return Err(Wait::Retry(RetryReason::Timeout)),
            Err(e) => return Err(Wait::Fatal(e)),
        };
        codec.decode(&raw).map_err(|e| {
            self.corrupt_frames += 1;
            log::warn!("[{}] corrupt frame {}: {}", self.transaction_id, hex::encode(&raw), e);
            Wait::Retry(RetryReason::Corrupt(e))
        })
    }

    async fn acknowledge(transport: &mut SerialInterface, codec: &FrameCodec) -> Result<(), SerialError> {
        let ack = codec.encode(&Frame::new(Command::Ack.code(), Vec::new()))?;
        transport.write(&ack).await
    }

    fn fail(&mut self, error: SerialError) -> SessionOutcome {
        self.state = SessionState::Failed;
        log::error!(
            "[{}] {:?} failed on attempt {}: {}",
            self.transaction_id,
            self.request.command(),
            self.attempt_count,
            error
        );
        SessionOutcome::Failed {
            error,
            attempts: self.attempt_count,
        }
    }
}
