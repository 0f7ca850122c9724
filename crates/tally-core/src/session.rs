use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::Level;
use uuid::Uuid;

use tally_observability::{redact_text, ObservabilityEvent, ProcessKind};
use tally_providers::ProviderRegistry;
use tally_tools::{Credential, ToolContext, ToolExecutor};
use tally_types::{ChatRequest, StreamFrame, TokenUsage};

use crate::audit::{AuditVerdict, CompletionAuditor, DrainDelay, DrainOutcome};
use crate::backend::ObsScope;
use crate::extract::{extract, ExtractionSource};
use crate::followup::{follow_up_messages, FollowUpFault, FollowUpSession};
use crate::normalize::{last_user_utterance, normalize_turns, to_chat_messages};
use crate::primary::{PrimaryFault, PrimaryRequest, PrimarySession};
use crate::relay::{FrameRelay, DEFAULT_BUFFER_CAPACITY};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the assistant of an invoicing application. \
Use the available tools to look up or change the signed-in user's invoices. \
After using a tool, always tell the user in plain words what you found or changed.";

const ERROR_FRAME_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Bound on the whole request, from open to the final frame.
    pub generation_deadline: Duration,
    pub drain_delay: Duration,
    pub buffer_capacity: usize,
    /// Frames the relay may queue ahead of a slow client.
    pub relay_capacity: usize,
    pub max_steps: usize,
    pub system_prompt: Option<String>,
    pub process: ProcessKind,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            generation_deadline: Duration::from_secs(120),
            drain_delay: Duration::from_millis(250),
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            relay_capacity: 32,
            max_steps: 8,
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            process: ProcessKind::Server,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Open,
    RelayingPrimary,
    Auditing,
    Done,
    NeedsFollowUp,
    RelayingFollowUp,
    Closed,
    Errored,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Open => "open",
            SessionPhase::RelayingPrimary => "relaying_primary",
            SessionPhase::Auditing => "auditing",
            SessionPhase::Done => "done",
            SessionPhase::NeedsFollowUp => "needs_follow_up",
            SessionPhase::RelayingFollowUp => "relaying_follow_up",
            SessionPhase::Closed => "closed",
            SessionPhase::Errored => "errored",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionPhase::Closed | SessionPhase::Errored)
    }

    pub fn can_transition(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        if self.is_terminal() {
            return false;
        }
        if next == Errored {
            return true;
        }
        matches!(
            (self, next),
            (Open, RelayingPrimary)
                | (RelayingPrimary, Auditing)
                | (Auditing, Done)
                | (Auditing, NeedsFollowUp)
                | (Done, Closed)
                | (NeedsFollowUp, RelayingFollowUp)
                | (NeedsFollowUp, Closed)
                | (RelayingFollowUp, Closed)
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal session transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    phase: SessionPhase,
    history: Vec<SessionPhase>,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            phase: SessionPhase::Open,
            history: vec![SessionPhase::Open],
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn history(&self) -> &[SessionPhase] {
        &self.history
    }

    pub fn transition(&mut self, next: SessionPhase) -> Result<(), IllegalTransition> {
        if !self.phase.can_transition(next) {
            return Err(IllegalTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Failures reported before any frame is sent; the caller can still answer
/// with a plain error response.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation has no usable turns")]
    EmptyConversation,
    #[error("{0}")]
    NoProvider(anyhow::Error),
    #[error(transparent)]
    Backend(PrimaryFault),
    #[error("generation deadline exceeded before the first frame")]
    DeadlineExceeded,
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::EmptyConversation => "EMPTY_CONVERSATION",
            SessionError::NoProvider(_) => "PROVIDER_NOT_CONFIGURED",
            SessionError::Backend(fault) => fault.code(),
            SessionError::DeadlineExceeded => "DEADLINE_EXCEEDED",
        }
    }
}

impl From<PrimaryFault> for SessionError {
    fn from(value: PrimaryFault) -> Self {
        match value {
            PrimaryFault::DeadlineExceeded => SessionError::DeadlineExceeded,
            other => SessionError::Backend(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    Completed,
    ClientDisconnected,
    DeadlineExceeded,
    BackendFault { code: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FollowUpOutcome {
    #[default]
    NotNeeded,
    /// Needed, but no tool result could be recovered.
    Abandoned,
    Delivered {
        chars: usize,
    },
    Failed {
        reason: String,
    },
    Cancelled,
}

/// What happened to one session, available once its stream has closed.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub message_id: String,
    pub phases: Vec<SessionPhase>,
    pub termination: Termination,
    pub verdict: Option<AuditVerdict>,
    pub follow_up: FollowUpOutcome,
    pub extraction: Option<ExtractionSource>,
    pub tool_calls: usize,
    /// The full outward frame sequence, in delivery order.
    pub frames: Vec<StreamFrame>,
    pub buffer_truncated: bool,
    pub usage: Option<TokenUsage>,
}

impl SessionReport {
    pub fn follow_up_started(&self) -> bool {
        self.phases.contains(&SessionPhase::RelayingFollowUp)
    }
}

/// Encoded frames of one session. Dropping the stream cancels the session.
pub struct FrameStream {
    rx: mpsc::Receiver<String>,
    _guard: DropGuard,
}

impl Stream for FrameStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.rx.poll_recv(cx)
    }
}

pub struct ReportHandle {
    rx: oneshot::Receiver<SessionReport>,
}

impl ReportHandle {
    /// Resolves once the session task has finished.
    pub async fn wait(self) -> Option<SessionReport> {
        self.rx.await.ok()
    }
}

pub struct ChatSession {
    message_id: String,
    frames: FrameStream,
    report: ReportHandle,
}

impl ChatSession {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn split(self) -> (FrameStream, ReportHandle) {
        (self.frames, self.report)
    }

    /// Reads the stream to its end, then returns every payload with the report.
    pub async fn collect(self) -> (Vec<String>, Option<SessionReport>) {
        let (mut frames, report) = self.split();
        let mut payloads = Vec::new();
        while let Some(payload) = frames.rx.recv().await {
            payloads.push(payload);
        }
        (payloads, report.wait().await)
    }
}

#[derive(Clone)]
pub struct ChatOrchestrator {
    providers: ProviderRegistry,
    tools: Arc<dyn ToolExecutor>,
    config: Arc<OrchestratorConfig>,
}

impl ChatOrchestrator {
    pub fn new(
        providers: ProviderRegistry,
        tools: Arc<dyn ToolExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            providers,
            tools,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tools(&self) -> &Arc<dyn ToolExecutor> {
        &self.tools
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Normalizes the request and opens the primary stream. On success the
    /// session runs on its own task and the returned handle carries its frames.
    pub async fn open(
        &self,
        request: ChatRequest,
        credential: Credential,
    ) -> Result<ChatSession, SessionError> {
        let turns = normalize_turns(&request.messages);
        if turns.is_empty() {
            tally_observability::emit_event(
                Level::INFO,
                self.config.process,
                ObservabilityEvent {
                    status: Some("rejected"),
                    error_code: Some("EMPTY_CONVERSATION"),
                    ..ObservabilityEvent::new("chat.session.rejected", "chat.session")
                },
            );
            return Err(SessionError::EmptyConversation);
        }
        let (provider_id, model_id) = match request.model {
            Some(spec) => (Some(spec.provider_id), Some(spec.model_id)),
            None => (None, None),
        };
        let provider = self
            .providers
            .select_provider(provider_id.as_deref())
            .map_err(SessionError::NoProvider)?;

        let message_id = format!("msg_{}", Uuid::new_v4().simple());
        let obs = ObsScope {
            process: self.config.process,
            component: "chat.session",
            message_id: message_id.clone(),
            provider_id: provider.info().id,
            model_id: model_id.clone(),
        };
        let utterance = last_user_utterance(&turns);
        let redacted = utterance.as_deref().map(redact_text).unwrap_or_default();
        obs.emit(
            Level::INFO,
            ObservabilityEvent {
                status: Some("open"),
                detail: Some(&redacted),
                ..obs.event("chat.session.open")
            },
        );

        let cancel = CancellationToken::new();
        let deadline = Instant::now() + self.config.generation_deadline;
        let history = to_chat_messages(self.config.system_prompt.as_deref(), &turns);
        let opening = PrimarySession::open(PrimaryRequest {
            provider: provider.clone(),
            model: model_id.clone(),
            tools: self.tools.clone(),
            tool_ctx: ToolContext::new(credential, cancel.clone()),
            history,
            max_steps: self.config.max_steps,
            message_id: message_id.clone(),
            process: self.config.process,
        });
        let primary = match tokio::time::timeout_at(deadline, opening).await {
            Ok(Ok(primary)) => primary,
            Ok(Err(fault)) => {
                cancel.cancel();
                return Err(fault.into());
            }
            Err(_) => {
                cancel.cancel();
                obs.emit(
                    Level::WARN,
                    ObservabilityEvent {
                        status: Some("failed"),
                        error_code: Some("DEADLINE_EXCEEDED"),
                        ..obs.event("chat.session.closed")
                    },
                );
                return Err(SessionError::DeadlineExceeded);
            }
        };

        let (tx, rx) = mpsc::channel(self.config.relay_capacity.max(1));
        let (report_tx, report_rx) = oneshot::channel();
        let driver = SessionDriver {
            relay: FrameRelay::new(message_id.clone(), tx, self.config.buffer_capacity),
            cancel: cancel.clone(),
            deadline,
            drain: DrainDelay::new(self.config.drain_delay),
            followup: FollowUpSession::new(provider, model_id, obs.clone()),
            utterance,
            obs,
        };
        tokio::spawn(async move {
            let report = driver.drive(primary).await;
            let _ = report_tx.send(report);
        });

        Ok(ChatSession {
            message_id,
            frames: FrameStream {
                rx,
                _guard: cancel.drop_guard(),
            },
            report: ReportHandle { rx: report_rx },
        })
    }
}

enum Stop {
    Primary(PrimaryFault),
    Disconnected,
    Deadline,
}

#[derive(Default)]
struct Progress {
    verdict: Option<AuditVerdict>,
    follow_up: FollowUpOutcome,
    extraction: Option<ExtractionSource>,
    tool_calls: usize,
    usage: Option<TokenUsage>,
}

/// Producer side of one session. Owns the relay, so the outward channel
/// closes exactly once, when the driver is dropped.
struct SessionDriver {
    relay: FrameRelay,
    cancel: CancellationToken,
    deadline: Instant,
    drain: DrainDelay,
    followup: FollowUpSession,
    utterance: Option<String>,
    obs: ObsScope,
}

impl SessionDriver {
    async fn drive(mut self, primary: PrimarySession) -> SessionReport {
        let deadline = self.deadline;
        let mut state = SessionState::new();
        let mut progress = Progress::default();
        let result = tokio::select! {
            biased;
            result = self.phases(primary, &mut state, &mut progress) => result,
            _ = tokio::time::sleep_until(deadline) => Err(Stop::Deadline),
        };

        let termination = match result {
            Ok(()) => Termination::Completed,
            Err(stop) => {
                self.cancel.cancel();
                if matches!(progress.follow_up, FollowUpOutcome::NotNeeded)
                    && state.phase() == SessionPhase::RelayingFollowUp
                {
                    progress.follow_up = FollowUpOutcome::Cancelled;
                }
                let termination = self.terminate(stop).await;
                self.advance(&mut state, SessionPhase::Errored);
                termination
            }
        };

        let report = SessionReport {
            message_id: self.relay.message_id().to_string(),
            phases: state.history().to_vec(),
            termination,
            verdict: progress.verdict,
            follow_up: progress.follow_up,
            extraction: progress.extraction,
            tool_calls: progress.tool_calls,
            frames: self.relay.delivered().to_vec(),
            buffer_truncated: self.relay.buffer().is_truncated(),
            usage: progress.usage,
        };
        let status = match &report.termination {
            Termination::Completed => "completed",
            Termination::ClientDisconnected => "client_disconnected",
            Termination::DeadlineExceeded => "deadline_exceeded",
            Termination::BackendFault { .. } => "backend_fault",
        };
        let error_code = match &report.termination {
            Termination::BackendFault { code } => Some(code.as_str()),
            _ => None,
        };
        self.obs.emit(
            if report.termination == Termination::Completed {
                Level::INFO
            } else {
                Level::WARN
            },
            ObservabilityEvent {
                status: Some(status),
                error_code,
                detail: Some(state.phase().as_str()),
                ..self.obs.event("chat.session.closed")
            },
        );
        report
    }

    async fn phases(
        &mut self,
        primary: PrimarySession,
        state: &mut SessionState,
        progress: &mut Progress,
    ) -> Result<(), Stop> {
        self.advance(state, SessionPhase::RelayingPrimary);
        let outcome = primary
            .run(&mut self.relay, &self.cancel)
            .await
            .map_err(Stop::Primary)?;
        progress.tool_calls = outcome.steps.len();
        progress.usage = outcome.usage;

        self.advance(state, SessionPhase::Auditing);
        if self.drain.wait(&self.cancel).await == DrainOutcome::Cancelled {
            return Err(Stop::Disconnected);
        }
        let verdict = CompletionAuditor::audit(&outcome.steps, self.relay.saw_text(), &outcome.text);
        progress.verdict = Some(verdict);
        self.obs.emit(
            Level::INFO,
            ObservabilityEvent {
                status: Some(verdict.as_str()),
                ..self.obs.event("chat.audit.verdict")
            },
        );

        let mut finish_reason = outcome.finish_reason.clone();
        match verdict {
            AuditVerdict::Done => self.advance(state, SessionPhase::Done),
            AuditVerdict::NeedsFollowUp => {
                self.advance(state, SessionPhase::NeedsFollowUp);
                match extract(&outcome.steps, self.relay.buffer().as_str()) {
                    None => {
                        progress.follow_up = FollowUpOutcome::Abandoned;
                        self.obs.emit(
                            Level::INFO,
                            ObservabilityEvent {
                                status: Some("abandoned"),
                                detail: Some("no tool result recovered"),
                                ..self.obs.event("chat.followup.abandoned")
                            },
                        );
                    }
                    Some(extraction) => {
                        progress.extraction = Some(extraction.source);
                        self.advance(state, SessionPhase::RelayingFollowUp);
                        let messages =
                            follow_up_messages(self.utterance.as_deref(), &extraction.result);
                        match self
                            .followup
                            .run(messages, &mut self.relay, &self.cancel)
                            .await
                        {
                            Ok(summary) => {
                                finish_reason = summary.finish_reason.clone();
                                if let Some(usage) = summary.usage {
                                    progress
                                        .usage
                                        .get_or_insert_with(TokenUsage::default)
                                        .accumulate(&usage);
                                }
                                progress.follow_up = FollowUpOutcome::Delivered {
                                    chars: summary.text.chars().count(),
                                };
                            }
                            Err(FollowUpFault::Disconnected | FollowUpFault::Cancelled) => {
                                progress.follow_up = FollowUpOutcome::Cancelled;
                                return Err(Stop::Disconnected);
                            }
                            Err(fault) => {
                                progress.follow_up = FollowUpOutcome::Failed {
                                    reason: fault.kind().to_string(),
                                };
                            }
                        }
                    }
                }
            }
        }

        self.relay
            .forward(&StreamFrame::MessageFinish {
                finish_reason,
                usage: progress.usage,
            })
            .await
            .map_err(|_| Stop::Disconnected)?;
        self.advance(state, SessionPhase::Closed);
        Ok(())
    }

    /// Ends a session that stopped early. Only faults the client can still
    /// hear about get an error frame.
    async fn terminate(&mut self, stop: Stop) -> Termination {
        let (termination, frame) = match stop {
            Stop::Disconnected
            | Stop::Primary(PrimaryFault::Cancelled)
            | Stop::Primary(PrimaryFault::Disconnected) => (Termination::ClientDisconnected, None),
            Stop::Deadline | Stop::Primary(PrimaryFault::DeadlineExceeded) => (
                Termination::DeadlineExceeded,
                Some(StreamFrame::Error {
                    code: "DEADLINE_EXCEEDED".to_string(),
                    message: "generation deadline exceeded".to_string(),
                }),
            ),
            Stop::Primary(fault) => (
                Termination::BackendFault {
                    code: fault.code().to_string(),
                },
                Some(StreamFrame::Error {
                    code: fault.code().to_string(),
                    message: fault.to_string(),
                }),
            ),
        };
        if let Some(frame) = frame {
            let _ = tokio::time::timeout(ERROR_FRAME_GRACE, self.relay.forward(&frame)).await;
        }
        termination
    }

    fn advance(&self, state: &mut SessionState, next: SessionPhase) {
        if let Err(err) = state.transition(next) {
            tracing::warn!(
                message_id = %self.relay.message_id(),
                error = %err,
                "rejected session phase change"
            );
        }
    }
}
