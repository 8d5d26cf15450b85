//! Execution monitor for a single submitted prompt.
//!
//! [`ExecutionMonitor::open`] connects a fresh push channel (one client ID
//! per request) and spawns a reader task that parses frames into
//! [`ComfyUIMessage`]s and forwards them over an mpsc channel. The
//! awaiting task then calls [`MonitorSession::wait_for_completion`],
//! which selects over inbound frames, a heartbeat ticker, the idle
//! deadline, and the caller's cancellation/deadline until exactly one
//! terminal state is reached.
//!
//! The channel is opened before the prompt is submitted so a fast job
//! cannot finish unobserved. Frames that arrive in the meantime are
//! buffered and only correlated once the prompt ID is known.

use std::borrow::Cow;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use relay_core::context::RequestContext;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::api::PromptId;
use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIStream};
use crate::messages::{parse_message, ComfyUIMessage, ProgressData};

/// Frames buffered between the reader task and the awaiting task.
const INBOUND_CHANNEL_CAPACITY: usize = 64;

/// Bound on the best-effort close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Cap on timer durations so `Instant` arithmetic cannot overflow.
const MAX_TIMER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Callback invoked for every progress frame of the awaited prompt.
pub type ProgressCallback<'a> = &'a (dyn Fn(&ProgressData) + Send + Sync);

/// Timing parameters for the monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Maximum silence on the channel before giving up. Any inbound frame
    /// (including heartbeat replies) resets it.
    pub idle_timeout: Duration,
    /// Interval between outbound ping frames.
    pub heartbeat_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Lifecycle of one monitored prompt. The last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Connecting,
    Streaming,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl MonitorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            MonitorState::Completed
                | MonitorState::Failed
                | MonitorState::TimedOut
                | MonitorState::Cancelled
        )
    }
}

/// Errors that end a monitor session without completion.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Opening, reading, or writing the push channel failed.
    #[error(transparent)]
    Channel(#[from] ComfyUIClientError),

    /// The server closed the channel before the prompt finished.
    #[error("ComfyUI closed the push channel: {0}")]
    ChannelClosed(String),

    /// ComfyUI reported an execution error. Payload kept verbatim.
    #[error("ComfyUI execution error: {0}")]
    ExecutionFailed(serde_json::Value),

    /// No frame arrived within the idle window.
    #[error("No message from ComfyUI for {0:?}")]
    IdleTimeout(Duration),

    /// The request deadline passed while waiting.
    #[error("Request deadline exceeded while waiting for completion")]
    DeadlineExceeded,

    /// The caller cancelled the request.
    #[error("Monitoring cancelled by caller")]
    Cancelled,
}

impl MonitorError {
    /// Terminal state this error corresponds to.
    pub fn terminal_state(&self) -> MonitorState {
        match self {
            MonitorError::Channel(_)
            | MonitorError::ChannelClosed(_)
            | MonitorError::ExecutionFailed(_) => MonitorState::Failed,
            MonitorError::IdleTimeout(_) | MonitorError::DeadlineExceeded => MonitorState::TimedOut,
            MonitorError::Cancelled => MonitorState::Cancelled,
        }
    }
}

/// What the reader task forwards to the awaiting task.
#[derive(Debug)]
enum Inbound {
    Message(ComfyUIMessage),
    /// Any other frame: pong, binary preview, unknown or malformed text.
    Activity,
    Closed(String),
    Failed(String),
}

/// Opens monitor sessions against one ComfyUI push endpoint.
#[derive(Debug, Clone)]
pub struct ExecutionMonitor {
    client: ComfyUIClient,
    config: MonitorConfig,
}

impl ExecutionMonitor {
    pub fn new(client: ComfyUIClient, config: MonitorConfig) -> Self {
        Self { client, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Connect a new push channel and start reading from it.
    pub async fn open(&self, ctx: &RequestContext) -> Result<MonitorSession, MonitorError> {
        let conn = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(MonitorError::Cancelled),
            _ = ctx.deadline_elapsed() => return Err(MonitorError::DeadlineExceeded),
            conn = self.client.connect() => conn.inspect_err(|e| {
                tracing::warn!(ws_url = %self.client.ws_url(), error = %e, "Push channel connect failed");
            })?,
        };

        let (sink, stream) = conn.ws_stream.split();
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let client_id = conn.client_id;

        let reader = tokio::spawn(read_frames(stream, tx, client_id.clone()));

        let mut session = MonitorSession {
            client_id,
            config: self.config.clone(),
            sink,
            inbound: rx,
            reader,
            state: MonitorState::Connecting,
        };
        session.transition(MonitorState::Streaming);
        Ok(session)
    }
}

/// One open push channel, bound to a single client ID.
///
/// Dropping the session stops the reader task and closes the socket.
pub struct MonitorSession {
    client_id: String,
    config: MonitorConfig,
    sink: SplitSink<ComfyUIStream, Message>,
    inbound: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
    state: MonitorState,
}

impl MonitorSession {
    /// Client ID to submit the prompt with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Wait until `prompt_id` completes, fails, times out, or the caller
    /// cancels. The channel is closed before returning on every path.
    pub async fn wait_for_completion(
        &mut self,
        prompt_id: &PromptId,
        ctx: &RequestContext,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<(), MonitorError> {
        if self.state.is_terminal() {
            return Err(MonitorError::ChannelClosed(
                "session already finished".into(),
            ));
        }

        let outcome = self.run_until_terminal(prompt_id, ctx, on_progress).await;

        let terminal = match &outcome {
            Ok(()) => MonitorState::Completed,
            Err(e) => e.terminal_state(),
        };
        self.transition(terminal);
        self.close().await;

        match &outcome {
            Ok(()) => tracing::debug!(prompt_id = %prompt_id, "Execution complete"),
            Err(MonitorError::Cancelled) => {
                tracing::info!(prompt_id = %prompt_id, "Monitoring cancelled")
            }
            Err(e) => tracing::warn!(prompt_id = %prompt_id, error = %e, "Monitoring ended without completion"),
        }
        outcome
    }

    async fn run_until_terminal(
        &mut self,
        prompt_id: &PromptId,
        ctx: &RequestContext,
        on_progress: Option<ProgressCallback<'_>>,
    ) -> Result<(), MonitorError> {
        let idle_timeout = self.config.idle_timeout.min(MAX_TIMER);
        let heartbeat_interval = self.config.heartbeat_interval.min(MAX_TIMER);

        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_interval, heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(MonitorError::Cancelled),
                _ = ctx.deadline_elapsed() => return Err(MonitorError::DeadlineExceeded),
                inbound = self.inbound.recv() => {
                    idle.as_mut().reset(Instant::now() + idle_timeout);
                    match inbound {
                        Some(Inbound::Message(msg)) => {
                            if let Some(result) = handle_message(msg, prompt_id, on_progress) {
                                return result;
                            }
                        }
                        Some(Inbound::Activity) => {}
                        Some(Inbound::Closed(reason)) => {
                            return Err(MonitorError::ChannelClosed(reason));
                        }
                        Some(Inbound::Failed(e)) => {
                            return Err(ComfyUIClientError::Protocol(e).into());
                        }
                        None => {
                            return Err(MonitorError::ChannelClosed("reader stopped".into()));
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    tracing::trace!(client_id = %self.client_id, "Sending heartbeat ping");
                    if let Err(e) = self.sink.send(Message::Ping(Vec::new())).await {
                        return Err(ComfyUIClientError::Protocol(format!("heartbeat failed: {e}")).into());
                    }
                }
                _ = &mut idle => return Err(MonitorError::IdleTimeout(idle_timeout)),
            }
        }
    }

    /// Send a normal close frame (best effort) and stop the reader.
    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        };
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.sink.send(Message::Close(Some(frame)))).await;
        self.reader.abort();
    }

    fn transition(&mut self, next: MonitorState) {
        debug_assert!(
            !self.state.is_terminal(),
            "monitor left terminal state {:?}",
            self.state
        );
        tracing::debug!(client_id = %self.client_id, from = ?self.state, to = ?next, "Monitor state change");
        self.state = next;
    }
}

impl std::fmt::Debug for MonitorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorSession")
            .field("client_id", &self.client_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for MonitorSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Decide whether a message ends the wait. `None` means keep waiting.
fn handle_message(
    msg: ComfyUIMessage,
    prompt_id: &PromptId,
    on_progress: Option<ProgressCallback<'_>>,
) -> Option<Result<(), MonitorError>> {
    match msg {
        ComfyUIMessage::Executing(data) => {
            if data.completes(prompt_id.as_str()) {
                return Some(Ok(()));
            }
            tracing::trace!(
                prompt_id = ?data.prompt_id,
                node = ?data.node,
                "Executing node",
            );
        }
        ComfyUIMessage::Progress(data) => {
            if data.prompt_id.as_deref() == Some(prompt_id.as_str()) {
                tracing::trace!(value = data.value, max = data.max, "Generation progress");
                if let Some(cb) = on_progress {
                    cb(&data);
                }
            }
        }
        ComfyUIMessage::ExecutionError(payload) => {
            // The channel is scoped to one client ID, so an error here is
            // attributed to the awaited prompt. Logged by the caller.
            tracing::debug!(prompt_id = %prompt_id, "Execution error frame received");
            return Some(Err(MonitorError::ExecutionFailed(payload)));
        }
        ComfyUIMessage::ExecutionStart(data) => {
            if data.prompt_id == prompt_id.as_str() {
                tracing::debug!(prompt_id = %prompt_id, "Execution started");
            }
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::trace!(prompt_id = %data.prompt_id, cached = data.nodes.len(), "Execution used cache");
        }
        ComfyUIMessage::Executed(data) => {
            tracing::trace!(prompt_id = %data.prompt_id, node = %data.node, "Node executed with output");
        }
        ComfyUIMessage::Status(data) => {
            tracing::trace!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
    }
    None
}

/// Reader task: forward every frame until the socket closes or the
/// receiving side goes away.
async fn read_frames(
    mut stream: SplitStream<ComfyUIStream>,
    tx: mpsc::Sender<Inbound>,
    client_id: String,
) {
    while let Some(frame) = stream.next().await {
        let inbound = match frame {
            Ok(Message::Text(text)) => match parse_message(&text) {
                Ok(msg) => Inbound::Message(msg),
                Err(e) => {
                    tracing::trace!(client_id = %client_id, error = %e, "Ignoring unrecognised ComfyUI message");
                    Inbound::Activity
                }
            },
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| format!("{} {}", u16::from(f.code), f.reason))
                    .unwrap_or_else(|| "no close frame".into());
                let _ = tx.send(Inbound::Closed(reason)).await;
                return;
            }
            // Binary frames carry preview images; ping/pong are answered
            // by tungstenite. All of them count as liveness.
            Ok(_) => Inbound::Activity,
            Err(e) => {
                let _ = tx.send(Inbound::Failed(e.to_string())).await;
                return;
            }
        };

        if tx.send(inbound).await.is_err() {
            return;
        }
    }
    let _ = tx.send(Inbound::Closed("stream ended".into())).await;
}
