//! Generation collaborator client: streaming LLM + TTS responses.
//!
//! One request carries the finalized utterance plus situational context
//! (current recipe step, neighbours, a bounded history window). The
//! response is an ordered stream of `data:`-prefixed JSON records which
//! this client decodes into typed [`StreamEvent`]s on a channel, in strict
//! arrival order. Malformed records are skipped with a warning; the stream
//! continues. A deliberately cancelled request produces no event at all.

use crate::config::BackendConfig;
use crate::dialogue::HistoryTurn;
use crate::error::{Result, VoiceError};
use crate::sse::SseRecordParser;
use base64::Engine;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Channel capacity for decoded stream events.
const EVENT_CHANNEL_SIZE: usize = 32;

/// Step-navigation intent resolved by the backend from the utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepIntent {
    /// Advance to the next recipe step.
    NextStep,
    /// Go back to the previous recipe step.
    PrevStep,
    /// The user is wrapping up.
    Finish,
}

impl StepIntent {
    /// Parse the wire value leniently; unknown intents carry no navigation.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "next_step" => Some(Self::NextStep),
            "prev_step" => Some(Self::PrevStep),
            "finish" => Some(Self::Finish),
            _ => None,
        }
    }
}

/// Backend-resolved action accompanying an `llm` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnAction {
    /// The recipe is finished; the session ends.
    EndCooking,
    /// Requested navigation is not possible (e.g. already at step 1).
    Blocked,
    /// The user asked to stop; the session ends.
    Finish,
}

impl TurnAction {
    /// Parse the wire value leniently.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "end_cooking" => Some(Self::EndCooking),
            "blocked" => Some(Self::Blocked),
            "finish" => Some(Self::Finish),
            _ => None,
        }
    }

    /// Whether this action terminates the voice session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::EndCooking | Self::Finish)
    }
}

/// Decoded response-stream event, delivered in arrival order.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Assistant text arrived; audio follows.
    Llm {
        text: String,
        intent: Option<StepIntent>,
        action: Option<TurnAction>,
        delay_seconds: f64,
    },
    /// One chunk of synthesized PCM16 audio.
    TtsChunk {
        audio: Vec<u8>,
        sample_rate: Option<u32>,
    },
    /// The turn completed normally.
    Done,
    /// Server-reported failure inside the stream.
    ServerError { message: String },
    /// Transport-level failure (never emitted for a cancelled request).
    TransportError { message: String },
}

/// Situational context bundled with each generation request.
#[derive(Debug, Clone, Default)]
pub struct TurnContext {
    /// Description of the active recipe step.
    pub current_step: String,
    /// Recipe name.
    pub recipe_name: String,
    /// Adjacent-step summary string ("인접 단계: ...").
    pub recipe_context: String,
    /// Zero-based active step index.
    pub step_index: usize,
    /// Total number of steps.
    pub total_steps: usize,
    /// Bounded trailing window of settled turns.
    pub history: Vec<HistoryTurn>,
}

/// Wire shape of one stream record.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireRecord {
    Llm {
        #[serde(default)]
        text: String,
        #[serde(default)]
        intent: Option<String>,
        #[serde(default)]
        action: Option<String>,
        #[serde(default)]
        delay_seconds: Option<f64>,
    },
    TtsChunk {
        audio: String,
        #[serde(default)]
        sample_rate: Option<u32>,
    },
    Done,
    Error {
        #[serde(default)]
        message: String,
    },
}

/// HTTP client for the streaming generation collaborator.
#[derive(Debug, Clone)]
pub struct GenerationClient {
    client: reqwest::Client,
    base_url: String,
}

impl GenerationClient {
    /// Create a client for the configured backend.
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        }
    }

    /// Submit an utterance and stream back response events.
    ///
    /// Returns immediately; the request itself runs on a spawned task so
    /// the caller's control loop keeps polling while the response is in
    /// flight. Cancelling `cancel` tears the stream down silently: no
    /// further event is delivered after the token is observed.
    pub fn submit(
        &self,
        utterance: &str,
        context: &TurnContext,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        let form = reqwest::multipart::Form::new()
            .text("text", utterance.to_owned())
            .text("current_step", context.current_step.clone())
            .text("current_cook", context.recipe_name.clone())
            .text("recipe_context", context.recipe_context.clone())
            .text("step_index", context.step_index.to_string())
            .text("total_steps", context.total_steps.to_string())
            .text(
                "history",
                serde_json::to_string(&context.history).unwrap_or_else(|_| "[]".to_owned()),
            );

        let request = self
            .client
            .post(format!("{}/api/voice/process-text", self.base_url))
            .multipart(form);

        tokio::spawn(async move {
            run_stream(request, tx, cancel).await;
        });

        rx
    }
}

/// Drive one response stream to completion, cancellation, or failure.
async fn run_stream(
    request: reqwest::RequestBuilder,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    let response = tokio::select! {
        () = cancel.cancelled() => {
            debug!("generation request cancelled before response");
            return;
        }
        res = request.send() => res,
    };

    let response = match response {
        Ok(r) if r.status().is_success() => r,
        Ok(r) => {
            send_transport_error(&tx, &cancel, format!("HTTP {}", r.status())).await;
            return;
        }
        Err(e) => {
            send_transport_error(&tx, &cancel, format!("request failed: {e}")).await;
            return;
        }
    };

    let mut byte_stream = response.bytes_stream();
    let mut parser = SseRecordParser::new();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => {
                debug!("generation stream cancelled");
                return;
            }
            chunk = byte_stream.next() => chunk,
        };

        match chunk {
            Some(Ok(bytes)) => {
                for record in parser.feed(&bytes) {
                    if !deliver_record(&tx, &cancel, &record).await {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                send_transport_error(&tx, &cancel, format!("stream failed: {e}")).await;
                return;
            }
            None => break,
        }
    }

    if let Some(record) = parser.flush() {
        let _ = deliver_record(&tx, &cancel, &record).await;
    }
}

/// Decode one record and forward it. Returns false when the receiver is
/// gone or the token fired.
async fn deliver_record(
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    record: &str,
) -> bool {
    let event = match decode_record(record) {
        Ok(event) => event,
        Err(e) => {
            warn!("skipping malformed stream record: {e}");
            return true;
        }
    };
    if cancel.is_cancelled() {
        return false;
    }
    tx.send(event).await.is_ok()
}

/// Decode one `data:` payload into a typed event.
pub fn decode_record(record: &str) -> Result<StreamEvent> {
    let wire: WireRecord = serde_json::from_str(record)
        .map_err(|e| VoiceError::ProtocolParse(format!("{e}: {record}")))?;

    Ok(match wire {
        WireRecord::Llm {
            text,
            intent,
            action,
            delay_seconds,
        } => StreamEvent::Llm {
            text,
            intent: intent.as_deref().and_then(StepIntent::parse),
            action: action.as_deref().and_then(TurnAction::parse),
            delay_seconds: delay_seconds.unwrap_or(0.0),
        },
        WireRecord::TtsChunk { audio, sample_rate } => {
            let audio = base64::engine::general_purpose::STANDARD
                .decode(audio.as_bytes())
                .map_err(|e| VoiceError::ProtocolParse(format!("bad audio payload: {e}")))?;
            StreamEvent::TtsChunk { audio, sample_rate }
        }
        WireRecord::Done => StreamEvent::Done,
        WireRecord::Error { message } => StreamEvent::ServerError { message },
    })
}

async fn send_transport_error(
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &CancellationToken,
    message: String,
) {
    // A failure observed after cancellation is the cancellation itself;
    // swallow it.
    if cancel.is_cancelled() {
        debug!("suppressing post-cancel transport error: {message}");
        return;
    }
    let _ = tx.send(StreamEvent::TransportError { message }).await;
}
