//! Main pipeline orchestrator.
//!
//! One control loop owns every piece of cross-stage state: the phase
//! machine, the dialogue log, the utterance buffer, the segment recorder,
//! timer deadlines, and in-flight request bookkeeping. Audio capture runs
//! on its own task and feeds amplitude frames over a channel; network
//! calls run on spawned tasks whose completions come back over channels,
//! so the VAD keeps ticking while a transcription or response is in
//! flight. That is what makes barge-in possible: speech onset during
//! `TtsStreaming` synchronously stops playback and aborts the stream
//! before the new segment starts recording.

use crate::audio::capture::CpalCapture;
use crate::audio::playback::StreamPlayer;
use crate::config::VoiceConfig;
use crate::dialogue::{MessageLog, MessageStatus, Role};
use crate::error::{Result, VoiceError};
use crate::generation::{GenerationClient, StepIntent, StreamEvent, TurnAction, TurnContext};
use crate::hints::{self, IdleHintScheduler};
use crate::pipeline::messages::{AmplitudeFrame, PipelineEvent, PipelinePhase};
use crate::segment::{AudioSegment, SegmentRecorder};
use crate::session::{CookHandoff, SessionClient};
use crate::stt::{SttResult, TranscriptionClient};
use crate::utterance::{FlushDecision, UtteranceBuffer};
use crate::vad::{EnergyVad, VadEvent};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel buffer sizes.
const AUDIO_CHANNEL_SIZE: usize = 64;
const STT_CHANNEL_SIZE: usize = 4;

/// Trailing turns included in each generation request.
const HISTORY_WINDOW: usize = 6;

/// Fallback delay before leaving the page after a terminal action.
const DEFAULT_END_DELAY_SECS: f64 = 3.0;

/// User-visible failure notice for recoverable errors.
const APOLOGY_MESSAGE: &str = "⚠️ 잠시 문제가 생겼어요. 나중에 시도해주세요!";
/// Placeholder while a segment is being recognized.
const RECOGNIZING_MESSAGE: &str = "인식 중...";
/// Placeholder while a response is being generated.
const THINKING_MESSAGE: &str = "생각 중...";
/// Terminal notice when the microphone cannot be used at all.
const MIC_PERMISSION_MESSAGE: &str = "마이크 권한을 확인해주세요.";
const MIC_UNSUPPORTED_MESSAGE: &str = "이 기기에서는 마이크를 사용할 수 없어요.";

/// Orchestrates the full voice pipeline.
pub struct PipelineCoordinator {
    config: VoiceConfig,
    handoff: CookHandoff,
    handoff_path: Option<PathBuf>,
    cancel: CancellationToken,
    event_tx: Option<broadcast::Sender<PipelineEvent>>,
    audio_rx: Option<mpsc::Receiver<AmplitudeFrame>>,
    player: Option<StreamPlayer>,
}

impl PipelineCoordinator {
    /// Create a coordinator for the given session context.
    pub fn new(config: VoiceConfig, handoff: CookHandoff) -> Self {
        Self {
            config,
            handoff,
            handoff_path: None,
            cancel: CancellationToken::new(),
            event_tx: None,
            audio_rx: None,
            player: None,
        }
    }

    /// Emit observer events on the given channel.
    #[must_use]
    pub fn with_events(mut self, tx: broadcast::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Use an injected amplitude-frame source instead of the microphone.
    #[must_use]
    pub fn with_audio_source(mut self, rx: mpsc::Receiver<AmplitudeFrame>) -> Self {
        self.audio_rx = Some(rx);
        self
    }

    /// Use an injected player instead of the default output device.
    #[must_use]
    pub fn with_player(mut self, player: StreamPlayer) -> Self {
        self.player = Some(player);
        self
    }

    /// Persist the handoff context to this path at transition points.
    #[must_use]
    pub fn with_handoff_path(mut self, path: PathBuf) -> Self {
        self.handoff_path = Some(path);
        self
    }

    /// Token that stops the pipeline when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a graceful shutdown (history save + handoff persist).
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the pipeline until session termination or shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only for capture-setup failures (permission denied
    /// or unsupported environment); everything downstream degrades back to
    /// the listening state.
    pub async fn run(mut self) -> Result<()> {
        info!("starting voice pipeline");

        let capture_cancel = self.cancel.child_token();
        let event_tx = self.event_tx.clone();
        let emit = |ev: PipelineEvent| {
            if let Some(tx) = &event_tx {
                let _ = tx.send(ev);
            }
        };

        // Stage 1: audio capture, unless a source was injected.
        let mut audio_rx = match self.audio_rx.take() {
            Some(rx) => rx,
            None => {
                let (tx, rx) = mpsc::channel::<AmplitudeFrame>(AUDIO_CHANNEL_SIZE);
                let capture = match CpalCapture::new(&self.config.audio) {
                    Ok(c) => c,
                    Err(e) => return Err(self.fail_setup(e)),
                };
                let cancel = capture_cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = capture.run(tx, cancel).await {
                        error!("audio capture failed: {e}");
                    }
                });
                rx
            }
        };

        // Playback, unless a player was injected.
        let player = match self.player.take() {
            Some(p) => p,
            None => {
                match StreamPlayer::with_cpal(&self.config.playback, &self.config.audio) {
                    Ok(p) => p,
                    Err(e) => return Err(self.fail_setup(e)),
                }
            }
        };

        let (stt_tx, mut stt_rx) = mpsc::channel::<(u64, Result<SttResult>)>(STT_CHANNEL_SIZE);

        let mut ctl = Controller {
            vad: EnergyVad::new(&self.config.vad),
            recorder: SegmentRecorder::new(&self.config.segment, self.config.audio.input_sample_rate),
            buffer: UtteranceBuffer::new(),
            log: MessageLog::new(),
            hints: IdleHintScheduler::new(self.config.hints.max_hints),
            player,
            phase: PipelinePhase::Idle,
            stt: TranscriptionClient::new(&self.config.backend),
            generation: GenerationClient::new(&self.config.backend),
            session: SessionClient::new(&self.config.backend),
            stt_tx,
            stt_seq: 0,
            stream_cancel: None,
            ai_msg_id: None,
            pending_user_id: None,
            turn_action: None,
            turn_delay: 0.0,
            flush_deadline: None,
            hint_deadline: None,
            end_deadline: None,
            ending: false,
            session_id: None,
            handoff: self.handoff,
            handoff_path: self.handoff_path,
            config: self.config,
            event_tx: self.event_tx,
            capture_cancel,
        };

        // One response stream at most; lives here so select! can poll it
        // while handlers mutate the controller.
        let mut stream_rx: Option<mpsc::Receiver<StreamEvent>> = None;

        ctl.startup().await;
        emit(PipelineEvent::Listening { active: true });

        let mut elapsed_ticker = tokio::time::interval_at(
            Instant::now() + Duration::from_secs(1),
            Duration::from_secs(1),
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    info!("pipeline shutdown requested");
                    ctl.finalize(&mut stream_rx).await;
                    break;
                }
                frame = audio_rx.recv() => {
                    match frame {
                        Some(frame) => ctl.handle_frame(frame, &mut stream_rx),
                        None => {
                            warn!("audio source closed");
                            ctl.finalize(&mut stream_rx).await;
                            break;
                        }
                    }
                }
                res = stt_rx.recv() => {
                    if let Some((seq, result)) = res {
                        ctl.handle_transcription(seq, result, &mut stream_rx);
                    }
                }
                ev = recv_opt(&mut stream_rx) => {
                    match ev {
                        Some(ev) => ctl.handle_stream_event(ev, &mut stream_rx),
                        None => ctl.handle_stream_closed(&mut stream_rx),
                    }
                }
                () = sleep_opt(ctl.flush_deadline) => {
                    ctl.flush_deadline = None;
                    debug!("extra wait elapsed, force-flushing utterance");
                    ctl.flush_utterance(&mut stream_rx);
                }
                () = sleep_opt(ctl.hint_deadline) => {
                    ctl.hint_deadline = None;
                    ctl.fire_hint();
                }
                () = sleep_opt(ctl.end_deadline) => {
                    ctl.end_deadline = None;
                    ctl.finalize(&mut stream_rx).await;
                    break;
                }
                _ = elapsed_ticker.tick() => {
                    ctl.handoff.elapsed_secs += 1;
                }
            }
        }

        info!("voice pipeline stopped");
        Ok(())
    }

    /// Surface a terminal capture-setup failure as a persistent message.
    fn fail_setup(&self, e: VoiceError) -> VoiceError {
        error!("capture setup failed: {e}");
        let text = match &e {
            VoiceError::PermissionDenied(_) => MIC_PERMISSION_MESSAGE,
            _ => MIC_UNSUPPORTED_MESSAGE,
        };
        if let Some(tx) = &self.event_tx {
            let message = crate::dialogue::DialogueMessage {
                id: uuid::Uuid::new_v4().to_string(),
                role: Role::System,
                text: text.to_owned(),
                status: MessageStatus::Error,
                timestamp: chrono::Utc::now(),
                restored: false,
            };
            let _ = tx.send(PipelineEvent::MessageAppended(message));
        }
        e
    }
}

/// Await the next event of an optional stream; pends forever when absent.
async fn recv_opt(rx: &mut Option<mpsc::Receiver<StreamEvent>>) -> Option<StreamEvent> {
    match rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep until an optional deadline; pends forever when unarmed.
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Live pipeline state, mutated exclusively from the control loop.
struct Controller {
    config: VoiceConfig,
    handoff: CookHandoff,
    handoff_path: Option<PathBuf>,
    event_tx: Option<broadcast::Sender<PipelineEvent>>,
    capture_cancel: CancellationToken,

    vad: EnergyVad,
    recorder: SegmentRecorder,
    buffer: UtteranceBuffer,
    log: MessageLog,
    hints: IdleHintScheduler,
    player: StreamPlayer,
    phase: PipelinePhase,

    stt: TranscriptionClient,
    generation: GenerationClient,
    session: SessionClient,
    session_id: Option<String>,

    stt_tx: mpsc::Sender<(u64, Result<SttResult>)>,
    /// Sequence number of the newest transcription request; stale results
    /// are dropped.
    stt_seq: u64,

    /// Abort token of the in-flight response stream, if any.
    stream_cancel: Option<CancellationToken>,

    /// Id of the assistant message for the current turn.
    ai_msg_id: Option<String>,
    /// Id of the user message holding the not-yet-flushed utterance text.
    pending_user_id: Option<String>,
    /// Action/delay carried from the turn's `llm` event to its `done`.
    turn_action: Option<TurnAction>,
    turn_delay: f64,

    flush_deadline: Option<Instant>,
    hint_deadline: Option<Instant>,
    end_deadline: Option<Instant>,
    /// A terminal action was received; capture is stopped and the session
    /// is winding down.
    ending: bool,
}

impl Controller {
    fn emit(&self, ev: PipelineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    fn emit_appended(&self, id: &str) {
        if let Some(message) = self.log.get(id) {
            self.emit(PipelineEvent::MessageAppended(message.clone()));
        }
    }

    fn emit_patched(&self, id: &str) {
        if let Some(message) = self.log.get(id) {
            self.emit(PipelineEvent::MessagePatched(message.clone()));
        }
    }

    fn set_phase(&mut self, phase: PipelinePhase) {
        if self.phase != phase {
            debug!("phase: {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
            self.emit(PipelineEvent::PhaseChanged(phase));
        }
    }

    /// Greeting, session create/restore, first idle-hint arm.
    async fn startup(&mut self) {
        let id = self
            .log
            .push(Role::System, hints::pick_welcome(), MessageStatus::Done);
        self.emit_appended(&id);

        match self.handoff.voice_session_id.clone() {
            Some(session_id) => match self.session.fetch_history(&session_id).await {
                Ok(messages) => {
                    let count = messages.len();
                    for entry in messages {
                        let role = if entry.role.eq_ignore_ascii_case("user") {
                            Role::User
                        } else {
                            Role::Assistant
                        };
                        let id = self.log.push_restored(role, entry.text);
                        self.emit_appended(&id);
                    }
                    info!("restored {count} history messages");
                }
                Err(e) => warn!("history restore failed: {e}"),
            },
            None => match self.session.create_session(self.config.backend.member_id).await {
                Ok(session_id) => {
                    info!("voice session created: {session_id}");
                    self.handoff.voice_session_id = Some(session_id);
                }
                Err(e) => warn!("session create failed: {e}"),
            },
        }
        self.session_id = self.handoff.voice_session_id.clone();

        self.arm_hint();
    }

    // ── timers ────────────────────────────────────────────────

    fn arm_flush(&mut self) {
        self.flush_deadline = Some(
            Instant::now() + Duration::from_millis(self.config.utterance.incomplete_extra_wait_ms),
        );
    }

    fn clear_flush(&mut self) {
        self.flush_deadline = None;
    }

    fn arm_hint(&mut self) {
        if self.hints.exhausted() || self.ending {
            self.hint_deadline = None;
            return;
        }
        self.hint_deadline = Some(Instant::now() + Duration::from_millis(self.config.hints.idle_ms));
    }

    fn fire_hint(&mut self) {
        // The timer guards idleness; fired mid-turn it defers instead.
        if self.phase != PipelinePhase::Idle || self.recorder.is_recording() {
            self.arm_hint();
            return;
        }
        if let Some(hint) = self.hints.fire() {
            let id = self.log.push(Role::System, hint, MessageStatus::Done);
            self.emit_appended(&id);
        }
        self.arm_hint();
    }

    // ── VAD / segmentation ────────────────────────────────────

    fn handle_frame(
        &mut self,
        frame: AmplitudeFrame,
        stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>,
    ) {
        if self.ending {
            return;
        }

        let tick = self.vad.tick(&frame);

        if self.recorder.is_recording() {
            self.recorder.push(&frame.samples);
        }

        match tick.event {
            Some(VadEvent::SpeechStarted) => {
                if self.phase == PipelinePhase::LlmWaiting {
                    // A committed response is pending: no new segment. Drop
                    // back to idle so continued speech re-triggers onset
                    // once the phase moves on (and barge-in still fires).
                    debug!("speech onset suppressed while awaiting response");
                    self.vad.reset();
                    return;
                }

                // Barge-in: new user speech always wins over an in-progress
                // assistant turn. Stop playback and abort the stream before
                // the new segment starts recording.
                if self.phase == PipelinePhase::TtsStreaming || self.player.is_active() {
                    info!("barge-in: cancelling assistant turn");
                    self.player.stop();
                    self.abort_stream(stream_rx);
                    self.set_phase(PipelinePhase::Idle);
                }

                // New speech supersedes a pending force-flush.
                self.clear_flush();

                self.recorder.start(frame.captured_at);
                self.recorder.push(&frame.samples);

                if self.log.thinking_id(Role::User).is_none() && self.pending_user_id.is_none() {
                    let id = self
                        .log
                        .push(Role::User, RECOGNIZING_MESSAGE, MessageStatus::Thinking);
                    self.emit_appended(&id);
                }
                self.emit(PipelineEvent::Speaking { active: true });
            }
            Some(VadEvent::SpeechEnded) => {
                self.emit(PipelineEvent::Speaking { active: false });
                match self.recorder.stop(frame.captured_at) {
                    Some(segment) => self.spawn_transcription(segment),
                    None => {
                        // Too short or lost: clear the recognizing bubble.
                        if let Some(removed) = self.log.remove_thinking(Role::User) {
                            self.emit(PipelineEvent::MessageRemoved { id: removed.id });
                        }
                    }
                }
            }
            None => {}
        }
    }

    fn spawn_transcription(&mut self, segment: AudioSegment) {
        let duration_ms = segment.duration().as_millis();
        info!("speech segment detected: {duration_ms}ms");

        self.stt_seq += 1;
        let seq = self.stt_seq;
        let stt = self.stt.clone();
        let tx = self.stt_tx.clone();
        tokio::spawn(async move {
            let result = stt.transcribe(&segment).await;
            let _ = tx.send((seq, result)).await;
        });
    }

    // ── transcription results ─────────────────────────────────

    fn handle_transcription(
        &mut self,
        seq: u64,
        result: Result<SttResult>,
        stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>,
    ) {
        if seq != self.stt_seq {
            debug!("dropping superseded transcription result");
            return;
        }

        let result = match result {
            Ok(r) => r,
            Err(e) => {
                error!("transcription failed: {e}");
                if let Some(removed) = self.log.remove_thinking(Role::User) {
                    self.emit(PipelineEvent::MessageRemoved { id: removed.id });
                }
                let id = self
                    .log
                    .push(Role::Assistant, APOLOGY_MESSAGE, MessageStatus::Error);
                self.emit_appended(&id);
                self.arm_hint();
                return;
            }
        };

        if result.text.is_empty() {
            debug!("transcription produced no text");
            if let Some(removed) = self.log.remove_thinking(Role::User) {
                self.emit(PipelineEvent::MessageRemoved { id: removed.id });
            }
            // Nothing usable heard; keep future guidance coming.
            self.arm_hint();
            return;
        }

        info!("recognized: \"{}\" [{:?}]", result.text, result.completeness);
        let decision = self.buffer.push(result.text, result.completeness);
        let joined = self.buffer.joined();

        if let Some(id) = self.pending_user_id.clone() {
            self.log.set_text(&id, joined);
            self.emit_patched(&id);
            // A later segment's recognizing bubble is now redundant.
            if let Some(removed) = self.log.remove_thinking(Role::User) {
                self.emit(PipelineEvent::MessageRemoved { id: removed.id });
            }
        } else if let Some(id) = self.log.thinking_id(Role::User).map(str::to_owned) {
            self.log.patch(&id, joined, MessageStatus::Pending);
            self.emit_patched(&id);
            self.pending_user_id = Some(id);
        } else {
            let id = self.log.push(Role::User, joined, MessageStatus::Pending);
            self.emit_appended(&id);
            self.pending_user_id = Some(id);
        }

        match decision {
            FlushDecision::FlushNow => self.flush_utterance(stream_rx),
            FlushDecision::ArmExtraWait => self.arm_flush(),
        }
    }

    // ── utterance flush / turn submission ─────────────────────

    fn flush_utterance(&mut self, stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>) {
        self.clear_flush();
        let Some(text) = self.buffer.take() else {
            return;
        };
        info!("utterance flushed: \"{text}\"");

        // History is the window of turns before this utterance.
        let context = self.turn_context();

        if let Some(id) = self.pending_user_id.take() {
            self.log.patch(&id, text.clone(), MessageStatus::Done);
            self.emit_patched(&id);
        } else {
            let id = self.log.push(Role::User, text.clone(), MessageStatus::Done);
            self.emit_appended(&id);
        }

        self.submit_turn(&text, context, stream_rx);
    }

    fn turn_context(&self) -> TurnContext {
        let index = self.handoff.current_step_index;
        let recipe = &self.handoff.recipe;
        TurnContext {
            current_step: recipe.step_desc(index).unwrap_or_default().to_owned(),
            recipe_name: recipe.name.clone(),
            recipe_context: recipe.neighbour_context(index),
            step_index: index,
            total_steps: recipe.steps.len(),
            history: self.log.history_window(HISTORY_WINDOW),
        }
    }

    fn submit_turn(
        &mut self,
        text: &str,
        context: TurnContext,
        stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>,
    ) {
        // At most one outstanding response stream.
        self.abort_stream(stream_rx);

        self.set_phase(PipelinePhase::LlmWaiting);
        let id = self
            .log
            .push(Role::Assistant, THINKING_MESSAGE, MessageStatus::Thinking);
        self.emit_appended(&id);

        self.ai_msg_id = None;
        self.turn_action = None;
        self.turn_delay = 0.0;

        let cancel = CancellationToken::new();
        let rx = self.generation.submit(text, &context, cancel.clone());
        self.stream_cancel = Some(cancel);
        *stream_rx = Some(rx);
    }

    fn abort_stream(&mut self, stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>) {
        if let Some(cancel) = self.stream_cancel.take() {
            cancel.cancel();
        }
        *stream_rx = None;
    }

    // ── response stream events ────────────────────────────────

    fn handle_stream_event(
        &mut self,
        ev: StreamEvent,
        stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>,
    ) {
        match ev {
            StreamEvent::Llm {
                text,
                intent,
                action,
                delay_seconds,
            } => {
                self.set_phase(PipelinePhase::TtsStreaming);
                self.player.init();
                self.turn_action = action;
                self.turn_delay = delay_seconds;

                if text.is_empty() {
                    // Action-only turn: no assistant bubble.
                    if let Some(removed) = self.log.remove_thinking(Role::Assistant) {
                        self.emit(PipelineEvent::MessageRemoved { id: removed.id });
                    }
                } else if let Some(id) = self.log.thinking_id(Role::Assistant).map(str::to_owned) {
                    self.log.patch(&id, text, MessageStatus::TtsStreaming);
                    self.emit_patched(&id);
                    self.ai_msg_id = Some(id);
                } else {
                    let id = self.log.push(Role::Assistant, text, MessageStatus::TtsStreaming);
                    self.emit_appended(&id);
                    self.ai_msg_id = Some(id);
                }

                // Navigation applies immediately, independent of audio.
                if let Some(intent) = intent {
                    self.apply_step_intent(intent, action);
                }
            }
            StreamEvent::TtsChunk { audio, sample_rate } => {
                if let Some(rate) = sample_rate {
                    self.player.set_sample_rate(rate);
                }
                self.player.play_chunk(&audio);
            }
            StreamEvent::Done => {
                if let Some(id) = self.ai_msg_id.take() {
                    self.log.set_status(&id, MessageStatus::Done);
                    self.emit_patched(&id);
                }
                self.set_phase(PipelinePhase::Idle);

                if self.turn_action.is_some_and(TurnAction::is_terminal) {
                    self.begin_termination();
                } else {
                    self.arm_hint();
                }
            }
            StreamEvent::ServerError { message } => {
                error!("{}", VoiceError::GenerationStream(message));
                self.fail_turn();
            }
            StreamEvent::TransportError { message } => {
                error!("{}", VoiceError::GenerationNetwork(message));
                self.fail_turn();
                self.abort_stream(stream_rx);
            }
        }
    }

    fn handle_stream_closed(&mut self, stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>) {
        debug!("response stream closed");
        *stream_rx = None;
        self.stream_cancel = None;
        if !self.ending {
            // A stream that ends without `done` must not leave the phase
            // stuck; playback of already-scheduled audio continues.
            self.set_phase(PipelinePhase::Idle);
        }
    }

    fn fail_turn(&mut self) {
        if let Some(removed) = self.log.remove_thinking(Role::Assistant) {
            self.emit(PipelineEvent::MessageRemoved { id: removed.id });
        }
        let id = self
            .log
            .push(Role::Assistant, APOLOGY_MESSAGE, MessageStatus::Error);
        self.emit_appended(&id);
        self.ai_msg_id = None;
        self.set_phase(PipelinePhase::Idle);
    }

    fn apply_step_intent(&mut self, intent: StepIntent, action: Option<TurnAction>) {
        let index = self.handoff.current_step_index;
        let last = self.handoff.recipe.steps.len().saturating_sub(1);
        let next = match intent {
            StepIntent::NextStep => {
                if action == Some(TurnAction::EndCooking) {
                    return;
                }
                index.saturating_add(1).min(last)
            }
            StepIntent::PrevStep => {
                if action == Some(TurnAction::Blocked) {
                    return;
                }
                index.saturating_sub(1)
            }
            StepIntent::Finish => return,
        };
        if next != index {
            info!("step {} -> {}", index + 1, next + 1);
            self.handoff.current_step_index = next;
            self.persist_handoff();
            self.emit(PipelineEvent::StepChanged { index: next });
        }
    }

    // ── termination ───────────────────────────────────────────

    fn begin_termination(&mut self) {
        info!("terminal action received; stopping capture");
        self.ending = true;
        self.capture_cancel.cancel();
        self.emit(PipelineEvent::Listening { active: false });
        self.hint_deadline = None;
        self.clear_flush();
        if self.turn_action == Some(TurnAction::EndCooking) {
            self.handoff.cooking_finished = true;
        }
        let delay = if self.turn_delay > 0.0 {
            self.turn_delay
        } else {
            DEFAULT_END_DELAY_SECS
        };
        self.end_deadline = Some(Instant::now() + Duration::from_secs_f64(delay));
    }

    /// Final teardown: silence audio, abort the stream, save history,
    /// persist the handoff context.
    async fn finalize(&mut self, stream_rx: &mut Option<mpsc::Receiver<StreamEvent>>) {
        self.player.stop();
        self.abort_stream(stream_rx);
        self.capture_cancel.cancel();
        self.set_phase(PipelinePhase::Idle);

        self.save_history().await;
        self.persist_handoff();
        self.emit(PipelineEvent::SessionEnded {
            finished: self.handoff.cooking_finished,
        });
    }

    async fn save_history(&self) {
        let Some(session_id) = &self.session_id else {
            return;
        };
        let turns = self.log.save_projection();
        let count = turns.len();
        match self
            .session
            .save_history(self.config.backend.member_id, session_id, &turns)
            .await
        {
            Ok(()) if count > 0 => info!("saved {count} history messages"),
            Ok(()) => {}
            Err(e) => warn!("history save failed: {e}"),
        }
    }

    fn persist_handoff(&self) {
        if let Some(path) = &self.handoff_path {
            if let Err(e) = self.handoff.save(path) {
                warn!("handoff persist failed: {e}");
            }
        }
    }
}
