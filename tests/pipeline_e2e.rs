//! End-to-end pipeline properties.
//!
//! The coordinator runs against an injected amplitude-frame source, a
//! recording playback sink, and a mocked backend, so every property is
//! exercised through the real control loop: segmentation timing, the
//! completeness flush policy, barge-in teardown, history pinning, and
//! session termination.

use sous::audio::playback::{PlaybackSink, StreamPlayer};
use sous::config::VoiceConfig;
use sous::dialogue::{MessageStatus, Role};
use sous::pipeline::messages::{AmplitudeFrame, PipelineEvent, PipelinePhase};
use sous::session::{CookHandoff, Recipe, RecipeStep};
use sous::PipelineCoordinator;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── test fixtures ───────────────────────────────────────────────────────

#[derive(Default)]
struct SinkState {
    submissions: Vec<(f64, usize, u32)>,
    halted: usize,
    active: bool,
}

struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
    started: Instant,
}

impl PlaybackSink for RecordingSink {
    fn begin(&mut self) {}
    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
    fn submit(&mut self, start_at: f64, samples: Vec<f32>, sample_rate: u32) {
        let mut state = self.state.lock().unwrap();
        state.submissions.push((start_at, samples.len(), sample_rate));
        state.active = true;
    }
    fn halt(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.halted += 1;
        state.active = false;
    }
    fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }
}

fn test_config(base_url: String) -> VoiceConfig {
    let mut config = VoiceConfig::default();
    config.backend.base_url = base_url;
    config.backend.member_id = 7;
    // Short extra wait so force-flush tests run quickly; hints far away so
    // they never interfere.
    config.utterance.incomplete_extra_wait_ms = 200;
    config.hints.idle_ms = 120_000;
    config
}

fn test_handoff() -> CookHandoff {
    CookHandoff {
        recipe: Recipe {
            name: "김치찌개".into(),
            steps: vec![
                RecipeStep {
                    no: 1,
                    desc: "물을 끓인다".into(),
                },
                RecipeStep {
                    no: 2,
                    desc: "김치를 넣는다".into(),
                },
                RecipeStep {
                    no: 3,
                    desc: "두부를 넣는다".into(),
                },
            ],
        },
        current_step_index: 0,
        elapsed_secs: 0,
        voice_session_id: Some("vs-e2e".into()),
        cooking_finished: false,
    }
}

struct Harness {
    audio_tx: mpsc::Sender<AmplitudeFrame>,
    events: Arc<Mutex<Vec<PipelineEvent>>>,
    sink: Arc<Mutex<SinkState>>,
    cancel: tokio_util::sync::CancellationToken,
    handle: tokio::task::JoinHandle<sous::Result<()>>,
    base: Instant,
}

fn start_pipeline(config: VoiceConfig, handoff: CookHandoff) -> Harness {
    start_pipeline_with_handoff_path(config, handoff, None)
}

fn start_pipeline_with_handoff_path(
    config: VoiceConfig,
    handoff: CookHandoff,
    handoff_path: Option<std::path::PathBuf>,
) -> Harness {
    let (audio_tx, audio_rx) = mpsc::channel(64);
    let (event_tx, mut event_rx) = broadcast::channel(256);

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_writer = Arc::clone(&events);
    tokio::spawn(async move {
        while let Ok(ev) = event_rx.recv().await {
            events_writer.lock().unwrap().push(ev);
        }
    });

    let sink = Arc::new(Mutex::new(SinkState::default()));
    let player = StreamPlayer::new(
        &config.playback,
        Box::new(RecordingSink {
            state: Arc::clone(&sink),
            started: Instant::now(),
        }),
    );

    let mut coordinator = PipelineCoordinator::new(config, handoff)
        .with_events(event_tx)
        .with_audio_source(audio_rx)
        .with_player(player);
    if let Some(path) = handoff_path {
        coordinator = coordinator.with_handoff_path(path);
    }
    let cancel = coordinator.cancel_token();
    let handle = tokio::spawn(coordinator.run());

    Harness {
        audio_tx,
        events,
        sink,
        cancel,
        handle,
        base: Instant::now(),
    }
}

impl Harness {
    /// Send one synthetic amplitude frame timestamped `at_ms` after the
    /// harness base instant.
    async fn frame(&self, level: f32, at_ms: u64) {
        let frame = AmplitudeFrame {
            samples: vec![level; 256],
            sample_rate: 16_000,
            captured_at: self.base + Duration::from_millis(at_ms),
        };
        self.audio_tx.send(frame).await.expect("pipeline alive");
    }

    /// One speech burst: frames above the start threshold for `speech_ms`,
    /// then silence long enough to close the segment.
    async fn burst(&self, start_ms: u64, speech_ms: u64) -> u64 {
        let mut t = start_ms;
        while t < start_ms + speech_ms {
            self.frame(0.3, t).await;
            t += 100;
        }
        let end = start_ms + speech_ms + 1700;
        while t <= end {
            self.frame(0.0, t).await;
            t += 100;
        }
        end
    }

    async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..250 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timeout waiting for {what}");
}

fn count_requests(requests: &[wiremock::Request], suffix: &str) -> usize {
    requests
        .iter()
        .filter(|r| r.url.path().ends_with(suffix))
        .count()
}

async fn wait_for_requests(server: &MockServer, suffix: &str, want: usize) {
    for _ in 0..250 {
        let requests = server.received_requests().await.unwrap_or_default();
        if count_requests(&requests, suffix) >= want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timeout waiting for {want} request(s) to {suffix}");
}

fn sse_body(records: &[&str]) -> String {
    records
        .iter()
        .map(|r| format!("data: {r}\n\n"))
        .collect::<String>()
}

async fn mount_history(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/voice/history/vs-e2e"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "messages": [] })),
        )
        .mount(server)
        .await;
}

async fn mount_stt(server: &MockServer, text: &str, completeness: &str) {
    Mock::given(method("POST"))
        .and(path("/api/voice/stt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "text": text,
            "completeness": completeness
        })))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

// ── properties ──────────────────────────────────────────────────────────

#[tokio::test]
async fn speech_burst_produces_exactly_one_transcription_and_immediate_flush() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "다 했어", "COMPLETE").await;
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["{\"type\":\"done\"}"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let harness = start_pipeline(test_config(server.uri()), test_handoff());

    // Above the start threshold for 400ms, then below the end threshold
    // until the 1500ms silence window closes the segment.
    harness.burst(0, 400).await;

    wait_for_requests(&server, "/process-text", 1).await;

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(count_requests(&requests, "/stt"), 1);
    assert_eq!(count_requests(&requests, "/process-text"), 1);

    // COMPLETE flushes with zero extra delay: the user message settles to
    // Done with the utterance text.
    let events = harness.events.lock().unwrap().clone();
    assert!(events.iter().any(|ev| matches!(
        ev,
        PipelineEvent::MessagePatched(m)
            if m.role == Role::User && m.status == MessageStatus::Done && m.text == "다 했어"
    )));

    harness.shutdown().await;
}

#[tokio::test]
async fn segment_below_minimum_duration_never_reaches_transcription() {
    let server = MockServer::start().await;
    mount_history(&server).await;

    let mut config = test_config(server.uri());
    // A silence window shorter than the minimum speech duration makes a
    // too-short segment reachable through the normal VAD path.
    config.vad.silence_window_ms = 100;
    config.segment.min_speech_ms = 300;

    let harness = start_pipeline(config, test_handoff());

    harness.frame(0.3, 0).await;
    harness.frame(0.0, 50).await;
    harness.frame(0.0, 160).await; // closes the segment at ~160ms

    // The recognizing placeholder appears on onset and is removed when the
    // segment is discarded.
    let events = Arc::clone(&harness.events);
    wait_until("placeholder removed", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|ev| matches!(ev, PipelineEvent::MessageRemoved { .. }))
    })
    .await;

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(count_requests(&requests, "/stt"), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn incomplete_fragment_flushes_once_after_extra_wait() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "오늘", "INCOMPLETE").await;
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["{\"type\":\"done\"}"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = start_pipeline(test_config(server.uri()), test_handoff());
    harness.burst(0, 400).await;

    // The fragment shows as pending first; the flush comes only from the
    // extra-wait timer.
    let events = Arc::clone(&harness.events);
    wait_until("pending fragment", || {
        events.lock().unwrap().iter().any(|ev| matches!(
            ev,
            PipelineEvent::MessagePatched(m)
                if m.status == MessageStatus::Pending && m.text == "오늘"
        ))
    })
    .await;

    wait_for_requests(&server, "/process-text", 1).await;

    // Exactly one flush, with exactly the single fragment.
    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(count_requests(&requests, "/process-text"), 1);
    let body = requests
        .iter()
        .find(|r| r.url.path().ends_with("/process-text"))
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .unwrap_or_default();
    assert!(body.contains("오늘"));

    harness.shutdown().await;
}

#[tokio::test]
async fn consecutive_incomplete_fragments_flush_once_joined_in_order() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "오늘", "INCOMPLETE").await;
    mount_stt(&server, "저녁 뭐 먹지", "INCOMPLETE").await;
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["{\"type\":\"done\"}"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let harness = start_pipeline(test_config(server.uri()), test_handoff());

    let end = harness.burst(0, 400).await;
    let events = Arc::clone(&harness.events);
    wait_until("first fragment pending", || {
        events.lock().unwrap().iter().any(|ev| matches!(
            ev,
            PipelineEvent::MessagePatched(m) if m.text == "오늘"
        ))
    })
    .await;

    // Second burst arrives within the first fragment's extra wait; the
    // timer restarts from this fragment.
    harness.burst(end + 100, 400).await;

    wait_for_requests(&server, "/process-text", 1).await;
    // Give a stray second flush a chance to surface before asserting.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(count_requests(&requests, "/process-text"), 1);
    let body = requests
        .iter()
        .find(|r| r.url.path().ends_with("/process-text"))
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .unwrap_or_default();
    assert!(body.contains("오늘 저녁 뭐 먹지"), "fragments must join with single spaces");

    harness.shutdown().await;
}

#[tokio::test]
async fn empty_transcription_clears_placeholder_without_flush() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "", "INCOMPLETE").await;

    let harness = start_pipeline(test_config(server.uri()), test_handoff());
    harness.burst(0, 400).await;

    let events = Arc::clone(&harness.events);
    wait_until("placeholder removed", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|ev| matches!(ev, PipelineEvent::MessageRemoved { .. }))
    })
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(count_requests(&requests, "/process-text"), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn assistant_turn_advances_step_and_settles_message() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "다음", "COMPLETE").await;

    use base64::Engine;
    let audio = base64::engine::general_purpose::STANDARD.encode([0u8; 640]);
    let body = sse_body(&[
        "{\"type\":\"llm\",\"text\":\"네, 다음 단계로 넘어갈게요.\",\"intent\":\"next_step\",\"delay_seconds\":0}",
        &format!("{{\"type\":\"tts_chunk\",\"audio\":\"{audio}\",\"sample_rate\":32000}}"),
        "{\"type\":\"done\"}",
    ]);
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let handoff_path = dir.path().join("cook_state.json");
    let harness = start_pipeline_with_handoff_path(
        test_config(server.uri()),
        test_handoff(),
        Some(handoff_path.clone()),
    );

    harness.burst(0, 400).await;

    let events = Arc::clone(&harness.events);
    wait_until("assistant message settles", || {
        events.lock().unwrap().iter().any(|ev| matches!(
            ev,
            PipelineEvent::MessagePatched(m)
                if m.role == Role::Assistant && m.status == MessageStatus::Done
        ))
    })
    .await;

    let events = harness.events.lock().unwrap().clone();
    // Thinking placeholder was reused: same turn passes through
    // TtsStreaming before Done.
    assert!(events.iter().any(|ev| matches!(
        ev,
        PipelineEvent::MessagePatched(m)
            if m.role == Role::Assistant
                && m.status == MessageStatus::TtsStreaming
                && m.text == "네, 다음 단계로 넘어갈게요."
    )));
    // Step intent applied immediately.
    assert!(events
        .iter()
        .any(|ev| matches!(ev, PipelineEvent::StepChanged { index: 1 })));
    // TTS audio reached the sink.
    assert!(!harness.sink.lock().unwrap().submissions.is_empty());
    // Handoff persisted at the step-advance point.
    let persisted = CookHandoff::load(&handoff_path).expect("handoff written");
    assert_eq!(persisted.current_step_index, 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn generation_error_event_yields_apology_and_idle() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "도와줘", "COMPLETE").await;
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            sse_body(&["{\"type\":\"error\",\"message\":\"답변 생성 중 오류가 발생했습니다.\"}"]),
            "text/event-stream",
        ))
        .mount(&server)
        .await;

    let harness = start_pipeline(test_config(server.uri()), test_handoff());
    harness.burst(0, 400).await;

    let events = Arc::clone(&harness.events);
    wait_until("apology message", || {
        events.lock().unwrap().iter().any(|ev| matches!(
            ev,
            PipelineEvent::MessageAppended(m)
                if m.role == Role::Assistant && m.status == MessageStatus::Error
        ))
    })
    .await;

    let events = harness.events.lock().unwrap().clone();
    let last_phase = events
        .iter()
        .rev()
        .find_map(|ev| match ev {
            PipelineEvent::PhaseChanged(p) => Some(*p),
            _ => None,
        })
        .expect("phase events emitted");
    assert_eq!(last_phase, PipelinePhase::Idle);

    harness.shutdown().await;
}

#[tokio::test]
async fn streaming_assistant_message_counts_as_history_for_next_turn() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "뭐 넣어", "COMPLETE").await;
    mount_stt(&server, "얼마나 끓여", "COMPLETE").await;

    use base64::Engine;
    let audio = base64::engine::general_purpose::STANDARD.encode([0u8; 640]);
    // Turn 1: text + audio but NO `done` — the assistant message stays in
    // TtsStreaming when the stream ends.
    let turn1 = sse_body(&[
        "{\"type\":\"llm\",\"text\":\"김치를 넣으세요.\"}",
        &format!("{{\"type\":\"tts_chunk\",\"audio\":\"{audio}\",\"sample_rate\":32000}}"),
    ]);
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(turn1, "text/event-stream"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["{\"type\":\"done\"}"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let harness = start_pipeline(test_config(server.uri()), test_handoff());

    let end = harness.burst(0, 400).await;
    let events = Arc::clone(&harness.events);
    wait_until("turn 1 assistant text", || {
        events.lock().unwrap().iter().any(|ev| matches!(
            ev,
            PipelineEvent::MessagePatched(m) if m.text == "김치를 넣으세요."
        ))
    })
    .await;

    // Second utterance; its request history must already contain the
    // still-streaming assistant reply. (Pins the upstream behavior that a
    // turn counts as history before it settles.)
    harness.burst(end + 200, 400).await;

    wait_for_requests(&server, "/process-text", 2).await;

    let requests = server.received_requests().await.unwrap_or_default();
    let turn2_body = requests
        .iter()
        .filter(|r| r.url.path().ends_with("/process-text"))
        .nth(1)
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .unwrap_or_default();
    assert!(
        turn2_body.contains("김치를 넣으세요."),
        "streaming assistant reply missing from history"
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn terminal_action_saves_history_and_ends_session() {
    let server = MockServer::start().await;
    mount_history(&server).await;
    mount_stt(&server, "그만할래", "COMPLETE").await;
    let body = sse_body(&[
        "{\"type\":\"llm\",\"text\":\"수고하셨어요!\",\"action\":\"end_cooking\",\"delay_seconds\":0.2}",
        "{\"type\":\"done\"}",
    ]);
    Mock::given(method("POST"))
        .and(path("/api/voice/process-text"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/voice/save-history"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let handoff_path = dir.path().join("cook_state.json");
    let harness = start_pipeline_with_handoff_path(
        test_config(server.uri()),
        test_handoff(),
        Some(handoff_path.clone()),
    );

    harness.burst(0, 400).await;

    let events = Arc::clone(&harness.events);
    wait_until("session ended", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|ev| matches!(ev, PipelineEvent::SessionEnded { finished: true }))
    })
    .await;

    // The run loop exits on its own after the termination delay.
    let result = harness.handle.await.expect("pipeline task");
    assert!(result.is_ok());

    let persisted = CookHandoff::load(&handoff_path).expect("handoff written");
    assert!(persisted.cooking_finished);

    let requests = server.received_requests().await.unwrap_or_default();
    let save_body = requests
        .iter()
        .find(|r| r.url.path().ends_with("/save-history"))
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .unwrap_or_default();
    assert!(save_body.contains("그만할래"));
    assert!(save_body.contains("수고하셨어요!"));
    assert!(save_body.contains("\"USER\""));
    assert!(save_body.contains("\"AGENT\""));
}

// ── barge-in against a held-open stream ─────────────────────────────────

struct MiniBackend {
    addr: std::net::SocketAddr,
    stream_closed: Arc<AtomicBool>,
}

/// A minimal backend whose process-text response stays open after the
/// first record, so barge-in happens mid-stream. Wiremock cannot hold a
/// response open, hence the hand-rolled server.
async fn spawn_mini_backend() -> MiniBackend {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let stream_closed = Arc::new(AtomicBool::new(false));
    let closed = Arc::clone(&stream_closed);
    let stt_calls = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let closed = Arc::clone(&closed);
            let stt_calls = Arc::clone(&stt_calls);
            tokio::spawn(async move {
                let Some(path) = read_request(&mut socket).await else {
                    return;
                };
                if path.contains("/api/voice/history/") {
                    respond_json(&mut socket, "{\"messages\":[]}").await;
                } else if path.ends_with("/api/voice/stt") {
                    let n = stt_calls.fetch_add(1, Ordering::SeqCst);
                    let body = if n == 0 {
                        "{\"text\":\"잠깐만\",\"completeness\":\"COMPLETE\"}"
                    } else {
                        "{\"text\":\"\",\"completeness\":\"INCOMPLETE\"}"
                    };
                    respond_json(&mut socket, body).await;
                } else if path.ends_with("/api/voice/process-text") {
                    serve_held_stream(&mut socket, &closed).await;
                } else {
                    respond_json(&mut socket, "{}").await;
                }
            });
        }
    });

    MiniBackend {
        addr,
        stream_closed,
    }
}

/// Read one request; returns its path once headers and body are drained.
async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 2048];
    let header_end = loop {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > 1 << 20 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let content_length = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    let mut body_len = buf.len() - header_end;
    while body_len < content_length {
        let n = socket.read(&mut tmp).await.ok()?;
        if n == 0 {
            break;
        }
        body_len += n;
    }

    let path = head
        .lines()
        .next()?
        .split_whitespace()
        .nth(1)?
        .to_owned();
    Some(path)
}

async fn respond_json(socket: &mut tokio::net::TcpStream, body: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = socket.write_all(response.as_bytes()).await;
}

/// Send one `llm` record over a chunked SSE response, then hold the
/// connection open until the client disconnects.
async fn serve_held_stream(socket: &mut tokio::net::TcpStream, closed: &AtomicBool) {
    let head =
        "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
    if socket.write_all(head.as_bytes()).await.is_err() {
        return;
    }
    let payload = "data: {\"type\":\"llm\",\"text\":\"오래 걸리는 답변이에요.\",\"delay_seconds\":0}\n\n";
    let chunk = format!("{:x}\r\n{}\r\n", payload.len(), payload);
    if socket.write_all(chunk.as_bytes()).await.is_err() {
        return;
    }
    let _ = socket.flush().await;

    // Block on the socket until the peer goes away.
    let mut probe = [0u8; 64];
    loop {
        match socket.read(&mut probe).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    closed.store(true, Ordering::SeqCst);
}

#[tokio::test]
async fn barge_in_stops_playback_aborts_stream_and_goes_idle() {
    let backend = spawn_mini_backend().await;
    let base_url = format!("http://{}", backend.addr);

    let mut handoff = test_handoff();
    handoff.voice_session_id = Some("vs-mini".into());
    let harness = start_pipeline(test_config(base_url), handoff);

    // Turn 1: utterance flushes and the response stream delivers its `llm`
    // record, then stays open.
    let end = harness.burst(0, 400).await;

    let events = Arc::clone(&harness.events);
    wait_until("tts_streaming phase", || {
        events
            .lock()
            .unwrap()
            .iter()
            .any(|ev| matches!(ev, PipelineEvent::PhaseChanged(PipelinePhase::TtsStreaming)))
    })
    .await;

    let patches_before = harness
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|ev| matches!(ev, PipelineEvent::MessagePatched(_) | PipelineEvent::MessageAppended(_)))
        .count();

    // Barge-in: speech onset while the response is mid-stream.
    harness.frame(0.3, end + 200).await;

    wait_until("stream torn down", || {
        backend.stream_closed.load(Ordering::SeqCst)
    })
    .await;
    let events = Arc::clone(&harness.events);
    wait_until("phase idle after barge-in", || {
        let events = events.lock().unwrap();
        let last = events.iter().rev().find_map(|ev| match ev {
            PipelineEvent::PhaseChanged(p) => Some(*p),
            _ => None,
        });
        last == Some(PipelinePhase::Idle)
    })
    .await;

    // Playback was halted synchronously and nothing was scheduled after.
    {
        let sink = harness.sink.lock().unwrap();
        assert!(sink.halted >= 1, "player must be stopped on barge-in");
        assert!(!sink.active, "no audio may remain scheduled after barge-in");
    }

    // The aborted stream mutates no further state: the interrupted
    // assistant message stays as it was (no Done patch, no new assistant
    // message from that turn).
    tokio::time::sleep(Duration::from_millis(300)).await;
    let events = harness.events.lock().unwrap();
    let assistant_done = events.iter().any(|ev| matches!(
        ev,
        PipelineEvent::MessagePatched(m)
            if m.role == Role::Assistant && m.status == MessageStatus::Done
    ));
    assert!(!assistant_done, "aborted turn must not settle to done");
    // Only the barge-in segment's own recognizing placeholder may have
    // been appended since; nothing patched by the dead stream.
    let appended_since: usize = events
        .iter()
        .filter(|ev| matches!(ev, PipelineEvent::MessagePatched(_) | PipelineEvent::MessageAppended(_)))
        .count()
        - patches_before;
    assert!(
        appended_since <= 1,
        "unexpected message activity after barge-in: {appended_since}"
    );
    drop(events);

    harness.shutdown().await;
}
