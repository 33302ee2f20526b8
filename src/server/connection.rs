//! Per-connection orchestrator
//!
//! One instance of [`Connection`] per accepted client. The orchestrator
//! task owns all mutable connection state and drives three input sources
//! through `select!`: client WebSocket messages, events from the open ASR
//! upstream, and events from the per-turn LLM/TTS pipeline task. Writes to
//! the client go through a single outbound channel consumed by a dedicated
//! writer task, so a JSON control frame can never interleave with the bytes
//! of an audio frame.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::{OpusFrameDecoder, VadEdge, VadEngine};
use crate::error::GatewayError;
use crate::providers::asr::{AsrEvent, AsrSession, AsrStream};
use crate::providers::llm::{ChatTurn, LlmProvider};
use crate::providers::tts::TtsProvider;
use crate::providers::ProviderFactory;
use crate::server::registry::ConnectionRegistry;
use crate::text::SentenceSplitter;

/// Encoded frames kept for prefix replay.
const ENCODED_RECENT_CAP: usize = 10;
/// Sliding dialog-history bound.
const DIALOG_HISTORY_CAP: usize = 20;
/// Utterances shorter than this many encoded frames are not dispatched in
/// auto mode.
const MIN_DISPATCH_FRAMES: usize = 15;
/// Upstream-reported audio length above which an empty result means the
/// whole segment is discarded.
const EMPTY_SPEECH_MIN_MS: u64 = 2000;

// ─── Wire messages ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "config")]
    Config {
        #[serde(default, rename = "deviceInfo")]
        device_info: Option<DeviceInfoPayload>,
    },
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        data: Option<TextData>,
    },
    #[serde(rename = "control")]
    Control {
        #[serde(default)]
        data: Option<ControlData>,
    },
    #[serde(rename = "audio")]
    Audio {
        #[serde(flatten)]
        rest: serde_json::Map<String, serde_json::Value>,
    },
}

#[derive(Debug, Deserialize)]
pub struct DeviceInfoPayload {
    #[serde(default, rename = "macAddress")]
    pub mac_address: Option<String>,
    #[serde(default, rename = "deviceModel")]
    pub device_model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TextData {
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ControlData {
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "hello")]
    Hello {
        session_id: String,
        status: String,
        message: String,
    },
    #[serde(rename = "stt")]
    Stt { text: String, session_id: String },
    #[serde(rename = "tts")]
    Tts {
        state: TtsState,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        session_id: String,
    },
    #[serde(rename = "control")]
    Control { data: serde_json::Value },
    #[serde(rename = "error")]
    Error { data: ErrorData },
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorData {
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    SentenceStart,
    SentenceEnd,
    Stop,
}

/// Outbound frames, serialized by the writer task.
pub enum Outbound {
    Json(ServerMessage),
    Binary(Vec<u8>),
}

/// Spawn the writer task that owns the WebSocket send half.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
) -> (mpsc::Sender<Outbound>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Outbound>(64);
    let task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let result = match frame {
                Outbound::Json(message) => {
                    sink.send(Message::Text(
                        serde_json::to_string(&message).unwrap_or_default().into(),
                    ))
                    .await
                }
                Outbound::Binary(data) => sink.send(Message::Binary(data.into())).await,
            };
            if result.is_err() {
                break;
            }
        }
    });
    (tx, task)
}

// ─── Connection state ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Idle,
    Listening,
    Transcribed,
    Speaking,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenMode {
    Auto,
    Manual,
}

/// Events from the per-turn LLM/TTS pipeline back to the orchestrator.
#[derive(Debug)]
enum TurnEvent {
    /// First LLM token arrived; `tts.start` has been sent.
    Started,
    /// Full assistant reply, for the dialog history.
    Reply(String),
    /// Terminal failure of the turn.
    Failed(String),
    /// Pipeline done (normal end).
    Finished,
}

pub struct Connection {
    client_id: String,
    device_id: String,
    session_id: String,
    state: ConnState,
    listen_mode: ListenMode,
    codec: OpusFrameDecoder,
    vad: Option<VadEngine>,
    encoded_recent: VecDeque<Vec<u8>>,
    segment_frames: usize,
    asr_accumulated: String,
    manual_stop_pending: bool,
    asr_end_sent: bool,
    dialog_history: Vec<ChatTurn>,
    factory: Arc<ProviderFactory>,
    llm: Option<Arc<dyn LlmProvider>>,
    tts: Option<Arc<dyn TtsProvider>>,
    asr_provider: Option<Arc<dyn crate::providers::asr::AsrProvider>>,
    asr_stream: Option<Box<dyn AsrStream>>,
    asr_events: Option<mpsc::Receiver<AsrEvent>>,
    turn_events: Option<mpsc::Receiver<TurnEvent>>,
    turn_task: Option<JoinHandle<()>>,
    outbound: mpsc::Sender<Outbound>,
    registry: Arc<ConnectionRegistry>,
}

impl Connection {
    pub fn new(
        client_id: String,
        device_id: String,
        outbound: mpsc::Sender<Outbound>,
        factory: Arc<ProviderFactory>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, GatewayError> {
        let codec = OpusFrameDecoder::new()?;
        let vad = match factory.build_vad() {
            Ok(engine) => Some(engine),
            Err(e) => {
                warn!("Failed to initialize VAD: {}", e);
                None
            }
        };
        Ok(Self {
            client_id,
            device_id,
            session_id: uuid::Uuid::new_v4().to_string(),
            state: ConnState::Idle,
            listen_mode: ListenMode::Auto,
            codec,
            vad,
            encoded_recent: VecDeque::with_capacity(ENCODED_RECENT_CAP),
            segment_frames: 0,
            asr_accumulated: String::new(),
            manual_stop_pending: false,
            asr_end_sent: false,
            dialog_history: Vec::new(),
            factory,
            llm: None,
            tts: None,
            asr_provider: None,
            asr_stream: None,
            asr_events: None,
            turn_events: None,
            turn_task: None,
            outbound,
            registry,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn send_json(&self, message: ServerMessage) {
        let _ = self.outbound.send(Outbound::Json(message)).await;
    }

    async fn send_error(&self, error: impl Into<String>) {
        self.send_json(ServerMessage::Error {
            data: ErrorData { error: error.into() },
        })
        .await;
    }

    // ─── Audio path ──────────────────────────────────────────

    pub async fn handle_audio_frame(&mut self, frame: &[u8]) {
        self.registry.touch(&self.client_id).await;
        self.push_recent(frame);

        match self.listen_mode {
            ListenMode::Manual => {
                // Client supplies the edges; every frame counts as voiced.
                if self.state == ConnState::Listening && !self.asr_end_sent {
                    self.forward_frame(frame).await;
                }
            }
            ListenMode::Auto => self.handle_auto_frame(frame).await,
        }
    }

    async fn handle_auto_frame(&mut self, frame: &[u8]) {
        // VAD only runs while we are willing to accept a new utterance or
        // are inside one; during a reply the mic is ignored until tts.stop.
        if !matches!(self.state, ConnState::Idle | ConnState::Listening) {
            return;
        }

        let pcm = match self.codec.decode(frame) {
            Ok(pcm) => pcm,
            Err(e) => {
                debug!("[{}] Dropping undecodable frame: {}", self.client_id, e);
                return;
            }
        };

        let Some(vad) = self.vad.as_mut() else {
            debug!("[{}] VAD not initialized, audio ignored", self.client_id);
            return;
        };
        let outcome = match vad.feed(&pcm) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("[{}] VAD failure: {}", self.client_id, e);
                return;
            }
        };

        match outcome.edge {
            Some(VadEdge::Start) if self.state == ConnState::Idle => {
                info!("[{}] Voice start", self.client_id);
                if let Err(e) = self.open_asr().await {
                    self.abort_utterance(&e).await;
                }
            }
            Some(VadEdge::Stop) if self.state == ConnState::Listening => {
                info!("[{}] Voice stop after {} frames", self.client_id, self.segment_frames);
                // clear the latch before the next frame is accepted
                if let Some(vad) = self.vad.as_mut() {
                    vad.reset();
                }
                self.asr_end_sent = true;
                if let Some(stream) = self.asr_stream.as_mut() {
                    if let Err(e) = stream.send_end().await {
                        warn!("[{}] ASR end signal failed: {}", self.client_id, e);
                    }
                }
            }
            _ => {
                if self.state == ConnState::Listening && !self.asr_end_sent {
                    self.forward_frame(frame).await;
                }
            }
        }
    }

    async fn forward_frame(&mut self, frame: &[u8]) {
        let Some(stream) = self.asr_stream.as_mut() else {
            return;
        };
        match stream.send_frame(frame).await {
            Ok(()) => self.segment_frames += 1,
            Err(GatewayError::Decode(e)) => {
                debug!("[{}] ASR driver dropped frame: {}", self.client_id, e);
            }
            Err(e) => {
                warn!("[{}] ASR send failed: {}", self.client_id, e);
                self.reset_utterance().await;
            }
        }
    }

    fn push_recent(&mut self, frame: &[u8]) {
        if self.encoded_recent.len() == ENCODED_RECENT_CAP {
            self.encoded_recent.pop_front();
        }
        self.encoded_recent.push_back(frame.to_vec());
    }

    /// Open the ASR upstream and prime it with the recent-frame ring.
    async fn open_asr(&mut self) -> Result<(), GatewayError> {
        let provider = match &self.asr_provider {
            Some(provider) => provider.clone(),
            None => {
                let provider = self.factory.build_asr()?;
                self.asr_provider = Some(provider.clone());
                provider
            }
        };
        let AsrSession { mut stream, events } = provider.open(&self.session_id).await?;

        let mut replayed = 0;
        for frame in &self.encoded_recent {
            match stream.send_frame(frame).await {
                Ok(()) => replayed += 1,
                Err(e) => debug!("[{}] Prefix replay frame failed: {}", self.client_id, e),
            }
        }

        self.segment_frames = replayed;
        self.asr_stream = Some(stream);
        self.asr_events = Some(events);
        self.asr_end_sent = false;
        self.state = ConnState::Listening;
        Ok(())
    }

    // ─── ASR events ──────────────────────────────────────────

    pub async fn handle_asr_event(&mut self, event: AsrEvent) {
        match event {
            AsrEvent::Partial(text) => {
                debug!("[{}] ASR partial: {}", self.client_id, text);
            }
            AsrEvent::Final(text) => self.handle_asr_final(text).await,
            AsrEvent::Empty { duration_ms } => match self.listen_mode {
                ListenMode::Auto => {
                    if duration_ms > EMPTY_SPEECH_MIN_MS {
                        info!(
                            "[{}] No speech in {} ms of audio, discarding segment",
                            self.client_id, duration_ms
                        );
                    }
                    self.reset_utterance().await;
                }
                // The client owns the stop edge; keep recording and keep
                // whatever has accumulated so far.
                ListenMode::Manual => {
                    debug!(
                        "[{}] Upstream reported no speech ({} ms) mid-recording",
                        self.client_id, duration_ms
                    );
                }
            },
            AsrEvent::Error { code, message } => {
                error!("[{}] ASR upstream error {}: {}", self.client_id, code, message);
                self.reset_utterance().await;
            }
            AsrEvent::Closed => {
                self.asr_events = None;
                if self.listen_mode == ListenMode::Manual
                    && self.manual_stop_pending
                    && !self.asr_accumulated.is_empty()
                {
                    self.dispatch_accumulated().await;
                } else if self.state == ConnState::Listening {
                    self.reset_utterance().await;
                }
            }
        }
    }

    async fn handle_asr_final(&mut self, text: String) {
        match self.listen_mode {
            ListenMode::Manual => {
                info!("[{}] ASR final (manual): {}", self.client_id, text);
                self.asr_accumulated.push_str(&text);
                if self.manual_stop_pending && !self.asr_accumulated.is_empty() {
                    self.dispatch_accumulated().await;
                }
            }
            ListenMode::Auto => {
                if self.state != ConnState::Listening {
                    return;
                }
                if self.turn_events.is_some() {
                    // a turn is already speaking; treat the late final as
                    // ignored voice
                    self.reset_utterance().await;
                    return;
                }
                if text.is_empty() {
                    return;
                }
                if self.segment_frames < MIN_DISPATCH_FRAMES {
                    info!(
                        "[{}] Utterance too short ({} frames), discarding",
                        self.client_id, self.segment_frames
                    );
                    self.reset_utterance().await;
                    return;
                }
                info!("[{}] ASR final: {}", self.client_id, text);
                self.asr_accumulated = text.clone();
                self.dispatch_transcript(text).await;
            }
        }
    }

    async fn dispatch_accumulated(&mut self) {
        let text = std::mem::take(&mut self.asr_accumulated);
        self.manual_stop_pending = false;
        info!("[{}] ASR accumulated transcript: {}", self.client_id, text);
        self.dispatch_transcript(text).await;
    }

    /// Voice turn: emit `stt`, record the user message and start the
    /// LLM/TTS pipeline.
    async fn dispatch_transcript(&mut self, text: String) {
        self.close_asr().await;
        if let Some(vad) = self.vad.as_mut() {
            vad.reset();
        }
        self.segment_frames = 0;
        self.state = ConnState::Transcribed;

        self.send_json(ServerMessage::Stt {
            text: text.clone(),
            session_id: self.session_id.clone(),
        })
        .await;
        self.begin_turn(text).await;
    }

    // ─── Turn pipeline ───────────────────────────────────────

    /// Start the LLM/TTS pipeline for one user turn. The history snapshot
    /// excludes the current user text; the driver appends it itself.
    async fn begin_turn(&mut self, text: String) {
        if self.turn_events.is_some() {
            warn!("[{}] Turn already in flight, dropping input", self.client_id);
            return;
        }

        let llm = match self.build_llm() {
            Ok(llm) => llm,
            Err(e) => {
                self.fail_turn_setup(e).await;
                return;
            }
        };
        let tts = match self.build_tts() {
            Ok(tts) => tts,
            Err(e) => {
                self.fail_turn_setup(e).await;
                return;
            }
        };

        let history = self.dialog_history.clone();
        self.push_history(ChatTurn::user(&text));
        self.registry
            .append_message(&self.session_id, "user", &text)
            .await;

        let (events_tx, events_rx) = mpsc::channel(8);
        let outbound = self.outbound.clone();
        let session_id = self.session_id.clone();
        self.turn_events = Some(events_rx);
        self.turn_task = Some(tokio::spawn(run_turn(
            llm, tts, outbound, session_id, text, history, events_tx,
        )));
    }

    async fn fail_turn_setup(&mut self, e: GatewayError) {
        error!("[{}] Turn setup failed: {}", self.client_id, e);
        self.send_error(e.to_string()).await;
        self.state = ConnState::Idle;
        if let Some(vad) = self.vad.as_mut() {
            vad.reset();
        }
    }

    fn build_llm(&mut self) -> Result<Arc<dyn LlmProvider>, GatewayError> {
        if let Some(llm) = &self.llm {
            return Ok(llm.clone());
        }
        let llm = self.factory.build_llm()?;
        self.llm = Some(llm.clone());
        Ok(llm)
    }

    fn build_tts(&mut self) -> Result<Arc<dyn TtsProvider>, GatewayError> {
        if let Some(tts) = &self.tts {
            return Ok(tts.clone());
        }
        let tts = self.factory.build_tts()?;
        self.tts = Some(tts.clone());
        Ok(tts)
    }

    async fn handle_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Started => {
                self.state = ConnState::Speaking;
            }
            TurnEvent::Reply(text) => {
                self.registry
                    .append_message(&self.session_id, "assistant", &text)
                    .await;
                self.push_history(ChatTurn::assistant(text));
            }
            TurnEvent::Failed(message) => {
                error!("[{}] Turn failed: {}", self.client_id, message);
                self.send_error(message).await;
                self.finish_turn().await;
            }
            TurnEvent::Finished => {
                self.finish_turn().await;
            }
        }
    }

    async fn finish_turn(&mut self) {
        self.turn_events = None;
        self.turn_task = None;
        self.state = ConnState::Idle;
        if let Some(vad) = self.vad.as_mut() {
            vad.reset();
        }
    }

    fn push_history(&mut self, turn: ChatTurn) {
        self.dialog_history.push(turn);
        if self.dialog_history.len() > DIALOG_HISTORY_CAP {
            let excess = self.dialog_history.len() - DIALOG_HISTORY_CAP;
            self.dialog_history.drain(..excess);
        }
    }

    // ─── Client JSON messages ────────────────────────────────

    pub async fn handle_client_text(&mut self, raw: &str) {
        self.registry.touch(&self.client_id).await;
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("[{}] Invalid client message: {}", self.client_id, e);
                return;
            }
        };

        match message {
            ClientMessage::Hello => {
                info!("[{}] Hello", self.client_id);
            }
            ClientMessage::Config { device_info } => {
                let (mac, model) = device_info
                    .map(|d| (d.mac_address, d.device_model))
                    .unwrap_or((None, None));
                self.registry
                    .update_device_info(&self.client_id, mac, model)
                    .await;
            }
            ClientMessage::Text { text, data } => {
                let text = text
                    .or(data.and_then(|d| d.text))
                    .unwrap_or_default();
                if text.is_empty() {
                    return;
                }
                info!("[{}] Text turn: {}", self.client_id, text);
                self.begin_turn(text).await;
            }
            ClientMessage::Control { data } => {
                let command = data.and_then(|d| d.command).unwrap_or_default();
                self.handle_control(&command).await;
            }
            ClientMessage::Audio { rest } => {
                info!(
                    "[{}] Audio control: {}",
                    self.client_id,
                    serde_json::Value::Object(rest)
                );
            }
        }
    }

    async fn handle_control(&mut self, command: &str) {
        match command {
            "ping" => {
                self.send_json(ServerMessage::Control {
                    data: serde_json::json!({"command": "pong"}),
                })
                .await;
            }
            "listen_start" => {
                info!("[{}] Manual listen start", self.client_id);
                self.listen_mode = ListenMode::Manual;
                self.asr_accumulated.clear();
                self.manual_stop_pending = false;
                if self.state == ConnState::Listening {
                    self.reset_utterance().await;
                }
                if self.state == ConnState::Idle {
                    if let Err(e) = self.open_asr().await {
                        self.abort_utterance(&e).await;
                    }
                }
            }
            "listen_stop" => {
                info!("[{}] Manual listen stop", self.client_id);
                if self.listen_mode != ListenMode::Manual || self.state != ConnState::Listening {
                    return;
                }
                self.manual_stop_pending = true;
                self.asr_end_sent = true;
                if let Some(stream) = self.asr_stream.as_mut() {
                    if let Err(e) = stream.send_end().await {
                        warn!("[{}] ASR end signal failed: {}", self.client_id, e);
                    }
                }
                if !self.asr_accumulated.is_empty() {
                    self.dispatch_accumulated().await;
                }
            }
            other => {
                debug!("[{}] Control command: {}", self.client_id, other);
            }
        }
    }

    // ─── Teardown ────────────────────────────────────────────

    async fn abort_utterance(&mut self, e: &GatewayError) {
        error!("[{}] Utterance aborted: {}", self.client_id, e);
        self.send_error(e.to_string()).await;
        self.reset_utterance().await;
    }

    /// Per-turn recovery: tear the ASR upstream down, clear buffers, reset
    /// the VAD and resume accepting audio.
    async fn reset_utterance(&mut self) {
        self.close_asr().await;
        self.segment_frames = 0;
        self.asr_end_sent = false;
        self.manual_stop_pending = false;
        self.asr_accumulated.clear();
        if let Some(vad) = self.vad.as_mut() {
            vad.reset();
        }
        if self.state == ConnState::Listening {
            self.state = ConnState::Idle;
        }
    }

    async fn close_asr(&mut self) {
        if let Some(mut stream) = self.asr_stream.take() {
            stream.close().await;
        }
    }

    /// Terminal cleanup on disconnect or transport error.
    pub async fn shutdown(&mut self) {
        self.state = ConnState::Closed;
        self.close_asr().await;
        self.asr_events = None;
        if let Some(task) = self.turn_task.take() {
            task.abort();
        }
        self.turn_events = None;
        self.registry.remove_device(&self.client_id).await;
        info!(
            "[{}] Connection closed (device {}, session {})",
            self.client_id, self.device_id, self.session_id
        );
    }
}

// ─── Turn pipeline task ──────────────────────────────────────

/// Stream the LLM reply, split it into sentences and synthesize each one
/// strictly in order. Outbound framing per turn:
/// `tts.start`, then per sentence `sentence_start` / binary audio /
/// `sentence_end`, then `tts.stop`.
async fn run_turn(
    llm: Arc<dyn LlmProvider>,
    tts: Arc<dyn TtsProvider>,
    outbound: mpsc::Sender<Outbound>,
    session_id: String,
    text: String,
    history: Vec<ChatTurn>,
    events: mpsc::Sender<TurnEvent>,
) {
    let mut tokens = llm.chat_stream(&text, &history).await;
    let mut splitter = SentenceSplitter::new();
    let mut full_response = String::new();
    let mut started = false;

    let tts_state = |state: TtsState, text: Option<String>| {
        Outbound::Json(ServerMessage::Tts {
            state,
            text,
            session_id: session_id.clone(),
        })
    };

    while let Some(item) = tokens.recv().await {
        match item {
            Ok(delta) => {
                if !started {
                    started = true;
                    let _ = events.send(TurnEvent::Started).await;
                    if outbound.send(tts_state(TtsState::Start, None)).await.is_err() {
                        return;
                    }
                }
                full_response.push_str(&delta);
                for sentence in splitter.push(&delta) {
                    if speak_sentence(&tts, &outbound, &tts_state, &sentence)
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
            Err(e) => {
                let _ = events.send(TurnEvent::Failed(e.to_string())).await;
                if started {
                    let _ = outbound.send(tts_state(TtsState::Stop, None)).await;
                }
                return;
            }
        }
    }

    if !started {
        // Reply with no tokens still closes the turn cleanly.
        let _ = events.send(TurnEvent::Started).await;
        if outbound.send(tts_state(TtsState::Start, None)).await.is_err() {
            return;
        }
    }

    if let Some(fragment) = splitter.finish() {
        if speak_sentence(&tts, &outbound, &tts_state, &fragment)
            .await
            .is_err()
        {
            return;
        }
    }

    let _ = outbound.send(tts_state(TtsState::Stop, None)).await;
    info!("LLM turn complete ({} chars)", full_response.len());
    if !full_response.is_empty() {
        let _ = events.send(TurnEvent::Reply(full_response)).await;
    }
    let _ = events.send(TurnEvent::Finished).await;
}

/// Synthesize one sentence and flush its audio between the sentence
/// markers. Returns `Err` only when the client channel is gone.
async fn speak_sentence(
    tts: &Arc<dyn TtsProvider>,
    outbound: &mpsc::Sender<Outbound>,
    tts_state: &impl Fn(TtsState, Option<String>) -> Outbound,
    sentence: &str,
) -> Result<(), ()> {
    outbound
        .send(tts_state(TtsState::SentenceStart, Some(sentence.to_string())))
        .await
        .map_err(|_| ())?;

    let mut frames = tts.synthesize(sentence).await;
    while let Some(item) = frames.recv().await {
        match item {
            Ok(audio) => {
                outbound
                    .send(Outbound::Binary(audio))
                    .await
                    .map_err(|_| ())?;
            }
            Err(e) => {
                warn!("TTS error for \"{}\": {}", sentence, e);
                break;
            }
        }
    }

    outbound
        .send(tts_state(TtsState::SentenceEnd, None))
        .await
        .map_err(|_| ())
}

// ─── Socket entry point ──────────────────────────────────────

/// Run one accepted client socket to completion.
pub async fn handle_socket(
    socket: WebSocket,
    client_id: String,
    device_id: String,
    factory: Arc<ProviderFactory>,
    registry: Arc<ConnectionRegistry>,
) {
    let (sink, mut source) = socket.split();
    let (outbound, writer) = spawn_writer(sink);

    let mut conn = match Connection::new(
        client_id.clone(),
        device_id,
        outbound.clone(),
        factory,
        registry.clone(),
    ) {
        Ok(conn) => conn,
        Err(e) => {
            error!("[{}] Connection setup failed: {}", client_id, e);
            let _ = outbound
                .send(Outbound::Json(ServerMessage::Error {
                    data: ErrorData { error: e.to_string() },
                }))
                .await;
            writer.abort();
            return;
        }
    };

    registry.add_device(&client_id).await;
    registry
        .create_session(conn.session_id(), &conn.device_id)
        .await;

    conn.send_json(ServerMessage::Hello {
        session_id: conn.session_id.clone(),
        status: "connected".to_string(),
        message: "连接成功".to_string(),
    })
    .await;

    loop {
        // Resolve one input first, then dispatch: the branch futures borrow
        // the event receivers, the handlers need the whole connection.
        let input = tokio::select! {
            message = source.next() => Input::Client(message),
            event = recv_next(&mut conn.asr_events) => Input::Asr(event),
            event = recv_next(&mut conn.turn_events) => Input::Turn(event),
        };
        match input {
            Input::Client(Some(Ok(Message::Binary(data)))) => {
                conn.handle_audio_frame(&data).await;
            }
            Input::Client(Some(Ok(Message::Text(text)))) => {
                conn.handle_client_text(&text).await;
            }
            Input::Client(Some(Ok(Message::Close(_)))) | Input::Client(None) => break,
            Input::Client(Some(Ok(_))) => {}
            Input::Client(Some(Err(e))) => {
                debug!("[{}] Client read error: {}", conn.client_id, e);
                break;
            }
            Input::Asr(Some(event)) => conn.handle_asr_event(event).await,
            Input::Asr(None) => conn.asr_events = None,
            Input::Turn(Some(event)) => conn.handle_turn_event(event).await,
            Input::Turn(None) => conn.turn_events = None,
        }
    }

    conn.shutdown().await;
    writer.abort();
}

enum Input {
    Client(Option<Result<Message, axum::Error>>),
    Asr(Option<AsrEvent>),
    Turn(Option<TurnEvent>),
}

/// Receive from an optional channel; pends forever while the slot is empty
/// so the corresponding `select!` branch stays quiet.
async fn recv_next<T>(slot: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match slot {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;

    struct MockLlm {
        tokens: Vec<Result<String, GatewayError>>,
    }

    #[async_trait]
    impl LlmProvider for MockLlm {
        async fn chat_stream(
            &self,
            _text: &str,
            _history: &[ChatTurn],
        ) -> mpsc::Receiver<Result<String, GatewayError>> {
            let (tx, rx) = mpsc::channel(32);
            let tokens: Vec<_> = self
                .tokens
                .iter()
                .map(|t| match t {
                    Ok(s) => Ok(s.clone()),
                    Err(e) => Err(GatewayError::UpstreamTransient(e.to_string())),
                })
                .collect();
            tokio::spawn(async move {
                for token in tokens {
                    if tx.send(token).await.is_err() {
                        break;
                    }
                }
            });
            rx
        }
    }

    struct MockTts {
        frames_per_sentence: usize,
    }

    #[async_trait]
    impl TtsProvider for MockTts {
        async fn synthesize(&self, _text: &str) -> mpsc::Receiver<Result<Vec<u8>, GatewayError>> {
            let (tx, rx) = mpsc::channel(32);
            let count = self.frames_per_sentence;
            tokio::spawn(async move {
                for i in 0..count {
                    if tx.send(Ok(vec![i as u8; 4])).await.is_err() {
                        break;
                    }
                }
            });
            rx
        }
    }

    struct NoopAsrStream;

    #[async_trait]
    impl AsrStream for NoopAsrStream {
        async fn send_frame(&mut self, _frame: &[u8]) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn send_end(&mut self) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// Compact trace of the outbound channel for order assertions.
    async fn drain_outbound(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut trace = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            trace.push(match frame {
                Outbound::Json(ServerMessage::Stt { text, .. }) => format!("stt:{}", text),
                Outbound::Json(ServerMessage::Tts { state, text, .. }) => match state {
                    TtsState::Start => "tts.start".to_string(),
                    TtsState::SentenceStart => {
                        format!("sentence_start:{}", text.unwrap_or_default())
                    }
                    TtsState::SentenceEnd => "sentence_end".to_string(),
                    TtsState::Stop => "tts.stop".to_string(),
                },
                Outbound::Json(ServerMessage::Error { data }) => format!("error:{}", data.error),
                Outbound::Json(ServerMessage::Hello { .. }) => "hello".to_string(),
                Outbound::Json(ServerMessage::Control { data }) => format!("control:{}", data),
                Outbound::Binary(_) => "bin".to_string(),
            });
        }
        trace
    }

    fn test_connection() -> (Connection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let factory = Arc::new(ProviderFactory::new(Arc::new(Config::default())));
        let registry = ConnectionRegistry::new();
        let conn = Connection::new(
            "client-1".to_string(),
            "device-1".to_string(),
            tx,
            factory,
            registry,
        )
        .unwrap();
        (conn, rx)
    }

    async fn run_turn_with(
        tokens: Vec<Result<String, GatewayError>>,
        frames_per_sentence: usize,
    ) -> (Vec<String>, Vec<String>) {
        let llm: Arc<dyn LlmProvider> = Arc::new(MockLlm { tokens });
        let tts: Arc<dyn TtsProvider> = Arc::new(MockTts { frames_per_sentence });
        let (out_tx, mut out_rx) = mpsc::channel(256);
        let (ev_tx, mut ev_rx) = mpsc::channel(16);

        run_turn(
            llm,
            tts,
            out_tx,
            "s-1".to_string(),
            "你好".to_string(),
            Vec::new(),
            ev_tx,
        )
        .await;

        let trace = drain_outbound(&mut out_rx).await;
        let mut events = Vec::new();
        while let Ok(event) = ev_rx.try_recv() {
            events.push(format!("{:?}", event));
        }
        (trace, events)
    }

    #[tokio::test]
    async fn test_turn_outbound_ordering() {
        let tokens = vec![
            Ok("你".to_string()),
            Ok("好。".to_string()),
            Ok("再见！".to_string()),
        ];
        let (trace, events) = run_turn_with(tokens, 2).await;
        assert_eq!(
            trace,
            vec![
                "tts.start",
                "sentence_start:你好。",
                "bin",
                "bin",
                "sentence_end",
                "sentence_start:再见！",
                "bin",
                "bin",
                "sentence_end",
                "tts.stop",
            ]
        );
        assert!(events.iter().any(|e| e.contains("Reply")));
        assert_eq!(events.last().map(|s| s.as_str()), Some("Finished"));
    }

    #[tokio::test]
    async fn test_turn_flushes_trailing_fragment() {
        // stream ends on a non-terminator character
        let tokens = vec![Ok("好的。".to_string()), Ok("没有结尾".to_string())];
        let (trace, _) = run_turn_with(tokens, 1).await;
        assert_eq!(
            trace,
            vec![
                "tts.start",
                "sentence_start:好的。",
                "bin",
                "sentence_end",
                "sentence_start:没有结尾",
                "bin",
                "sentence_end",
                "tts.stop",
            ]
        );
    }

    #[tokio::test]
    async fn test_turn_failure_before_first_token() {
        let tokens = vec![Err(GatewayError::UpstreamTransient("boom".to_string()))];
        let (trace, events) = run_turn_with(tokens, 1).await;
        assert!(trace.is_empty());
        assert!(events.iter().any(|e| e.contains("Failed")));
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (mut conn, mut rx) = test_connection();
        conn.handle_client_text(r#"{"type":"control","data":{"command":"ping"}}"#)
            .await;
        let trace = drain_outbound(&mut rx).await;
        assert_eq!(trace, vec![r#"control:{"command":"pong"}"#]);
    }

    #[tokio::test]
    async fn test_short_utterance_not_dispatched() {
        let (mut conn, mut rx) = test_connection();
        conn.state = ConnState::Listening;
        conn.asr_stream = Some(Box::new(NoopAsrStream));
        conn.segment_frames = 5;

        conn.handle_asr_event(AsrEvent::Final("短".to_string())).await;

        assert_eq!(conn.state, ConnState::Idle);
        assert!(conn.asr_stream.is_none());
        assert!(drain_outbound(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_speech_resets_without_emission() {
        let (mut conn, mut rx) = test_connection();
        conn.state = ConnState::Listening;
        conn.asr_stream = Some(Box::new(NoopAsrStream));
        conn.segment_frames = 40;

        conn.handle_asr_event(AsrEvent::Empty { duration_ms: 2400 })
            .await;

        assert_eq!(conn.state, ConnState::Idle);
        assert!(drain_outbound(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_speech_in_manual_mode_keeps_recording() {
        let (mut conn, mut rx) = test_connection();
        conn.listen_mode = ListenMode::Manual;
        conn.state = ConnState::Listening;
        conn.asr_stream = Some(Box::new(NoopAsrStream));
        conn.asr_accumulated = "前半段".to_string();

        conn.handle_asr_event(AsrEvent::Empty { duration_ms: 2400 })
            .await;

        // a mid-utterance pause must not tear the recording down
        assert_eq!(conn.state, ConnState::Listening);
        assert!(conn.asr_stream.is_some());
        assert_eq!(conn.asr_accumulated, "前半段");
        assert!(drain_outbound(&mut rx).await.is_empty());

        // the client's stop edge still dispatches the accumulated text
        conn.handle_client_text(r#"{"type":"control","data":{"command":"listen_stop"}}"#)
            .await;
        let trace = drain_outbound(&mut rx).await;
        assert_eq!(trace.first().map(|s| s.as_str()), Some("stt:前半段"));
    }

    #[tokio::test]
    async fn test_manual_mode_accumulates_until_stop() {
        let (mut conn, mut rx) = test_connection();
        conn.listen_mode = ListenMode::Manual;
        conn.state = ConnState::Listening;
        conn.asr_stream = Some(Box::new(NoopAsrStream));

        conn.handle_asr_event(AsrEvent::Final("今天".to_string())).await;
        conn.handle_asr_event(AsrEvent::Final("天气好".to_string())).await;
        assert!(drain_outbound(&mut rx).await.is_empty());
        assert_eq!(conn.asr_accumulated, "今天天气好");

        conn.handle_client_text(r#"{"type":"control","data":{"command":"listen_stop"}}"#)
            .await;

        let trace = drain_outbound(&mut rx).await;
        // single stt with the concatenated text, then a turn-setup error
        // because no LLM is configured in the test factory
        assert_eq!(trace.first().map(|s| s.as_str()), Some("stt:今天天气好"));
        assert!(trace.iter().any(|e| e.starts_with("error:")));
        assert_eq!(conn.state, ConnState::Idle);
    }

    #[tokio::test]
    async fn test_auto_final_dispatches_with_enough_frames() {
        let (mut conn, mut rx) = test_connection();
        conn.state = ConnState::Listening;
        conn.asr_stream = Some(Box::new(NoopAsrStream));
        conn.segment_frames = 30;

        conn.handle_asr_event(AsrEvent::Final("你好".to_string())).await;

        let trace = drain_outbound(&mut rx).await;
        assert_eq!(trace.first().map(|s| s.as_str()), Some("stt:你好"));
        assert!(conn.asr_stream.is_none());
    }

    #[tokio::test]
    async fn test_history_bounded_at_twenty_entries() {
        let (mut conn, _rx) = test_connection();
        for i in 0..30 {
            conn.push_history(ChatTurn::user(format!("u{}", i)));
            conn.push_history(ChatTurn::assistant(format!("a{}", i)));
        }
        assert_eq!(conn.dialog_history.len(), DIALOG_HISTORY_CAP);
        assert_eq!(conn.dialog_history[0].content, "u20");
    }

    #[tokio::test]
    async fn test_encoded_recent_bounded_at_ten() {
        let (mut conn, _rx) = test_connection();
        for i in 0..25u8 {
            conn.push_recent(&[i]);
        }
        assert_eq!(conn.encoded_recent.len(), ENCODED_RECENT_CAP);
        assert_eq!(conn.encoded_recent.front().map(|f| f[0]), Some(15));
        assert_eq!(conn.encoded_recent.back().map(|f| f[0]), Some(24));
    }

    #[test]
    fn test_server_message_wire_format() {
        let message = ServerMessage::Tts {
            state: TtsState::SentenceStart,
            text: Some("你好。".to_string()),
            session_id: "s".to_string(),
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "tts");
        assert_eq!(json["state"], "sentence_start");
        assert_eq!(json["text"], "你好。");

        let stop = ServerMessage::Tts {
            state: TtsState::Stop,
            text: None,
            session_id: "s".to_string(),
        };
        let json = serde_json::to_value(&stop).unwrap();
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_client_message_text_variants() {
        let direct: ClientMessage =
            serde_json::from_str(r#"{"type":"text","text":"你好"}"#).unwrap();
        let nested: ClientMessage =
            serde_json::from_str(r#"{"type":"text","data":{"text":"你好"}}"#).unwrap();
        for message in [direct, nested] {
            match message {
                ClientMessage::Text { text, data } => {
                    let resolved = text.or(data.and_then(|d| d.text)).unwrap();
                    assert_eq!(resolved, "你好");
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }
}
