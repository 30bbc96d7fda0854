//! Recognizer backends.
//!
//! All three backends speak the same narrow adapter surface: frames in
//! via [`Recognizer::feed`], transcript events out over an mpsc channel
//! owned by the session event loop. Engine failures never propagate as
//! `Err` from the trait methods — they surface as
//! [`TranscriptEvent::Failed`] so the state machine handles them as an
//! ordered event like everything else.

use super::{Recognizer, TranscriptEvent};
use crate::audio::ingest::Utterance;
use crate::audio::{self, AudioFrame};
use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;

// ── Scripted backend ──────────────────────────────────────────────

/// Deterministic recognizer for offline runs and tests: each finalize
/// pops the next scripted transcript. An empty script falls back to a
/// fixed greeting so the offline demo loop still converses.
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<String>>,
    failures: Mutex<VecDeque<String>>,
    events: mpsc::Sender<TranscriptEvent>,
}

impl ScriptedRecognizer {
    pub fn new(script: Vec<String>, events: mpsc::Sender<TranscriptEvent>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            failures: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Queue a failure for the next finalize.
    pub fn fail_next(&self, message: &str) {
        self.failures.lock().push_back(message.to_string());
    }
}

#[async_trait]
impl Recognizer for ScriptedRecognizer {
    async fn feed(&self, _frame: AudioFrame) -> anyhow::Result<()> {
        // Batch-style: everything arrives with the finalized utterance.
        Ok(())
    }

    async fn finalize(&self, utterance: Utterance) -> anyhow::Result<()> {
        // Pop before awaiting so no guard lives across the send.
        let failure = self.failures.lock().pop_front();
        if let Some(message) = failure {
            let _ = self.events.send(TranscriptEvent::Failed { message }).await;
            return Ok(());
        }
        let text = if utterance.is_empty() {
            String::new()
        } else {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| "hello".to_string())
        };
        if !text.is_empty() {
            let _ = self
                .events
                .send(TranscriptEvent::Partial { text: text.clone() })
                .await;
        }
        let _ = self.events.send(TranscriptEvent::Final { text }).await;
        Ok(())
    }

    async fn reset(&self) {}
}

// ── Batch HTTP backend ────────────────────────────────────────────

#[derive(Serialize)]
struct RecognizeRequest<'a> {
    sample_rate: u32,
    pcm16le: &'a str,
}

/// Batch recognizer: POSTs the finalized utterance as one base64 PCM
/// payload. The POST runs on a spawned task so the session event loop
/// keeps draining (a barge-in must not wait on the recognizer's round
/// trip).
pub struct HttpRecognizer {
    url: String,
    target_rate: u32,
    client: reqwest::Client,
    events: mpsc::Sender<TranscriptEvent>,
}

impl HttpRecognizer {
    pub fn new(url: &str, target_rate: u32, events: mpsc::Sender<TranscriptEvent>) -> Self {
        Self {
            url: url.to_string(),
            target_rate,
            client: reqwest::Client::new(),
            events,
        }
    }
}

#[async_trait]
impl Recognizer for HttpRecognizer {
    async fn feed(&self, _frame: AudioFrame) -> anyhow::Result<()> {
        // Batch backend: the audio arrives whole at finalize.
        Ok(())
    }

    async fn finalize(&self, utterance: Utterance) -> anyhow::Result<()> {
        let samples = audio::resample(
            &utterance.merged_samples(),
            utterance.sample_rate,
            self.target_rate,
        );
        if samples.is_empty() {
            let _ = self
                .events
                .send(TranscriptEvent::Final { text: String::new() })
                .await;
            return Ok(());
        }

        let client = self.client.clone();
        let url = self.url.clone();
        let rate = self.target_rate;
        let events = self.events.clone();
        tokio::spawn(async move {
            let pcm = audio::encode(&samples);
            let b64 = base64::engine::general_purpose::STANDARD.encode(&pcm);
            let body = RecognizeRequest {
                sample_rate: rate,
                pcm16le: &b64,
            };
            let event = match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    match resp.json::<serde_json::Value>().await {
                        Ok(v) => {
                            let text = v
                                .get("text")
                                .and_then(|t| t.as_str())
                                .unwrap_or_default()
                                .trim()
                                .to_string();
                            TranscriptEvent::Final { text }
                        }
                        Err(e) => TranscriptEvent::Failed {
                            message: format!("recognizer response unreadable: {e}"),
                        },
                    }
                }
                Ok(resp) => TranscriptEvent::Failed {
                    message: format!("recognizer returned HTTP {}", resp.status()),
                },
                Err(e) => TranscriptEvent::Failed {
                    message: format!("recognizer request failed: {e}"),
                },
            };
            let _ = events.send(event).await;
        });
        Ok(())
    }

    async fn reset(&self) {}
}

// ── Streaming WebSocket backend ───────────────────────────────────

/// Commands sent to the outbound socket loop.
#[derive(Debug)]
enum WsCommand {
    Audio { sample_rate: u32, pcm: Vec<u8> },
    Finalize,
    Reset,
}

/// Streaming recognizer over a WebSocket service.
///
/// Wire format, all JSON text frames:
/// - out: `{"type":"audio","sample_rate":16000,"pcm16le":"<base64>"}`,
///   `{"type":"finalize"}`, `{"type":"reset"}`
/// - in: `{"type":"partial","text"}`, `{"type":"final","text"}`,
///   `{"type":"error","message"}`
pub struct WsRecognizer {
    command_tx: mpsc::Sender<WsCommand>,
    target_rate: u32,
}

impl WsRecognizer {
    /// Connect to the recognizer service and spawn the socket loops.
    pub async fn connect(
        url: &str,
        target_rate: u32,
        events: mpsc::Sender<TranscriptEvent>,
    ) -> anyhow::Result<Self> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to recognizer at {url}: {e}"))?;
        tracing::info!(url, "Connected to streaming recognizer");

        let (ws_sender, ws_receiver) = ws_stream.split();
        let ws_sender = Arc::new(AsyncMutex::new(ws_sender));

        let (command_tx, command_rx) = mpsc::channel::<WsCommand>(256);

        let sender_for_out = Arc::clone(&ws_sender);
        tokio::spawn(async move {
            Self::outbound_loop(command_rx, sender_for_out).await;
        });

        tokio::spawn(async move {
            Self::inbound_loop(ws_receiver, events).await;
        });

        Ok(Self {
            command_tx,
            target_rate,
        })
    }

    async fn outbound_loop(
        mut rx: mpsc::Receiver<WsCommand>,
        ws_sender: Arc<
            AsyncMutex<
                futures_util::stream::SplitSink<
                    tokio_tungstenite::WebSocketStream<
                        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
                    >,
                    WsMessage,
                >,
            >,
        >,
    ) {
        while let Some(command) = rx.recv().await {
            let json = match command {
                WsCommand::Audio { sample_rate, pcm } => {
                    let b64 = base64::engine::general_purpose::STANDARD.encode(&pcm);
                    serde_json::json!({"type": "audio", "sample_rate": sample_rate, "pcm16le": b64})
                }
                WsCommand::Finalize => serde_json::json!({"type": "finalize"}),
                WsCommand::Reset => serde_json::json!({"type": "reset"}),
            };
            let mut sender = ws_sender.lock().await;
            if sender.send(WsMessage::Text(json.to_string().into())).await.is_err() {
                tracing::warn!("Recognizer socket send failed, closing outbound loop");
                break;
            }
        }
        tracing::debug!("Recognizer outbound loop terminated");
    }

    async fn inbound_loop(
        mut ws_receiver: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
        events: mpsc::Sender<TranscriptEvent>,
    ) {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => {
                    if let Some(event) = parse_recognizer_message(&text) {
                        if events.send(event).await.is_err() {
                            return;
                        }
                    }
                }
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(close_frame = ?frame, "Recognizer connection closed");
                    let _ = events
                        .send(TranscriptEvent::Failed {
                            message: "recognizer connection closed".into(),
                        })
                        .await;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Recognizer WebSocket error");
                    let _ = events
                        .send(TranscriptEvent::Failed {
                            message: format!("recognizer socket error: {e}"),
                        })
                        .await;
                    break;
                }
            }
        }
        tracing::debug!("Recognizer inbound loop terminated");
    }
}

/// Parse one JSON text frame from the recognizer service.
pub fn parse_recognizer_message(json_text: &str) -> Option<TranscriptEvent> {
    let value: serde_json::Value = match serde_json::from_str(json_text) {
        Ok(v) => v,
        Err(e) => {
            return Some(TranscriptEvent::Failed {
                message: format!("unparseable recognizer message: {e}"),
            })
        }
    };
    let text_field = |v: &serde_json::Value| {
        v.get("text")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string()
    };
    match value.get("type").and_then(|t| t.as_str()) {
        Some("partial") => Some(TranscriptEvent::Partial {
            text: text_field(&value),
        }),
        Some("final") => Some(TranscriptEvent::Final {
            text: text_field(&value),
        }),
        Some("error") => Some(TranscriptEvent::Failed {
            message: value
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown recognizer error")
                .to_string(),
        }),
        other => {
            tracing::debug!(msg_type = ?other, "Ignoring unknown recognizer message");
            None
        }
    }
}

#[async_trait]
impl Recognizer for WsRecognizer {
    async fn feed(&self, frame: AudioFrame) -> anyhow::Result<()> {
        let resampled = audio::resample(&frame.samples, frame.sample_rate, self.target_rate);
        self.command_tx
            .send(WsCommand::Audio {
                sample_rate: self.target_rate,
                pcm: audio::encode(&resampled),
            })
            .await
            .map_err(|_| anyhow::anyhow!("Recognizer command channel closed"))
    }

    async fn finalize(&self, _utterance: Utterance) -> anyhow::Result<()> {
        // The frames were streamed live; only the boundary is news.
        self.command_tx
            .send(WsCommand::Finalize)
            .await
            .map_err(|_| anyhow::anyhow!("Recognizer command channel closed"))
    }

    async fn reset(&self) {
        let _ = self.command_tx.send(WsCommand::Reset).await;
    }
}
