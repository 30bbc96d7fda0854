//! External speech-engine seams.
//!
//! Three capability traits — [`Recognizer`], [`Generator`],
//! [`Synthesizer`] — with backends selected from configuration at
//! session construction. The session core only ever sees the traits;
//! swapping a backend never touches the state machine.

pub mod generator;
pub mod recognizer;
pub mod synthesizer;

use crate::audio::ingest::Utterance;
use crate::audio::AudioFrame;
use crate::config::{AudioConfig, EnginesConfig, GeneratorKind, RecognizerKind, SynthesizerKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

// ── Transcription events ──────────────────────────────────────────

/// Event emitted by a recognizer backend over its event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    /// Provisional hypothesis; superseded repeatedly.
    Partial { text: String },
    /// Confirmed transcript for the finalized utterance. Exactly one
    /// per finalize.
    Final { text: String },
    /// The recognizer gave up on this utterance.
    Failed { message: String },
}

// ── Capability traits ─────────────────────────────────────────────

/// Streaming speech recognizer seam.
///
/// `feed` is fire-and-forget: it never blocks the caller beyond a
/// bounded queue push. Transcript events come back over the channel
/// supplied at construction.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Forward one frame of the open utterance as it arrives.
    /// Streaming backends transcribe from these; batch backends wait
    /// for the finalized utterance instead.
    async fn feed(&self, frame: AudioFrame) -> anyhow::Result<()>;

    /// Consume the finalized utterance and request its transcript.
    /// The backend must emit exactly one `Final` or `Failed` event.
    async fn finalize(&self, utterance: Utterance) -> anyhow::Result<()>;

    /// Drop any recognizer-side state for the open utterance without
    /// producing a transcript.
    async fn reset(&self);
}

/// One completed user/assistant exchange, as seen by the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub user: String,
    pub assistant: String,
}

/// Dialogue reply generator seam. One call per turn, bounded by the
/// configured engine timeout at the call site.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn reply(&self, history: &[Exchange], user_text: &str) -> anyhow::Result<String>;
}

/// One unit of raw synthesized audio before resampling.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthChunk {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Speech synthesizer seam. Returns a lazy, finite, non-restartable
/// chunk stream; the receiver side may be dropped at any time to
/// abandon the synthesis.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<mpsc::Receiver<anyhow::Result<SynthChunk>>>;
}

// ── Backend selection ─────────────────────────────────────────────

/// Build the configured recognizer backend. The `ws` backend connects
/// eagerly so a bad endpoint fails the session up front.
pub async fn create_recognizer(
    engines: &EnginesConfig,
    audio: &AudioConfig,
    events: mpsc::Sender<TranscriptEvent>,
) -> anyhow::Result<Arc<dyn Recognizer>> {
    Ok(match engines.recognizer {
        RecognizerKind::Ws => {
            let url = engines
                .recognizer_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("recognizer = \"ws\" requires recognizer_url"))?;
            Arc::new(
                recognizer::WsRecognizer::connect(url, audio.recognizer_rate, events).await?,
            )
        }
        RecognizerKind::Http => {
            let url = engines
                .recognizer_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("recognizer = \"http\" requires recognizer_url"))?;
            Arc::new(recognizer::HttpRecognizer::new(
                url,
                audio.recognizer_rate,
                events,
            ))
        }
        RecognizerKind::Scripted => {
            Arc::new(recognizer::ScriptedRecognizer::new(Vec::new(), events))
        }
    })
}

/// Build the configured generator backend.
pub fn create_generator(engines: &EnginesConfig) -> anyhow::Result<Arc<dyn Generator>> {
    Ok(match engines.generator {
        GeneratorKind::Http => {
            let url = engines
                .generator_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("generator = \"http\" requires generator_url"))?;
            Arc::new(generator::HttpGenerator::new(
                url,
                engines.generator_model.as_deref(),
                engines.generator_api_key.as_deref(),
            ))
        }
        GeneratorKind::Rules => Arc::new(generator::RulesGenerator::new()),
        GeneratorKind::Scripted => Arc::new(generator::ScriptedGenerator::echo()),
    })
}

/// Build the configured synthesizer backend.
pub fn create_synthesizer(
    engines: &EnginesConfig,
    audio: &AudioConfig,
) -> anyhow::Result<Arc<dyn Synthesizer>> {
    Ok(match engines.synthesizer {
        SynthesizerKind::Http => {
            let url = engines
                .synthesizer_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("synthesizer = \"http\" requires synthesizer_url"))?;
            Arc::new(synthesizer::HttpSynthesizer::new(url, audio.playback_rate))
        }
        SynthesizerKind::Tone => Arc::new(synthesizer::ToneSynthesizer::new(audio.playback_rate)),
        SynthesizerKind::Scripted => {
            Arc::new(synthesizer::ScriptedSynthesizer::silence(3, audio.playback_rate))
        }
    })
}
