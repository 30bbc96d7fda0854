//! TOML configuration.
//!
//! Every field has a default, so an empty file (or no file at all)
//! yields a working offline configuration: scripted recognizer, rules
//! generator, tone synthesizer.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub turn: TurnConfig,
    pub engines: EnginesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the gateway.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8970".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of inbound microphone PCM, Hz.
    pub capture_rate: u32,
    /// Sample rate of outbound playback PCM, Hz.
    pub playback_rate: u32,
    /// Sample rate the recognizer expects, Hz.
    pub recognizer_rate: u32,
    /// Samples per inbound binary frame (1024 ≈ 64 ms at 16 kHz).
    pub frame_samples: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_rate: 16_000,
            playback_rate: 22_050,
            recognizer_rate: 16_000,
            frame_samples: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// How long Listening may stay open without a finalize signal.
    pub silence_timeout_ms: u64,
    /// Enable the energy VAD as a start/end-of-speech source.
    pub vad_enabled: bool,
    /// RMS threshold for the energy VAD.
    pub vad_threshold: f32,
    /// Sub-threshold frames before the VAD declares end of speech.
    pub vad_hangover_frames: u32,
    /// Scheduling look-ahead for the first playback chunk, ms.
    pub playback_lookahead_ms: u64,
    /// Bounded wait for an out-of-order playback chunk before the gap
    /// is treated as a protocol error, ms.
    pub sequence_gap_wait_ms: u64,
    /// Maximum wait on any single external engine call.
    pub engine_timeout_secs: u64,
    /// Conversation turns kept in the generator's history window.
    pub max_history_turns: usize,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: 10_000,
            vad_enabled: false,
            vad_threshold: 0.01,
            vad_hangover_frames: 8,
            playback_lookahead_ms: 50,
            sequence_gap_wait_ms: 250,
            engine_timeout_secs: 30,
            max_history_turns: 6,
        }
    }
}

impl TurnConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn playback_lookahead(&self) -> Duration {
        Duration::from_millis(self.playback_lookahead_ms)
    }

    pub fn sequence_gap_wait(&self) -> Duration {
        Duration::from_millis(self.sequence_gap_wait_ms)
    }

    pub fn engine_timeout(&self) -> Duration {
        Duration::from_secs(self.engine_timeout_secs)
    }
}

// ── Engine backend selection ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerKind {
    /// Streaming WebSocket recognizer service.
    Ws,
    /// Batch HTTP recognizer: one POST per finalized utterance.
    Http,
    /// Deterministic offline recognizer for development and tests.
    Scripted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeneratorKind {
    /// OpenAI-style chat completions endpoint.
    Http,
    /// Offline deterministic responder.
    Rules,
    /// Fixed reply, for development and tests.
    Scripted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesizerKind {
    /// HTTP synthesizer returning raw PCM.
    Http,
    /// Offline sine-burst synthesis, deterministic.
    Tone,
    /// Fixed chunk script, for development and tests.
    Scripted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnginesConfig {
    pub recognizer: RecognizerKind,
    pub recognizer_url: Option<String>,
    pub generator: GeneratorKind,
    pub generator_url: Option<String>,
    pub generator_model: Option<String>,
    pub generator_api_key: Option<String>,
    pub synthesizer: SynthesizerKind,
    pub synthesizer_url: Option<String>,
}

impl Default for EnginesConfig {
    fn default() -> Self {
        Self {
            recognizer: RecognizerKind::Scripted,
            recognizer_url: None,
            generator: GeneratorKind::Rules,
            generator_url: None,
            generator_model: None,
            generator_api_key: None,
            synthesizer: SynthesizerKind::Tone,
            synthesizer_url: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file. A missing file yields the
    /// defaults; a present-but-broken file is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}
