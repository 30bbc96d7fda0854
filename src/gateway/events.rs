//! WebSocket control-message schema for a voice session.
//!
//! ## Protocol
//!
//! ```text
//! Browser mic ──binary PCM16LE──▸ voicegate ──binary PCM16LE──▸ Browser speaker
//!      └──────JSON control──────▸          ◂──────JSON control──────┘
//! ```
//!
//! Control messages are JSON text frames; audio travels as raw binary
//! frames of little-endian 16-bit mono PCM. A control message is never
//! interleaved inside a partial binary frame — the outbound writer task
//! serializes both onto the socket.

use serde::{Deserialize, Serialize};

// ── Client → Server messages ──────────────────────────────────────

/// Control messages sent from the client to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start of speech: open a new utterance. Arriving while the
    /// assistant is thinking or speaking, this is a barge-in.
    Start,
    /// End of speech: finalize the open utterance.
    Stop,
    /// Drop the open utterance and the conversation history.
    Reset,
}

// ── Server → Client messages ──────────────────────────────────────

/// Control messages sent from the gateway to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Provisional transcript of the open utterance; superseded
    /// repeatedly until the final transcript arrives.
    PartialTranscript { text: String },

    /// Confirmed transcript for the finalized utterance.
    FinalTranscript { text: String },

    /// The assistant's reply text. Binary playback frames for this turn
    /// follow at `sample_rate`.
    AssistantText { text: String, sample_rate: u32 },

    /// All playback audio for the assistant's reply has been sent.
    AssistantAudioEnd,

    /// Barge-in: discard any queued or sounding playback immediately.
    ClearAudioQueue,

    /// Acknowledges `reset`: history and buffers are gone.
    SessionReset,

    /// A short user-visible failure notice.
    Error {
        code: String,
        message: String,
    },
}
