//! Per-connection session core.
//!
//! One session owns one serialized event loop ([`runner`]): every state
//! transition is an ordered event against the same [`machine`], so
//! "new speech arrived" and "turn completing" can never race. External
//! engine work runs as spawned tasks whose results come back as events
//! into that same loop.

pub mod machine;
pub mod orchestrator;
pub mod runner;

use crate::audio::AudioFrame;
use crate::engines::TranscriptEvent;
use crate::error::SessionError;
use crate::gateway::events::{ClientMessage, ServerMessage};

/// Conversation phase of a session. `Thinking` spans everything between
/// end-of-speech and the first playback chunk: final recognition,
/// generation, and synthesis spin-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Listening,
    Thinking,
    Speaking,
}

/// One ordered unit of synthesized playback audio, already resampled to
/// the session's playback rate. Owned by exactly one stage at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    /// The turn this chunk belongs to. Stale chunks from a cancelled
    /// turn are dropped by id, never replayed.
    pub turn_id: u64,
    /// Position within the turn, starting at 0, gapless.
    pub seq: u64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackChunk {
    pub fn duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Progress reports from an in-flight orchestrator task.
#[derive(Debug)]
pub enum TurnEvent {
    /// The generator produced the assistant's reply text.
    ReplyReady { turn_id: u64, text: String },
    /// The first playback chunk of this turn was handed to the
    /// scheduler.
    FirstChunk { turn_id: u64 },
    /// The turn ran to completion with its cancellation token live.
    Completed {
        turn_id: u64,
        user: String,
        assistant: String,
    },
    /// An engine failed or timed out mid-turn.
    Failed { turn_id: u64, error: SessionError },
}

/// Faults reported by the playback scheduler.
#[derive(Debug, Clone)]
pub enum PlaybackEvent {
    /// A chunk gap outlived the bounded reorder wait.
    Gap {
        turn_id: u64,
        expected: u64,
        buffered: u64,
    },
}

/// Commands accepted by the playback scheduler task.
#[derive(Debug)]
pub enum PlayCmd {
    Enqueue(PlaybackChunk),
    /// No more chunks will arrive for this turn; emit
    /// `assistant_audio_end` after the last one is sent.
    EndOfTurn(u64),
    /// Barge-in or reset: discard everything, reset the clock, and
    /// advance the dead-turn barrier to the given turn id.
    Flush(u64),
}

/// Every input the session event loop can receive.
#[derive(Debug)]
pub enum SessionEvent {
    Client(ClientMessage),
    Frame(AudioFrame),
    Transcript(TranscriptEvent),
    Turn(TurnEvent),
    Playback(PlaybackEvent),
    Disconnected,
}

/// Outbound traffic, funneled through the single socket writer task so
/// a control message never interleaves a partial binary frame.
#[derive(Debug)]
pub enum Outbound {
    Control(ServerMessage),
    Audio(Vec<u8>),
}

impl SessionError {
    /// Build the `error` control message for this fault.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Error {
            code: self.code().to_string(),
            message: self.user_notice().to_string(),
        }
    }
}
