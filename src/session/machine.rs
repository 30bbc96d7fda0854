//! Turn & interruption state machine.
//!
//! Pure and synchronous: events in, effects out, no I/O and no clocks.
//! The async runner feeds it one event at a time and executes the
//! returned effects, so every transition is serialized by construction.
//!
//! ```text
//! Idle ─start─▸ Listening ─stop─▸ Thinking ─first chunk─▸ Speaking
//!   ▴                                │                        │
//!   └────────────── turn complete ───┴────────────────────────┘
//!
//! barge-in: (Thinking | Speaking) ─start─▸ Listening
//! ```
//!
//! A barge-in is total: the active turn's token is invalidated, its
//! queued playback flushed, and nothing it produces afterwards reaches
//! the client or the history.

use super::TurnState;
use crate::error::SessionError;
use crate::gateway::events::ServerMessage;

/// Input event, already serialized by the runner.
#[derive(Debug)]
pub enum Input {
    /// Client `start` or VAD speech-start. The detection policy never
    /// reaches this machine; both arrive as the same event.
    StartOfSpeech,
    /// Client `stop` or VAD speech-end.
    EndOfSpeech,
    /// Listening outlived the silence timeout without a stop signal.
    SilenceTimeout,
    /// Client `reset`.
    Reset,
    /// The finalized utterance contained no audio.
    UtteranceEmpty,
    TranscriptPartial(String),
    TranscriptFinal(String),
    TranscriptFailed(String),
    /// Generator reply is ready; playback frames will follow.
    ReplyReady { turn_id: u64, text: String },
    /// First playback chunk of the turn reached the scheduler.
    FirstChunk { turn_id: u64 },
    TurnCompleted {
        turn_id: u64,
        user: String,
        assistant: String,
    },
    TurnFailed {
        turn_id: u64,
        error: SessionError,
    },
}

/// Side effect for the runner to execute, in order.
#[derive(Debug, PartialEq)]
pub enum Effect {
    /// Open a fresh utterance buffer.
    OpenUtterance,
    /// Close the open utterance and finalize recognition.
    FinalizeUtterance,
    /// Drop the open utterance and any recognizer-side state for it,
    /// producing no transcript.
    AbandonUtterance,
    /// Spawn an orchestrator task for this turn.
    BeginTurn { turn_id: u64, text: String },
    /// Invalidate this turn's cancellation token.
    CancelTurn { turn_id: u64 },
    /// Discard all queued and sounding playback immediately. Chunks
    /// from turns at or below `up_to` are dead even if they arrive
    /// after the flush (the cancelled orchestrator may still have one
    /// in flight).
    FlushPlayback { up_to: u64 },
    /// Append a completed exchange to the history window.
    CommitTurn { user: String, assistant: String },
    ClearHistory,
    Send(ServerMessage),
    ArmSilenceTimer,
    DisarmSilenceTimer,
}

/// The control core of one session. Single-owner, mutated only from the
/// session event loop.
pub struct TurnMachine {
    state: TurnState,
    /// The one turn whose synthesis/playback may be active.
    active: Option<ActiveTurn>,
    next_turn_id: u64,
    playback_rate: u32,
}

struct ActiveTurn {
    id: u64,
    user_text: String,
}

impl TurnMachine {
    pub fn new(playback_rate: u32) -> Self {
        Self {
            state: TurnState::Idle,
            active: None,
            next_turn_id: 1,
            playback_rate,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn active_turn_id(&self) -> Option<u64> {
        self.active.as_ref().map(|t| t.id)
    }

    /// A flush covering every turn allocated so far. Whenever a flush
    /// fires, the newest turn is being cancelled and all older ones
    /// have finished, so the whole range is dead.
    fn flush_all(&self) -> Effect {
        Effect::FlushPlayback {
            up_to: self.next_turn_id - 1,
        }
    }

    /// Process one event. Effects must be executed in order.
    pub fn handle(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::StartOfSpeech => self.on_start_of_speech(),
            Input::EndOfSpeech | Input::SilenceTimeout => self.on_end_of_speech(),
            Input::Reset => self.on_reset(),
            Input::UtteranceEmpty => self.on_utterance_empty(),
            Input::TranscriptPartial(text) => self.on_partial(text),
            Input::TranscriptFinal(text) => self.on_final(text),
            Input::TranscriptFailed(message) => self.on_transcript_failed(message),
            Input::ReplyReady { turn_id, text } => self.on_reply_ready(turn_id, text),
            Input::FirstChunk { turn_id } => self.on_first_chunk(turn_id),
            Input::TurnCompleted {
                turn_id,
                user,
                assistant,
            } => self.on_turn_completed(turn_id, user, assistant),
            Input::TurnFailed { turn_id, error } => self.on_turn_failed(turn_id, error),
        }
    }

    fn on_start_of_speech(&mut self) -> Vec<Effect> {
        match self.state {
            TurnState::Idle => {
                self.state = TurnState::Listening;
                vec![Effect::OpenUtterance, Effect::ArmSilenceTimer]
            }
            // Already capturing; duplicate start signals are noise.
            TurnState::Listening => vec![],
            // Barge-in. Invalidate the active turn wholesale, then
            // start listening again.
            TurnState::Thinking | TurnState::Speaking => {
                let mut effects = Vec::new();
                if let Some(turn) = self.active.take() {
                    effects.push(Effect::CancelTurn { turn_id: turn.id });
                }
                effects.push(self.flush_all());
                effects.push(Effect::Send(ServerMessage::ClearAudioQueue));
                // Recognition for the abandoned utterance may still be
                // in flight; drop it so its transcript never lands.
                effects.push(Effect::AbandonUtterance);
                effects.push(Effect::OpenUtterance);
                effects.push(Effect::ArmSilenceTimer);
                self.state = TurnState::Listening;
                effects
            }
        }
    }

    fn on_end_of_speech(&mut self) -> Vec<Effect> {
        if self.state != TurnState::Listening {
            return vec![];
        }
        self.state = TurnState::Thinking;
        vec![Effect::DisarmSilenceTimer, Effect::FinalizeUtterance]
    }

    fn on_reset(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(turn) = self.active.take() {
            effects.push(Effect::CancelTurn { turn_id: turn.id });
        }
        effects.push(self.flush_all());
        effects.push(Effect::AbandonUtterance);
        effects.push(Effect::ClearHistory);
        effects.push(Effect::DisarmSilenceTimer);
        effects.push(Effect::Send(ServerMessage::SessionReset));
        self.state = TurnState::Idle;
        effects
    }

    fn on_utterance_empty(&mut self) -> Vec<Effect> {
        if self.state != TurnState::Thinking || self.active.is_some() {
            return vec![];
        }
        // Nothing was captured. Acknowledge the stop and go back to
        // waiting; no turn is created.
        self.state = TurnState::Idle;
        vec![Effect::Send(ServerMessage::FinalTranscript {
            text: String::new(),
        })]
    }

    fn on_partial(&mut self, text: String) -> Vec<Effect> {
        // Partials are UI-facing only and may arrive while still
        // listening (streaming recognizers) or while finalizing.
        match self.state {
            TurnState::Listening | TurnState::Thinking => {
                vec![Effect::Send(ServerMessage::PartialTranscript { text })]
            }
            _ => vec![],
        }
    }

    fn on_final(&mut self, text: String) -> Vec<Effect> {
        // Only a finalize we are actually waiting on may advance the
        // machine; a transcript for an abandoned utterance is stale.
        if self.state != TurnState::Thinking || self.active.is_some() {
            return vec![];
        }
        let text = text.trim().to_string();
        if text.is_empty() {
            self.state = TurnState::Idle;
            return vec![Effect::Send(ServerMessage::FinalTranscript { text })];
        }
        let turn_id = self.next_turn_id;
        self.next_turn_id += 1;
        self.active = Some(ActiveTurn {
            id: turn_id,
            user_text: text.clone(),
        });
        vec![
            Effect::Send(ServerMessage::FinalTranscript { text: text.clone() }),
            Effect::BeginTurn { turn_id, text },
        ]
    }

    fn on_transcript_failed(&mut self, message: String) -> Vec<Effect> {
        if self.state != TurnState::Thinking || self.active.is_some() {
            return vec![];
        }
        self.state = TurnState::Idle;
        let error = SessionError::RecognitionFailed(message);
        vec![Effect::Send(error.to_message())]
    }

    fn on_reply_ready(&mut self, turn_id: u64, text: String) -> Vec<Effect> {
        if self.active_turn_id() != Some(turn_id) {
            return vec![];
        }
        vec![Effect::Send(ServerMessage::AssistantText {
            text,
            sample_rate: self.playback_rate,
        })]
    }

    fn on_first_chunk(&mut self, turn_id: u64) -> Vec<Effect> {
        if self.active_turn_id() == Some(turn_id) && self.state == TurnState::Thinking {
            self.state = TurnState::Speaking;
        }
        vec![]
    }

    fn on_turn_completed(&mut self, turn_id: u64, user: String, assistant: String) -> Vec<Effect> {
        if self.active_turn_id() != Some(turn_id) {
            // Completed after cancellation; its output is discarded.
            return vec![];
        }
        self.active = None;
        self.state = TurnState::Idle;
        vec![Effect::CommitTurn { user, assistant }]
    }

    fn on_turn_failed(&mut self, turn_id: u64, error: SessionError) -> Vec<Effect> {
        if self.active_turn_id() != Some(turn_id) {
            return vec![];
        }
        self.active = None;
        self.state = TurnState::Idle;
        vec![
            Effect::CancelTurn { turn_id },
            self.flush_all(),
            Effect::Send(error.to_message()),
        ]
    }
}
