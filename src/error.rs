//! Session error taxonomy.
//!
//! Errors are split by blast radius:
//! - frame-level (`MalformedFrame`): drop the frame, session stays up
//! - turn-level (`RecognitionFailed` / `GenerationFailed` /
//!   `SynthesisFailed` / `SequenceGap`): abort the current turn, notify
//!   the client, return to idle
//! - session-level (`TransportClosed`): tear the session down
//!
//! Clients only ever see the short notice from [`SessionError::user_notice`];
//! internal detail stays in the logs.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Binary frame whose byte length is not a whole number of samples.
    #[error("malformed audio frame: {0}")]
    MalformedFrame(String),

    /// The speech recognizer reported a fatal error or timed out.
    #[error("recognition failed: {0}")]
    RecognitionFailed(String),

    /// The reply generator reported a fatal error or timed out.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// The speech synthesizer reported a fatal error or timed out.
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    /// A playback chunk gap persisted beyond the bounded reorder wait.
    #[error("playback sequence gap: expected seq {expected}, next buffered {buffered}")]
    SequenceGap { expected: u64, buffered: u64 },

    /// The WebSocket connection is gone. Terminal for the session.
    #[error("transport closed")]
    TransportClosed,
}

impl SessionError {
    /// Machine-readable code for the `error` control message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::RecognitionFailed(_) => "recognition_failed",
            Self::GenerationFailed(_) => "generation_failed",
            Self::SynthesisFailed(_) => "synthesis_failed",
            Self::SequenceGap { .. } => "sequence_gap",
            Self::TransportClosed => "transport_closed",
        }
    }

    /// Short user-visible notice. No internal detail crosses the boundary.
    pub fn user_notice(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "Received an unreadable audio frame.",
            Self::RecognitionFailed(_) => "Sorry, I couldn't hear that. Please try again.",
            Self::GenerationFailed(_) => "Sorry, I couldn't come up with a reply. Please try again.",
            Self::SynthesisFailed(_) => "Sorry, I lost my voice for a moment. Please try again.",
            Self::SequenceGap { .. } => "Playback got out of order; the reply was cut short.",
            Self::TransportClosed => "Connection closed.",
        }
    }

    /// Whether this error ends the session (vs. only the current turn).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_level_errors_are_not_fatal() {
        assert!(!SessionError::RecognitionFailed("boom".into()).is_fatal());
        assert!(!SessionError::GenerationFailed("boom".into()).is_fatal());
        assert!(!SessionError::SynthesisFailed("boom".into()).is_fatal());
        assert!(!SessionError::SequenceGap {
            expected: 2,
            buffered: 5
        }
        .is_fatal());
    }

    #[test]
    fn transport_closed_is_fatal() {
        assert!(SessionError::TransportClosed.is_fatal());
    }

    #[test]
    fn notices_carry_no_internal_detail() {
        let err = SessionError::GenerationFailed("http 500 from upstream at 10.0.0.3".into());
        assert!(!err.user_notice().contains("10.0.0.3"));
        assert!(!err.user_notice().contains("500"));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            SessionError::MalformedFrame("x".into()).code(),
            "malformed_frame"
        );
        assert_eq!(SessionError::TransportClosed.code(), "transport_closed");
    }
}
