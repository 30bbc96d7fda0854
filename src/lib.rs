//! voicegate: a real-time voice conversation gateway.
//!
//! Clients stream microphone PCM over one WebSocket and receive
//! synthesized speech back, with utterance delimiting, a transcript
//! driven turn state machine, and barge-in that cancels in-flight
//! synthesis and flushes playback mid-chunk.

pub mod audio;
pub mod config;
pub mod engines;
pub mod error;
pub mod gateway;
pub mod playback;
pub mod session;
