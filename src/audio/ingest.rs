//! Utterance ingest: accumulates inbound frames between start-of-speech
//! and end-of-speech.
//!
//! Boundaries come either from explicit client control signals or, when
//! the energy VAD is enabled, from frame energy crossing a threshold.
//! Both policies surface as the same start/end decisions so the turn
//! state machine never learns which one fired.

use super::AudioFrame;

/// One continuous span of captured user speech. Finalized exactly once,
/// then consumed by the transcription adapter.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub frames: Vec<AudioFrame>,
    pub sample_rate: u32,
}

impl Utterance {
    /// Total sample count across all frames.
    pub fn sample_count(&self) -> usize {
        self.frames.iter().map(|f| f.samples.len()).sum()
    }

    /// Concatenate all frames into one contiguous buffer.
    pub fn merged_samples(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.sample_count());
        for frame in &self.frames {
            out.extend_from_slice(&frame.samples);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }
}

/// Boundary decision produced by the energy VAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    SpeechStarted,
    SpeechEnded,
}

/// Simple energy-threshold voice activity detector.
///
/// Declares speech started when a frame's RMS crosses the threshold,
/// and ended after `hangover_frames` consecutive sub-threshold frames.
#[derive(Debug)]
pub struct EnergyVad {
    threshold: f32,
    hangover_frames: u32,
    silent_run: u32,
}

impl EnergyVad {
    pub fn new(threshold: f32, hangover_frames: u32) -> Self {
        Self {
            threshold,
            hangover_frames,
            silent_run: 0,
        }
    }

    /// Judge one frame. `speaking` is whether an utterance is currently open.
    fn judge(&mut self, frame: &AudioFrame, speaking: bool) -> Option<VadDecision> {
        let loud = frame.rms() >= self.threshold;
        if !speaking {
            self.silent_run = 0;
            return loud.then_some(VadDecision::SpeechStarted);
        }
        if loud {
            self.silent_run = 0;
            return None;
        }
        self.silent_run += 1;
        (self.silent_run >= self.hangover_frames).then_some(VadDecision::SpeechEnded)
    }

    fn reset(&mut self) {
        self.silent_run = 0;
    }
}

/// Per-session utterance buffer. Single-writer, driven only from the
/// session event loop; at most one utterance is open at a time.
pub struct IngestAggregator {
    capture_rate: u32,
    buffer: Vec<AudioFrame>,
    open: bool,
    vad: Option<EnergyVad>,
}

impl IngestAggregator {
    pub fn new(capture_rate: u32, vad: Option<EnergyVad>) -> Self {
        Self {
            capture_rate,
            buffer: Vec::new(),
            open: false,
            vad,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Open a new utterance, discarding any stale buffered frames.
    pub fn open(&mut self) {
        self.buffer.clear();
        self.open = true;
        if let Some(vad) = &mut self.vad {
            vad.reset();
        }
    }

    /// Buffer one inbound frame. Frames arriving while no utterance is
    /// open are dropped (the client kept streaming after `stop`).
    ///
    /// Returns a boundary decision when the energy VAD fires.
    pub fn push(&mut self, frame: AudioFrame) -> Option<VadDecision> {
        let decision = self
            .vad
            .as_mut()
            .and_then(|vad| vad.judge(&frame, self.open));
        if self.open {
            self.buffer.push(frame);
        }
        decision
    }

    /// Close the open utterance and hand it off.
    ///
    /// A zero-length utterance is discarded silently and `None` is
    /// returned; it must not reach the recognizer.
    pub fn finalize(&mut self) -> Option<Utterance> {
        if !self.open {
            return None;
        }
        self.open = false;
        let frames = std::mem::take(&mut self.buffer);
        let utterance = Utterance {
            frames,
            sample_rate: self.capture_rate,
        };
        if utterance.is_empty() {
            tracing::debug!("discarding zero-length utterance");
            return None;
        }
        Some(utterance)
    }

    /// Drop everything, leaving the aggregator closed. Used on `reset`.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.open = false;
        if let Some(vad) = &mut self.vad {
            vad.reset();
        }
    }
}
