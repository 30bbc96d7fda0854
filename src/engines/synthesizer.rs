//! Speech synthesizer backends.
//!
//! Every backend yields its audio as a lazy, finite chunk stream over a
//! small bounded channel: the orchestrator pulls, and dropping the
//! receiver abandons the rest of the synthesis. Chunks are ~250 ms
//! (`rate / 4` samples) so a barge-in stops playback within one chunk's
//! latency.

use super::{SynthChunk, Synthesizer};
use crate::audio;
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::mpsc;

/// Chunk stream channel depth. Small on purpose: laziness comes from
/// backpressure, not buffering.
const CHUNK_CHANNEL_DEPTH: usize = 4;

/// Split a complete waveform into ~250 ms chunks and feed them through
/// a bounded channel.
fn stream_chunks(samples: Vec<f32>, sample_rate: u32) -> mpsc::Receiver<anyhow::Result<SynthChunk>> {
    let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
    tokio::spawn(async move {
        let chunk_len = (sample_rate as usize / 4).max(1);
        for piece in samples.chunks(chunk_len) {
            let chunk = SynthChunk {
                samples: piece.to_vec(),
                sample_rate,
            };
            if tx.send(Ok(chunk)).await.is_err() {
                // Receiver dropped: the turn was cancelled.
                return;
            }
        }
    });
    rx
}

/// Normalize a waveform so its peak sits at `target_peak`.
fn normalize_peak(samples: &mut [f32], target_peak: f32) {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > 0.0 {
        let gain = target_peak / peak;
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

// ── Tone backend ──────────────────────────────────────────────────

/// Offline synthesis: one short sine burst per word, pitch varying with
/// word length. Not speech, but deterministic, audible, and enough to
/// exercise the full playback path without a model.
pub struct ToneSynthesizer {
    sample_rate: u32,
}

impl ToneSynthesizer {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    fn render(&self, text: &str) -> Vec<f32> {
        let rate = self.sample_rate as f32;
        let burst_len = (rate * 0.12) as usize;
        let gap_len = (rate * 0.04) as usize;
        let mut samples = Vec::new();
        for word in text.split_whitespace() {
            let freq = 220.0 + 40.0 * (word.chars().count() % 8) as f32;
            for i in 0..burst_len {
                let t = i as f32 / rate;
                // Linear fade-out avoids clicks at burst edges.
                let envelope = 1.0 - i as f32 / burst_len as f32;
                samples.push((2.0 * std::f32::consts::PI * freq * t).sin() * envelope);
            }
            samples.extend(std::iter::repeat_n(0.0, gap_len));
        }
        if samples.is_empty() {
            samples.push(0.0);
        }
        normalize_peak(&mut samples, 0.3);
        samples
    }
}

#[async_trait]
impl Synthesizer for ToneSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
    ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<SynthChunk>>> {
        Ok(stream_chunks(self.render(text), self.sample_rate))
    }
}

// ── HTTP backend ──────────────────────────────────────────────────

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
}

/// Remote synthesizer: one POST per reply, response is
/// `{"sample_rate": n, "pcm16le": "<base64>"}`. The waveform is then
/// chunk-streamed locally so the consumer side looks identical to a
/// natively streaming backend.
pub struct HttpSynthesizer {
    url: String,
    fallback_rate: u32,
    client: reqwest::Client,
}

impl HttpSynthesizer {
    pub fn new(url: &str, fallback_rate: u32) -> Self {
        Self {
            url: url.to_string(),
            fallback_rate,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(
        &self,
        text: &str,
    ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<SynthChunk>>> {
        let response = self
            .client
            .post(&self.url)
            .json(&SynthesizeRequest { text })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("synthesizer returned HTTP {status}");
        }
        let value: serde_json::Value = response.json().await?;
        let sample_rate = value
            .get("sample_rate")
            .and_then(|r| r.as_u64())
            .map(|r| r as u32)
            .unwrap_or(self.fallback_rate);
        let b64 = value
            .get("pcm16le")
            .and_then(|p| p.as_str())
            .ok_or_else(|| anyhow::anyhow!("synthesizer response had no pcm16le field"))?;
        let pcm = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| anyhow::anyhow!("synthesizer audio was not valid base64: {e}"))?;
        let frame = audio::decode(&pcm, sample_rate, 0)
            .map_err(|e| anyhow::anyhow!("synthesizer audio was not valid PCM16: {e}"))?;
        Ok(stream_chunks(frame.samples, sample_rate))
    }
}

// ── Scripted backend ──────────────────────────────────────────────

/// Test/development backend: emits a fixed number of chunks per call,
/// or a scripted error.
pub struct ScriptedSynthesizer {
    sample_rate: u32,
    chunks_per_call: usize,
    failures: Mutex<VecDeque<String>>,
}

impl ScriptedSynthesizer {
    /// Emit `chunks_per_call` quarter-second silence chunks per reply.
    pub fn silence(chunks_per_call: usize, sample_rate: u32) -> Self {
        Self {
            sample_rate,
            chunks_per_call,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue a failure for the next `synthesize` call.
    pub fn fail_next(&self, message: &str) {
        self.failures.lock().push_back(message.to_string());
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        _text: &str,
    ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<SynthChunk>>> {
        if let Some(message) = self.failures.lock().pop_front() {
            anyhow::bail!("{message}");
        }
        let chunk_len = self.sample_rate as usize / 4;
        let samples = vec![0.0f32; chunk_len * self.chunks_per_call];
        Ok(stream_chunks(samples, self.sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut rx: mpsc::Receiver<anyhow::Result<SynthChunk>>) -> Vec<SynthChunk> {
        let mut out = Vec::new();
        while let Some(chunk) = rx.recv().await {
            out.push(chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn tone_output_is_chunked_and_normalized() {
        let synth = ToneSynthesizer::new(22_050);
        let rx = synth.synthesize("hello there friend").await.unwrap();
        let chunks = drain(rx).await;
        assert!(!chunks.is_empty());
        let peak = chunks
            .iter()
            .flat_map(|c| c.samples.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        assert!(peak <= 0.3 + 1e-4);
        assert!(peak > 0.2);
        // All but the last chunk are exactly a quarter second.
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.samples.len(), 22_050 / 4);
        }
    }

    #[tokio::test]
    async fn tone_is_deterministic() {
        let synth = ToneSynthesizer::new(16_000);
        let a = drain(synth.synthesize("same words").await.unwrap()).await;
        let b = drain(synth.synthesize("same words").await.unwrap()).await;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn tone_empty_text_yields_one_silent_chunk() {
        let synth = ToneSynthesizer::new(16_000);
        let chunks = drain(synth.synthesize("").await.unwrap()).await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].samples.iter().all(|s| *s == 0.0));
    }

    #[tokio::test]
    async fn scripted_emits_requested_chunk_count() {
        let synth = ScriptedSynthesizer::silence(3, 16_000);
        let chunks = drain(synth.synthesize("anything").await.unwrap()).await;
        assert_eq!(chunks.len(), 3);
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let synth = ScriptedSynthesizer::silence(2, 16_000);
        synth.fail_next("voice box exploded");
        assert!(synth.synthesize("a").await.is_err());
        assert!(synth.synthesize("b").await.is_ok());
    }

    #[tokio::test]
    async fn dropping_receiver_abandons_stream() {
        let synth = ToneSynthesizer::new(22_050);
        let rx = synth
            .synthesize("a very long sentence with many words to chunk up nicely")
            .await
            .unwrap();
        drop(rx);
        // Nothing to assert beyond "the spawned task exits"; give it a tick.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn http_synthesizer_decodes_response() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let pcm = audio::encode(&vec![0.25f32; 8_000]);
        let b64 = base64::engine::general_purpose::STANDARD.encode(&pcm);
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/speak"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"sample_rate": 16_000, "pcm16le": b64}),
            ))
            .mount(&server)
            .await;

        let synth = HttpSynthesizer::new(&format!("{}/speak", server.uri()), 22_050);
        let chunks = drain(synth.synthesize("hello").await.unwrap()).await;
        assert_eq!(chunks.len(), 2); // 8000 samples at 16 kHz = two 250 ms chunks
        assert_eq!(chunks[0].sample_rate, 16_000);
    }

    #[tokio::test]
    async fn http_synthesizer_surfaces_upstream_failure() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let synth = HttpSynthesizer::new(&server.uri(), 22_050);
        assert!(synth.synthesize("hello").await.is_err());
    }
}
