//! Response/synthesis orchestrator.
//!
//! One spawned task per turn: generate the reply, stream its synthesis,
//! resample and hand ordered chunks to the playback scheduler. The
//! turn's cancellation token is checked at every suspension point, so a
//! barge-in stops chunk production within one chunk's latency. A
//! cancelled task exits silently; only a live token may report
//! completion or failure.

use super::{PlayCmd, PlaybackChunk, SessionEvent, TurnEvent};
use crate::audio;
use crate::engines::{Exchange, Generator, Synthesizer};
use crate::error::SessionError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything a turn needs, captured at spawn time. History is a
/// snapshot: exchanges committed after this turn started do not leak
/// into its prompt.
pub struct TurnContext {
    pub turn_id: u64,
    pub user_text: String,
    pub history: Vec<Exchange>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub playback_rate: u32,
    pub engine_timeout: Duration,
    pub cancel: CancellationToken,
    pub playback: mpsc::Sender<PlayCmd>,
    pub events: mpsc::Sender<SessionEvent>,
}

/// Drive one turn to completion, cancellation, or failure.
pub async fn run_turn(ctx: TurnContext) {
    let turn_id = ctx.turn_id;
    match drive(&ctx).await {
        Ok(Outcome::Completed { assistant }) => {
            send_event(
                &ctx,
                TurnEvent::Completed {
                    turn_id,
                    user: ctx.user_text.clone(),
                    assistant,
                },
            )
            .await;
        }
        Ok(Outcome::Cancelled) => {
            tracing::debug!(turn_id, "turn cancelled mid-flight");
        }
        Err(error) => {
            send_event(&ctx, TurnEvent::Failed { turn_id, error }).await;
        }
    }
}

enum Outcome {
    Completed { assistant: String },
    Cancelled,
}

async fn drive(ctx: &TurnContext) -> Result<Outcome, SessionError> {
    let turn_id = ctx.turn_id;

    // 1. Generate the reply, bounded by the engine timeout.
    let reply = tokio::select! {
        _ = ctx.cancel.cancelled() => return Ok(Outcome::Cancelled),
        result = tokio::time::timeout(
            ctx.engine_timeout,
            ctx.generator.reply(&ctx.history, &ctx.user_text),
        ) => match result {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => {
                tracing::warn!(turn_id, error = %err, "generator failed");
                return Err(SessionError::GenerationFailed(err.to_string()));
            }
            Err(_) => {
                tracing::warn!(turn_id, "generator timed out");
                return Err(SessionError::GenerationFailed("timed out".into()));
            }
        },
    };

    if ctx.cancel.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    send_event(
        ctx,
        TurnEvent::ReplyReady {
            turn_id,
            text: reply.clone(),
        },
    )
    .await;

    // 2. Open the synthesis stream.
    let mut chunks = tokio::select! {
        _ = ctx.cancel.cancelled() => return Ok(Outcome::Cancelled),
        result = tokio::time::timeout(ctx.engine_timeout, ctx.synthesizer.synthesize(&reply)) => {
            match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::warn!(turn_id, error = %err, "synthesizer failed");
                    return Err(SessionError::SynthesisFailed(err.to_string()));
                }
                Err(_) => {
                    tracing::warn!(turn_id, "synthesizer timed out");
                    return Err(SessionError::SynthesisFailed("timed out".into()));
                }
            }
        },
    };

    // 3. Drain the chunk stream, resampling and re-sequencing.
    let mut seq = 0u64;
    loop {
        let next = tokio::select! {
            _ = ctx.cancel.cancelled() => return Ok(Outcome::Cancelled),
            next = tokio::time::timeout(ctx.engine_timeout, chunks.recv()) => match next {
                Ok(item) => item,
                Err(_) => {
                    tracing::warn!(turn_id, seq, "synthesis stream stalled");
                    return Err(SessionError::SynthesisFailed("stream stalled".into()));
                }
            },
        };
        let raw = match next {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                tracing::warn!(turn_id, seq, error = %err, "synthesis chunk failed");
                return Err(SessionError::SynthesisFailed(err.to_string()));
            }
            None => break,
        };

        let samples = audio::resample(&raw.samples, raw.sample_rate, ctx.playback_rate);
        let chunk = PlaybackChunk {
            turn_id,
            seq,
            samples,
            sample_rate: ctx.playback_rate,
        };
        // Token check directly before emission: output produced after
        // invalidation is discarded, not forwarded.
        if ctx.cancel.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }
        if ctx.playback.send(PlayCmd::Enqueue(chunk)).await.is_err() {
            return Ok(Outcome::Cancelled);
        }
        if seq == 0 {
            send_event(ctx, TurnEvent::FirstChunk { turn_id }).await;
        }
        seq += 1;
    }

    if ctx.cancel.is_cancelled() {
        return Ok(Outcome::Cancelled);
    }
    let _ = ctx.playback.send(PlayCmd::EndOfTurn(turn_id)).await;
    Ok(Outcome::Completed { assistant: reply })
}

async fn send_event(ctx: &TurnContext, event: TurnEvent) {
    // The session loop owning the receiver may already be gone on
    // disconnect; that is not this task's problem.
    let _ = ctx.events.send(SessionEvent::Turn(event)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engines::generator::ScriptedGenerator;
    use crate::engines::synthesizer::ScriptedSynthesizer;

    fn context(
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
        cancel: CancellationToken,
    ) -> (
        TurnContext,
        mpsc::Receiver<PlayCmd>,
        mpsc::Receiver<SessionEvent>,
    ) {
        let (play_tx, play_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        let ctx = TurnContext {
            turn_id: 7,
            user_text: "hello".into(),
            history: Vec::new(),
            generator,
            synthesizer,
            playback_rate: 22_050,
            engine_timeout: Duration::from_secs(5),
            cancel,
            playback: play_tx,
            events: event_tx,
        };
        (ctx, play_rx, event_rx)
    }

    async fn drain_events(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Turn(turn_event) = event {
                out.push(turn_event);
            }
        }
        out
    }

    #[tokio::test]
    async fn happy_path_emits_reply_chunks_and_completion() {
        let generator = Arc::new(ScriptedGenerator::new(vec!["hi there".into()]));
        let synthesizer = Arc::new(ScriptedSynthesizer::silence(3, 22_050));
        let (ctx, mut play_rx, mut event_rx) =
            context(generator, synthesizer, CancellationToken::new());

        run_turn(ctx).await;

        let mut chunk_seqs = Vec::new();
        let mut saw_end = false;
        while let Ok(cmd) = play_rx.try_recv() {
            match cmd {
                PlayCmd::Enqueue(chunk) => {
                    assert_eq!(chunk.turn_id, 7);
                    chunk_seqs.push(chunk.seq);
                }
                PlayCmd::EndOfTurn(id) => {
                    assert_eq!(id, 7);
                    saw_end = true;
                }
                PlayCmd::Flush(_) => panic!("unexpected flush"),
            }
        }
        assert_eq!(chunk_seqs, vec![0, 1, 2]);
        assert!(saw_end);

        let events = drain_events(&mut event_rx).await;
        assert!(matches!(
            &events[0],
            TurnEvent::ReplyReady { text, .. } if text == "hi there"
        ));
        assert!(matches!(&events[1], TurnEvent::FirstChunk { turn_id: 7 }));
        assert!(matches!(
            events.last().unwrap(),
            TurnEvent::Completed { user, assistant, .. }
                if user == "hello" && assistant == "hi there"
        ));
    }

    #[tokio::test]
    async fn pre_cancelled_turn_produces_nothing() {
        let generator = Arc::new(ScriptedGenerator::echo());
        let synthesizer = Arc::new(ScriptedSynthesizer::silence(3, 22_050));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (ctx, mut play_rx, mut event_rx) = context(generator, synthesizer, cancel);

        run_turn(ctx).await;

        assert!(play_rx.try_recv().is_err());
        assert!(drain_events(&mut event_rx).await.is_empty());
    }

    #[tokio::test]
    async fn cancellation_mid_stream_stops_chunk_production() {
        let generator = Arc::new(ScriptedGenerator::echo());
        let synthesizer = Arc::new(ScriptedSynthesizer::silence(50, 22_050));
        let cancel = CancellationToken::new();
        // Tiny channel so the orchestrator blocks on playback send.
        let (play_tx, mut play_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let ctx = TurnContext {
            turn_id: 3,
            user_text: "hello".into(),
            history: Vec::new(),
            generator,
            synthesizer,
            playback_rate: 22_050,
            engine_timeout: Duration::from_secs(5),
            cancel: cancel.clone(),
            playback: play_tx,
            events: event_tx,
        };

        let handle = tokio::spawn(run_turn(ctx));
        // Take one chunk, then barge in.
        let first = play_rx.recv().await.unwrap();
        assert!(matches!(first, PlayCmd::Enqueue(ref c) if c.seq == 0));
        cancel.cancel();
        handle.await.unwrap();

        // At most the chunk already in the channel; no EndOfTurn, no
        // Completed event.
        let mut trailing = 0;
        while let Ok(cmd) = play_rx.try_recv() {
            assert!(matches!(cmd, PlayCmd::Enqueue(_)));
            trailing += 1;
        }
        assert!(trailing <= 1);
        let events = drain_events(&mut event_rx).await;
        assert!(!events
            .iter()
            .any(|e| matches!(e, TurnEvent::Completed { .. })));
    }

    #[tokio::test]
    async fn generator_failure_reports_generation_failed() {
        let generator = Arc::new(ScriptedGenerator::failing("model melted"));
        let synthesizer = Arc::new(ScriptedSynthesizer::silence(3, 22_050));
        let (ctx, mut play_rx, mut event_rx) =
            context(generator, synthesizer, CancellationToken::new());

        run_turn(ctx).await;

        assert!(play_rx.try_recv().is_err());
        let events = drain_events(&mut event_rx).await;
        assert!(matches!(
            &events[0],
            TurnEvent::Failed { error, .. } if error.code() == "generation_failed"
        ));
    }

    #[tokio::test]
    async fn synthesizer_failure_reports_synthesis_failed() {
        let generator = Arc::new(ScriptedGenerator::echo());
        let synthesizer = Arc::new(ScriptedSynthesizer::silence(3, 22_050));
        synthesizer.fail_next("voice box exploded");
        let (ctx, _play_rx, mut event_rx) =
            context(generator, synthesizer, CancellationToken::new());

        run_turn(ctx).await;

        let events = drain_events(&mut event_rx).await;
        assert!(matches!(
            events.last().unwrap(),
            TurnEvent::Failed { error, .. } if error.code() == "synthesis_failed"
        ));
    }

    #[tokio::test]
    async fn generator_timeout_reports_generation_failed() {
        struct StallingGenerator;
        #[async_trait::async_trait]
        impl Generator for StallingGenerator {
            async fn reply(&self, _: &[Exchange], _: &str) -> anyhow::Result<String> {
                std::future::pending().await
            }
        }

        let synthesizer = Arc::new(ScriptedSynthesizer::silence(1, 22_050));
        let (mut ctx, _play_rx, mut event_rx) =
            context(Arc::new(StallingGenerator), synthesizer, CancellationToken::new());
        ctx.engine_timeout = Duration::from_millis(20);

        run_turn(ctx).await;

        let events = drain_events(&mut event_rx).await;
        assert!(matches!(
            &events[0],
            TurnEvent::Failed { error, .. } if error.code() == "generation_failed"
        ));
    }

    #[tokio::test]
    async fn chunks_are_resampled_to_playback_rate() {
        struct LowRateSynth;
        #[async_trait::async_trait]
        impl Synthesizer for LowRateSynth {
            async fn synthesize(
                &self,
                _: &str,
            ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<crate::engines::SynthChunk>>> {
                let (tx, rx) = mpsc::channel(4);
                tx.send(Ok(crate::engines::SynthChunk {
                    samples: vec![0.5; 4_000],
                    sample_rate: 16_000,
                }))
                .await
                .ok();
                Ok(rx)
            }
        }

        let generator = Arc::new(ScriptedGenerator::echo());
        let (ctx, mut play_rx, _event_rx) =
            context(generator, Arc::new(LowRateSynth), CancellationToken::new());

        run_turn(ctx).await;

        match play_rx.recv().await.unwrap() {
            PlayCmd::Enqueue(chunk) => {
                assert_eq!(chunk.sample_rate, 22_050);
                // 4000 samples upsampled from 16 kHz to 22.05 kHz.
                assert!((chunk.samples.len() as i64 - 5_512).abs() <= 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
