//! Per-session event loop.
//!
//! Owns the machine, the ingest aggregator, the history window, and the
//! active turn's cancellation token. Every input — client control,
//! audio frame, transcript event, orchestrator report, playback fault,
//! silence timeout — lands here as one ordered event, so no two inputs
//! ever mutate session state concurrently.

use super::machine::{Effect, Input, TurnMachine};
use super::orchestrator::{self, TurnContext};
use super::{Outbound, PlayCmd, PlaybackEvent, SessionEvent, TurnEvent, TurnState};
use crate::audio::ingest::{EnergyVad, IngestAggregator, VadDecision};
use crate::config::Config;
use crate::engines::{Exchange, Generator, Recognizer, Synthesizer, TranscriptEvent};
use crate::error::SessionError;
use crate::gateway::events::ClientMessage;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct SessionRunner {
    id: Uuid,
    config: Arc<Config>,
    machine: TurnMachine,
    aggregator: IngestAggregator,
    recognizer: Arc<dyn Recognizer>,
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    history: Vec<Exchange>,
    /// Token of the one in-flight turn, if any.
    active: Option<(u64, CancellationToken)>,
    playback: mpsc::Sender<PlayCmd>,
    outbound: mpsc::Sender<Outbound>,
    /// Loopback for spawned orchestrator tasks.
    events_tx: mpsc::Sender<SessionEvent>,
    silence_deadline: Option<Instant>,
}

impl SessionRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: Uuid,
        config: Arc<Config>,
        recognizer: Arc<dyn Recognizer>,
        generator: Arc<dyn Generator>,
        synthesizer: Arc<dyn Synthesizer>,
        playback: mpsc::Sender<PlayCmd>,
        outbound: mpsc::Sender<Outbound>,
        events_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let vad = config
            .turn
            .vad_enabled
            .then(|| EnergyVad::new(config.turn.vad_threshold, config.turn.vad_hangover_frames));
        Self {
            id,
            machine: TurnMachine::new(config.audio.playback_rate),
            aggregator: IngestAggregator::new(config.audio.capture_rate, vad),
            config,
            recognizer,
            generator,
            synthesizer,
            history: Vec::new(),
            active: None,
            playback: playback.clone(),
            outbound,
            events_tx,
            silence_deadline: None,
        }
    }

    /// Run until the transport disconnects or the event channel closes.
    pub async fn run(mut self, mut events: mpsc::Receiver<SessionEvent>) {
        tracing::info!(session_id = %self.id, "session started");
        loop {
            let deadline = self.silence_deadline;
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if self.on_event(event).await.is_break() {
                        break;
                    }
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    tracing::debug!(session_id = %self.id, "silence timeout");
                    self.silence_deadline = None;
                    if self.apply(Input::SilenceTimeout).await.is_break() {
                        break;
                    }
                }
            }
        }
        // Teardown: nothing in flight survives the session.
        if let Some((turn_id, token)) = self.active.take() {
            tracing::debug!(session_id = %self.id, turn_id, "cancelling turn on teardown");
            token.cancel();
        }
        tracing::info!(session_id = %self.id, turns = self.history.len(), "session closed");
    }

    async fn on_event(&mut self, event: SessionEvent) -> ControlFlow<()> {
        match event {
            SessionEvent::Client(ClientMessage::Start) => self.apply(Input::StartOfSpeech).await,
            SessionEvent::Client(ClientMessage::Stop) => self.apply(Input::EndOfSpeech).await,
            SessionEvent::Client(ClientMessage::Reset) => self.apply(Input::Reset).await,
            SessionEvent::Frame(frame) => {
                // Streaming recognizers want frames live, not replayed
                // after finalize.
                if self.machine.state() == TurnState::Listening {
                    if let Err(err) = self.recognizer.feed(frame.clone()).await {
                        tracing::warn!(session_id = %self.id, error = %err, "recognizer feed failed");
                    }
                }
                match self.aggregator.push(frame) {
                    Some(VadDecision::SpeechStarted) => self.apply(Input::StartOfSpeech).await,
                    Some(VadDecision::SpeechEnded) => self.apply(Input::EndOfSpeech).await,
                    None => ControlFlow::Continue(()),
                }
            }
            SessionEvent::Transcript(TranscriptEvent::Partial { text }) => {
                self.apply(Input::TranscriptPartial(text)).await
            }
            SessionEvent::Transcript(TranscriptEvent::Final { text }) => {
                self.apply(Input::TranscriptFinal(text)).await
            }
            SessionEvent::Transcript(TranscriptEvent::Failed { message }) => {
                self.apply(Input::TranscriptFailed(message)).await
            }
            SessionEvent::Turn(TurnEvent::ReplyReady { turn_id, text }) => {
                self.apply(Input::ReplyReady { turn_id, text }).await
            }
            SessionEvent::Turn(TurnEvent::FirstChunk { turn_id }) => {
                self.apply(Input::FirstChunk { turn_id }).await
            }
            SessionEvent::Turn(TurnEvent::Completed {
                turn_id,
                user,
                assistant,
            }) => {
                self.apply(Input::TurnCompleted {
                    turn_id,
                    user,
                    assistant,
                })
                .await
            }
            SessionEvent::Turn(TurnEvent::Failed { turn_id, error }) => {
                self.fail(turn_id, error).await
            }
            SessionEvent::Playback(PlaybackEvent::Gap {
                turn_id,
                expected,
                buffered,
            }) => {
                self.fail(turn_id, SessionError::SequenceGap { expected, buffered })
                    .await
            }
            SessionEvent::Disconnected => ControlFlow::Break(()),
        }
    }

    /// Route one session error by blast radius: fatal errors end the
    /// session, everything else aborts only the turn it names.
    async fn fail(&mut self, turn_id: u64, error: SessionError) -> ControlFlow<()> {
        if error.is_fatal() {
            tracing::warn!(session_id = %self.id, turn_id, error = %error, "fatal session error");
            return ControlFlow::Break(());
        }
        self.apply(Input::TurnFailed { turn_id, error }).await
    }

    /// Feed one input through the machine and execute its effects.
    /// Effects may surface follow-up inputs (an empty utterance), which
    /// are processed before returning so the state stays consistent.
    async fn apply(&mut self, input: Input) -> ControlFlow<()> {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            for effect in self.machine.handle(input) {
                self.execute(effect, &mut queue).await?;
            }
        }
        ControlFlow::Continue(())
    }

    async fn execute(&mut self, effect: Effect, queue: &mut VecDeque<Input>) -> ControlFlow<()> {
        match effect {
            Effect::OpenUtterance => self.aggregator.open(),
            Effect::FinalizeUtterance => match self.aggregator.finalize() {
                Some(utterance) => {
                    tracing::debug!(
                        session_id = %self.id,
                        samples = utterance.sample_count(),
                        "utterance finalized"
                    );
                    if let Err(err) = self.recognizer.finalize(utterance).await {
                        queue.push_back(Input::TranscriptFailed(err.to_string()));
                    }
                }
                None => queue.push_back(Input::UtteranceEmpty),
            },
            Effect::AbandonUtterance => {
                self.aggregator.clear();
                self.recognizer.reset().await;
            }
            Effect::BeginTurn { turn_id, text } => {
                let token = CancellationToken::new();
                self.active = Some((turn_id, token.clone()));
                tracing::info!(session_id = %self.id, turn_id, "turn started");
                tokio::spawn(orchestrator::run_turn(TurnContext {
                    turn_id,
                    user_text: text,
                    history: self.history.clone(),
                    generator: Arc::clone(&self.generator),
                    synthesizer: Arc::clone(&self.synthesizer),
                    playback_rate: self.config.audio.playback_rate,
                    engine_timeout: self.config.turn.engine_timeout(),
                    cancel: token,
                    playback: self.playback.clone(),
                    events: self.events_tx.clone(),
                }));
            }
            Effect::CancelTurn { turn_id } => {
                if let Some((active_id, token)) = self.active.take() {
                    if active_id == turn_id {
                        tracing::info!(session_id = %self.id, turn_id, "turn cancelled");
                        token.cancel();
                    } else {
                        self.active = Some((active_id, token));
                    }
                }
            }
            Effect::FlushPlayback { up_to } => {
                let _ = self.playback.send(PlayCmd::Flush(up_to)).await;
            }
            Effect::CommitTurn { user, assistant } => {
                self.active = None;
                self.history.push(Exchange { user, assistant });
                let window = self.config.turn.max_history_turns;
                if self.history.len() > window {
                    let excess = self.history.len() - window;
                    self.history.drain(..excess);
                }
            }
            Effect::ClearHistory => self.history.clear(),
            Effect::Send(message) => {
                if self.outbound.send(Outbound::Control(message)).await.is_err() {
                    // The writer task is gone, so the socket is too.
                    let error = SessionError::TransportClosed;
                    tracing::info!(session_id = %self.id, error = %error, "ending session");
                    return ControlFlow::Break(());
                }
            }
            Effect::ArmSilenceTimer => {
                self.silence_deadline = Some(Instant::now() + self.config.turn.silence_timeout());
            }
            Effect::DisarmSilenceTimer => self.silence_deadline = None,
        }
        ControlFlow::Continue(())
    }
}

/// Forward recognizer events into the session's ordered event stream.
pub async fn forward_transcripts(
    mut transcripts: mpsc::Receiver<TranscriptEvent>,
    events: mpsc::Sender<SessionEvent>,
) {
    while let Some(event) = transcripts.recv().await {
        if events.send(SessionEvent::Transcript(event)).await.is_err() {
            return;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFrame;
    use crate::engines::generator::ScriptedGenerator;
    use crate::engines::recognizer::ScriptedRecognizer;
    use crate::engines::synthesizer::ScriptedSynthesizer;
    use crate::gateway::events::ServerMessage;
    use crate::playback::Scheduler;
    use std::time::Duration;

    /// A full session wired with scripted engines and a real playback
    /// scheduler, minus the socket.
    struct Harness {
        events: mpsc::Sender<SessionEvent>,
        out_rx: mpsc::Receiver<Outbound>,
        recognizer: Arc<ScriptedRecognizer>,
    }

    fn start_session(transcripts: Vec<String>, replies: Vec<String>, chunks: usize) -> Harness {
        start_session_with_synth(
            transcripts,
            replies,
            Arc::new(ScriptedSynthesizer::silence(chunks, 22_050)),
        )
    }

    fn start_session_with_synth(
        transcripts: Vec<String>,
        replies: Vec<String>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Harness {
        let mut config = Config::default();
        config.turn.playback_lookahead_ms = 10;
        let config = Arc::new(config);

        let (event_tx, event_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        let (play_tx, play_rx) = mpsc::channel(256);
        let (transcript_tx, transcript_rx) = mpsc::channel(64);

        let scheduler = Scheduler::new(
            config.turn.playback_lookahead(),
            config.turn.sequence_gap_wait(),
            out_tx.clone(),
            event_tx.clone(),
        );
        tokio::spawn(scheduler.run(play_rx));
        tokio::spawn(forward_transcripts(transcript_rx, event_tx.clone()));

        let recognizer = Arc::new(ScriptedRecognizer::new(transcripts, transcript_tx));
        let runner = SessionRunner::new(
            Uuid::new_v4(),
            config,
            recognizer.clone(),
            Arc::new(ScriptedGenerator::new(replies)),
            synthesizer,
            play_tx,
            out_tx,
            event_tx.clone(),
        );
        tokio::spawn(runner.run(event_rx));

        Harness {
            events: event_tx,
            out_rx,
            recognizer,
        }
    }

    fn frame(seq: u64) -> AudioFrame {
        AudioFrame {
            samples: vec![0.2; 1024],
            sample_rate: 16_000,
            seq,
        }
    }

    async fn speak(h: &Harness, frames: u64) {
        h.events
            .send(SessionEvent::Client(ClientMessage::Start))
            .await
            .unwrap();
        for seq in 0..frames {
            h.events
                .send(SessionEvent::Frame(frame(seq)))
                .await
                .unwrap();
        }
        h.events
            .send(SessionEvent::Client(ClientMessage::Stop))
            .await
            .unwrap();
    }

    async fn next_control(h: &mut Harness) -> ServerMessage {
        loop {
            match h.out_rx.recv().await.expect("outbound closed") {
                Outbound::Control(msg) => return msg,
                Outbound::Audio(_) => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_turn_streams_transcript_reply_and_audio() {
        // start, 50 frames, stop; "hello" -> "hi there", 3 chunks.
        let mut h = start_session(vec!["hello".into()], vec!["hi there".into()], 3);
        speak(&h, 50).await;

        let mut controls = Vec::new();
        let mut audio_frames = 0;
        loop {
            match h.out_rx.recv().await.unwrap() {
                Outbound::Control(msg) => {
                    let done = msg == ServerMessage::AssistantAudioEnd;
                    controls.push(msg);
                    if done {
                        break;
                    }
                }
                Outbound::Audio(_) => audio_frames += 1,
            }
        }

        // Exactly one final transcript and one assistant text, three
        // playback chunks, in order.
        assert_eq!(audio_frames, 3);
        let finals: Vec<_> = controls
            .iter()
            .filter(|m| matches!(m, ServerMessage::FinalTranscript { .. }))
            .collect();
        assert_eq!(finals.len(), 1);
        assert!(controls.contains(&ServerMessage::FinalTranscript {
            text: "hello".into()
        }));
        let texts: Vec<_> = controls
            .iter()
            .filter(|m| matches!(m, ServerMessage::AssistantText { .. }))
            .collect();
        assert_eq!(texts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_clears_queue_and_discards_remaining_chunks() {
        // Turn one synthesizes 3 chunks; barge in after the first.
        let mut h = start_session(
            vec!["first".into(), "second".into()],
            vec!["reply one".into(), "reply two".into()],
            3,
        );
        speak(&h, 10).await;

        // Wait for the first playback chunk of turn one.
        loop {
            if matches!(h.out_rx.recv().await.unwrap(), Outbound::Audio(_)) {
                break;
            }
        }
        h.events
            .send(SessionEvent::Client(ClientMessage::Start))
            .await
            .unwrap();

        assert_eq!(next_control(&mut h).await, ServerMessage::ClearAudioQueue);

        // No stale audio between the flush and the next turn's reply.
        let mut saw_stale_audio = false;
        let mut saw_second_final = false;
        h.events
            .send(SessionEvent::Frame(frame(100)))
            .await
            .unwrap();
        h.events
            .send(SessionEvent::Client(ClientMessage::Stop))
            .await
            .unwrap();
        loop {
            match h.out_rx.recv().await.unwrap() {
                Outbound::Control(ServerMessage::FinalTranscript { text }) => {
                    assert_eq!(text, "second");
                    saw_second_final = true;
                    break;
                }
                Outbound::Control(_) => {}
                Outbound::Audio(_) => saw_stale_audio = true,
            }
        }
        assert!(saw_second_final);
        assert!(!saw_stale_audio, "cancelled turn audio leaked past the flush");
    }

    #[tokio::test(start_paused = true)]
    async fn recognition_failure_notifies_and_recovers() {
        let mut h = start_session(vec!["second try".into()], vec!["ok".into()], 1);
        // The recognizer dies instead of delivering a transcript.
        h.recognizer.fail_next("upstream asr crashed");
        speak(&h, 5).await;

        match next_control(&mut h).await {
            ServerMessage::Error { code, message } => {
                assert_eq!(code, "recognition_failed");
                assert!(!message.contains("upstream"));
            }
            other => panic!("unexpected {other:?}"),
        }

        // Session is alive and ready for a new turn.
        speak(&h, 5).await;
        loop {
            if let ServerMessage::FinalTranscript { text } = next_control(&mut h).await {
                assert_eq!(text, "second try");
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_without_frames_short_circuits() {
        let mut h = start_session(vec!["never used".into()], vec!["never".into()], 1);
        h.events
            .send(SessionEvent::Client(ClientMessage::Start))
            .await
            .unwrap();
        h.events
            .send(SessionEvent::Client(ClientMessage::Stop))
            .await
            .unwrap();

        assert_eq!(
            next_control(&mut h).await,
            ServerMessage::FinalTranscript { text: "".into() }
        );
        // No assistant output follows an empty utterance.
        h.events
            .send(SessionEvent::Client(ClientMessage::Reset))
            .await
            .unwrap();
        assert_eq!(next_control(&mut h).await, ServerMessage::SessionReset);
    }

    #[tokio::test(start_paused = true)]
    async fn double_reset_acknowledges_twice_from_idle() {
        let mut h = start_session(vec![], vec![], 1);
        for _ in 0..2 {
            h.events
                .send(SessionEvent::Client(ClientMessage::Reset))
                .await
                .unwrap();
            assert_eq!(next_control(&mut h).await, ServerMessage::SessionReset);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silence_timeout_finalizes_the_utterance() {
        let mut h = start_session(vec!["timed out words".into()], vec!["ok".into()], 1);
        h.events
            .send(SessionEvent::Client(ClientMessage::Start))
            .await
            .unwrap();
        h.events.send(SessionEvent::Frame(frame(0))).await.unwrap();
        // No stop; the 10 s silence timeout fires under the paused
        // clock as soon as everything else is idle.
        loop {
            if let ServerMessage::FinalTranscript { text } = next_control(&mut h).await {
                assert_eq!(text, "timed out words");
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_tears_the_session_down() {
        let mut h = start_session(vec![], vec![], 1);
        h.events
            .send(SessionEvent::Turn(TurnEvent::Failed {
                turn_id: 1,
                error: SessionError::TransportClosed,
            }))
            .await
            .unwrap();
        // The runner exits and the outbound side closes with it.
        assert!(h.out_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sequence_gap_aborts_the_turn_with_a_notice() {
        /// Opens a chunk stream and never yields or closes it, keeping
        /// the turn in flight for as long as the test needs.
        struct StallingSynth {
            held: parking_lot::Mutex<Vec<mpsc::Sender<anyhow::Result<crate::engines::SynthChunk>>>>,
        }
        #[async_trait::async_trait]
        impl Synthesizer for StallingSynth {
            async fn synthesize(
                &self,
                _: &str,
            ) -> anyhow::Result<mpsc::Receiver<anyhow::Result<crate::engines::SynthChunk>>> {
                let (tx, rx) = mpsc::channel(1);
                self.held.lock().push(tx);
                Ok(rx)
            }
        }

        let mut h = start_session_with_synth(
            vec!["hello".into()],
            vec!["hi".into()],
            Arc::new(StallingSynth {
                held: parking_lot::Mutex::new(Vec::new()),
            }),
        );
        speak(&h, 5).await;
        loop {
            if matches!(
                next_control(&mut h).await,
                ServerMessage::AssistantText { .. }
            ) {
                break;
            }
        }
        // The scheduler reports a hole in the chunk stream of the
        // still-active turn.
        h.events
            .send(SessionEvent::Playback(PlaybackEvent::Gap {
                turn_id: 1,
                expected: 1,
                buffered: 3,
            }))
            .await
            .unwrap();
        loop {
            if let ServerMessage::Error { code, .. } = next_control(&mut h).await {
                assert_eq!(code, "sequence_gap");
                break;
            }
        }
    }
}
