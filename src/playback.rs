//! Outbound playback scheduler.
//!
//! Runs as one task per session, downstream of the orchestrator.
//! Chunks are released strictly in sequence order; out-of-order
//! arrivals are buffered, and a gap that outlives the bounded wait is a
//! protocol error for the current turn, never silently dropped. Pacing
//! is server-side: each send is timed so the client always holds about
//! one look-ahead of audio, which keeps playback gapless without
//! trusting wall-clock jitter and keeps `flush()` latency at one chunk.

use crate::audio;
use crate::gateway::events::ServerMessage;
use crate::session::{Outbound, PlayCmd, PlaybackChunk, PlaybackEvent, SessionEvent};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Ordered queue and clock for the one turn currently sounding.
struct TurnQueue {
    id: u64,
    next_seq: u64,
    pending: BTreeMap<u64, PlaybackChunk>,
    /// Scheduled end of the last chunk sent; the pacing reference.
    prev_end: Instant,
    sent_any: bool,
    /// Set once the orchestrator closed the turn's chunk stream.
    finished: bool,
    /// Armed when the next in-sequence chunk is missing but later ones
    /// are buffered.
    gap_deadline: Option<Instant>,
}

pub struct Scheduler {
    lookahead: Duration,
    gap_wait: Duration,
    outbound: mpsc::Sender<Outbound>,
    events: mpsc::Sender<SessionEvent>,
    /// Turns at or below this id are dead; their chunks are dropped on
    /// arrival. Advanced by every flush.
    barrier: u64,
    turn: Option<TurnQueue>,
}

impl Scheduler {
    pub fn new(
        lookahead: Duration,
        gap_wait: Duration,
        outbound: mpsc::Sender<Outbound>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            lookahead,
            gap_wait,
            outbound,
            events,
            barrier: 0,
            turn: None,
        }
    }

    /// Drain commands until the channel closes. Returns when the
    /// session is torn down or the socket writer is gone.
    pub async fn run(mut self, mut cmds: mpsc::Receiver<PlayCmd>) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = cmds.recv() => match cmd {
                    None => return,
                    Some(PlayCmd::Enqueue(chunk)) => self.enqueue(chunk),
                    Some(PlayCmd::EndOfTurn(id)) => {
                        match self.turn.as_mut() {
                            Some(turn) if turn.id == id => turn.finished = true,
                            Some(_) => {}
                            // A live turn that produced no audio at
                            // all still closes with an audio-end
                            // marker. Flushed turns are filtered by
                            // the barrier.
                            None if id > self.barrier => {
                                if self
                                    .outbound
                                    .send(Outbound::Control(ServerMessage::AssistantAudioEnd))
                                    .await
                                    .is_err()
                                {
                                    return;
                                }
                            }
                            None => {}
                        }
                        if self.finish_if_drained().await.is_err() {
                            return;
                        }
                    }
                    Some(PlayCmd::Flush(up_to)) => self.flush(up_to),
                },
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    if self.on_deadline().await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn enqueue(&mut self, chunk: PlaybackChunk) {
        if chunk.turn_id <= self.barrier {
            tracing::debug!(
                turn_id = chunk.turn_id,
                seq = chunk.seq,
                "dropping chunk from flushed turn"
            );
            return;
        }
        match self.turn.as_mut() {
            Some(turn) if turn.id == chunk.turn_id => {
                if chunk.seq < turn.next_seq || turn.pending.contains_key(&chunk.seq) {
                    tracing::warn!(
                        turn_id = chunk.turn_id,
                        seq = chunk.seq,
                        "duplicate playback chunk"
                    );
                    return;
                }
                turn.pending.insert(chunk.seq, chunk);
            }
            Some(turn) => {
                // A newer turn started without an explicit flush. The
                // old turn is dead either way.
                tracing::warn!(
                    old = turn.id,
                    new = chunk.turn_id,
                    "playback turn replaced without flush"
                );
                self.barrier = self.barrier.max(turn.id);
                self.start_turn(chunk);
            }
            None => self.start_turn(chunk),
        }
        self.arm_gap_timer();
    }

    fn start_turn(&mut self, chunk: PlaybackChunk) {
        let mut pending = BTreeMap::new();
        let id = chunk.turn_id;
        pending.insert(chunk.seq, chunk);
        self.turn = Some(TurnQueue {
            id,
            next_seq: 0,
            pending,
            prev_end: Instant::now(),
            sent_any: false,
            finished: false,
            gap_deadline: None,
        });
    }

    /// Discard everything and reset the clock to "now". The barrier
    /// advances to `up_to` unconditionally — a barge-in can land
    /// before the cancelled turn's first chunk does, and that chunk
    /// must still be dropped on sight.
    fn flush(&mut self, up_to: u64) {
        self.barrier = self.barrier.max(up_to);
        if let Some(turn) = self.turn.take() {
            self.barrier = self.barrier.max(turn.id);
            tracing::debug!(turn_id = turn.id, queued = turn.pending.len(), "playback flushed");
        }
    }

    fn arm_gap_timer(&mut self) {
        let gap_wait = self.gap_wait;
        if let Some(turn) = self.turn.as_mut() {
            if turn.pending.is_empty() || turn.pending.contains_key(&turn.next_seq) {
                turn.gap_deadline = None;
            } else if turn.gap_deadline.is_none() {
                turn.gap_deadline = Some(Instant::now() + gap_wait);
            }
        }
    }

    /// When this task next needs to wake without a command: either the
    /// send time of the next in-sequence chunk, or the gap deadline.
    fn next_deadline(&self) -> Option<Instant> {
        let turn = self.turn.as_ref()?;
        if turn.pending.contains_key(&turn.next_seq) {
            let due = if turn.sent_any {
                // Keep the client one look-ahead of audio in hand.
                turn.prev_end - self.lookahead
            } else {
                Instant::now()
            };
            return Some(due);
        }
        turn.gap_deadline
    }

    async fn on_deadline(&mut self) -> Result<(), ()> {
        let ready = self
            .turn
            .as_ref()
            .is_some_and(|t| t.pending.contains_key(&t.next_seq));
        if ready {
            self.send_next().await?;
            self.arm_gap_timer();
            return self.finish_if_drained().await;
        }
        self.declare_gap().await;
        Ok(())
    }

    async fn send_next(&mut self) -> Result<(), ()> {
        let lookahead = self.lookahead;
        let Some(turn) = self.turn.as_mut() else {
            return Ok(());
        };
        let Some(chunk) = turn.pending.remove(&turn.next_seq) else {
            return Ok(());
        };
        let now = Instant::now();
        // Playback start is the later of "now plus look-ahead" and the
        // previous chunk's scheduled end.
        let start = if turn.sent_any {
            turn.prev_end.max(now + lookahead)
        } else {
            now + lookahead
        };
        turn.prev_end = start + chunk.duration();
        turn.sent_any = true;
        turn.next_seq += 1;
        tracing::trace!(turn_id = turn.id, seq = chunk.seq, "sending playback chunk");
        self.outbound
            .send(Outbound::Audio(audio::encode(&chunk.samples)))
            .await
            .map_err(|_| ())
    }

    /// Emit `assistant_audio_end` once a finished turn has fully
    /// drained, and forget the turn.
    async fn finish_if_drained(&mut self) -> Result<(), ()> {
        let drained = self
            .turn
            .as_ref()
            .is_some_and(|t| t.finished && t.pending.is_empty());
        if !drained {
            return Ok(());
        }
        if let Some(turn) = self.turn.take() {
            tracing::debug!(turn_id = turn.id, "playback drained");
            self.barrier = self.barrier.max(turn.id);
        }
        self.outbound
            .send(Outbound::Control(ServerMessage::AssistantAudioEnd))
            .await
            .map_err(|_| ())
    }

    async fn declare_gap(&mut self) {
        let Some(turn) = self.turn.take() else {
            return;
        };
        let buffered = turn.pending.keys().next().copied().unwrap_or(turn.next_seq);
        tracing::warn!(
            turn_id = turn.id,
            expected = turn.next_seq,
            buffered,
            "playback sequence gap"
        );
        self.barrier = self.barrier.max(turn.id);
        let _ = self
            .events
            .send(SessionEvent::Playback(PlaybackEvent::Gap {
                turn_id: turn.id,
                expected: turn.next_seq,
                buffered,
            }))
            .await;
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
