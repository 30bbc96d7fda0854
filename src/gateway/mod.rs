//! Axum HTTP gateway.
//!
//! Two routes: `GET /ws/audio` upgrades to one voice session, and
//! `GET /health` answers a JSON liveness probe. Each upgraded socket
//! gets its own engine backends, playback scheduler, and event loop;
//! sessions share nothing mutable.

pub mod events;

use crate::audio;
use crate::config::Config;
use crate::engines;
use crate::playback::Scheduler;
use crate::session::runner::{self, SessionRunner};
use crate::session::{Outbound, SessionEvent};
use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use events::ClientMessage;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use uuid::Uuid;

/// Maximum HTTP request body. The voice path is all WebSocket frames,
/// so plain requests never need more than this.
const MAX_BODY_SIZE: usize = 65_536;
/// Timeout for plain HTTP requests. Not applied to the WebSocket
/// route, whose connection outlives any sane request timeout.
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
}

pub fn router(config: Arc<Config>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let health = Router::new()
        .route("/health", get(handle_health))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)));

    Router::new()
        .route("/ws/audio", get(handle_voice_ws))
        .merge(health)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .with_state(AppState { config })
}

async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn handle_voice_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_voice_connection(socket, state.config))
}

/// Bind one socket to one session: engines, scheduler, writer, and the
/// serialized event loop. Returns when the client disconnects.
async fn handle_voice_connection(socket: WebSocket, config: Arc<Config>) {
    let session_id = Uuid::new_v4();
    tracing::info!(session_id = %session_id, "voice connection accepted");

    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);
    let (play_tx, play_rx) = mpsc::channel(64);
    let (transcript_tx, transcript_rx) = mpsc::channel(64);

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_outbound(ws_tx, out_rx));

    let recognizer =
        match engines::create_recognizer(&config.engines, &config.audio, transcript_tx).await {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(session_id = %session_id, error = %err, "recognizer setup failed");
                abort_with_notice(out_tx, writer).await;
                return;
            }
        };
    let (generator, synthesizer) = match (
        engines::create_generator(&config.engines),
        engines::create_synthesizer(&config.engines, &config.audio),
    ) {
        (Ok(g), Ok(s)) => (g, s),
        (g, s) => {
            let err = g.err().or(s.err()).map(|e| e.to_string()).unwrap_or_default();
            tracing::error!(session_id = %session_id, error = %err, "engine setup failed");
            abort_with_notice(out_tx, writer).await;
            return;
        }
    };

    let scheduler = Scheduler::new(
        config.turn.playback_lookahead(),
        config.turn.sequence_gap_wait(),
        out_tx.clone(),
        event_tx.clone(),
    );
    let playback_task = tokio::spawn(scheduler.run(play_rx));
    let forward_task = tokio::spawn(runner::forward_transcripts(transcript_rx, event_tx.clone()));

    let session = SessionRunner::new(
        session_id,
        Arc::clone(&config),
        recognizer,
        generator,
        synthesizer,
        play_tx,
        out_tx.clone(),
        event_tx.clone(),
    );
    let session_task = tokio::spawn(session.run(event_rx));

    // Drive the inbound side from this task until the socket closes.
    read_inbound(ws_rx, event_tx, out_tx, config.audio.capture_rate).await;

    // The Disconnected event tells the loop to cancel anything in
    // flight; wait for that, then stop the helpers.
    let _ = session_task.await;
    playback_task.abort();
    forward_task.abort();
    writer.abort();
    tracing::info!(session_id = %session_id, "voice connection closed");
}

/// Notice sent when a session's engine backends cannot be built. The
/// client sees that the service is down, never why.
fn setup_failure_notice() -> events::ServerMessage {
    events::ServerMessage::Error {
        code: "engine_setup_failed".into(),
        message: "The voice service is unavailable right now. Please try again later.".into(),
    }
}

/// Deliver the setup-failure notice, then let the writer drain and
/// close the socket.
async fn abort_with_notice(
    out_tx: mpsc::Sender<Outbound>,
    writer: tokio::task::JoinHandle<()>,
) {
    let _ = out_tx.send(Outbound::Control(setup_failure_notice())).await;
    drop(out_tx);
    let _ = writer.await;
}

/// Demultiplex inbound frames: binary PCM to the ingest path, JSON text
/// to the control path. A malformed frame is dropped with a notice; it
/// never kills the session.
async fn read_inbound(
    mut ws_rx: SplitStream<WebSocket>,
    events: mpsc::Sender<SessionEvent>,
    outbound: mpsc::Sender<Outbound>,
    capture_rate: u32,
) {
    let mut seq = 0u64;
    while let Some(Ok(message)) = ws_rx.next().await {
        match message {
            Message::Binary(bytes) => match audio::decode(&bytes, capture_rate, seq) {
                Ok(frame) => {
                    seq += 1;
                    if events.send(SessionEvent::Frame(frame)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "dropping malformed audio frame");
                    let _ = outbound.send(Outbound::Control(err.to_message())).await;
                }
            },
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(control) => {
                    if events.send(SessionEvent::Client(control)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring unreadable control message");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }
    let _ = events.send(SessionEvent::Disconnected).await;
}

/// The single socket writer. Everything outbound funnels through here,
/// so control messages and binary audio are never interleaved.
async fn write_outbound(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        let message = match item {
            Outbound::Control(control) => match serde_json::to_string(&control) {
                Ok(json) => Message::Text(json.into()),
                Err(err) => {
                    tracing::error!(error = %err, "unserializable control message");
                    continue;
                }
            },
            Outbound::Audio(bytes) => Message::Binary(bytes.into()),
        };
        if ws_tx.send(message).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_builds_with_default_config() {
        let _ = router(Arc::new(Config::default()));
    }

    #[tokio::test]
    async fn setup_failure_notice_reaches_the_writer() {
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let writer = tokio::spawn(async {});
        abort_with_notice(out_tx, writer).await;
        match out_rx.recv().await {
            Some(Outbound::Control(events::ServerMessage::Error { code, .. })) => {
                assert_eq!(code, "engine_setup_failed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = handle_health().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
