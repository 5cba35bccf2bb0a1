use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::chat::session::ChatSession;
use crate::config::Config;
use crate::state::AppState;
use crate::ws::ConnectionSender;

/// Ping schedule for a connection. A peer that misses a pong is dropped and
/// its session retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
        }
    }
}

impl KeepAlive {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval_secs.max(1)),
            pong_timeout: Duration::from_secs(config.pong_timeout_secs),
        }
    }
}

/// Run the actor-per-connection pattern for one chat client.
///
/// Splits the WebSocket into reader and writer halves:
/// - Writer task: owns the sink, forwards messages from an mpsc channel
/// - Reader loop: feeds text frames to the chat session
///
/// The mpsc sender is the session's outbound stream; the subscriber loop
/// reaches it through the session registry.
pub async fn run_connection(socket: WebSocket, state: AppState, username: String) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Spawn writer task first so admission notices reach the client
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    let mut session = ChatSession::new(username.clone(), tx.clone(), state.clone());
    if session.admit().await.is_err() {
        // The refusal notice and close frame are queued; let the writer flush them.
        drop(session);
        drop(tx);
        let _ = writer_handle.await;
        return;
    }

    tracing::info!(username = %username, "WebSocket actor started");

    let (pong_tx, pong_rx) = mpsc::unbounded_channel::<()>();
    let unresponsive = CancellationToken::new();
    let keepalive_handle = tokio::spawn(keep_alive(
        tx.clone(),
        pong_rx,
        state.keepalive,
        unresponsive.clone(),
    ));

    // Reader loop: runs until the client leaves, the connection breaks, the
    // peer stops answering pings, or the process shuts down
    loop {
        let next = tokio::select! {
            _ = state.shutdown.cancelled() => {
                tracing::info!(username = %username, "Shutdown signalled, closing session");
                break;
            }
            _ = unresponsive.cancelled() => {
                tracing::warn!(username = %username, "No pong from peer, dropping session");
                break;
            }
            next = ws_receiver.next() => next,
        };

        match next {
            Some(Ok(msg)) => match msg {
                Message::Text(text) => {
                    session.relay(text.as_str()).await;
                }
                Message::Binary(data) => {
                    tracing::debug!(
                        username = %username,
                        bytes = data.len(),
                        "Ignoring binary frame"
                    );
                }
                Message::Pong(_) => {
                    let _ = pong_tx.send(());
                }
                Message::Ping(data) => {
                    let _ = tx.send(Message::Pong(data));
                }
                Message::Close(frame) => {
                    tracing::info!(
                        username = %username,
                        reason = ?frame,
                        "Connection closed by user"
                    );
                    break;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(
                    username = %username,
                    error = %e,
                    "WebSocket receive error"
                );
                break;
            }
            None => {
                tracing::info!(username = %username, "WebSocket stream ended");
                break;
            }
        }
    }

    keepalive_handle.abort();

    // Queues the close frame, so the writer finishes on its own
    session.disconnect().await;
    drop(session);
    drop(tx);
    if timeout(Duration::from_secs(5), writer_handle).await.is_err() {
        tracing::debug!(username = %username, "Writer did not finish, abandoning it");
    }

    tracing::info!(username = %username, "WebSocket actor stopped");
}

/// Ping the peer on `schedule`. When a pong does not arrive in time, queue an
/// `AWAY` close frame and cancel `unresponsive` so the reader loop stops
/// waiting on a socket nobody answers.
async fn keep_alive(
    outbound: ConnectionSender,
    mut pongs: mpsc::UnboundedReceiver<()>,
    schedule: KeepAlive,
    unresponsive: CancellationToken,
) {
    let mut ticks = interval(schedule.ping_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticks.tick().await;

    loop {
        ticks.tick().await;

        // Pongs answering earlier pings do not count for this one.
        while pongs.try_recv().is_ok() {}

        if outbound.send(Message::Ping(b"keepalive".to_vec().into())).is_err() {
            return;
        }

        match timeout(schedule.pong_timeout, pongs.recv()).await {
            Ok(Some(())) => {}
            Ok(None) => return,
            Err(_) => {
                let _ = outbound.send(Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "pong timeout".into(),
                })));
                unresponsive.cancel();
                return;
            }
        }
    }
}

/// Writer task: receives messages from mpsc channel and forwards them to the
/// WebSocket sink. Stops after forwarding a close frame.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let is_close = matches!(msg, Message::Close(_));
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed, connection is broken
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = ws_sender.close().await;
}
