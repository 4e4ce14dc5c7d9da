/// WebSocket relay: two per-connection protocols chosen by path
/// - `/ws`: chat commands streamed from the Gemini CLI
/// - `/shell`: an interactive PTY confined to the shell root
///
/// Every connection gets a writer task fed by channels, and a heartbeat that
/// drops clients which stop answering pings.
pub mod chat;
pub mod heartbeat;
pub mod shell;
pub mod shell_guard;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::caller::Caller;
use crate::events::EventSink;
use crate::state::AppState;
use chat::ChatChannel;
use heartbeat::{run_heartbeat, HeartbeatResult, Liveness};
use shell::ShellChannel;

/// Per-connection protocol handler
#[async_trait]
pub trait Channel: Send {
    async fn on_text(&mut self, text: &str);

    async fn on_close(&mut self) {}
}

/// `GET /ws`
pub async fn chat_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let caller = Caller::from_headers(&headers, &state.config.identity);
    ws.on_upgrade(move |socket| async move {
        info!("Chat client connected ({})", caller.uid);
        let interval = state.config.server.heartbeat_interval();
        relay(socket, interval, |sink| ChatChannel::new(state, caller, sink)).await;
        info!("Chat client disconnected");
    })
}

/// `GET /shell`
pub async fn shell_upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let caller = Caller::from_headers(&headers, &state.config.identity);
    ws.on_upgrade(move |socket| async move {
        info!("Shell client connected ({})", caller.uid);
        let interval = state.config.server.heartbeat_interval();
        relay(socket, interval, |sink| ShellChannel::new(state, caller, sink)).await;
        info!("Shell client disconnected");
    })
}

/// Drive one connection: JSON events and control frames share a writer task,
/// inbound text goes to the channel until the client leaves or misses a ping.
async fn relay<C, F>(socket: WebSocket, heartbeat_interval: Duration, make_channel: F)
where
    C: Channel,
    F: FnOnce(Arc<dyn EventSink>) -> C,
{
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Value>();
    let cancel = CancellationToken::new();
    let liveness = Arc::new(Liveness::default());

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                Some(message) = control_rx.recv() => message,
                Some(event) = event_rx.recv() => Message::Text(event.to_string().into()),
                () = writer_cancel.cancelled() => break,
                else => break,
            };
            if ws_sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.send(Message::Close(None)).await;
    });

    let heartbeat_cancel = cancel.clone();
    let heartbeat_liveness = liveness.clone();
    let heartbeat = tokio::spawn(async move {
        let result = run_heartbeat(
            heartbeat_liveness,
            control_tx,
            heartbeat_interval,
            heartbeat_cancel.clone(),
        )
        .await;
        heartbeat_cancel.cancel();
        result
    });

    let sink: Arc<dyn EventSink> = Arc::new(event_tx);
    let mut channel = make_channel(sink);

    loop {
        tokio::select! {
            frame = ws_stream.next() => match frame {
                Some(Ok(Message::Text(text))) => channel.on_text(text.as_str()).await,
                Some(Ok(Message::Pong(_))) => liveness.mark_alive(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("WebSocket read error: {}", e);
                    break;
                }
            },
            () = cancel.cancelled() => break,
        }
    }

    cancel.cancel();
    channel.on_close().await;
    if let Ok(HeartbeatResult::TimedOut) = heartbeat.await {
        info!("Terminated unresponsive WebSocket client");
    }
    let _ = writer.await;
}
