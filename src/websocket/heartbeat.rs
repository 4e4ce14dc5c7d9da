//! Ping/pong liveness for relay connections.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Alive flag shared between the reader (marks pongs) and the heartbeat loop
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }
}

impl Liveness {
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Read and reset the flag; true if the client answered since the last check
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No pong between two consecutive ticks
    TimedOut,
    Cancelled,
}

/// Ping every `interval`; a client that has not answered since the previous
/// tick is declared dead.
pub async fn run_heartbeat(
    liveness: Arc<Liveness>,
    outbound: mpsc::UnboundedSender<Message>,
    interval: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !liveness.check_alive() {
                    debug!("Client missed heartbeat, terminating connection");
                    return HeartbeatResult::TimedOut;
                }
                if outbound.send(Message::Ping(Vec::new().into())).is_err() {
                    return HeartbeatResult::Cancelled;
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
