use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::error;

/// Events sent from the server to chat and shell clients.
/// Serialized as tagged JSON with a "type" field, matching what the browser expects.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session-created")]
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    #[serde(rename = "gemini-error")]
    GeminiError { error: String },
    #[serde(rename = "gemini-complete")]
    GeminiComplete {
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        #[serde(rename = "isNewSession")]
        is_new_session: bool,
    },
    #[serde(rename = "photon-charge")]
    PhotonCharge(PhotonCharge),
    #[serde(rename = "session-aborted")]
    SessionAborted {
        #[serde(rename = "sessionId")]
        session_id: String,
        success: bool,
    },
    #[serde(rename = "error")]
    Error { error: String },
    #[serde(rename = "output")]
    Output { data: String },
    #[serde(rename = "url_open")]
    UrlOpen { url: String },
}

/// Outcome of one metering call as reported to the client
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PhotonCharge {
    Charged {
        data: ChargeEventData,
    },
    Failed {
        error: String,
        #[serde(rename = "tokensUsed")]
        tokens_used: u64,
    },
}

/// Payload of a successful photon charge
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeEventData {
    pub photons_charged: u64,
    pub tokens_used: u64,
    /// Photons per 1000 tokens
    pub price: u64,
    pub charge_response: Value,
    pub reason: String,
}

impl ServerEvent {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            error!("Failed to serialize server event: {}", e);
            Value::Null
        })
    }
}

/// Abstract output channel for one client connection.
/// Sends never fail: a closed channel silently drops the event.
pub trait EventSink: Send + Sync {
    /// Send a raw JSON payload (used for verbatim CLI responses)
    fn send_json(&self, payload: Value);

    fn send(&self, event: ServerEvent) {
        self.send_json(event.to_json());
    }
}

impl EventSink for mpsc::UnboundedSender<Value> {
    fn send_json(&self, payload: Value) {
        let _ = mpsc::UnboundedSender::send(self, payload);
    }
}

/// Sink that discards everything, for one-shot runs with no listener
pub struct NullSink;

impl EventSink for NullSink {
    fn send_json(&self, _payload: Value) {}
}
