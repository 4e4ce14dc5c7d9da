use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Channel;
use crate::caller::Caller;
use crate::events::{EventSink, ServerEvent};
use crate::gemini_spawner::CommandOptions;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
struct CommandRequest {
    #[serde(default)]
    command: String,
    #[serde(default)]
    options: CommandOptions,
}

#[derive(Debug, Deserialize)]
struct AbortRequest {
    #[serde(rename = "sessionId", default)]
    session_id: String,
}

/// Chat channel (`/ws`): runs CLI commands and aborts them
pub struct ChatChannel {
    state: AppState,
    caller: Caller,
    sink: Arc<dyn EventSink>,
}

impl ChatChannel {
    pub fn new(state: AppState, caller: Caller, sink: Arc<dyn EventSink>) -> Self {
        Self {
            state,
            caller,
            sink,
        }
    }

    fn error(&self, error: String) {
        self.sink.send(ServerEvent::Error { error });
    }

    /// Commands run in their own task so an abort on the same connection is
    /// handled while the CLI is still streaming.
    fn run_command(&self, request: CommandRequest) {
        let spawner = self.state.spawner.clone();
        let caller = self.caller.clone();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let result = spawner
                .spawn_invocation(&request.command, request.options, &caller, sink.clone())
                .await;
            if let Err(e) = result {
                warn!("Gemini command for {} failed: {}", caller.uid, e);
                sink.send(ServerEvent::Error {
                    error: e.to_string(),
                });
            }
        });
    }

    async fn abort(&self, request: AbortRequest) {
        let success = self.state.spawner.abort(&request.session_id);
        info!(
            "Abort requested for session {} by {}: {}",
            request.session_id, self.caller.uid, success
        );
        self.sink.send(ServerEvent::SessionAborted {
            session_id: request.session_id.clone(),
            success,
        });
        self.state
            .spawner
            .audit()
            .log_user_event(
                &self.caller.uid,
                "session_aborted",
                json!({ "sessionId": request.session_id, "success": success }),
            )
            .await;
    }
}

#[async_trait]
impl Channel for ChatChannel {
    async fn on_text(&mut self, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(payload) => payload,
            Err(e) => {
                self.error(e.to_string());
                return;
            }
        };

        match payload.get("type").and_then(Value::as_str) {
            Some("gemini-command") => match serde_json::from_value::<CommandRequest>(payload) {
                Ok(request) => self.run_command(request),
                Err(e) => self.error(e.to_string()),
            },
            Some("abort-session") => match serde_json::from_value::<AbortRequest>(payload) {
                Ok(request) => self.abort(request).await,
                Err(e) => self.error(e.to_string()),
            },
            other => debug!("Ignoring chat message of type {:?}", other),
        }
    }
}
