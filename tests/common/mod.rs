#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc;

use gemini_relay::billing::{BillingError, Biller, ConsumeRequest, Credentials, MeteringClient};
use gemini_relay::caller::Caller;
use gemini_relay::config::ServerConfig;
use gemini_relay::events::EventSink;
use gemini_relay::state::AppState;

/// Metering client that records every request and can be told to reject them,
/// either all of them or only the requests at the indices in `fail_on`
#[derive(Default)]
pub struct RecordingClient {
    pub requests: Mutex<Vec<ConsumeRequest>>,
    pub fail: AtomicBool,
    pub fail_on: Mutex<Vec<usize>>,
}

impl RecordingClient {
    pub fn photons(&self) -> Vec<u64> {
        self.requests.lock().iter().map(|r| r.event_value).collect()
    }
}

#[async_trait]
impl MeteringClient for RecordingClient {
    async fn consume(
        &self,
        _credentials: &Credentials,
        request: &ConsumeRequest,
    ) -> Result<Value, BillingError> {
        let index = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() - 1
        };
        if self.fail.load(Ordering::SeqCst) || self.fail_on.lock().contains(&index) {
            return Err(BillingError::Rejected {
                code: json!(4001),
                message: "insufficient photons".into(),
            });
        }
        Ok(json!({ "code": 0, "data": { "bizNo": request.biz_no } }))
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub state: AppState,
    pub client: Arc<RecordingClient>,
}

impl Harness {
    pub fn project(&self) -> PathBuf {
        self.dir.path().join("project")
    }

    pub fn project_str(&self) -> String {
        self.project().display().to_string()
    }

    /// File the fake CLI writes its last prompt to
    pub fn last_prompt(&self) -> Option<String> {
        std::fs::read_to_string(self.dir.path().join("last_prompt")).ok()
    }

    pub fn last_args(&self) -> Vec<String> {
        std::fs::read_to_string(self.dir.path().join("last_args"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Build the app state around a fake CLI whose body is `script`.
/// The script records its argv and prompt next to itself before running `script`.
pub fn harness(script: &str, tweak: impl FnOnce(&mut ServerConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let root = dir.path();
    std::fs::create_dir_all(root.join("project")).unwrap();

    let binary = root.join("gemini-fake");
    let body = format!(
        "#!/bin/sh\nHERE=\"$(dirname \"$0\")\"\nprintf '%s\\n' \"$@\" > \"$HERE/last_args\"\nprintf '%s' \"$2\" > \"$HERE/last_prompt\"\n{}\n",
        script
    );
    write_executable(&binary, &body);

    let mut config = ServerConfig::default();
    config.server.port = 0;
    config.cli.binary = binary.display().to_string();
    config.cli.mcp_config_path = Some(root.join("no-mcp.json"));
    config.cli.abort_grace_ms = 500;
    config.storage.sessions_dir = root.join("sessions");
    config.paths.user_data_base = root.join("users");
    config.paths.shell_root = None;
    config.billing.enabled = true;
    config.billing.mock = false;
    config.billing.sku_id = Some("1001".into());
    config.billing.client_name = Some("relay-test".into());
    config.billing.per_message_photons = 3;
    config.billing.photons_per_1k_tokens = 1;
    config.billing.request_timeout_secs = 5;
    tweak(&mut config);

    let client = Arc::new(RecordingClient::default());
    let biller = Biller::new(config.billing.clone(), client.clone());
    let state = AppState::with_biller(config, biller);
    Harness { dir, state, client }
}

fn write_executable(path: &Path, body: &str) {
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

pub fn billed_caller() -> Caller {
    Caller {
        uid: "alice".into(),
        access_key: Some("ak-alice-1234".into()),
        client_name: None,
    }
}

pub fn event_sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(tx), rx)
}

pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn of_type<'a>(events: &'a [Value], kind: &str) -> Vec<&'a Value> {
    events.iter().filter(|e| e["type"] == kind).collect()
}
