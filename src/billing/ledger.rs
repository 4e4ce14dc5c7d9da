use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{compute_charge, BillingError, Biller, ChargeReason, ChargeStatus, Eligibility};
use crate::events::{ChargeEventData, EventSink, PhotonCharge, ServerEvent};

/// Called when a charge failure must stop the running subprocess
pub type AbortHook = Arc<dyn Fn() + Send + Sync>;

/// Billing state carried across one invocation
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSummary {
    pub status: ChargeStatus,
    /// Highest running total reported by the CLI
    pub total_tokens: u64,
    /// Tokens covered by successful charges
    pub billed_tokens: u64,
    /// Tokens whose charge failed; never retried
    pub failed_tokens: u64,
    pub photons_charged: u64,
}

struct LedgerInner {
    biller: Biller,
    uid: String,
    eligibility: Eligibility,
    sink: Arc<dyn EventSink>,
    state: Mutex<LedgerSummary>,
    abort_hook: Mutex<Option<AbortHook>>,
}

/// Per-invocation ledger. Charges are serialized: at most one metering call
/// is in flight, later token totals coalesce until it returns.
#[derive(Clone)]
pub struct InvocationLedger {
    inner: Arc<LedgerInner>,
}

/// Feeds running token totals from the stdout reader into the ledger
pub struct UsageReporter {
    tx: watch::Sender<u64>,
}

/// Background charging task; `finish` runs the final reconciliation
pub struct MeteringTask {
    handle: JoinHandle<()>,
    ledger: InvocationLedger,
}

impl InvocationLedger {
    pub(super) fn new(
        biller: Biller,
        uid: String,
        eligibility: Eligibility,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let status = match &eligibility {
            Eligibility::Billable(_) => ChargeStatus::Pending,
            Eligibility::Skipped(status) => *status,
        };
        debug!("Billing status for {}: {:?}", uid, status);
        Self {
            inner: Arc::new(LedgerInner {
                biller,
                uid,
                eligibility,
                sink,
                state: Mutex::new(LedgerSummary {
                    status,
                    total_tokens: 0,
                    billed_tokens: 0,
                    failed_tokens: 0,
                    photons_charged: 0,
                }),
                abort_hook: Mutex::new(None),
            }),
        }
    }

    pub fn status(&self) -> ChargeStatus {
        self.inner.state.lock().status
    }

    pub fn is_billable(&self) -> bool {
        matches!(self.inner.eligibility, Eligibility::Billable(_))
    }

    pub fn summary(&self) -> LedgerSummary {
        self.inner.state.lock().clone()
    }

    /// Install the hook used when `fatal_on_billing_error` is set
    pub fn set_abort_hook(&self, hook: AbortHook) {
        *self.inner.abort_hook.lock() = Some(hook);
    }

    /// Charge the flat per-command fee. A failure here must prevent the spawn.
    pub async fn charge_message(&self) -> Result<(), BillingError> {
        let Eligibility::Billable(credentials) = &self.inner.eligibility else {
            return Ok(());
        };
        let photons = self.inner.biller.config().per_message_photons;
        if photons == 0 {
            return Ok(());
        }

        match self
            .inner
            .biller
            .charge(credentials, &self.inner.uid, photons, 0, ChargeReason::Message)
            .await
        {
            Ok(response) => {
                self.record_success(photons, 0, response, ChargeReason::Message);
                Ok(())
            }
            Err(e) => {
                self.record_failure(0, &e);
                Err(e)
            }
        }
    }

    /// Spawn the charging task and return the reporter that feeds it
    pub fn start_metering(&self) -> (UsageReporter, MeteringTask) {
        let (tx, rx) = watch::channel(0u64);
        let ledger = self.clone();
        let handle = tokio::spawn(run_metering(ledger.clone(), rx));
        (UsageReporter { tx }, MeteringTask { handle, ledger })
    }

    /// Bill whatever part of `total` has not been accounted for yet
    async fn settle(&self, total: u64, reason: ChargeReason) {
        let delta = {
            let mut state = self.inner.state.lock();
            state.total_tokens = state.total_tokens.max(total);
            state.total_tokens - (state.billed_tokens + state.failed_tokens)
        };
        if delta == 0 {
            return;
        }
        let Eligibility::Billable(credentials) = &self.inner.eligibility else {
            return;
        };

        let rate = self.inner.biller.config().photons_per_1k_tokens;
        let photons = compute_charge(delta, rate);
        if photons == 0 {
            self.inner.state.lock().billed_tokens += delta;
            return;
        }

        match self
            .inner
            .biller
            .charge(credentials, &self.inner.uid, photons, delta, reason)
            .await
        {
            Ok(response) => self.record_success(photons, delta, response, reason),
            Err(e) => {
                self.record_failure(delta, &e);
                if self.inner.biller.config().fatal_on_billing_error {
                    warn!("Billing failure is fatal, aborting invocation for {}", self.inner.uid);
                    let hook = self.inner.abort_hook.lock().clone();
                    if let Some(hook) = hook {
                        hook();
                    }
                }
            }
        }
    }

    fn record_success(
        &self,
        photons: u64,
        tokens: u64,
        response: serde_json::Value,
        reason: ChargeReason,
    ) {
        {
            let mut state = self.inner.state.lock();
            state.billed_tokens += tokens;
            state.photons_charged += photons;
            state.status = ChargeStatus::Charged;
        }
        self.inner.sink.send(ServerEvent::PhotonCharge(PhotonCharge::Charged {
            data: ChargeEventData {
                photons_charged: photons,
                tokens_used: tokens,
                price: self.inner.biller.config().photons_per_1k_tokens,
                charge_response: response,
                reason: reason.as_str().to_string(),
            },
        }));
    }

    fn record_failure(&self, tokens: u64, error: &BillingError) {
        {
            let mut state = self.inner.state.lock();
            state.failed_tokens += tokens;
            state.status = ChargeStatus::ChargeError;
        }
        self.inner.sink.send(ServerEvent::PhotonCharge(PhotonCharge::Failed {
            error: error.to_string(),
            tokens_used: tokens,
        }));
    }
}

async fn run_metering(ledger: InvocationLedger, mut rx: watch::Receiver<u64>) {
    while rx.changed().await.is_ok() {
        let total = *rx.borrow_and_update();
        // A closed reporter means the process has exited and this total is the last one
        let reason = if rx.has_changed().is_err() {
            ChargeReason::Final
        } else {
            ChargeReason::Tokens
        };
        ledger.settle(total, reason).await;
    }
    let total = *rx.borrow();
    ledger.settle(total, ChargeReason::Final).await;
}

impl UsageReporter {
    /// Record a running total; lower or repeated totals are ignored
    pub fn observe(&self, total_tokens: u64) {
        self.tx.send_if_modified(|current| {
            if total_tokens > *current {
                *current = total_tokens;
                true
            } else {
                false
            }
        });
    }
}

impl MeteringTask {
    /// Wait for in-flight charges and the final reconciliation.
    /// The reporter must have been dropped, otherwise this waits for it.
    pub async fn finish(self) -> LedgerSummary {
        if let Err(e) = self.handle.await {
            error!("Metering task failed: {}", e);
        }
        self.ledger.summary()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{ConsumeRequest, Credentials, MeteringClient};
    use crate::caller::Caller;
    use crate::config::BillingConfig;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Records requests; fails calls whose index is listed in `fail_on`
    #[derive(Default)]
    struct RecordingClient {
        requests: Mutex<Vec<ConsumeRequest>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_on: Vec<usize>,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MeteringClient for RecordingClient {
        async fn consume(
            &self,
            _credentials: &Credentials,
            request: &ConsumeRequest,
        ) -> Result<Value, BillingError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let index = {
                let mut requests = self.requests.lock();
                requests.push(request.clone());
                requests.len() - 1
            };
            if self.fail_on.contains(&index) {
                Err(BillingError::Rejected {
                    code: json!(500),
                    message: "denied".into(),
                })
            } else {
                Ok(json!({"code": 0}))
            }
        }
    }

    fn config() -> BillingConfig {
        BillingConfig {
            client_name: Some("relay".into()),
            sku_id: Some("7".into()),
            ..BillingConfig::default()
        }
    }

    fn caller() -> Caller {
        Caller {
            uid: "u1".into(),
            access_key: Some("ak".into()),
            client_name: None,
        }
    }

    fn setup(
        config: BillingConfig,
        client: Arc<RecordingClient>,
    ) -> (InvocationLedger, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let biller = Biller::new(config, client);
        (biller.open(&caller(), Arc::new(tx)), rx)
    }

    fn charge_events(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event["type"], "photon-charge");
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_message_fee_and_token_deltas() {
        let client = Arc::new(RecordingClient::default());
        let (ledger, mut rx) = setup(config(), client.clone());

        ledger.charge_message().await.unwrap();
        let (reporter, task) = ledger.start_metering();
        reporter.observe(1200);
        tokio::time::sleep(Duration::from_millis(20)).await;
        reporter.observe(1200);
        reporter.observe(900);
        reporter.observe(2500);
        drop(reporter);
        let summary = task.finish().await;

        assert_eq!(summary.status, ChargeStatus::Charged);
        assert_eq!(summary.total_tokens, 2500);
        assert_eq!(summary.billed_tokens, 2500);
        // 3 flat + ceil(1200/1000) + ceil(1300/1000)
        assert_eq!(summary.photons_charged, 3 + 2 + 2);

        let requests = client.requests.lock().clone();
        let total: u64 = requests.iter().map(|r| r.event_value).sum();
        assert_eq!(total, summary.photons_charged);
        assert_eq!(requests[0].event_value, 3);
        assert_eq!(requests[0].sku_id, json!(7));

        let events = charge_events(&mut rx);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["data"]["reason"], "message");
        assert_eq!(events[1]["data"]["tokensUsed"], 1200);
    }

    #[tokio::test]
    async fn test_charges_are_serialized() {
        let client = Arc::new(RecordingClient {
            delay: Duration::from_millis(30),
            ..RecordingClient::default()
        });
        let (ledger, _rx) = setup(config(), client.clone());
        let (reporter, task) = ledger.start_metering();
        for total in (500..=5000).step_by(500) {
            reporter.observe(total);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(reporter);
        let summary = task.finish().await;

        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(summary.billed_tokens, 5000);
        assert!(summary.billed_tokens <= summary.total_tokens);
    }

    #[tokio::test]
    async fn test_remainder_after_exit_is_final() {
        let client = Arc::new(RecordingClient {
            delay: Duration::from_millis(50),
            ..RecordingClient::default()
        });
        let (ledger, mut rx) = setup(config(), client.clone());
        let (reporter, task) = ledger.start_metering();
        reporter.observe(1000);
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Arrives while the first charge is still in flight
        reporter.observe(2500);
        drop(reporter);
        let summary = task.finish().await;

        assert_eq!(summary.billed_tokens, 2500);
        let events = charge_events(&mut rx);
        let reasons: Vec<&str> = events
            .iter()
            .map(|e| e["data"]["reason"].as_str().unwrap())
            .collect();
        assert_eq!(reasons, vec!["tokens", "final"]);
        assert_eq!(events[1]["data"]["tokensUsed"], 1500);
    }

    #[tokio::test]
    async fn test_failed_segment_not_retried() {
        let client = Arc::new(RecordingClient {
            fail_on: vec![0],
            ..RecordingClient::default()
        });
        let (ledger, mut rx) = setup(config(), client.clone());
        let (reporter, task) = ledger.start_metering();
        reporter.observe(1000);
        tokio::time::sleep(Duration::from_millis(20)).await;
        reporter.observe(3000);
        drop(reporter);
        let summary = task.finish().await;

        assert_eq!(summary.failed_tokens, 1000);
        assert_eq!(summary.billed_tokens, 2000);
        assert_eq!(summary.photons_charged, 2);
        assert_eq!(client.requests.lock().len(), 2);

        let events = charge_events(&mut rx);
        assert_eq!(events[0]["error"].as_str().map(|s| s.contains("denied")), Some(true));
        assert_eq!(events[0]["tokensUsed"], 1000);
    }

    #[tokio::test]
    async fn test_message_fee_failure_propagates() {
        let client = Arc::new(RecordingClient {
            fail_on: vec![0],
            ..RecordingClient::default()
        });
        let (ledger, mut rx) = setup(config(), client);
        assert!(ledger.charge_message().await.is_err());
        assert_eq!(ledger.status(), ChargeStatus::ChargeError);
        assert_eq!(charge_events(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_fatal_policy_invokes_hook() {
        let client = Arc::new(RecordingClient {
            fail_on: vec![0],
            ..RecordingClient::default()
        });
        let (ledger, _rx) = setup(
            BillingConfig {
                fatal_on_billing_error: true,
                ..config()
            },
            client,
        );
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        ledger.set_abort_hook(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (reporter, task) = ledger.start_metering();
        reporter.observe(10);
        drop(reporter);
        task.finish().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_skipped_ledger_is_inert() {
        let client = Arc::new(RecordingClient::default());
        let (ledger, mut rx) = setup(
            BillingConfig {
                sku_id: None,
                ..config()
            },
            client.clone(),
        );
        assert_eq!(ledger.status(), ChargeStatus::MissingCredentials);
        ledger.charge_message().await.unwrap();
        let (reporter, task) = ledger.start_metering();
        reporter.observe(4000);
        drop(reporter);
        let summary = task.finish().await;

        assert_eq!(summary.status, ChargeStatus::MissingCredentials);
        assert_eq!(summary.total_tokens, 4000);
        assert_eq!(summary.photons_charged, 0);
        assert!(client.requests.lock().is_empty());
        assert!(charge_events(&mut rx).is_empty());
    }
}
