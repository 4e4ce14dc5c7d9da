//! Photon billing: eligibility, rate model and the external metering call.

mod ledger;
mod metering;

pub use ledger::{AbortHook, InvocationLedger, LedgerSummary, MeteringTask, UsageReporter};
pub use metering::{check_response_code, ConsumeRequest, HttpMeteringClient, MeteringClient};

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::audit::AuditLog;
use crate::caller::Caller;
use crate::config::BillingConfig;
use crate::events::EventSink;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("metering request timed out after {0}s")]
    Timeout(u64),
    #[error("metering request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("metering API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("metering API rejected charge (code {code}): {message}")]
    Rejected { code: Value, message: String },
    #[error("invalid metering response: {0}")]
    InvalidResponse(String),
}

/// Billing state of one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeStatus {
    Pending,
    SkipConfig,
    SkipWhitelist,
    MissingCredentials,
    Charged,
    ChargeError,
    NoBilling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeReason {
    /// Flat per-command fee
    Message,
    /// Token delta observed mid-stream
    Tokens,
    /// Reconciliation at process exit
    Final,
}

impl ChargeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ChargeReason::Message => "message",
            ChargeReason::Tokens => "tokens",
            ChargeReason::Final => "final",
        }
    }
}

/// Resolved metering credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key: String,
    pub client_name: String,
    pub sku_id: String,
}

/// Outcome of the per-invocation eligibility gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Billable(Credentials),
    Skipped(ChargeStatus),
}

/// Photons owed for a token delta: `ceil(tokens * photons_per_1k / 1000)`
pub fn compute_charge(tokens: u64, photons_per_1k: u64) -> u64 {
    tokens.saturating_mul(photons_per_1k).div_ceil(1000)
}

fn generate_biz_no() -> u64 {
    let suffix: u64 = rand::rng().random_range(1000..10000);
    let secs = Utc::now().timestamp().max(0) as u64;
    secs.saturating_mul(10_000).saturating_add(suffix)
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("***{}", tail)
}

/// Shared billing front: config, metering client and audit trail
#[derive(Clone)]
pub struct Biller {
    config: Arc<BillingConfig>,
    client: Arc<dyn MeteringClient>,
    audit: Option<AuditLog>,
}

impl Biller {
    pub fn new(config: BillingConfig, client: Arc<dyn MeteringClient>) -> Self {
        Self {
            config: Arc::new(config),
            client,
            audit: None,
        }
    }

    /// Biller backed by the HTTP metering API
    pub fn with_http(config: BillingConfig) -> Self {
        let client = Arc::new(HttpMeteringClient::new(config.endpoint.clone()));
        Self::new(config, client)
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Decide whether a caller's invocation is billed
    pub fn evaluate(&self, caller: &Caller) -> Eligibility {
        let config = &self.config;
        if !config.enabled {
            return Eligibility::Skipped(ChargeStatus::NoBilling);
        }
        if config.mock {
            return Eligibility::Skipped(ChargeStatus::SkipConfig);
        }

        let access_key = caller.access_key.clone().or_else(|| {
            if config.dev_mode {
                config.dev_access_key.clone()
            } else {
                None
            }
        });
        let client_name = caller
            .client_name
            .clone()
            .or_else(|| config.client_name.clone());
        let sku_id = config.effective_sku().map(str::to_string);

        let (Some(access_key), Some(client_name), Some(sku_id)) = (access_key, client_name, sku_id)
        else {
            return Eligibility::Skipped(ChargeStatus::MissingCredentials);
        };

        if config.whitelist_access_keys.iter().any(|k| *k == access_key)
            || config.whitelist_users.iter().any(|u| *u == caller.uid)
        {
            return Eligibility::Skipped(ChargeStatus::SkipWhitelist);
        }

        Eligibility::Billable(Credentials {
            access_key,
            client_name,
            sku_id,
        })
    }

    /// Submit one charge against the metering API, bounded by the request timeout
    pub async fn charge(
        &self,
        credentials: &Credentials,
        uid: &str,
        photons: u64,
        tokens_used: u64,
        reason: ChargeReason,
    ) -> Result<Value, BillingError> {
        let sku_id = credentials
            .sku_id
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(credentials.sku_id.clone()));
        let request = ConsumeRequest {
            biz_no: generate_biz_no(),
            change_type: 1,
            event_value: photons,
            sku_id,
            scene: self.config.scene.clone(),
        };

        info!(
            "Charging {} photons to {} ({} tokens, reason={})",
            photons,
            uid,
            tokens_used,
            reason.as_str()
        );
        let timeout_secs = self.config.request_timeout_secs;
        let result = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.client.consume(credentials, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BillingError::Timeout(timeout_secs)),
        };

        if let Some(audit) = &self.audit {
            let (event, detail) = match &result {
                Ok(_) => ("photon_charge", Value::Null),
                Err(e) => ("photon_charge_error", Value::String(e.to_string())),
            };
            audit
                .log_user_event(
                    uid,
                    event,
                    json!({
                        "photons": photons,
                        "tokensUsed": tokens_used,
                        "reason": reason.as_str(),
                        "bizNo": request.biz_no,
                        "error": detail,
                    }),
                )
                .await;
        }

        if let Err(e) = &result {
            error!("Photon charge failed for {}: {}", uid, e);
        }
        result
    }

    /// Start the ledger for one invocation
    pub fn open(&self, caller: &Caller, sink: Arc<dyn EventSink>) -> InvocationLedger {
        InvocationLedger::new(self.clone(), caller.uid.clone(), self.evaluate(caller), sink)
    }

    pub fn log_startup_summary(&self) {
        let config = &self.config;
        let masked: Vec<String> = config
            .whitelist_access_keys
            .iter()
            .map(|k| mask_key(k))
            .collect();
        let billing_active = config.enabled
            && !config.mock
            && config.effective_sku().is_some()
            && (config.client_name.is_some() || config.dev_mode);
        info!(
            "Photon billing: enabled={} mock={} dev_mode={} dev_access_key={} client_name={} sku_id={} whitelist={:?} whitelist_users={} fatal_on_error={} active={}",
            config.enabled,
            config.mock,
            config.dev_mode,
            config.dev_access_key.is_some(),
            config.client_name.is_some(),
            config.effective_sku().is_some(),
            masked,
            config.whitelist_users.len(),
            config.fatal_on_billing_error,
            billing_active
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn billing_config() -> BillingConfig {
        BillingConfig {
            client_name: Some("relay".into()),
            sku_id: Some("1001".into()),
            ..BillingConfig::default()
        }
    }

    fn caller(key: Option<&str>) -> Caller {
        Caller {
            uid: "alice".into(),
            access_key: key.map(str::to_string),
            client_name: None,
        }
    }

    struct Unused;

    #[async_trait::async_trait]
    impl MeteringClient for Unused {
        async fn consume(
            &self,
            _credentials: &Credentials,
            _request: &ConsumeRequest,
        ) -> Result<Value, BillingError> {
            Err(BillingError::InvalidResponse("unused".into()))
        }
    }

    fn biller(config: BillingConfig) -> Biller {
        Biller::new(config, Arc::new(Unused))
    }

    #[test]
    fn test_compute_charge() {
        assert_eq!(compute_charge(0, 1), 0);
        assert_eq!(compute_charge(1, 1), 1);
        assert_eq!(compute_charge(1000, 1), 1);
        assert_eq!(compute_charge(1001, 1), 2);
        assert_eq!(compute_charge(2500, 1), 3);
        assert_eq!(compute_charge(2500, 4), 10);
        assert_eq!(compute_charge(10, 0), 0);

        let mut previous = 0;
        for tokens in (0..20_000).step_by(7) {
            let charge = compute_charge(tokens, 3);
            assert!(charge >= previous);
            assert_eq!(charge, (tokens * 3 + 999) / 1000);
            previous = charge;
        }
    }

    #[test]
    fn test_eligibility_gate() {
        let b = biller(billing_config());
        assert!(matches!(b.evaluate(&caller(Some("k"))), Eligibility::Billable(_)));
        assert_eq!(
            b.evaluate(&caller(None)),
            Eligibility::Skipped(ChargeStatus::MissingCredentials)
        );

        let b = biller(BillingConfig { mock: true, ..billing_config() });
        assert_eq!(
            b.evaluate(&caller(Some("k"))),
            Eligibility::Skipped(ChargeStatus::SkipConfig)
        );

        let b = biller(BillingConfig { enabled: false, ..billing_config() });
        assert_eq!(
            b.evaluate(&caller(Some("k"))),
            Eligibility::Skipped(ChargeStatus::NoBilling)
        );

        let b = biller(BillingConfig {
            sku_id: Some(crate::config::PLACEHOLDER_SKU_ID.into()),
            ..billing_config()
        });
        assert_eq!(
            b.evaluate(&caller(Some("k"))),
            Eligibility::Skipped(ChargeStatus::MissingCredentials)
        );

        let b = biller(BillingConfig {
            whitelist_access_keys: vec!["k".into()],
            ..billing_config()
        });
        assert_eq!(
            b.evaluate(&caller(Some("k"))),
            Eligibility::Skipped(ChargeStatus::SkipWhitelist)
        );

        let b = biller(BillingConfig {
            whitelist_users: vec!["alice".into()],
            ..billing_config()
        });
        assert_eq!(
            b.evaluate(&caller(Some("other"))),
            Eligibility::Skipped(ChargeStatus::SkipWhitelist)
        );
    }

    #[test]
    fn test_dev_mode_access_key_fallback() {
        let b = biller(BillingConfig {
            dev_mode: true,
            dev_access_key: Some("dev-key".into()),
            ..billing_config()
        });
        match b.evaluate(&caller(None)) {
            Eligibility::Billable(creds) => {
                assert_eq!(creds.access_key, "dev-key");
                assert_eq!(creds.client_name, "relay");
                assert_eq!(creds.sku_id, "1001");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_biz_no_and_mask() {
        let biz = generate_biz_no();
        let suffix = biz % 10_000;
        assert!((1000..10000).contains(&suffix));
        assert!(biz / 10_000 > 1_600_000_000);
        assert_eq!(mask_key("abcdef123"), "***f123");
        assert_eq!(mask_key("ab"), "***ab");
    }
}
