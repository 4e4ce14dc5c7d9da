use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{BillingError, Credentials};

/// Body of a photon consumption request
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    /// Unique business number: unix seconds followed by a 4-digit random suffix
    pub biz_no: u64,
    pub change_type: u8,
    /// Photons to consume
    pub event_value: u64,
    pub sku_id: Value,
    pub scene: String,
}

/// External credit-consumption API
#[async_trait]
pub trait MeteringClient: Send + Sync {
    /// Submit one consumption request. Returns the response body on success.
    async fn consume(
        &self,
        credentials: &Credentials,
        request: &ConsumeRequest,
    ) -> Result<Value, BillingError>;
}

/// Metering client talking JSON over HTTPS
pub struct HttpMeteringClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpMeteringClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl MeteringClient for HttpMeteringClient {
    async fn consume(
        &self,
        credentials: &Credentials,
        request: &ConsumeRequest,
    ) -> Result<Value, BillingError> {
        debug!("POST {} bizNo={}", self.endpoint, request.biz_no);
        let response = self
            .http
            .post(&self.endpoint)
            .header("accessKey", &credentials.access_key)
            .header("x-app-key", &credentials.client_name)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(BillingError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| BillingError::InvalidResponse(format!("{}: {}", e, text)))?;
        check_response_code(body)
    }
}

/// A 200 response still fails unless its body carries `code == 0`
pub fn check_response_code(body: Value) -> Result<Value, BillingError> {
    match body.get("code").and_then(Value::as_i64) {
        Some(0) => Ok(body),
        _ => Err(BillingError::Rejected {
            code: body.get("code").cloned().unwrap_or(Value::Null),
            message: body
                .get("message")
                .or_else(|| body.get("msg"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        }),
    }
}
