//! Payment sandbox provider client
//!
//! HTTP client for the external payment sandbox. Every call carries the
//! bearer API key. A capture that resolves "pending" will be followed by a
//! delayed `payment.settled` callback from the sandbox to the webhook
//! endpoint; the core treats that callback and its own scheduled job as two
//! independent idempotent producers.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Outcome the sandbox is asked to simulate; omitted in production traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedOutcome {
    Completed,
    Failed,
    Pending,
}

#[derive(Debug, Clone)]
pub struct CaptureParams {
    pub tenant_id: Uuid,
    pub payment_id: Uuid,
    pub ticket_id: Uuid,
    pub amount_cents: i64,
    pub tip_cents: i64,
    pub currency: String,
    pub method: String,
    pub outcome: Option<ForcedOutcome>,
}

#[derive(Debug, Clone)]
pub struct RefundParams {
    pub payment_id: Uuid,
    pub refund_id: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    pub reason: Option<String>,
    pub outcome: Option<ForcedOutcome>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureResponse {
    pub processor_payment_id: String,
    pub reference: String,
    #[serde(default)]
    pub receipt_url: Option<String>,
    pub status: String,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundResponse {
    pub processor_refund_id: String,
    pub status: String,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

#[derive(Serialize)]
struct CaptureBody<'a> {
    tenant_id: Uuid,
    payment_id: Uuid,
    ticket_id: Uuid,
    amount: i64,
    tip_amount: i64,
    currency: &'a str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<ForcedOutcome>,
}

#[derive(Serialize)]
struct RefundBody<'a> {
    refund_id: Uuid,
    amount: i64,
    currency: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<ForcedOutcome>,
}

#[derive(Clone)]
pub struct SandboxClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl SandboxClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BillingError::Provider(e.to_string()))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    pub async fn capture(&self, params: CaptureParams) -> BillingResult<CaptureResponse> {
        let body = CaptureBody {
            tenant_id: params.tenant_id,
            payment_id: params.payment_id,
            ticket_id: params.ticket_id,
            amount: params.amount_cents,
            tip_amount: params.tip_cents,
            currency: &params.currency,
            method: &params.method,
            outcome: params.outcome,
        };

        let resp = self
            .http
            .post(format!("{}/payments/capture", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Provider(e.to_string()))?;

        Self::parse_response(resp).await
    }

    pub async fn refund(&self, params: RefundParams) -> BillingResult<RefundResponse> {
        let body = RefundBody {
            refund_id: params.refund_id,
            amount: params.amount_cents,
            currency: &params.currency,
            reason: params.reason.as_deref(),
            outcome: params.outcome,
        };

        let resp = self
            .http
            .post(format!(
                "{}/payments/{}/refund",
                self.base_url, params.payment_id
            ))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| BillingError::Provider(e.to_string()))?;

        Self::parse_response(resp).await
    }

    pub async fn health(&self) -> BillingResult<bool> {
        let resp = self
            .http
            .get(format!("{}/healthz", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| BillingError::Provider(e.to_string()))?;

        Ok(resp.status().is_success())
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> BillingResult<T> {
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(BillingError::ProviderAuth);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BillingError::Provider(format!(
                "sandbox returned {status}: {body}"
            )));
        }

        resp.json::<T>()
            .await
            .map_err(|e| BillingError::Provider(format!("bad sandbox response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(outcome: Option<ForcedOutcome>) -> CaptureParams {
        CaptureParams {
            tenant_id: Uuid::new_v4(),
            payment_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            amount_cents: 4_250,
            tip_cents: 500,
            currency: "usd".to_string(),
            method: "card".to_string(),
            outcome,
        }
    }

    #[tokio::test]
    async fn capture_sends_bearer_key_and_parses_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments/capture")
            .match_header("authorization", "Bearer sk_test_123")
            .with_status(200)
            .with_body(
                r#"{
                    "processor_payment_id": "pp_9",
                    "reference": "ref_9",
                    "receipt_url": "https://sandbox/receipts/9",
                    "status": "completed",
                    "failure_reason": null
                }"#,
            )
            .create_async()
            .await;

        let client = SandboxClient::new(server.url(), "sk_test_123").unwrap();
        let resp = client.capture(params(None)).await.unwrap();

        assert_eq!(resp.status, "completed");
        assert_eq!(resp.processor_payment_id, "pp_9");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn capture_maps_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/payments/capture")
            .with_status(401)
            .create_async()
            .await;

        let client = SandboxClient::new(server.url(), "wrong").unwrap();
        let err = client.capture(params(None)).await.unwrap_err();
        assert!(matches!(err, BillingError::ProviderAuth));
    }

    #[tokio::test]
    async fn forced_outcome_is_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payments/capture")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"outcome": "pending"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(
                r#"{
                    "processor_payment_id": "pp_1",
                    "reference": "ref_1",
                    "status": "pending"
                }"#,
            )
            .create_async()
            .await;

        let client = SandboxClient::new(server.url(), "sk_test_123").unwrap();
        let resp = client
            .capture(params(Some(ForcedOutcome::Pending)))
            .await
            .unwrap();

        assert_eq!(resp.status, "pending");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn refund_posts_to_payment_scoped_path() {
        let mut server = mockito::Server::new_async().await;
        let payment_id = Uuid::new_v4();
        let mock = server
            .mock("POST", format!("/payments/{payment_id}/refund").as_str())
            .with_status(200)
            .with_body(r#"{"processor_refund_id": "rf_3", "status": "completed"}"#)
            .create_async()
            .await;

        let client = SandboxClient::new(server.url(), "sk_test_123").unwrap();
        let resp = client
            .refund(RefundParams {
                payment_id,
                refund_id: Uuid::new_v4(),
                amount_cents: 1_000,
                currency: "usd".to_string(),
                reason: Some("customer request".to_string()),
                outcome: None,
            })
            .await
            .unwrap();

        assert_eq!(resp.processor_refund_id, "rf_3");
        mock.assert_async().await;
    }
}
