//! HTTP client for the messaging provider's send endpoint.

use log::debug;
use serde_json::{json, Value};

use crate::config::THROUGHPUT_EXCEEDED_ERROR_CODE;
use crate::dispatch::{OutboundMessage, ProviderClient, SendOutcome};
use crate::error_handling::InitializationError;

/// Sends text messages through the provider's messages endpoint.
///
/// One request per recipient: `POST {base_url}/{sender_id}/messages` with a
/// bearer token. The response body is inspected for the provider message id
/// on success and for the throughput-limit error code on rejection.
pub struct HttpProviderClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    body: String,
}

impl HttpProviderClient {
    pub fn new(
        base_url: &str,
        sender_id: &str,
        token: impl Into<String>,
        body: impl Into<String>,
    ) -> Result<Self, InitializationError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| InitializationError::ProviderClientError(e.to_string()))?;
        Ok(HttpProviderClient {
            client,
            endpoint: format!("{}/{}/messages", base_url.trim_end_matches('/'), sender_id),
            token: token.into(),
            body: body.into(),
        })
    }

    fn classify_response(status: reqwest::StatusCode, payload: &Value) -> SendOutcome {
        if status.is_success() {
            if let Some(message_id) = payload
                .pointer("/messages/0/id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
            {
                return SendOutcome::Sent {
                    message_id: message_id.to_string(),
                };
            }
            return SendOutcome::Failed {
                reason: "provider response missing message id".to_string(),
            };
        }

        let code = payload.pointer("/error/code").and_then(Value::as_i64);
        if code == Some(THROUGHPUT_EXCEEDED_ERROR_CODE) {
            return SendOutcome::ThroughputExceeded;
        }
        let message = payload
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("unknown provider error");
        SendOutcome::Failed {
            reason: format!("{status}: {message}"),
        }
    }
}

impl ProviderClient for HttpProviderClient {
    async fn send(&self, message: OutboundMessage) -> SendOutcome {
        let request_body = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": message.phone,
            "type": "text",
            "text": { "body": self.body },
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&request_body)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                return SendOutcome::Failed {
                    reason: format!("transport error: {e}"),
                }
            }
        };

        let status = response.status();
        let payload: Value = match response.json().await {
            Ok(payload) => payload,
            Err(e) => {
                debug!("Unparseable provider response for contact {}: {e}", message.contact_id);
                Value::Null
            }
        };
        Self::classify_response(status, &payload)
    }
}
