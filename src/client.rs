use std::time::Duration;

use crate::error::{AttemptOutcome, HubError};

/// HTTP delivery client.
///
/// One instance is shared by every in-flight delivery; the underlying
/// connection pool is safe for concurrent use. Each attempt is a single
/// POST bounded by the configured timeout.
#[derive(Clone)]
pub struct DeliveryClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl DeliveryClient {
    pub fn new(timeout: Duration) -> Result<Self, HubError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| HubError::Http(err.to_string()))?;
        Ok(Self { http, timeout })
    }

    /// POST the payload to the target and classify what happened.
    ///
    /// This never returns an error: failures to reach the destination at
    /// all (refused connection, DNS, TLS, timeout) are retryable with
    /// `status = 0`.
    pub async fn post(&self, target_url: &str, payload_json: &str) -> AttemptOutcome {
        let response = self
            .http
            .post(target_url)
            .header("Content-Type", "application/json")
            .body(payload_json.to_string())
            .timeout(self.timeout)
            .send()
            .await;

        match response {
            Ok(resp) => classify_status(resp.status().as_u16()),
            Err(err) => {
                let message = if err.is_timeout() {
                    "timeout".to_string()
                } else {
                    format!("request failed: {err}")
                };
                AttemptOutcome::RetryableFailure { status: 0, message }
            }
        }
    }
}

fn classify_status(status: u16) -> AttemptOutcome {
    match status {
        200..=299 => AttemptOutcome::Success,
        429 | 500..=599 => AttemptOutcome::RetryableFailure {
            status,
            message: format!("destination answered {status}"),
        },
        _ => AttemptOutcome::NonRetryableFailure {
            status,
            message: format!("destination answered {status}"),
        },
    }
}
