//! Fire-and-forget trigger for the downstream fine-tuning service.

use reqwest::StatusCode;
use serde_json::json;
use tracing::{error, info};

/// POST `{"run_id": ...}` to `url`. Failures are logged, never returned.
pub fn queue_fine_tuning(url: &str, run_id: &str) {
    let client = reqwest::blocking::Client::new();
    let response = client.post(url).json(&json!({ "run_id": run_id })).send();

    match response {
        Ok(resp) => {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            if status == StatusCode::OK {
                info!(url, run_id, response = body.as_str(), "queued fine-tuning job");
            } else {
                error!(url, run_id, %status, response = body.as_str(), "failed to queue fine-tuning job");
            }
        }
        Err(e) => error!(url, run_id, error = %e, "error sending fine-tuning request"),
    }
}
