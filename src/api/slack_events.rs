//! Slack Events API endpoint: request signing and URL verification.

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, warn};

use super::{errors::AppError, AppState};

type HmacSha256 = Hmac<Sha256>;

/// Requests signed further than this from our clock are rejected as replays.
const MAX_SKEW_SECS: i64 = 5 * 60;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    challenge: Option<String>,
}

/// `v0=` + hex HMAC-SHA256 of `v0:<timestamp>:<body>`.
#[cfg(test)]
pub(crate) fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    format!("v0={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check the `X-Slack-Signature` header against `body` at time `now` (unix seconds).
pub fn verify_signature(headers: &HeaderMap, body: &[u8], secret: &str, now: i64) -> bool {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(timestamp), Some(signature)) =
        (header("x-slack-request-timestamp"), header("x-slack-signature"))
    else {
        return false;
    };

    match timestamp.parse::<i64>() {
        Ok(ts) if (now - ts).abs() <= MAX_SKEW_SECS => {}
        _ => return false,
    }

    let Some(hex_sig) = signature.strip_prefix("v0=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("v0:{timestamp}:").as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Receive a Slack Events API callback.
#[utoipa::path(
    post,
    path = "/slack/events",
    request_body(content = String, description = "Raw Slack event envelope", content_type = "application/json"),
    responses(
        (status = 200, description = "Challenge echoed or event acknowledged"),
        (status = 400, description = "Malformed JSON"),
        (status = 401, description = "Bad or missing signature"),
    ),
    tag = "slack"
)]
pub async fn slack_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    if state.verifies_slack_requests()
        && !verify_signature(&headers, &body, &state.signing_secret, Utc::now().timestamp())
    {
        warn!("Rejected Slack request with an invalid signature");
        return Err(AppError::Unauthorized("invalid signature".into()));
    }

    let envelope: Envelope = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("invalid JSON: {e}")))?;

    match (envelope.kind.as_str(), envelope.challenge) {
        ("url_verification", Some(challenge)) => Ok(Json(json!({ "challenge": challenge }))),
        (kind, _) => {
            debug!(event_type = %kind, "Slack event acknowledged");
            Ok(Json(json!({ "ok": true })))
        }
    }
}
