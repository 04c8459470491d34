use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{Notification, NotificationTransport};

const SLACK_API_BASE: &str = "https://slack.com/api";

/// Posts notifications to a Slack channel via `chat.postMessage`.
#[derive(Debug, Clone)]
pub struct SlackTransport {
    http: Client,
    api_base: String,
    bot_token: String,
    channel_id: String,
}

/// Envelope returned by every Slack Web API method.
///
/// Slack answers `200 OK` even for failed calls; the outcome lives in `ok`
/// and the machine-readable reason in `error`.
#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    error: Option<String>,
}

impl SlackTransport {
    pub fn new(bot_token: &str, channel_id: &str) -> Self {
        Self::with_api_base(SLACK_API_BASE, bot_token, channel_id)
    }

    pub fn with_api_base(api_base: &str, bot_token: &str, channel_id: &str) -> Self {
        Self {
            http: Client::new(),
            api_base: api_base.trim_end_matches('/').to_owned(),
            bot_token: bot_token.to_owned(),
            channel_id: channel_id.to_owned(),
        }
    }
}

#[async_trait]
impl NotificationTransport for SlackTransport {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let url = format!("{}/chat.postMessage", self.api_base);
        let body = build_message(&self.channel_id, notification);
        debug!(channel = %self.channel_id, title = %notification.title, "Posting Slack message");

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .context("Slack chat.postMessage request failed")?;

        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            bail!("Slack API error: too_many_requests (HTTP 429)");
        }

        let resp = resp
            .error_for_status()
            .context("Slack chat.postMessage returned error status")?
            .json::<SlackResponse>()
            .await
            .context("Failed to deserialize Slack response")?;

        if !resp.ok {
            bail!(
                "Slack API error: {}",
                resp.error.as_deref().unwrap_or("(no error code)")
            );
        }
        Ok(())
    }
}

/// Block Kit payload: header with the severity tag, body section, timestamp context.
fn build_message(channel_id: &str, notification: &Notification) -> Value {
    let headline = notification.headline();
    let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    json!({
        "channel": channel_id,
        "text": format!("{headline}: {}", notification.body),
        "blocks": [
            {
                "type": "header",
                "text": { "type": "plain_text", "text": headline, "emoji": true }
            },
            {
                "type": "section",
                "text": { "type": "mrkdwn", "text": notification.body }
            },
            {
                "type": "context",
                "elements": [ { "type": "mrkdwn", "text": timestamp } ]
            }
        ]
    })
}
