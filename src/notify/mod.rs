pub mod slack;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

pub use self::slack::SlackTransport;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Error,
}

impl Severity {
    pub fn emoji(self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Success => "✅",
            Self::Error => "🚨",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub severity: Severity,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(severity: Severity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self { severity, title: title.into(), body: body.into() }
    }

    pub fn info(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Severity::Info, title, body)
    }

    pub fn success(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Severity::Success, title, body)
    }

    pub fn error(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Severity::Error, title, body)
    }

    /// Title prefixed with the severity tag, e.g. `🚨 Task Timeout`.
    pub fn headline(&self) -> String {
        format!("{} {}", self.severity.emoji(), self.title)
    }
}

/// Delivers a formatted notification to the operator channel.
///
/// Errors are reported as text; the `Notifier` inspects that text to detect
/// rate limiting.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send(&self, notification: &Notification) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// No credentials configured.
    Disabled,
    /// Dropped inside an active rate-limit backoff window.
    Suppressed,
    Failed,
}

impl SendOutcome {
    pub fn is_sent(self) -> bool {
        self == Self::Sent
    }
}

/// Rate-limit error tokens and the backoff each one triggers. Matching is
/// case-insensitive; the longest matching window wins.
const RATE_LIMIT_TOKENS: &[(&str, Duration)] = &[
    ("message_limit_exceeded", Duration::from_secs(5 * 60)),
    ("rate_limited", Duration::from_secs(60)),
    ("ratelimited", Duration::from_secs(60)),
    ("too_many_requests", Duration::from_secs(60)),
];

/// Backoff window for a failed send, or `None` if the failure is not a rate limit.
pub fn rate_limit_window(error: &str) -> Option<Duration> {
    let error = error.to_lowercase();
    RATE_LIMIT_TOKENS
        .iter()
        .filter(|(token, _)| error.contains(token))
        .map(|(_, window)| *window)
        .max()
}

/// Best-effort operator notifications with self-expiring rate-limit backoff.
///
/// Sending never returns an error. While a backoff window is open every
/// message is dropped; the window is checked lazily on the next send.
pub struct Notifier {
    transport: Option<Arc<dyn NotificationTransport>>,
    backoff_until: Mutex<Option<Instant>>,
}

impl Notifier {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self { transport: Some(transport), backoff_until: Mutex::new(None) }
    }

    pub fn disabled() -> Self {
        Self { transport: None, backoff_until: Mutex::new(None) }
    }

    /// Slack-backed notifier, or a disabled one when either credential is empty.
    pub fn from_slack(bot_token: &str, channel_id: &str) -> Self {
        if bot_token.is_empty() || channel_id.is_empty() {
            info!("Slack token or channel ID not configured; notifications disabled");
            return Self::disabled();
        }
        Self::new(Arc::new(SlackTransport::new(bot_token, channel_id)))
    }

    pub async fn is_rate_limited(&self) -> bool {
        let mut until = self.backoff_until.lock().await;
        expire(&mut until)
    }

    pub async fn send(&self, notification: Notification) -> SendOutcome {
        let Some(transport) = &self.transport else {
            return SendOutcome::Disabled;
        };

        if self.is_rate_limited().await {
            debug!(title = %notification.title, "Notification suppressed by rate-limit backoff");
            return SendOutcome::Suppressed;
        }

        match transport.send(&notification).await {
            Ok(()) => SendOutcome::Sent,
            Err(e) => {
                let message = format!("{e:#}");
                match rate_limit_window(&message) {
                    Some(window) => {
                        *self.backoff_until.lock().await = Some(Instant::now() + window);
                        warn!(
                            error = %message,
                            backoff_secs = window.as_secs(),
                            "Notification rate limit detected; suppressing messages"
                        );
                    }
                    None => warn!(error = %message, "Failed to send notification"),
                }
                SendOutcome::Failed
            }
        }
    }
}

/// `true` while the window is open; clears it once elapsed.
fn expire(until: &mut Option<Instant>) -> bool {
    match *until {
        Some(deadline) if Instant::now() < deadline => true,
        Some(_) => {
            *until = None;
            info!("Notification rate-limit backoff ended; messages resume");
            false
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingTransport;

    #[test]
    fn classifies_rate_limit_tokens() {
        let five = Some(Duration::from_secs(300));
        let one = Some(Duration::from_secs(60));

        assert_eq!(rate_limit_window("slack error: message_limit_exceeded"), five);
        assert_eq!(rate_limit_window("MESSAGE_LIMIT_EXCEEDED"), five);
        assert_eq!(rate_limit_window("rate_limited"), one);
        assert_eq!(rate_limit_window("Slack API error: ratelimited"), one);
        assert_eq!(rate_limit_window("Too_Many_Requests (HTTP 429)"), one);
        assert_eq!(rate_limit_window("rate_limited; message_limit_exceeded"), five);
        assert_eq!(rate_limit_window("channel_not_found"), None);
    }

    #[test]
    fn headline_carries_severity_tag() {
        assert_eq!(Notification::error("Task Timeout", "x").headline(), "🚨 Task Timeout");
        assert_eq!(Notification::success("Done", "x").headline(), "✅ Done");
        assert_eq!(Notification::info("Start", "x").headline(), "ℹ️ Start");
    }

    #[tokio::test]
    async fn disabled_notifier_is_a_silent_noop() {
        let notifier = Notifier::from_slack("", "C123");
        assert_eq!(notifier.send(Notification::info("a", "b")).await, SendOutcome::Disabled);
        assert!(!notifier.send(Notification::error("a", "b")).await.is_sent());
        assert!(!notifier.is_rate_limited().await);
    }

    #[tokio::test]
    async fn successful_send_reaches_transport() {
        let transport = RecordingTransport::default();
        let notifier = Notifier::new(Arc::new(transport.clone()));

        assert!(notifier.send(Notification::success("Done", "all good")).await.is_sent());
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, Severity::Success);
        assert_eq!(sent[0].body, "all good");
    }

    #[tokio::test]
    async fn other_failures_do_not_open_a_window() {
        let transport = RecordingTransport::default();
        transport.fail_next("channel_not_found");
        let notifier = Notifier::new(Arc::new(transport.clone()));

        assert_eq!(notifier.send(Notification::info("a", "b")).await, SendOutcome::Failed);
        assert!(!notifier.is_rate_limited().await);
        assert!(notifier.send(Notification::info("a", "b")).await.is_sent());
    }

    #[tokio::test(start_paused = true)]
    async fn strict_token_suppresses_for_five_minutes() {
        let transport = RecordingTransport::default();
        transport.fail_next("message_limit_exceeded");
        let notifier = Notifier::new(Arc::new(transport.clone()));

        assert_eq!(notifier.send(Notification::info("a", "b")).await, SendOutcome::Failed);
        assert!(notifier.is_rate_limited().await);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(notifier.send(Notification::info("c", "d")).await, SendOutcome::Suppressed);

        tokio::time::advance(Duration::from_secs(239)).await;
        assert_eq!(notifier.send(Notification::info("e", "f")).await, SendOutcome::Suppressed);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(notifier.send(Notification::info("g", "h")).await.is_sent());
        assert!(!notifier.is_rate_limited().await);

        // Only the first attempt and the post-window one reached the transport.
        assert_eq!(transport.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn generic_token_suppresses_for_one_minute() {
        let transport = RecordingTransport::default();
        transport.fail_next("Slack API error: rate_limited");
        let notifier = Notifier::new(Arc::new(transport.clone()));

        notifier.send(Notification::info("a", "b")).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(notifier.send(Notification::error("c", "d")).await, SendOutcome::Suppressed);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(notifier.send(Notification::error("e", "f")).await.is_sent());
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.sent()[0].title, "e");
    }
}
