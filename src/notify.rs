//! Optional chat-notification sink.
//!
//! Publication boundaries and operational errors are pushed to a Slack
//! channel when credentials are configured. The sink is write-only and
//! best-effort: every failure is logged and swallowed, never propagated
//! into the engine.

use std::env;
use std::sync::Arc;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::config::MirrorSettings;

const POST_MESSAGE_URL: &str = "https://slack.com/api/chat.postMessage";
const AUTH_TEST_URL: &str = "https://slack.com/api/auth.test";

#[derive(Debug, Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

struct SlackSink {
    client: Client,
    token: String,
    channel: String,
}

/// Cheap-clone notification handle. Disabled when no credentials are
/// configured, in which case every call is a no-op.
#[derive(Clone)]
pub struct Notifier {
    sink: Option<Arc<SlackSink>>,
}

impl Notifier {
    pub fn disabled() -> Self {
        Self { sink: None }
    }

    pub fn slack(token: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            sink: Some(Arc::new(SlackSink {
                client: Client::new(),
                token: token.into(),
                channel: channel.into(),
            })),
        }
    }

    /// Build from the configuration document, falling back to the
    /// `SLACK_TOKEN` / `SLACK_CHANNEL_ID` environment variables.
    pub fn from_settings(settings: &MirrorSettings) -> Self {
        let token = settings
            .slack_token
            .clone()
            .or_else(|| env::var("SLACK_TOKEN").ok())
            .filter(|t| !t.is_empty());
        let channel = settings
            .slack_channel_id
            .clone()
            .or_else(|| env::var("SLACK_CHANNEL_ID").ok())
            .filter(|c| !c.is_empty());

        match (token, channel) {
            (Some(token), Some(channel)) => Self::slack(token, channel),
            _ => Self::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    /// Post a message to the configured channel. Never fails.
    pub async fn notify(&self, text: &str) {
        let Some(sink) = &self.sink else { return };

        let body = json!({ "channel": sink.channel, "text": text });
        let sent = sink
            .client
            .post(POST_MESSAGE_URL)
            .bearer_auth(&sink.token)
            .json(&body)
            .send()
            .await;

        match sent {
            Ok(response) => match response.json::<SlackResponse>().await {
                Ok(reply) if reply.ok => {}
                Ok(reply) => warn!(
                    error = reply.error.as_deref().unwrap_or("unknown"),
                    "slack rejected notification"
                ),
                Err(err) => warn!(error = %err, "failed to decode slack response"),
            },
            Err(err) => warn!(error = %err, "failed to send slack notification"),
        }
    }

    /// Verify the configured token against `auth.test`.
    pub async fn auth_test(&self) -> bool {
        let Some(sink) = &self.sink else { return false };

        let sent = sink
            .client
            .post(AUTH_TEST_URL)
            .bearer_auth(&sink.token)
            .send()
            .await;

        match sent {
            Ok(response) => match response.json::<SlackResponse>().await {
                Ok(reply) if reply.ok => {
                    info!(
                        user_id = reply.user_id.as_deref().unwrap_or("unknown"),
                        "authenticated with slack"
                    );
                    true
                }
                Ok(reply) => {
                    warn!(
                        error = reply.error.as_deref().unwrap_or("unknown"),
                        "slack authentication failed"
                    );
                    false
                }
                Err(err) => {
                    warn!(error = %err, "failed to decode slack auth response");
                    false
                }
            },
            Err(err) => {
                warn!(error = %err, "failed to reach slack");
                false
            }
        }
    }
}
