use std::env;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{DeployerError, Result};

pub const ENV_DISCORD_WEBHOOK_URL: &str = "SIMPLE_CONTAINER_DISCORD_WEBHOOK_URL";
pub const ENV_SLACK_WEBHOOK_URL: &str = "SIMPLE_CONTAINER_SLACK_WEBHOOK_URL";
pub const ENV_TELEGRAM_BOT_TOKEN: &str = "SIMPLE_CONTAINER_TELEGRAM_BOT_TOKEN";
pub const ENV_TELEGRAM_CHAT_ID: &str = "SIMPLE_CONTAINER_TELEGRAM_CHAT_ID";
pub const ENV_ALERT_NAME: &str = "SIMPLE_CONTAINER_ALERT_NAME";
pub const ENV_ALERT_DESCRIPTION: &str = "SIMPLE_CONTAINER_ALERT_DESCRIPTION";

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Triggered,
    Resolved,
    BuildStarted,
    BuildSucceeded,
    BuildFailed,
    BuildCancelled,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Triggered => "TRIGGERED",
            AlertType::Resolved => "RESOLVED",
            AlertType::BuildStarted => "BUILD_STARTED",
            AlertType::BuildSucceeded => "BUILD_SUCCEEDED",
            AlertType::BuildFailed => "BUILD_FAILED",
            AlertType::BuildCancelled => "BUILD_CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub name: String,
    pub title: String,
    pub reason: String,
    pub description: String,
    pub stack_name: String,
    pub stack_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details_url: Option<String>,
    pub alert_type: AlertType,
}

impl Alert {
    /// Deploy lifecycle alert, overridable through the alert env vars.
    pub fn build_event(alert_type: AlertType, stack: &str, environment: &str, reason: &str) -> Self {
        let name = env::var(ENV_ALERT_NAME).unwrap_or_else(|_| format!("{stack}/{environment}"));
        let description = env::var(ENV_ALERT_DESCRIPTION).unwrap_or_else(|_| reason.to_string());
        Self {
            name,
            title: format!("{} {stack} ({environment})", alert_type.as_str()),
            reason: reason.to_string(),
            description,
            stack_name: stack.to_string(),
            stack_env: environment.to_string(),
            details_url: None,
            alert_type,
        }
    }

    fn render_text(&self) -> String {
        let mut text = format!("[{}] {}\n{}", self.alert_type.as_str(), self.title, self.description);
        if let Some(url) = &self.details_url {
            text.push('\n');
            text.push_str(url);
        }
        text
    }
}

#[async_trait]
pub trait AlertSender: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &Alert) -> Result<()>;
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(SEND_TIMEOUT)
        .build()
        .map_err(|err| DeployerError::Alert(err.to_string()))
}

/// Discord webhook sender.
pub struct DiscordSender {
    webhook_url: String,
}

#[async_trait]
impl AlertSender for DiscordSender {
    fn name(&self) -> &'static str {
        "discord"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = json!({
            "username": alert.name,
            "content": alert.render_text(),
        });
        post_json(&self.webhook_url, &body).await
    }
}

/// Slack webhook sender.
pub struct SlackSender {
    webhook_url: String,
}

#[async_trait]
impl AlertSender for SlackSender {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let body = json!({
            "text": alert.render_text(),
        });
        post_json(&self.webhook_url, &body).await
    }
}

/// Telegram bot sender.
pub struct TelegramSender {
    bot_token: String,
    chat_id: String,
}

#[async_trait]
impl AlertSender for TelegramSender {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": alert.render_text(),
        });
        post_json(&url, &body).await
    }
}

async fn post_json(url: &str, body: &serde_json::Value) -> Result<()> {
    let response = http_client()?
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|err| DeployerError::Alert(err.to_string()))?;
    if !response.status().is_success() {
        return Err(DeployerError::Alert(format!(
            "webhook responded with {}",
            response.status()
        )));
    }
    Ok(())
}

/// Senders configured through the environment; empty when no webhook is set.
pub fn senders_from_env() -> Vec<Box<dyn AlertSender>> {
    let mut senders: Vec<Box<dyn AlertSender>> = Vec::new();
    if let Ok(webhook_url) = env::var(ENV_DISCORD_WEBHOOK_URL) {
        senders.push(Box::new(DiscordSender { webhook_url }));
    }
    if let Ok(webhook_url) = env::var(ENV_SLACK_WEBHOOK_URL) {
        senders.push(Box::new(SlackSender { webhook_url }));
    }
    if let (Ok(bot_token), Ok(chat_id)) = (
        env::var(ENV_TELEGRAM_BOT_TOKEN),
        env::var(ENV_TELEGRAM_CHAT_ID),
    ) {
        senders.push(Box::new(TelegramSender { bot_token, chat_id }));
    }
    senders
}

/// Delivery failures are logged, never fatal.
pub async fn broadcast(senders: &[Box<dyn AlertSender>], alert: &Alert) {
    for sender in senders {
        match sender.send(alert).await {
            Ok(()) => debug!(sender = sender.name(), alert = %alert.title, "alert delivered"),
            Err(err) => warn!(sender = sender.name(), error = %err, "alert delivery failed"),
        }
    }
}
