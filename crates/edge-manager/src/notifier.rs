//! Notification channels.
//!
//! Every channel implements [`Notifier`]. Channels are immutable once built
//! and are constructed from [`ChannelConfig`] by [`build_notifiers`].

use crate::types::{Alert, AlertLevel};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use common::{Component, Error, ErrorKind, Result};
use hmac::{Hmac, Mac};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A sink alerts are delivered to.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<()>;

    /// Channel name, used in logs and metric labels
    fn name(&self) -> &str;
}

/// Channel configuration, one entry per configured channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(flatten)]
    pub channel: ChannelConfig,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Console,
    Email(EmailConfig),
    Webhook(WebhookConfig),
    Slack(SlackConfig),
    #[serde(rename = "dingtalk")]
    DingTalk(DingTalkConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    pub to: Vec<String>,
    #[serde(default = "default_enabled")]
    pub tls: bool,
    /// Overrides the `[LEVEL] Alert: type` subject
    #[serde(default)]
    pub subject: Option<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_slack_username")]
    pub username: String,
    #[serde(default = "default_slack_icon")]
    pub icon_emoji: String,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_slack_username() -> String {
    "Edge Platform".to_string()
}

fn default_slack_icon() -> String {
    ":robot_face:".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DingTalkConfig {
    pub webhook_url: String,
    /// Request signing secret
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub at_mobiles: Vec<String>,
    #[serde(default)]
    pub at_all: bool,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// Build every enabled channel.
pub fn build_notifiers(channels: &[ChannelSettings]) -> Result<Vec<Arc<dyn Notifier>>> {
    channels
        .iter()
        .filter(|c| c.enabled)
        .map(|c| build_notifier(&c.channel))
        .collect()
}

pub fn build_notifier(config: &ChannelConfig) -> Result<Arc<dyn Notifier>> {
    let notifier: Arc<dyn Notifier> = match config {
        ChannelConfig::Console => Arc::new(ConsoleNotifier),
        ChannelConfig::Email(cfg) => Arc::new(EmailNotifier::new(cfg)?),
        ChannelConfig::Webhook(cfg) => Arc::new(WebhookNotifier::new(cfg)?),
        ChannelConfig::Slack(cfg) => Arc::new(ChatWebhookNotifier::slack(cfg)?),
        ChannelConfig::DingTalk(cfg) => Arc::new(ChatWebhookNotifier::dingtalk(cfg)?),
    };
    debug!(channel = notifier.name(), "Notification channel configured");
    Ok(notifier)
}

fn channel_config_error(channel: &'static str, msg: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::Config, Component::Notifier, channel, msg)
}

fn http_client(channel: &'static str, timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| channel_config_error(channel, &e).with_source(e))
}

fn level_upper(level: AlertLevel) -> String {
    level.as_str().to_uppercase()
}

/// Writes one line per alert to standard output.
pub struct ConsoleNotifier;

impl ConsoleNotifier {
    pub fn format(alert: &Alert) -> String {
        format!(
            "[ALERT] {} | {} | {} | {} | {}",
            alert.created_at.format("%Y-%m-%d %H:%M:%S"),
            level_upper(alert.level),
            alert.alert_type,
            alert.source,
            alert.message
        )
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        println!("{}", Self::format(alert));
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// SMTP email channel.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
    subject: Option<String>,
}

impl EmailNotifier {
    pub fn new(config: &EmailConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e: lettre::address::AddressError| channel_config_error("email", e))?;
        let to = config
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| channel_config_error("email", e))
            })
            .collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            return Err(channel_config_error("email", "at least one recipient is required"));
        }

        let mut builder = if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|e| channel_config_error("email", e))?
                .port(config.smtp_port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
                .port(config.smtp_port)
        };
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
            subject: config.subject.clone(),
        })
    }

    pub fn subject(&self, alert: &Alert) -> String {
        self.subject.clone().unwrap_or_else(|| {
            format!("[{}] Alert: {}", level_upper(alert.level), alert.alert_type)
        })
    }

    pub fn body(alert: &Alert) -> String {
        format!(
            "Alert Details:\n\n\
             Type: {}\nLevel: {}\nMessage: {}\nSource: {}\nTime: {}\n\n\
             Please check the system for more details.",
            alert.alert_type,
            alert.level,
            alert.message,
            alert.source,
            alert.created_at.to_rfc3339()
        )
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let mut builder = Message::builder().from(self.from.clone());
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        let email = builder
            .subject(self.subject(alert))
            .body(Self::body(alert))
            .map_err(|e| Error::notification("email", e))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| Error::notification("email", &e).with_source(e))?;

        info!(
            channel = "email",
            recipients = self.to.len(),
            alert_type = %alert.alert_type,
            "Alert delivered"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "email"
    }
}

/// Generic JSON webhook.
pub struct WebhookNotifier {
    url: String,
    method: reqwest::Method,
    headers: HashMap<String, String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let method = reqwest::Method::from_bytes(config.method.to_uppercase().as_bytes())
            .map_err(|_| {
                channel_config_error("webhook", format!("invalid HTTP method '{}'", config.method))
            })?;
        Ok(Self {
            url: config.url.clone(),
            method,
            headers: config.headers.clone(),
            client: http_client("webhook", config.timeout)?,
        })
    }

    pub fn payload(alert: &Alert) -> Value {
        json!({
            "alert_id": alert.id,
            "type": alert.alert_type,
            "level": alert.level,
            "message": alert.message,
            "source": alert.source,
            "status": alert.status.as_str(),
            "created_at": alert.created_at.to_rfc3339(),
            "timestamp": Utc::now().timestamp(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .json(&Self::payload(alert));
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::notification("webhook", &e).with_source(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::notification(
                "webhook",
                format!("webhook returned {}: {}", status, body),
            ));
        }

        info!(
            channel = "webhook",
            status = status.as_u16(),
            alert_type = %alert.alert_type,
            "Alert delivered"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Payload flavour of a chat webhook.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatFlavor {
    Slack {
        channel: Option<String>,
        username: String,
        icon_emoji: String,
    },
    DingTalk {
        secret: Option<String>,
        at_mobiles: Vec<String>,
        at_all: bool,
    },
}

/// Incoming-webhook of a chat service.
pub struct ChatWebhookNotifier {
    webhook_url: String,
    flavor: ChatFlavor,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DingTalkResponse {
    errcode: i64,
    #[serde(default)]
    errmsg: String,
}

impl ChatWebhookNotifier {
    pub fn slack(config: &SlackConfig) -> Result<Self> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            flavor: ChatFlavor::Slack {
                channel: config.channel.clone(),
                username: config.username.clone(),
                icon_emoji: config.icon_emoji.clone(),
            },
            client: http_client("slack", config.timeout)?,
        })
    }

    pub fn dingtalk(config: &DingTalkConfig) -> Result<Self> {
        Ok(Self {
            webhook_url: config.webhook_url.clone(),
            flavor: ChatFlavor::DingTalk {
                secret: config.secret.clone(),
                at_mobiles: config.at_mobiles.clone(),
                at_all: config.at_all,
            },
            client: http_client("dingtalk", config.timeout)?,
        })
    }

    pub fn payload(&self, alert: &Alert) -> Value {
        match &self.flavor {
            ChatFlavor::Slack {
                channel,
                username,
                icon_emoji,
            } => slack_payload(alert, channel.as_deref(), username, icon_emoji),
            ChatFlavor::DingTalk {
                at_mobiles, at_all, ..
            } => dingtalk_payload(alert, at_mobiles, *at_all),
        }
    }

    async fn send_slack(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&self.payload(alert))
            .send()
            .await
            .map_err(|e| Error::notification("slack", &e).with_source(e))?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::notification(
                "slack",
                format!("slack returned {}: {}", status, body),
            ));
        }
        Ok(())
    }

    async fn send_dingtalk(&self, alert: &Alert, secret: Option<&str>) -> Result<()> {
        let mut request = self.client.post(&self.webhook_url).json(&self.payload(alert));
        if let Some(secret) = secret {
            let timestamp = Utc::now().timestamp_millis();
            let sign = dingtalk_sign(secret, timestamp)?;
            request = request.query(&[("timestamp", timestamp.to_string()), ("sign", sign)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::notification("dingtalk", &e).with_source(e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::notification(
                "dingtalk",
                format!("dingtalk returned {}", status),
            ));
        }

        let answer: DingTalkResponse = response
            .json()
            .await
            .map_err(|e| Error::notification("dingtalk", &e).with_source(e))?;
        if answer.errcode != 0 {
            return Err(Error::notification(
                "dingtalk",
                format!("dingtalk error {}: {}", answer.errcode, answer.errmsg),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for ChatWebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        match &self.flavor {
            ChatFlavor::Slack { .. } => self.send_slack(alert).await?,
            ChatFlavor::DingTalk { secret, .. } => {
                self.send_dingtalk(alert, secret.as_deref()).await?
            }
        }
        info!(channel = self.name(), alert_type = %alert.alert_type, "Alert delivered");
        Ok(())
    }

    fn name(&self) -> &str {
        match self.flavor {
            ChatFlavor::Slack { .. } => "slack",
            ChatFlavor::DingTalk { .. } => "dingtalk",
        }
    }
}

fn slack_color(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Critical => "danger",
        AlertLevel::Warning => "warning",
        AlertLevel::Info => "good",
    }
}

pub fn slack_payload(
    alert: &Alert,
    channel: Option<&str>,
    username: &str,
    icon_emoji: &str,
) -> Value {
    let level = level_upper(alert.level);
    let time = alert.created_at.format("%Y-%m-%d %H:%M:%S").to_string();
    let mut payload = json!({
        "username": username,
        "icon_emoji": icon_emoji,
        "text": format!(":warning: *{} Alert*: {}", level, alert.alert_type),
        "attachments": [{
            "color": slack_color(alert.level),
            "title": format!("Alert: {}", alert.alert_type),
            "text": alert.message,
            "timestamp": alert.created_at.timestamp(),
            "fields": [
                { "title": "Level", "value": level, "short": true },
                { "title": "Source", "value": alert.source, "short": true },
                { "title": "Time", "value": time, "short": true },
            ],
        }],
    });
    if let Some(channel) = channel {
        payload["channel"] = json!(channel);
    }
    payload
}

fn dingtalk_emoji(level: AlertLevel) -> &'static str {
    match level {
        AlertLevel::Critical => "🚨",
        AlertLevel::Warning => "⚠️",
        AlertLevel::Info => "ℹ️",
    }
}

pub fn dingtalk_payload(alert: &Alert, at_mobiles: &[String], at_all: bool) -> Value {
    let level = level_upper(alert.level);
    let text = format!(
        "## {} {} Alert\n\n**Type:** {}\n\n**Level:** {}\n\n**Message:** {}\n\n\
         **Source:** {}\n\n**Time:** {}\n\n---\n\n> Please check the system for more details.",
        dingtalk_emoji(alert.level),
        level,
        alert.alert_type,
        level,
        alert.message,
        alert.source,
        alert.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    let mut payload = json!({
        "msgtype": "markdown",
        "markdown": {
            "title": format!("Alert: {}", alert.alert_type),
            "text": text,
        },
    });
    if !at_mobiles.is_empty() || at_all {
        payload["at"] = json!({ "atMobiles": at_mobiles, "isAtAll": at_all });
    }
    payload
}

/// HMAC-SHA256 over `"{timestamp_ms}\n{secret}"`, keyed by the secret,
/// base64 encoded.
pub fn dingtalk_sign(secret: &str, timestamp_ms: i64) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::notification("dingtalk", e))?;
    mac.update(format!("{}\n{}", timestamp_ms, secret).as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alert(level: AlertLevel) -> Alert {
        let mut a = Alert::new(
            "high_cpu_usage",
            level,
            "system_monitor",
            "CPU usage is 91.00%, exceeding threshold 80.00%",
        );
        a.created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        a
    }

    #[test]
    fn test_console_format() {
        assert_eq!(
            ConsoleNotifier::format(&alert(AlertLevel::Warning)),
            "[ALERT] 2024-05-01 12:30:00 | WARNING | high_cpu_usage | system_monitor | \
             CPU usage is 91.00%, exceeding threshold 80.00%"
        );
    }

    #[test]
    fn test_email_subject_and_body() {
        let notifier = EmailNotifier::new(&EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 587,
            username: None,
            password: None,
            from: "alerts@example.com".into(),
            to: vec!["ops@example.com".into()],
            tls: false,
            subject: None,
        })
        .unwrap();
        let a = alert(AlertLevel::Critical);
        assert_eq!(notifier.subject(&a), "[CRITICAL] Alert: high_cpu_usage");
        let body = EmailNotifier::body(&a);
        assert!(body.starts_with("Alert Details:\n\nType: high_cpu_usage\nLevel: critical\n"));
        assert!(body.contains("Time: 2024-05-01T12:30:00+00:00"));
    }

    #[test]
    fn test_email_requires_recipients() {
        let err = EmailNotifier::new(&EmailConfig {
            smtp_host: "smtp.example.com".into(),
            smtp_port: 25,
            username: None,
            password: None,
            from: "alerts@example.com".into(),
            to: vec![],
            tls: false,
            subject: None,
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_webhook_payload_fields() {
        let mut a = alert(AlertLevel::Warning);
        a.id = Some(12);
        let payload = WebhookNotifier::payload(&a);
        assert_eq!(payload["alert_id"], 12);
        assert_eq!(payload["type"], "high_cpu_usage");
        assert_eq!(payload["level"], "warning");
        assert_eq!(payload["status"], "active");
        assert_eq!(payload["created_at"], "2024-05-01T12:30:00+00:00");
    }

    #[test]
    fn test_webhook_rejects_bad_method() {
        let err = WebhookNotifier::new(&WebhookConfig {
            url: "http://localhost/hook".into(),
            method: "NOT A METHOD".into(),
            headers: HashMap::new(),
            timeout: Duration::from_secs(1),
        })
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_slack_payload() {
        let payload = slack_payload(
            &alert(AlertLevel::Critical),
            Some("#ops"),
            "bot",
            ":robot_face:",
        );
        assert_eq!(payload["channel"], "#ops");
        assert_eq!(payload["text"], ":warning: *CRITICAL Alert*: high_cpu_usage");
        assert_eq!(payload["attachments"][0]["color"], "danger");
        assert_eq!(payload["attachments"][0]["fields"][1]["value"], "system_monitor");

        let info = slack_payload(&alert(AlertLevel::Info), None, "bot", ":robot_face:");
        assert!(info.get("channel").is_none());
        assert_eq!(info["attachments"][0]["color"], "good");
    }

    #[test]
    fn test_dingtalk_payload_mentions() {
        let plain = dingtalk_payload(&alert(AlertLevel::Warning), &[], false);
        assert_eq!(plain["msgtype"], "markdown");
        assert!(plain.get("at").is_none());
        let text = plain["markdown"]["text"].as_str().unwrap();
        assert!(text.starts_with("## ⚠️ WARNING Alert"));

        let mobiles = ["13800000000".to_string()];
        let mentioned = dingtalk_payload(&alert(AlertLevel::Critical), &mobiles, true);
        assert_eq!(mentioned["at"]["atMobiles"][0], "13800000000");
        assert_eq!(mentioned["at"]["isAtAll"], true);
    }

    #[test]
    fn test_dingtalk_signature() {
        assert_eq!(
            dingtalk_sign("SECabc123", 1_700_000_000_000).unwrap(),
            "N5P09a4+p1AMJIJWnIvQd2Yxw9+fu/oEBnPrjCcsLXk="
        );
    }

    #[test]
    fn test_channel_config_yaml() {
        let yaml = r#"
- type: console
- type: webhook
  url: http://hooks.local/alerts
  headers:
    Authorization: Bearer abc
  timeout: 3s
- type: dingtalk
  enabled: false
  webhook_url: https://oapi.dingtalk.com/robot/send?access_token=x
  secret: SEC1
"#;
        let channels: Vec<ChannelSettings> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(channels.len(), 3);
        assert_eq!(channels[0].channel, ChannelConfig::Console);
        match &channels[1].channel {
            ChannelConfig::Webhook(cfg) => {
                assert_eq!(cfg.method, "POST");
                assert_eq!(cfg.timeout, Duration::from_secs(3));
            }
            other => panic!("unexpected channel {:?}", other),
        }
        assert!(!channels[2].enabled);

        let built = build_notifiers(&channels).unwrap();
        let names: Vec<_> = built.iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, ["console", "webhook"]);
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_notification_error() {
        let notifier = WebhookNotifier::new(&WebhookConfig {
            url: "http://127.0.0.1:1/hook".into(),
            method: "post".into(),
            headers: HashMap::new(),
            timeout: Duration::from_millis(200),
        })
        .unwrap();
        let err = notifier.notify(&alert(AlertLevel::Info)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Notification);
        assert!(err.is_transient());
    }
}
