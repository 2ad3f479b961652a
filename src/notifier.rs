use crate::config::NotifierConfig;
use crate::secret_string::SecretString;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Certificate, Client, StatusCode};
use serde_json::{Value, json};
use std::fmt;
use std::fs;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};

static NOTIFICATION_TITLE: &str = "Image policy violation - Pod rejected";
static NOTIFICATION_COLOR: &str = "#F35A00";
static NOTIFICATION_FOOTER: &str = "kube-image-bouncer";

/// Describes a rejected pod. Built once per rejected request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub pod_name: String,
    pub namespace: String,
    pub violating_image: String,
    pub reason: String,
    pub images: Vec<String>,
    pub init_images: Vec<String>,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum NotifyError {
    Request(reqwest::Error),
    Status(StatusCode),
    Timeout(Duration),
}

impl std::error::Error for NotifyError {}
impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Request(e) => write!(f, "failed to send notification: {}", e),
            NotifyError::Status(status) => {
                write!(f, "notification webhook returned error status {}", status)
            }
            NotifyError::Timeout(timeout) => {
                write!(f, "notification was not delivered within {:?}", timeout)
            }
        }
    }
}

/// Delivers rejection alerts. Failures are reported to the caller, which logs them;
/// they never change an admission verdict.
pub trait Notifier: Send + Sync {
    fn notify(
        &self,
        event: &NotificationEvent,
    ) -> impl Future<Output = Result<(), NotifyError>> + Send;
}

/// No notifier configured: rejections are only logged.
impl<N: Notifier> Notifier for Option<N> {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        match self {
            Some(notifier) => notifier.notify(event).await,
            None => {
                debug!(
                    "Notifier URL is not configured, skipping notification for pod {}",
                    event.pod_name
                );
                Ok(())
            }
        }
    }
}

/// Posts Slack-compatible incoming-webhook messages.
#[derive(Debug, Clone)]
pub struct SlackNotifier {
    client: Client,
    webhook_url: SecretString,
}

impl SlackNotifier {
    pub fn new(client: Client, webhook_url: SecretString) -> Self {
        Self {
            client,
            webhook_url,
        }
    }

    /// Returns `None` when no webhook URL is configured.
    pub fn from_config(config: &NotifierConfig) -> Result<Option<Self>> {
        let Some(webhook_url) = config.webhook_url() else {
            info!("No notifier URL configured, rejection notifications are disabled");
            return Ok(None);
        };
        let client = create_client(config)?;
        Ok(Some(Self::new(client, webhook_url.clone())))
    }
}

impl Notifier for SlackNotifier {
    async fn notify(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        let message = build_message(event);
        debug!(
            "Sending rejection notification for pod {} in namespace {}",
            event.pod_name, event.namespace
        );

        let response = self
            .client
            .post(self.webhook_url.expose_secret())
            .json(&message)
            .send()
            .await
            .map_err(NotifyError::Request)?;

        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status()));
        }
        Ok(())
    }
}

pub fn create_client(config: &NotifierConfig) -> Result<Client> {
    info!("Initializing notifier HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder().timeout(config.timeout());

    for file_path in &config.ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder
        .build()
        .context("Failed to build HTTP client")
}

fn build_message(event: &NotificationEvent) -> Value {
    let short = event.images.len() < 2 && event.init_images.len() < 2;
    json!({
        "text": format!("pod {} has been rejected by the image policy", event.pod_name),
        "attachments": [{
            "title": NOTIFICATION_TITLE,
            "text": event.reason,
            "fallback": event.reason,
            "color": NOTIFICATION_COLOR,
            "footer": NOTIFICATION_FOOTER,
            "ts": event.rejected_at.timestamp(),
            "fields": [
                { "title": "namespace", "value": event.namespace, "short": short },
                { "title": "pod", "value": event.pod_name, "short": short },
                { "title": "image", "value": event.images.join(", "), "short": short },
                { "title": "initImage", "value": event.init_images.join(", "), "short": short },
                { "title": "violatingImage", "value": event.violating_image, "short": false },
            ],
        }],
    })
}
