//! Connection event notifications.
//!
//! Fired after a successful dial and again when the splice ends (or when a
//! connection is rejected with a known hostname). Delivery is best-effort;
//! a dead webhook never affects the data path.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use hoppergate_common::config::WebhookSettings;

/// One connection's identifying details, as carried in notifications.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub session_id: Uuid,
    pub client_addr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub player_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConnectionEvent {
    pub fn new(session_id: Uuid, client_addr: impl Into<String>) -> Self {
        Self {
            session_id,
            client_addr: client_addr.into(),
            hostname: None,
            backend: None,
            player_name: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }
}

/// Webhook surface the connection handler notifies.
#[async_trait]
pub trait ConnectionNotifier: Send + Sync {
    async fn connected(&self, event: &ConnectionEvent);
    async fn disconnected(&self, event: &ConnectionEvent);
}

/// Notifier used when no webhook is configured.
pub struct NullNotifier;

#[async_trait]
impl ConnectionNotifier for NullNotifier {
    async fn connected(&self, _event: &ConnectionEvent) {}
    async fn disconnected(&self, _event: &ConnectionEvent) {}
}

/// POSTs connection events as JSON to a configured URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(settings: &WebhookSettings) -> anyhow::Result<Option<Self>> {
        let Some(url) = &settings.url else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms.unwrap_or(5_000)))
            .build()?;
        Ok(Some(Self {
            client,
            url: url.clone(),
        }))
    }

    async fn post(&self, kind: &str, event: &ConnectionEvent) {
        #[derive(Serialize)]
        struct Payload<'a> {
            event: &'a str,
            #[serde(flatten)]
            details: &'a ConnectionEvent,
        }

        let payload = Payload {
            event: kind,
            details: event,
        };
        if let Err(e) = self.client.post(&self.url).json(&payload).send().await {
            debug!(url = %self.url, error = %e, "webhook delivery failed");
        }
    }
}

#[async_trait]
impl ConnectionNotifier for WebhookNotifier {
    async fn connected(&self, event: &ConnectionEvent) {
        self.post("connected", event).await;
    }

    async fn disconnected(&self, event: &ConnectionEvent) {
        self.post("disconnected", event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_shape() {
        let mut event = ConnectionEvent::new(Uuid::nil(), "192.0.2.1:54321");
        event.hostname = Some("mc.example.com".to_string());
        event.player_name = Some("Alice".to_string());

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["clientAddr"], "192.0.2.1:54321");
        assert_eq!(json["hostname"], "mc.example.com");
        assert_eq!(json["playerName"], "Alice");
        // Unset optional fields are omitted entirely.
        assert!(json.get("backend").is_none());
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_notifier_disabled_without_url() {
        let notifier = WebhookNotifier::new(&WebhookSettings::default()).unwrap();
        assert!(notifier.is_none());
    }
}
