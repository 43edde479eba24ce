//! Notification Sinks
//!
//! Delivery of structured finding/alert events. The pipeline emits an
//! event on successful implementation, failed implementation, successful
//! update, and rollback; how the event reaches an operator is opaque to
//! the core. Delivery failures are logged, never propagated.

use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, warn};

use crate::types::NotificationSink;

/// Posts events as JSON to a configured webhook URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn post(&self, payload: serde_json::Value) {
        let result = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await;
        if let Err(e) = result {
            warn!("Webhook delivery failed: {}", e);
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn notify_finding(&self, title: &str, description: &str) {
        self.post(json!({
            "kind": "finding",
            "title": title,
            "description": description,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .await;
    }

    async fn notify_alert(&self, message: &str, error: &str) {
        self.post(json!({
            "kind": "alert",
            "message": message,
            "error": error,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .await;
    }
}

/// Tracing-only sink used when no webhook is configured.
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_finding(&self, title: &str, description: &str) {
        info!("[finding] {}: {}", title, description);
    }

    async fn notify_alert(&self, message: &str, error: &str) {
        error!("[alert] {}: {}", message, error);
    }
}

#[cfg(test)]
pub mod test_support {
    //! Recording sink used across the crate's tests.

    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingSink {
        pub findings: Mutex<Vec<(String, String)>>,
        pub alerts: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify_finding(&self, title: &str, description: &str) {
            self.findings
                .lock()
                .unwrap()
                .push((title.to_string(), description.to_string()));
        }

        async fn notify_alert(&self, message: &str, error: &str) {
            self.alerts
                .lock()
                .unwrap()
                .push((message.to_string(), error.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::RecordingSink;
    use crate::types::NotificationSink;

    #[tokio::test]
    async fn test_recording_sink_captures_events() {
        let sink = RecordingSink::default();
        sink.notify_finding("Implemented 1.0.1", "cache-utility written").await;
        sink.notify_alert("Implementation failed", "unsafe code").await;
        assert_eq!(sink.findings.lock().unwrap().len(), 1);
        assert_eq!(sink.alerts.lock().unwrap()[0].1, "unsafe code");
    }
}
