use serde_json::json;

use crate::config::WebhookSettings;

// Discord-style webhooks answer 204 No Content on success.
const WEBHOOK_SUCCESS_STATUS: u16 = 204;

/// Chat-webhook notifier for the abnormal cup state.
///
/// Fire-and-forget: every outcome is logged and none is reported to the
/// caller. There is no retry and no escalation.
pub struct WebhookNotifier {
    url: String,
    username: String,
}

impl WebhookNotifier {
    pub fn new(settings: &WebhookSettings) -> Self {
        Self {
            url: settings.url.clone(),
            username: settings.username.clone(),
        }
    }

    /// POST `{content, username}` to the configured webhook.
    pub fn notify(&self, message: &str) {
        if self.url.is_empty() {
            log::warn!("webhook url not configured; dropping alert");
            return;
        }

        let payload = json!({
            "content": message,
            "username": self.username,
        });
        match ureq::post(&self.url).send_json(payload) {
            Ok(response) if response.status() == WEBHOOK_SUCCESS_STATUS => {
                log::info!("webhook alert delivered");
            }
            Ok(response) => {
                log::warn!("webhook returned unexpected status {}", response.status());
            }
            Err(e) => {
                log::warn!("webhook delivery failed: {}", e);
            }
        }
    }
}
