//! Notifications shown by the worker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::ServiceWorkerError;

/// A button on a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
}

impl NotificationAction {
    pub fn new(action: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            title: title.into(),
            icon: None,
        }
    }

    pub fn with_icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }
}

/// Options passed to `showNotification`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOptions {
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vibrate: Vec<u32>,
    /// Replaces an earlier notification with the same tag.
    pub tag: Option<String>,
    pub require_interaction: bool,
    pub actions: Vec<NotificationAction>,
    pub data: JsonValue,
}

impl NotificationOptions {
    pub fn action_ids(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.action.as_str()).collect()
    }
}

/// A displayed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub options: NotificationOptions,
}

/// Platform notification surface.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Display a notification.
    async fn show_notification(&self, notification: Notification)
        -> Result<(), ServiceWorkerError>;

    /// Close a displayed notification.
    async fn close_notification(&self, notification: &Notification);
}

/// Sink that only logs; used when no platform surface is attached.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn show_notification(
        &self,
        notification: Notification,
    ) -> Result<(), ServiceWorkerError> {
        info!(
            title = %notification.title,
            body = %notification.options.body,
            tag = ?notification.options.tag,
            actions = ?notification.options.action_ids(),
            "Notification shown"
        );
        Ok(())
    }

    async fn close_notification(&self, notification: &Notification) {
        info!(title = %notification.title, "Notification closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_serialize_like_the_web_api() {
        let options = NotificationOptions {
            body: "Hallo".to_string(),
            require_interaction: true,
            actions: vec![NotificationAction::new("open-app", "Open").with_icon("/i.png")],
            ..Default::default()
        };

        let value = serde_json::to_value(&options).unwrap();
        assert_eq!(value["requireInteraction"], json!(true));
        assert_eq!(value["actions"][0]["action"], json!("open-app"));
        assert!(value.get("vibrate").is_none());
        assert_eq!(options.action_ids(), vec!["open-app"]);
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_everything() {
        let notification = Notification {
            title: "t".to_string(),
            options: NotificationOptions::default(),
        };
        LogNotifier.show_notification(notification.clone()).await.unwrap();
        LogNotifier.close_notification(&notification).await;
    }
}
