//! Background sync, periodic sync, push, notification clicks and host messages.
//!
//! None of these handlers raise into the host page. Failures are logged and,
//! for one-shot sync, turned into a [`SyncOutcome::Retry`] that the
//! [`SyncManager`] redelivers with backoff.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hashbrown::HashMap;
use pwakit_common::RetryConfig;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::clients::{Client, Clients};
use crate::config::{WorkerConfig, ACTION_DISMISS, ACTION_OPEN_APP, ACTION_SNOOZE};
use crate::event::WaitUntil;
use crate::notification::{Notification, NotificationAction, NotificationOptions, NotificationSink};
use crate::registration::ServiceWorkerRegistration;
use crate::ServiceWorkerError;

/// Result of delivering one sync event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed,
    /// The work failed; deliver the tag again later.
    Retry,
    /// Tag not handled by this worker.
    Ignored,
}

/// Offline record store reached by background sync.
#[async_trait]
pub trait OfflineDataSync: Send + Sync {
    /// Push locally queued data upstream.
    async fn sync_offline_data(&self) -> Result<(), ServiceWorkerError>;
}

/// Data sync with nothing queued.
#[derive(Debug, Default)]
pub struct NoopDataSync;

#[async_trait]
impl OfflineDataSync for NoopDataSync {
    async fn sync_offline_data(&self) -> Result<(), ServiceWorkerError> {
        Ok(())
    }
}

/// Messages the host page posts to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "SKIP_WAITING")]
    SkipWaiting,
}

impl HostMessage {
    /// Parse a posted value; anything unrecognized is `None`.
    pub fn parse(data: &JsonValue) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }
}

/// Handlers for the non-fetch functional events.
pub struct SignalChannel {
    config: Arc<WorkerConfig>,
    notifier: Arc<dyn NotificationSink>,
    data_sync: Arc<dyn OfflineDataSync>,
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    clients: Arc<RwLock<Clients>>,
}

impl SignalChannel {
    pub fn new(
        config: Arc<WorkerConfig>,
        notifier: Arc<dyn NotificationSink>,
        data_sync: Arc<dyn OfflineDataSync>,
        registration: Arc<RwLock<ServiceWorkerRegistration>>,
        clients: Arc<RwLock<Clients>>,
    ) -> Self {
        Self {
            config,
            notifier,
            data_sync,
            registration,
            clients,
        }
    }

    /// One-shot background sync.
    pub async fn on_sync(&self, tag: &str) -> SyncOutcome {
        if tag != self.config.sync.background_tag {
            debug!(tag, "Ignoring unknown sync tag");
            return SyncOutcome::Ignored;
        }

        match self.data_sync.sync_offline_data().await {
            Ok(()) => {
                info!(tag, "Background sync completed");
                SyncOutcome::Completed
            }
            Err(e) => {
                warn!(tag, error = %e, "Background sync failed");
                SyncOutcome::Retry
            }
        }
    }

    /// Periodic sync. Every firing of the reminder tag shows a notification.
    pub fn on_periodic_sync(&self, tag: &str, wait_until: &WaitUntil) -> SyncOutcome {
        if tag != self.config.sync.reminder_tag {
            debug!(tag, "Ignoring unknown periodic sync tag");
            return SyncOutcome::Ignored;
        }
        self.show(self.reminder_notification(), wait_until);
        SyncOutcome::Completed
    }

    /// Push message; `payload` is the message text, if any.
    pub fn on_push(&self, payload: Option<&str>, wait_until: &WaitUntil) {
        self.show(self.push_notification(payload), wait_until);
    }

    /// Close the clicked notification and act on the chosen button.
    ///
    /// Returns the window opened by `open-app`.
    pub async fn on_notification_click(
        &self,
        notification: &Notification,
        action: Option<&str>,
    ) -> Result<Option<Client>, ServiceWorkerError> {
        self.notifier.close_notification(notification).await;

        match action {
            Some(ACTION_OPEN_APP) => {
                let url = self.config.resolve(&self.config.notifications.open_path)?;
                let controller = self.registration.read().await.controller_for(&url);
                let client = self.clients.write().await.open_window(url, controller);
                info!(client = %client.id, "Opened app from notification");
                Ok(Some(client))
            }
            other => {
                debug!(action = ?other, "Notification click needs no further action");
                Ok(None)
            }
        }
    }

    /// Host message. Returns true when it set the skip-waiting flag.
    pub async fn on_message(&self, data: &JsonValue) -> bool {
        match HostMessage::parse(data) {
            Some(HostMessage::SkipWaiting) => {
                self.registration.write().await.skip_waiting();
                info!("Skip waiting requested by page");
                true
            }
            None => {
                debug!(message = %data, "Ignoring unrecognized message");
                false
            }
        }
    }

    /// Notification shown for a push message.
    pub fn push_notification(&self, payload: Option<&str>) -> Notification {
        let texts = &self.config.notifications;
        let body = payload
            .filter(|text| !text.is_empty())
            .unwrap_or(texts.default_push_body.as_str())
            .to_string();

        Notification {
            title: texts.app_title.clone(),
            options: NotificationOptions {
                body,
                icon: Some(texts.icon.clone()),
                badge: Some(texts.badge.clone()),
                vibrate: texts.vibrate.clone(),
                tag: None,
                require_interaction: false,
                actions: vec![
                    NotificationAction::new(ACTION_OPEN_APP, &texts.open_app_title)
                        .with_icon(&texts.action_icon),
                    NotificationAction::new(ACTION_DISMISS, &texts.dismiss_title)
                        .with_icon(&texts.action_icon),
                ],
                data: json!({
                    "dateOfArrival": unix_millis(),
                    "primaryKey": 1,
                }),
            },
        }
    }

    /// Notification shown for the periodic reminder.
    pub fn reminder_notification(&self) -> Notification {
        let texts = &self.config.notifications;
        Notification {
            title: texts.reminder_title.clone(),
            options: NotificationOptions {
                body: texts.reminder_body.clone(),
                icon: Some(texts.icon.clone()),
                badge: Some(texts.badge.clone()),
                vibrate: Vec::new(),
                tag: Some(self.config.sync.reminder_tag.clone()),
                require_interaction: true,
                actions: vec![
                    NotificationAction::new(ACTION_OPEN_APP, &texts.open_app_title),
                    NotificationAction::new(ACTION_SNOOZE, &texts.snooze_title),
                ],
                data: JsonValue::Null,
            },
        }
    }

    fn show(&self, notification: Notification, wait_until: &WaitUntil) {
        let notifier = Arc::clone(&self.notifier);
        wait_until.spawn(async move {
            let title = notification.title.clone();
            if let Err(e) = notifier.show_notification(notification).await {
                warn!(title = %title, error = %e, "Failed to show notification");
            }
        });
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// What happened to a sync tag after a delivery was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDelivery {
    /// Delivered; the tag is gone.
    Done,
    /// Failed; delivered again after the delay.
    Rescheduled(Duration),
    /// Failed too often; the tag is gone.
    Dropped,
}

#[derive(Debug)]
struct PendingSync {
    tag: String,
    attempts: u32,
    next_attempt_at: Instant,
    in_flight: bool,
}

/// Queue of one-shot sync registrations.
#[derive(Debug)]
pub struct SyncManager {
    retry: RetryConfig,
    pending: Vec<PendingSync>,
}

impl SyncManager {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            pending: Vec::new(),
        }
    }

    /// Queue `tag`. Registering a tag that is already queued is a no-op.
    pub fn register(&mut self, tag: impl Into<String>, now: Instant) -> bool {
        let tag = tag.into();
        if self.pending.iter().any(|p| p.tag == tag) {
            debug!(tag = %tag, "Sync already registered");
            return false;
        }
        self.pending.push(PendingSync {
            tag,
            attempts: 0,
            next_attempt_at: now,
            in_flight: false,
        });
        true
    }

    /// Tags ready for delivery, in registration order. They stay queued
    /// until [`SyncManager::report`] is called.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        self.pending
            .iter_mut()
            .filter(|p| !p.in_flight && p.next_attempt_at <= now)
            .map(|p| {
                p.in_flight = true;
                p.tag.clone()
            })
            .collect()
    }

    /// Record the outcome of delivering `tag`.
    pub fn report(&mut self, tag: &str, outcome: SyncOutcome, now: Instant) -> SyncDelivery {
        let Some(index) = self.pending.iter().position(|p| p.tag == tag) else {
            return SyncDelivery::Done;
        };

        if outcome != SyncOutcome::Retry {
            self.pending.remove(index);
            return SyncDelivery::Done;
        }

        let pending = &mut self.pending[index];
        pending.attempts += 1;
        pending.in_flight = false;

        if self.retry.is_exhausted(pending.attempts) {
            warn!(tag, attempts = pending.attempts, "Giving up on background sync");
            self.pending.remove(index);
            return SyncDelivery::Dropped;
        }

        let delay = self.retry.delay_for_attempt(pending.attempts + 1);
        pending.next_attempt_at = now + delay;
        debug!(tag, attempts = pending.attempts, ?delay, "Background sync rescheduled");
        SyncDelivery::Rescheduled(delay)
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.pending.iter().any(|p| p.tag == tag)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct PeriodicRegistration {
    min_interval: Duration,
    last_fired: Option<Instant>,
}

/// Periodic sync registrations and their minimum intervals.
#[derive(Debug, Default)]
pub struct PeriodicSyncManager {
    registrations: HashMap<String, PeriodicRegistration>,
}

impl PeriodicSyncManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update `tag`. The first firing is due immediately.
    pub fn register(&mut self, tag: impl Into<String>, min_interval: Duration) {
        let tag = tag.into();
        debug!(tag = %tag, ?min_interval, "Periodic sync registered");
        self.registrations
            .entry(tag)
            .and_modify(|r| r.min_interval = min_interval)
            .or_insert(PeriodicRegistration {
                min_interval,
                last_fired: None,
            });
    }

    pub fn unregister(&mut self, tag: &str) -> bool {
        self.registrations.remove(tag).is_some()
    }

    /// Tags whose minimum interval has elapsed, sorted.
    pub fn due(&self, now: Instant) -> Vec<String> {
        let mut due: Vec<String> = self
            .registrations
            .iter()
            .filter(|(_, r)| match r.last_fired {
                None => true,
                Some(at) => now.saturating_duration_since(at) >= r.min_interval,
            })
            .map(|(tag, _)| tag.clone())
            .collect();
        due.sort();
        due
    }

    pub fn mark_fired(&mut self, tag: &str, now: Instant) {
        if let Some(registration) = self.registrations.get_mut(tag) {
            registration.last_fired = Some(now);
        }
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.registrations.keys().cloned().collect();
        tags.sort();
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BACKGROUND_SYNC_TAG, REMINDER_SYNC_TAG};
    use std::sync::Mutex;
    use url::Url;

    #[derive(Default)]
    struct Recorder {
        shown: Mutex<Vec<Notification>>,
        closed: Mutex<usize>,
    }

    #[async_trait]
    impl NotificationSink for Recorder {
        async fn show_notification(&self, notification: Notification) -> Result<(), ServiceWorkerError> {
            self.shown.lock().unwrap().push(notification);
            Ok(())
        }

        async fn close_notification(&self, _notification: &Notification) {
            *self.closed.lock().unwrap() += 1;
        }
    }

    struct FailingSync;

    #[async_trait]
    impl OfflineDataSync for FailingSync {
        async fn sync_offline_data(&self) -> Result<(), ServiceWorkerError> {
            Err(ServiceWorkerError::StateError("record store locked".to_string()))
        }
    }

    fn channel(recorder: Arc<Recorder>, data_sync: Arc<dyn OfflineDataSync>) -> SignalChannel {
        let config = WorkerConfig::in_memory(Url::parse("https://haekeln.example/").unwrap());
        let scope = config.scope_url().unwrap();
        SignalChannel::new(
            Arc::new(config),
            recorder,
            data_sync,
            Arc::new(RwLock::new(ServiceWorkerRegistration::new(scope))),
            Arc::new(RwLock::new(Clients::new())),
        )
    }

    #[tokio::test]
    async fn test_sync_outcomes() {
        let ok = channel(Arc::default(), Arc::new(NoopDataSync));
        assert_eq!(ok.on_sync(BACKGROUND_SYNC_TAG).await, SyncOutcome::Completed);
        assert_eq!(ok.on_sync("upload-photos").await, SyncOutcome::Ignored);

        let failing = channel(Arc::default(), Arc::new(FailingSync));
        assert_eq!(failing.on_sync(BACKGROUND_SYNC_TAG).await, SyncOutcome::Retry);
    }

    #[tokio::test]
    async fn test_push_notification_shape() {
        let recorder = Arc::new(Recorder::default());
        let signals = channel(recorder.clone(), Arc::new(NoopDataSync));

        let wait_until = WaitUntil::new();
        signals.on_push(None, &wait_until);
        signals.on_push(Some("Neues Muster"), &wait_until);
        wait_until.settled().await;

        let shown = recorder.shown.lock().unwrap();
        assert_eq!(shown.len(), 2);
        let bodies: Vec<&str> = shown.iter().map(|n| n.options.body.as_str()).collect();
        assert!(bodies.contains(&"Zeit für dein Häkelprojekt!"));
        assert!(bodies.contains(&"Neues Muster"));

        let first = &shown[0];
        assert_eq!(first.title, "Häkelmuster PWA");
        assert_eq!(first.options.vibrate, vec![100, 50, 100]);
        assert_eq!(first.options.action_ids(), vec!["open-app", "dismiss"]);
        assert_eq!(first.options.data["primaryKey"], json!(1));
    }

    #[tokio::test]
    async fn test_reminder_notification_shape() {
        let recorder = Arc::new(Recorder::default());
        let signals = channel(recorder.clone(), Arc::new(NoopDataSync));

        let wait_until = WaitUntil::new();
        assert_eq!(
            signals.on_periodic_sync(REMINDER_SYNC_TAG, &wait_until),
            SyncOutcome::Completed
        );
        assert_eq!(signals.on_periodic_sync("other", &wait_until), SyncOutcome::Ignored);
        wait_until.settled().await;

        let shown = recorder.shown.lock().unwrap();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].options.tag.as_deref(), Some(REMINDER_SYNC_TAG));
        assert!(shown[0].options.require_interaction);
        assert_eq!(shown[0].options.action_ids(), vec!["open-app", "snooze"]);
    }

    #[tokio::test]
    async fn test_notification_click_actions() {
        let recorder = Arc::new(Recorder::default());
        let signals = channel(recorder.clone(), Arc::new(NoopDataSync));
        let notification = signals.reminder_notification();

        let opened = signals
            .on_notification_click(&notification, Some(ACTION_OPEN_APP))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.url.as_str(), "https://haekeln.example/");

        assert!(signals
            .on_notification_click(&notification, Some(ACTION_SNOOZE))
            .await
            .unwrap()
            .is_none());
        assert!(signals.on_notification_click(&notification, None).await.unwrap().is_none());
        assert_eq!(*recorder.closed.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_messages() {
        let signals = channel(Arc::default(), Arc::new(NoopDataSync));
        assert!(!signals.on_message(&json!({ "type": "PING" })).await);
        assert!(!signals.on_message(&json!("SKIP_WAITING")).await);
        assert!(!signals.registration.read().await.is_skip_waiting());

        assert!(signals.on_message(&json!({ "type": "SKIP_WAITING" })).await);
        assert!(signals.registration.read().await.is_skip_waiting());
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_sync_manager_redelivers_then_drops() {
        let mut manager = SyncManager::new(retry());
        let start = Instant::now();
        assert!(manager.register(BACKGROUND_SYNC_TAG, start));
        assert!(!manager.register(BACKGROUND_SYNC_TAG, start));

        assert_eq!(manager.take_due(start), vec![BACKGROUND_SYNC_TAG]);
        // in flight, not handed out twice
        assert!(manager.take_due(start).is_empty());

        assert_eq!(
            manager.report(BACKGROUND_SYNC_TAG, SyncOutcome::Retry, start),
            SyncDelivery::Rescheduled(Duration::from_secs(60))
        );
        assert!(manager.take_due(start).is_empty());

        let later = start + Duration::from_secs(60);
        assert_eq!(manager.take_due(later), vec![BACKGROUND_SYNC_TAG]);
        assert_eq!(
            manager.report(BACKGROUND_SYNC_TAG, SyncOutcome::Retry, later),
            SyncDelivery::Rescheduled(Duration::from_secs(120))
        );

        let last = later + Duration::from_secs(120);
        assert_eq!(manager.take_due(last).len(), 1);
        assert_eq!(
            manager.report(BACKGROUND_SYNC_TAG, SyncOutcome::Retry, last),
            SyncDelivery::Dropped
        );
        assert!(manager.is_empty());
    }

    #[test]
    fn test_sync_manager_completes() {
        let mut manager = SyncManager::new(retry());
        let now = Instant::now();
        manager.register(BACKGROUND_SYNC_TAG, now);
        manager.take_due(now);
        assert_eq!(
            manager.report(BACKGROUND_SYNC_TAG, SyncOutcome::Completed, now),
            SyncDelivery::Done
        );
        assert!(!manager.is_registered(BACKGROUND_SYNC_TAG));
    }

    #[test]
    fn test_periodic_manager_respects_interval() {
        let mut manager = PeriodicSyncManager::new();
        let day = Duration::from_secs(86_400);
        let start = Instant::now();
        manager.register(REMINDER_SYNC_TAG, day);

        assert_eq!(manager.due(start), vec![REMINDER_SYNC_TAG]);
        manager.mark_fired(REMINDER_SYNC_TAG, start);
        assert!(manager.due(start + Duration::from_secs(3600)).is_empty());
        assert_eq!(manager.due(start + day).len(), 1);

        assert!(manager.unregister(REMINDER_SYNC_TAG));
        assert!(manager.tags().is_empty());
    }
}
