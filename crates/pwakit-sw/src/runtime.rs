//! Event-loop runtime.
//!
//! One task owns the worker's event queue. Each [`WorkerEvent`] is dispatched
//! to its handler and polled in a `FuturesUnordered` set, so handlers
//! interleave on the loop task instead of running in parallel. An event is
//! settled once its handler returned and its wait-until work completed or
//! timed out.
//!
//! ```no_run
//! # async fn demo() -> Result<(), pwakit_sw::ServiceWorkerError> {
//! use pwakit_sw::{ServiceWorkerRuntime, WorkerConfig};
//! use url::Url;
//!
//! let config = WorkerConfig::in_memory(Url::parse("https://haekeln.example/").unwrap());
//! let (runtime, handle, _lifecycle) = ServiceWorkerRuntime::builder(config).build().await?;
//! tokio::spawn(runtime.run());
//!
//! handle.install().await?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use pwakit_common::with_timeout;
use pwakit_net::{Fetcher, HttpFetcher, LoaderConfig, Request};
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::activate::{ActivationController, ActivationReport};
use crate::cache::CacheStorage;
use crate::clients::{Client, Clients};
use crate::config::WorkerConfig;
use crate::event::WaitUntil;
use crate::fetch::{FetchDisposition, FetchInterceptor};
use crate::install::{InstallController, InstallReport};
use crate::notification::{LogNotifier, Notification, NotificationSink};
use crate::registration::{
    ActiveRecord, RegistrationEvent, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
};
use crate::sync::{
    NoopDataSync, OfflineDataSync, PeriodicSyncManager, SignalChannel, SyncDelivery, SyncManager,
    SyncOutcome,
};
use crate::{FetchError, InstallError, ServiceWorkerError};

const EVENT_QUEUE_CAPACITY: usize = 256;

/// Functional events delivered to the worker.
#[derive(Debug)]
pub enum WorkerEvent {
    Install {
        reply: oneshot::Sender<Result<InstallReport, InstallError>>,
    },
    /// Activate the waiting worker if it is allowed to take over.
    Activate {
        reply: oneshot::Sender<Result<Option<ActivationReport>, ServiceWorkerError>>,
    },
    Fetch {
        request: Request,
        reply: oneshot::Sender<FetchDisposition>,
    },
    Sync {
        tag: String,
        reply: oneshot::Sender<SyncOutcome>,
    },
    PeriodicSync {
        tag: String,
        reply: oneshot::Sender<SyncOutcome>,
    },
    Push {
        payload: Option<String>,
        reply: oneshot::Sender<()>,
    },
    NotificationClick {
        notification: Notification,
        action: Option<String>,
        reply: oneshot::Sender<Result<Option<Client>, ServiceWorkerError>>,
    },
    Message {
        data: JsonValue,
        reply: oneshot::Sender<bool>,
    },
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Install { .. } => "install",
            WorkerEvent::Activate { .. } => "activate",
            WorkerEvent::Fetch { .. } => "fetch",
            WorkerEvent::Sync { .. } => "sync",
            WorkerEvent::PeriodicSync { .. } => "periodicsync",
            WorkerEvent::Push { .. } => "push",
            WorkerEvent::NotificationClick { .. } => "notificationclick",
            WorkerEvent::Message { .. } => "message",
        }
    }
}

struct Envelope {
    event: WorkerEvent,
    settled: oneshot::Sender<()>,
}

/// Shared state every handler runs against.
#[derive(Clone)]
struct WorkerScope {
    config: Arc<WorkerConfig>,
    caches: Arc<CacheStorage>,
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    clients: Arc<RwLock<Clients>>,
    install: Arc<InstallController>,
    activation: Arc<ActivationController>,
    fetch: Arc<FetchInterceptor>,
    signals: Arc<SignalChannel>,
    lifecycle: mpsc::UnboundedSender<RegistrationEvent>,
}

impl WorkerScope {
    fn dispatch(&self, envelope: Envelope) -> BoxFuture<'static, ()> {
        let scope = self.clone();
        async move { scope.handle(envelope).await }.boxed()
    }

    async fn handle(self, envelope: Envelope) {
        let Envelope { event, settled } = envelope;
        let kind = event.kind();
        let wait_until = WaitUntil::new();
        trace!(event = kind, "Dispatching event");

        let delivered = match event {
            WorkerEvent::Install { reply } => reply.send(self.install().await).is_ok(),
            WorkerEvent::Activate { reply } => reply.send(self.activate_if_ready().await).is_ok(),
            WorkerEvent::Fetch { request, reply } => {
                let disposition = self.fetch(request, &wait_until).await;
                reply.send(disposition).is_ok()
            }
            WorkerEvent::Sync { tag, reply } => reply.send(self.signals.on_sync(&tag).await).is_ok(),
            WorkerEvent::PeriodicSync { tag, reply } => {
                reply.send(self.signals.on_periodic_sync(&tag, &wait_until)).is_ok()
            }
            WorkerEvent::Push { payload, reply } => {
                self.signals.on_push(payload.as_deref(), &wait_until);
                reply.send(()).is_ok()
            }
            WorkerEvent::NotificationClick {
                notification,
                action,
                reply,
            } => {
                let result = self
                    .signals
                    .on_notification_click(&notification, action.as_deref())
                    .await;
                reply.send(result).is_ok()
            }
            WorkerEvent::Message { data, reply } => {
                let skip_waiting = self.signals.on_message(&data).await;
                if skip_waiting {
                    if let Err(e) = self.activate_if_ready().await {
                        warn!(error = %e, "Activation after skip waiting failed");
                    }
                }
                reply.send(skip_waiting).is_ok()
            }
        };

        if !delivered {
            trace!(event = kind, "Event result dropped by caller");
        }

        self.settle(kind, wait_until).await;
        let _ = settled.send(());
    }

    async fn settle(&self, kind: &'static str, wait_until: WaitUntil) {
        if wait_until.pending() == 0 {
            return;
        }
        let lifetime = self.config.event_timeout();
        match with_timeout(lifetime, wait_until.settled()).await {
            Ok(tasks) => trace!(event = kind, tasks, "Event settled"),
            Err(e) => warn!(event = kind, error = %e, "Event exceeded its extended lifetime"),
        }
    }

    fn emit(&self, event: RegistrationEvent) {
        let _ = self.lifecycle.send(event);
    }

    fn emit_state(&self, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        self.emit(RegistrationEvent::StateChange {
            worker_id,
            new_state,
        });
    }

    async fn install(&self) -> Result<InstallReport, InstallError> {
        let script_url = self
            .config
            .script_url()
            .map_err(|e| InstallError::InvalidUrl(e.to_string()))?;

        let worker_id = self
            .registration
            .write()
            .await
            .update(script_url, &self.config.cache_name);
        self.emit(RegistrationEvent::UpdateFound { worker_id });
        self.emit_state(worker_id, ServiceWorkerState::Installing);

        let lifetime = self.config.event_timeout();
        let result = match with_timeout(lifetime, self.install.install()).await {
            Ok(result) => result,
            Err(_) => Err(InstallError::Timeout(lifetime)),
        };

        match result {
            Ok(report) => {
                {
                    let mut registration = self.registration.write().await;
                    registration.install_complete();
                    if report.skip_waiting {
                        registration.skip_waiting();
                    }
                }
                self.emit_state(worker_id, ServiceWorkerState::Installed);

                if let Err(e) = self.activate_if_ready().await {
                    warn!(error = %e, "Activation after install failed");
                }
                Ok(report)
            }
            Err(e) => {
                self.registration.write().await.install_failed(e.to_string());
                self.emit_state(worker_id, ServiceWorkerState::Redundant);
                Err(e)
            }
        }
    }

    /// Move the waiting worker to active when skip-waiting is set or the
    /// current worker controls no clients. `Ok(None)` when nothing moved.
    async fn activate_if_ready(&self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        let (worker_id, previous) = {
            let mut registration = self.registration.write().await;
            let clients_of_active = match registration.active.as_ref() {
                Some(active) => self.clients.read().await.controlled_by(active.id),
                None => 0,
            };
            if !registration.ready_to_activate(clients_of_active) {
                debug!(clients_of_active, "Waiting worker cannot activate yet");
                return Ok(None);
            }
            match registration.begin_activation() {
                Some(ids) => ids,
                None => return Ok(None),
            }
        };

        if let Some(previous) = previous {
            self.emit_state(previous, ServiceWorkerState::Redundant);
        }
        self.emit_state(worker_id, ServiceWorkerState::Activating);

        let result = self.activation.activate(worker_id).await;

        // A failed activate handler does not stop the worker from activating.
        let record = {
            let mut registration = self.registration.write().await;
            registration.finish_activation();
            registration.get_active().map(ActiveRecord::of)
        };
        self.emit_state(worker_id, ServiceWorkerState::Activated);
        if let (Some(dir), Some(record)) = (self.caches.dir(), record) {
            if let Err(e) = record.save(dir).await {
                warn!(error = %e, "Failed to record the active version");
            }
        }

        match result {
            Ok(report) => {
                for client_id in &report.claimed {
                    self.emit(RegistrationEvent::ControllerChange {
                        client_id: client_id.clone(),
                        worker_id,
                    });
                }
                Ok(Some(report))
            }
            Err(e) => {
                error!(error = %e, "Activation failed");
                Err(e)
            }
        }
    }

    /// Only the runtime of the active version intercepts.
    async fn fetch(&self, request: Request, wait_until: &WaitUntil) -> FetchDisposition {
        let active_cache = self
            .registration
            .read()
            .await
            .get_active()
            .map(|worker| worker.cache_name.clone());
        match active_cache {
            None => {
                trace!(url = %request.url, "No active worker, not intercepting");
                FetchDisposition::PassThrough
            }
            Some(cache_name) if cache_name != self.config.cache_name => {
                debug!(
                    url = %request.url,
                    active = %cache_name,
                    "Superseded version, not intercepting"
                );
                FetchDisposition::PassThrough
            }
            Some(_) => self.fetch.handle(request, wait_until).await,
        }
    }
}

/// The worker's event loop. Drive it with [`ServiceWorkerRuntime::run`].
pub struct ServiceWorkerRuntime {
    scope: WorkerScope,
    events: mpsc::Receiver<Envelope>,
}

impl ServiceWorkerRuntime {
    pub fn builder(config: WorkerConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    /// Process events until every [`WorkerHandle`] is dropped, then drain
    /// the events still in flight.
    pub async fn run(mut self) {
        info!(cache = %self.scope.config.cache_name, "Worker event loop started");
        let mut in_flight = FuturesUnordered::new();

        loop {
            tokio::select! {
                next = self.events.recv() => match next {
                    Some(envelope) => in_flight.push(self.scope.dispatch(envelope)),
                    None => break,
                },
                Some(()) = in_flight.next(), if !in_flight.is_empty() => {}
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            debug!(events = draining, "Draining in-flight events");
        }
        while in_flight.next().await.is_some() {}
        info!("Worker event loop stopped");
    }
}

/// Assembles a runtime and its collaborators.
pub struct RuntimeBuilder {
    config: WorkerConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    notifier: Option<Arc<dyn NotificationSink>>,
    data_sync: Option<Arc<dyn OfflineDataSync>>,
    caches: Option<Arc<CacheStorage>>,
    registration: Option<Arc<RwLock<ServiceWorkerRegistration>>>,
    clients: Option<Arc<RwLock<Clients>>>,
}

impl RuntimeBuilder {
    fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            fetcher: None,
            notifier: None,
            data_sync: None,
            caches: None,
            registration: None,
            clients: None,
        }
    }

    /// Network layer; defaults to an [`HttpFetcher`] for the configured origin.
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Notification surface; defaults to [`LogNotifier`].
    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn data_sync(mut self, data_sync: Arc<dyn OfflineDataSync>) -> Self {
        self.data_sync = Some(data_sync);
        self
    }

    /// Share cache storage with another runtime, e.g. an older version.
    pub fn caches(mut self, caches: Arc<CacheStorage>) -> Self {
        self.caches = Some(caches);
        self
    }

    pub fn registration(mut self, registration: Arc<RwLock<ServiceWorkerRegistration>>) -> Self {
        self.registration = Some(registration);
        self
    }

    pub fn clients(mut self, clients: Arc<RwLock<Clients>>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub async fn build(
        self,
    ) -> Result<
        (
            ServiceWorkerRuntime,
            WorkerHandle,
            mpsc::UnboundedReceiver<RegistrationEvent>,
        ),
        ServiceWorkerError,
    > {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(LoaderConfig::new(config.origin.clone()))?),
        };

        let caches = match self.caches {
            Some(caches) => caches,
            None => {
                let storage = match &config.storage_dir {
                    Some(dir) => CacheStorage::open_dir(dir).await?,
                    None => CacheStorage::in_memory(),
                };
                Arc::new(storage.with_quota(config.quota_bytes))
            }
        };

        let registration = match self.registration {
            Some(registration) => registration,
            None => {
                let mut registration = ServiceWorkerRegistration::new(config.scope_url()?);
                if let Some(dir) = caches.dir() {
                    restore_active(&mut registration, dir, &caches).await;
                }
                Arc::new(RwLock::new(registration))
            }
        };
        let clients = self.clients.unwrap_or_default();
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier) as Arc<dyn NotificationSink>);
        let data_sync = self.data_sync.unwrap_or_else(|| Arc::new(NoopDataSync) as Arc<dyn OfflineDataSync>);

        let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let scope = WorkerScope {
            install: Arc::new(InstallController::new(
                config.clone(),
                caches.clone(),
                fetcher.clone(),
            )),
            activation: Arc::new(ActivationController::new(
                config.clone(),
                caches.clone(),
                clients.clone(),
            )),
            fetch: Arc::new(FetchInterceptor::new(config.clone(), caches.clone(), fetcher)),
            signals: Arc::new(SignalChannel::new(
                config.clone(),
                notifier,
                data_sync,
                registration.clone(),
                clients.clone(),
            )),
            config: config.clone(),
            caches: caches.clone(),
            registration: registration.clone(),
            clients: clients.clone(),
            lifecycle: lifecycle_tx,
        };

        let handle = WorkerHandle {
            events: events_tx,
            config: config.clone(),
            caches,
            registration,
            clients,
            syncs: Arc::new(Mutex::new(SyncManager::new(config.sync_retry()))),
            periodic: Arc::new(Mutex::new(PeriodicSyncManager::new())),
        };

        let runtime = ServiceWorkerRuntime {
            scope,
            events: events_rx,
        };

        Ok((runtime, handle, lifecycle_rx))
    }
}

/// Bring back the version that was active before a restart, provided its
/// cache container survived.
async fn restore_active(registration: &mut ServiceWorkerRegistration, dir: &Path, caches: &CacheStorage) {
    let record = match ActiveRecord::load(dir).await {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Ignoring unreadable registration record");
            return;
        }
    };
    if !caches.has(&record.cache_name).await {
        warn!(cache = %record.cache_name, "Recorded active version has no cache, starting fresh");
        return;
    }
    let worker_id = registration.restore_active(&record);
    info!(worker = %worker_id, cache = %record.cache_name, "Restored active worker");
}

/// A fetch in progress.
#[derive(Debug)]
pub struct PendingFetch {
    response: oneshot::Receiver<FetchDisposition>,
    settled: oneshot::Receiver<()>,
}

impl PendingFetch {
    /// Wait for the response. Cache population may still be running.
    pub async fn response(&mut self) -> FetchDisposition {
        match (&mut self.response).await {
            Ok(disposition) => disposition,
            Err(_) => FetchDisposition::Respond(Err(FetchError::WorkerStopped)),
        }
    }

    /// Wait until the event's background work finished too.
    pub async fn settled(self) {
        let _ = self.settled.await;
    }
}

/// Cloneable handle for delivering events to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    events: mpsc::Sender<Envelope>,
    config: Arc<WorkerConfig>,
    caches: Arc<CacheStorage>,
    registration: Arc<RwLock<ServiceWorkerRegistration>>,
    clients: Arc<RwLock<Clients>>,
    syncs: Arc<Mutex<SyncManager>>,
    periodic: Arc<Mutex<PeriodicSyncManager>>,
}

impl WorkerHandle {
    async fn send<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent,
    ) -> Result<(oneshot::Receiver<T>, oneshot::Receiver<()>), ServiceWorkerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (settled_tx, settled_rx) = oneshot::channel();
        let envelope = Envelope {
            event: build(reply_tx),
            settled: settled_tx,
        };
        self.events
            .send(envelope)
            .await
            .map_err(|_| ServiceWorkerError::WorkerStopped)?;
        Ok((reply_rx, settled_rx))
    }

    /// Deliver an event and wait until it settled.
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WorkerEvent,
    ) -> Result<T, ServiceWorkerError> {
        let (reply, settled) = self.send(build).await?;
        let value = reply.await.map_err(|_| ServiceWorkerError::WorkerStopped)?;
        let _ = settled.await;
        Ok(value)
    }

    /// Install the configured version. Activation follows automatically
    /// when the new worker is allowed to take over.
    pub async fn install(&self) -> Result<InstallReport, InstallError> {
        self.call(|reply| WorkerEvent::Install { reply })
            .await
            .map_err(|_| InstallError::WorkerStopped)?
    }

    pub async fn activate(&self) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        self.call(|reply| WorkerEvent::Activate { reply }).await?
    }

    /// Intercept `request` and wait for the response.
    pub async fn fetch(&self, request: Request) -> FetchDisposition {
        match self.dispatch_fetch(request).await {
            Ok(mut pending) => pending.response().await,
            Err(_) => FetchDisposition::Respond(Err(FetchError::WorkerStopped)),
        }
    }

    /// Intercept `request` without waiting; the response and the end of
    /// the event's background work are observed separately.
    pub async fn dispatch_fetch(&self, request: Request) -> Result<PendingFetch, ServiceWorkerError> {
        let (response, settled) = self.send(|reply| WorkerEvent::Fetch { request, reply }).await?;
        Ok(PendingFetch { response, settled })
    }

    /// Deliver a one-shot sync event directly.
    pub async fn sync(&self, tag: impl Into<String>) -> Result<SyncOutcome, ServiceWorkerError> {
        let tag = tag.into();
        self.call(|reply| WorkerEvent::Sync { tag, reply }).await
    }

    pub async fn periodic_sync(&self, tag: impl Into<String>) -> Result<SyncOutcome, ServiceWorkerError> {
        let tag = tag.into();
        self.call(|reply| WorkerEvent::PeriodicSync { tag, reply }).await
    }

    pub async fn push(&self, payload: Option<String>) -> Result<(), ServiceWorkerError> {
        self.call(|reply| WorkerEvent::Push { payload, reply }).await
    }

    pub async fn notification_click(
        &self,
        notification: Notification,
        action: Option<String>,
    ) -> Result<Option<Client>, ServiceWorkerError> {
        self.call(|reply| WorkerEvent::NotificationClick {
            notification,
            action,
            reply,
        })
        .await?
    }

    /// Post a message from a page. Returns true if it requested skip-waiting.
    pub async fn post_message(&self, data: JsonValue) -> Result<bool, ServiceWorkerError> {
        self.call(|reply| WorkerEvent::Message { data, reply }).await
    }

    /// Queue a one-shot sync for [`WorkerHandle::fire_pending_syncs`].
    pub async fn register_sync(&self, tag: impl Into<String>) -> bool {
        self.syncs.lock().await.register(tag, Instant::now())
    }

    /// Deliver every due one-shot sync and report each outcome to the queue.
    pub async fn fire_pending_syncs(&self) -> Result<Vec<(String, SyncDelivery)>, ServiceWorkerError> {
        let due = self.syncs.lock().await.take_due(Instant::now());
        let mut deliveries = Vec::with_capacity(due.len());

        for tag in due {
            let outcome = match self.sync(tag.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // put the tag back before giving up
                    self.syncs.lock().await.report(&tag, SyncOutcome::Retry, Instant::now());
                    return Err(e);
                }
            };
            let delivery = self.syncs.lock().await.report(&tag, outcome, Instant::now());
            deliveries.push((tag, delivery));
        }
        Ok(deliveries)
    }

    pub async fn register_periodic_sync(&self, tag: impl Into<String>, min_interval: Duration) {
        self.periodic.lock().await.register(tag, min_interval);
    }

    /// Register the reminder with its configured interval.
    pub async fn register_reminder(&self) {
        self.register_periodic_sync(self.config.sync.reminder_tag.clone(), self.config.reminder_interval())
            .await;
    }

    /// Fire every periodic sync whose minimum interval elapsed. Returns the
    /// tags that fired.
    pub async fn fire_due_periodic_syncs(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let due = self.periodic.lock().await.due(Instant::now());
        for tag in &due {
            self.periodic_sync(tag.clone()).await?;
            self.periodic.lock().await.mark_fired(tag, Instant::now());
        }
        Ok(due)
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn caches(&self) -> &Arc<CacheStorage> {
        &self.caches
    }

    pub fn registration(&self) -> &Arc<RwLock<ServiceWorkerRegistration>> {
        &self.registration
    }

    pub fn clients(&self) -> &Arc<RwLock<Clients>> {
        &self.clients
    }

    /// Open a page. It is controlled by the active worker when it loads in
    /// scope, otherwise it stays uncontrolled until a worker claims it.
    pub async fn open_page(&self, path: &str) -> Result<Client, ServiceWorkerError> {
        let url = self.config.resolve(path)?;
        let mut client = Client::window(url);
        client.controller = self.registration.read().await.controller_for(&client.url);
        self.clients.write().await.add(client.clone());
        Ok(client)
    }

    /// Close a page. A waiting worker activates once the active worker
    /// controls no pages.
    pub async fn close_page(&self, client_id: &str) -> Result<Option<ActivationReport>, ServiceWorkerError> {
        if self.clients.write().await.remove(client_id).is_none() {
            debug!(client = client_id, "Closing unknown client");
        }
        self.activate().await
    }
}
