//! Open pages in the worker's origin and which worker version controls them.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use tracing::debug;
use url::Url;

use crate::registration::ServiceWorkerId;

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

/// An open page.
#[derive(Debug, Clone, PartialEq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    /// Brought to the foreground by the worker, e.g. from a notification click.
    pub focused: bool,
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// Uncontrolled, unfocused page at `url`.
    pub fn window(url: Url) -> Self {
        Self {
            id: format!("client-{:04}", NEXT_CLIENT.fetch_add(1, Ordering::Relaxed)),
            url,
            focused: false,
            controller: None,
        }
    }
}

/// Whether `url` falls under the registration `scope`.
pub(crate) fn in_scope(url: &Url, scope: &Url) -> bool {
    url.origin() == scope.origin() && url.path().starts_with(scope.path())
}

#[derive(Debug, Default)]
pub struct Clients {
    pages: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.pages.get(id)
    }

    /// Pages controlled by `worker`, ordered by id.
    pub fn controlled(&self, worker: ServiceWorkerId) -> Vec<&Client> {
        let mut pages: Vec<&Client> = self
            .pages
            .values()
            .filter(|c| c.controller == Some(worker))
            .collect();
        pages.sort_by(|a, b| a.id.cmp(&b.id));
        pages
    }

    pub fn controlled_by(&self, worker: ServiceWorkerId) -> usize {
        self.pages.values().filter(|c| c.controller == Some(worker)).count()
    }

    /// Open a focused page. A page loaded while a worker is active starts
    /// out controlled by it.
    pub fn open_window(&mut self, url: Url, controller: Option<ServiceWorkerId>) -> Client {
        let mut client = Client::window(url);
        client.focused = true;
        client.controller = controller;
        debug!(client = %client.id, url = %client.url, controller = ?controller, "Opened window client");
        self.add(client.clone());
        client
    }

    /// Make `worker` the controller of every page under `scope`. Returns the
    /// ids of pages whose controller changed, sorted.
    pub fn claim(&mut self, worker: ServiceWorkerId, scope: &Url) -> Vec<String> {
        let mut changed = Vec::new();
        for client in self.pages.values_mut() {
            if in_scope(&client.url, scope) && client.controller != Some(worker) {
                client.controller = Some(worker);
                changed.push(client.id.clone());
            }
        }
        changed.sort();
        changed
    }

    pub fn add(&mut self, client: Client) {
        self.pages.insert(client.id.clone(), client);
    }

    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.pages.remove(id)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}
