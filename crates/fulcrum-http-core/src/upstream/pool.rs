use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::OnceCell, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};
use url::Url;

use super::{
    client::{UpstreamClient, UpstreamConnector},
    errors::UpstreamError,
};

/// Per-key cell that makes connection creation single-flight.
///
/// Concurrent first-use callers for one server key all wait on the same
/// initialisation; a failed or cancelled initialisation leaves the cell empty and the
/// next waiter retries it on the same slot.
#[derive(Default)]
struct PoolSlot {
    entry: OnceCell<Arc<PoolEntry>>,
}

type Slots = DashMap<String, Arc<PoolSlot>>;

/// A pooled upstream connection and its idle bookkeeping.
pub struct PoolEntry {
    server: String,
    client: Arc<dyn UpstreamClient>,
    last_used: parking_lot::Mutex<Instant>,
    watcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl PoolEntry {
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Pushes the idle deadline forward from now.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    #[must_use]
    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    fn stop_watcher(&self) {
        let watcher = self.watcher.lock().take();
        if let Some(handle) = watcher {
            handle.abort();
        }
    }
}

impl Drop for PoolEntry {
    fn drop(&mut self) {
        if let Some(handle) = self.watcher.get_mut().take() {
            handle.abort();
        }
    }
}

/// Client handle returned by [`PoolManager::get_client`].
///
/// Every successful call counts as a use of the pooled connection and re-arms its
/// idle timer.
#[derive(Clone)]
pub struct PooledClient {
    entry: Arc<PoolEntry>,
}

impl PooledClient {
    #[must_use]
    pub fn server(&self) -> &str {
        &self.entry.server
    }
}

#[async_trait]
impl UpstreamClient for PooledClient {
    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, UpstreamError> {
        debug!(server = %self.entry.server, method, "forwarding call to upstream");
        let result = self.entry.client.request(method, params).await;
        if result.is_ok() {
            self.entry.touch();
        }
        result
    }

    async fn disconnect(&self) {
        self.entry.client.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.entry.client.is_connected()
    }
}

/// Owns one upstream connection per server key and drops it after inactivity.
///
/// # Lifecycle
///
/// - `get_client` creates the connection on first use (single-flight per key) and
///   returns the existing one afterwards, re-arming the idle timer each time.
/// - A watcher task per entry sleeps until `last_used + idle_timeout`; if nothing
///   touched the entry in the meantime it removes the entry and disconnects the
///   client, even if a call is still in flight on it.
/// - A client whose transport has died is discarded and replaced on the next lookup.
///
/// There is no size limit: one entry exists per distinct server key seen within
/// the idle window. Failures for one key never affect entries for other keys.
pub struct PoolManager {
    connector: Arc<dyn UpstreamConnector>,
    idle_timeout: Duration,
    slots: Arc<Slots>,
}

impl PoolManager {
    #[must_use]
    pub fn new(connector: Arc<dyn UpstreamConnector>, idle_timeout: Duration) -> Self {
        Self { connector, idle_timeout, slots: Arc::new(DashMap::new()) }
    }

    /// Returns the pooled client for `server`, connecting if needed.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidServer`] if `server` is not a URL, or whatever
    /// connect error the connector reports. Connect failures are not retried.
    pub async fn get_client(&self, server: &str) -> Result<PooledClient, UpstreamError> {
        let url = Url::parse(server).map_err(|e| UpstreamError::InvalidServer {
            url: server.to_string(),
            reason: e.to_string(),
        })?;

        loop {
            let slot = SlotGuard::acquire(&self.slots, server);

            let entry =
                Arc::clone(slot.slot.entry.get_or_try_init(|| self.open(server, &url)).await?);

            if !entry.client.is_connected() {
                info!(server, "replacing dead upstream connection");
                self.slots.remove_if(server, |_, current| Arc::ptr_eq(current, &slot.slot));
                entry.stop_watcher();
                entry.client.disconnect().await;
                continue;
            }

            entry.touch();
            return Ok(PooledClient { entry });
        }
    }

    /// Re-arms the idle timer for `server` without any other effect.
    pub fn touch(&self, server: &str) {
        let entry = self.slots.get(server).and_then(|slot| slot.entry.get().map(Arc::clone));
        if let Some(entry) = entry {
            entry.touch();
        }
    }

    /// Returns `true` when a live entry exists for `server`.
    #[must_use]
    pub fn contains(&self, server: &str) -> bool {
        self.slots.get(server).is_some_and(|slot| slot.entry.initialized())
    }

    /// Number of established entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.initialized()).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Disconnects and removes every pooled connection.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.slots.iter().map(|slot| slot.key().clone()).collect();
        let mut closed = 0usize;

        for key in keys {
            let Some((_, slot)) = self.slots.remove(&key) else {
                continue;
            };
            if let Some(entry) = slot.entry.get() {
                entry.stop_watcher();
                entry.client.disconnect().await;
                closed += 1;
            }
        }

        info!(closed, "upstream pool shut down");
    }

    async fn open(&self, server: &str, url: &Url) -> Result<Arc<PoolEntry>, UpstreamError> {
        let client = self.connector.connect(url).await.map_err(|e| {
            warn!(server, error = %e, "failed to connect to upstream");
            e
        })?;

        info!(server, "new upstream connection");

        let entry = Arc::new(PoolEntry {
            server: server.to_string(),
            client,
            last_used: parking_lot::Mutex::new(Instant::now()),
            watcher: parking_lot::Mutex::new(None),
        });

        let watcher = tokio::spawn(watch_idle(
            Arc::clone(&self.slots),
            Arc::downgrade(&entry),
            self.idle_timeout,
        ));
        *entry.watcher.lock() = Some(watcher);

        Ok(entry)
    }
}

/// Caller's hold on a slot while it waits for, or runs, the slot's initialisation.
///
/// Dropping the guard removes the slot when its cell is still empty and no other
/// caller holds it. This covers failed connects and callers cancelled mid-connect,
/// while a slot some waiter is about to initialise stays reachable from the map.
struct SlotGuard<'a> {
    slots: &'a Slots,
    server: &'a str,
    slot: Arc<PoolSlot>,
}

impl<'a> SlotGuard<'a> {
    fn acquire(slots: &'a Slots, server: &'a str) -> Self {
        // Cloned under the shard lock so `strong_count` in `drop` sees every holder.
        let slot =
            Arc::clone(slots.entry(server.to_string()).or_insert_with(Arc::default).value());
        Self { slots, server, slot }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        // Two holders: the map and this guard.
        self.slots.remove_if(self.server, |_, current| {
            Arc::ptr_eq(current, &self.slot)
                && Arc::strong_count(current) == 2
                && current.entry.get().is_none()
        });
    }
}

/// Evicts `entry` once it has gone `idle_timeout` without a touch.
async fn watch_idle(slots: Arc<Slots>, entry: Weak<PoolEntry>, idle_timeout: Duration) {
    loop {
        let Some(deadline) = entry.upgrade().map(|entry| entry.last_used() + idle_timeout) else {
            return;
        };

        tokio::time::sleep_until(deadline).await;

        let Some(current) = entry.upgrade() else {
            return;
        };
        if current.last_used() + idle_timeout > Instant::now() {
            continue;
        }

        slots.remove_if(&current.server, |_, slot| {
            slot.entry.get().is_some_and(|pooled| Arc::ptr_eq(pooled, &current))
        });

        info!(server = %current.server, "dropping inactive upstream connection");
        current.client.disconnect().await;
        return;
    }
}
