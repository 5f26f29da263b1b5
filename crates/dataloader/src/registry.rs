use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::join_all;
use rustc_hash::FxHashMap;
use tokio::sync::{Semaphore, watch};

use crate::binding::Binding;
use crate::cache_key::CacheKey;
use crate::config::{LoadConfig, RegistryConfig};
use crate::controller::StartReason;
use crate::entry::{EntryState, Fetcher, LoadStatus, SubscriberId};
use crate::error::{LoadError, LoadResult};

/// One tracked key and its mutable entry record.
pub(crate) struct Slot<T> {
    pub key: CacheKey,
    pub state: Mutex<EntryState<T>>,
    changes: watch::Sender<u64>,
}

impl<T> Slot<T> {
    fn new(key: CacheKey) -> Self {
        Slot {
            key,
            state: Mutex::new(EntryState::new()),
            changes: watch::channel(0).0,
        }
    }

    /// Wakes every binding watching this entry.
    pub(crate) fn publish(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }
}

pub(crate) struct RegistryInner<T> {
    pub(crate) config: RegistryConfig,
    pub(crate) limiter: Option<Arc<Semaphore>>,
    slots: Mutex<FxHashMap<CacheKey, Arc<Slot<T>>>>,
    next_subscriber: AtomicU64,
}

/// Process-local mapping from canonical keys to live cache entries.
///
/// The registry owns entry creation and eviction, deduplicates concurrent
/// requests per entry, and exposes the reload broadcast surface. It is an
/// explicitly constructed, explicitly scoped object: independent registries
/// coexist, and a `cache_key_prefix` keeps their entries apart even for
/// identical logical keys. Cloning returns another handle to the same
/// registry.
pub struct Registry<T> {
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Registry {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Registry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    pub fn with_config(config: RegistryConfig) -> Self {
        let limiter = config
            .settings
            .max_concurrent_loads
            .map(|limit| Arc::new(Semaphore::new(limit.max(1))));
        Registry {
            inner: Arc::new(RegistryInner {
                config,
                limiter,
                slots: Mutex::default(),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Attaches a consumer to `key`, creating the entry on first
    /// subscription and joining the live one otherwise.
    ///
    /// The load starts immediately when the binding is enabled and the entry
    /// has no fresh data; concurrent bindings for the same key share a
    /// single execution. Dropping the binding detaches it.
    pub fn bind<K, F, Fut>(&self, key: K, fetch: F, config: LoadConfig<T>) -> Binding<T>
    where
        K: Into<CacheKey>,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = LoadResult<T>> + Send + 'static,
    {
        let fetcher: Fetcher<T> = Arc::new(move || fetch().boxed());
        self.bind_erased(key.into(), fetcher, config)
    }

    fn bind_erased(&self, key: CacheKey, fetcher: Fetcher<T>, mut config: LoadConfig<T>) -> Binding<T> {
        self.inner.apply_defaults(&mut config);
        let key = self.inner.scoped_key(&key);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let slot = {
            let mut slots = self.inner.slots.lock().unwrap();
            let slot = slots
                .entry(key.clone())
                .or_insert_with(|| {
                    tracing::debug!(key = %key, "creating cache entry");
                    Arc::new(Slot::new(key.clone()))
                })
                .clone();
            let mut state = slot.state.lock().unwrap();
            state.fetcher = Some(fetcher);
            state.subscribers.insert(id, config.clone());
            drop(state);
            slot
        };

        let wants_load = slot.state.lock().unwrap().wants_load(&config);
        if wants_load {
            let _ = self.inner.start_load(&slot, StartReason::Subscribe);
        } else {
            // A new subscriber can switch polling on for a settled entry.
            let mut state = slot.state.lock().unwrap();
            self.inner.arm_poll(&slot, &mut state);
        }

        Binding::attach(Arc::clone(&self.inner), slot, id, config)
    }

    /// Forces a refetch of `key` even when fresh data exists. A call already
    /// in flight is joined rather than duplicated, so back-to-back reloads
    /// observe one underlying execution.
    ///
    /// The returned future may be dropped without cancelling the load; the
    /// outcome still settles the entry and reaches its subscribers.
    pub async fn reload<K: Into<CacheKey>>(&self, key: K) -> LoadResult<T> {
        let key = self.inner.scoped_key(&key.into());
        self.inner.reload_scoped(&key).await
    }

    /// Reloads every key tracked at call time and resolves once all of the
    /// reloads settle, yielding the per-key outcomes. Keys added while the
    /// reloads run are not included.
    pub async fn reload_all(&self) -> Vec<(CacheKey, LoadResult<T>)> {
        let slots: Vec<Arc<Slot<T>>> = self.inner.slots.lock().unwrap().values().cloned().collect();
        let mut loads = Vec::with_capacity(slots.len());
        for slot in slots {
            let load = self.inner.start_load(&slot, StartReason::Reload);
            loads.push(async move {
                let outcome = match load {
                    Ok(shared) => shared.await,
                    Err(error) => Err(error),
                };
                (slot.key.clone(), outcome)
            });
        }
        join_all(loads).await
    }

    /// Reload triggers for every tracked key, for callers that need to force
    /// a refresh of a known entry without subscribing to it.
    pub fn reload_handles(&self) -> FxHashMap<CacheKey, ReloadHandle<T>> {
        self.inner
            .slots
            .lock()
            .unwrap()
            .keys()
            .map(|key| {
                let handle = ReloadHandle {
                    registry: Arc::downgrade(&self.inner),
                    key: key.clone(),
                };
                (key.clone(), handle)
            })
            .collect()
    }

    /// The current data of a tracked key, without subscribing.
    pub fn cached_data<K: Into<CacheKey>>(&self, key: K) -> Option<T> {
        let key = self.inner.scoped_key(&key.into());
        let slot = self.inner.slots.lock().unwrap().get(&key).cloned()?;
        let state = slot.state.lock().unwrap();
        state.data.clone()
    }

    /// Canonical keys of all live entries.
    pub fn tracked_keys(&self) -> Vec<CacheKey> {
        self.inner.slots.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.slots.lock().unwrap().is_empty()
    }

    /// Drops every cached value and cancels all timers.
    ///
    /// Entries without subscribers are evicted outright. Entries that still
    /// have bindings attached are reset to idle, and the eventual settlement
    /// of any orphaned in-flight call is discarded.
    pub fn clear(&self) {
        let mut slots = self.inner.slots.lock().unwrap();
        slots.retain(|_, slot| {
            let mut state = slot.state.lock().unwrap();
            state.cancel_poll();
            state.generation += 1;
            state.in_flight = None;
            state.status = LoadStatus::Idle;
            state.data = None;
            state.previous_data = None;
            state.error = None;
            state.last_resolved_at = None;
            let keep = !state.subscribers.is_empty();
            drop(state);
            if keep {
                slot.publish();
            }
            keep
        });
        tracing::debug!(remaining = slots.len(), "cleared cached data");
    }
}

impl<T> fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.slots.lock().map(|slots| slots.len()).unwrap_or_default();
        f.debug_struct("Registry")
            .field("config", &self.inner.config)
            .field("entries", &entries)
            .finish()
    }
}

impl<T> RegistryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn scoped_key(&self, key: &CacheKey) -> CacheKey {
        match &self.config.settings.cache_key_prefix {
            Some(prefix) => key.scoped(prefix),
            None => key.clone(),
        }
    }

    pub(crate) fn apply_defaults(&self, config: &mut LoadConfig<T>) {
        let defaults = &self.config.settings;
        if config.data_lifetime.is_none() {
            config.data_lifetime = defaults.data_lifetime;
        }
        if config.polling_interval.is_none() {
            config.polling_interval = defaults.polling_interval;
        }
    }

    pub(crate) async fn reload_scoped(self: &Arc<Self>, key: &CacheKey) -> LoadResult<T> {
        let slot = self.slots.lock().unwrap().get(key).cloned();
        let Some(slot) = slot else {
            return Err(LoadError::NotTracked);
        };
        self.start_load(&slot, StartReason::Reload)?.await
    }

    /// Replaces a subscriber's configuration and re-evaluates start and
    /// polling conditions under the new one.
    pub(crate) fn update_subscriber(
        self: &Arc<Self>,
        slot: &Arc<Slot<T>>,
        id: SubscriberId,
        config: LoadConfig<T>,
    ) {
        let mut state = slot.state.lock().unwrap();
        state.subscribers.insert(id, config.clone());
        if state.wants_load(&config) {
            drop(state);
            let _ = self.start_load(slot, StartReason::Subscribe);
        } else {
            self.arm_poll(slot, &mut state);
            drop(state);
            slot.publish();
        }
    }

    /// Detaches a subscriber; the entry is evicted once the last one leaves.
    /// An in-flight call of an evicted entry runs to completion, but its
    /// settlement is discarded.
    pub(crate) fn unsubscribe(self: &Arc<Self>, slot: &Arc<Slot<T>>, id: SubscriberId) {
        let mut slots = self.slots.lock().unwrap();
        let mut state = slot.state.lock().unwrap();
        state.subscribers.remove(&id);
        if state.subscribers.is_empty() {
            state.cancel_poll();
            state.generation += 1;
            state.in_flight = None;
            slots.remove(&slot.key);
            tracing::debug!(key = %slot.key, "evicting cache entry");
        } else {
            // The departing subscriber may have been the only one polling.
            self.arm_poll(slot, &mut state);
        }
    }
}

/// A reload trigger for one tracked key, detached from any subscription.
pub struct ReloadHandle<T> {
    registry: Weak<RegistryInner<T>>,
    key: CacheKey,
}

impl<T> ReloadHandle<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The canonical key this handle refreshes.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Forces a refetch of the entry, joining an in-flight call if present.
    /// Fails with [`LoadError::NotTracked`] once the entry or the registry
    /// is gone.
    pub async fn reload(&self) -> LoadResult<T> {
        let Some(registry) = self.registry.upgrade() else {
            return Err(LoadError::NotTracked);
        };
        registry.reload_scoped(&self.key).await
    }
}

impl<T> Clone for ReloadHandle<T> {
    fn clone(&self) -> Self {
        ReloadHandle {
            registry: Weak::clone(&self.registry),
            key: self.key.clone(),
        }
    }
}

impl<T> fmt::Debug for ReloadHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadHandle").field("key", &self.key).finish()
    }
}
