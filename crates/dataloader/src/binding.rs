use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use crate::cache_key::CacheKey;
use crate::config::LoadConfig;
use crate::controller::StartReason;
use crate::entry::{LoadStatus, SubscriberId};
use crate::error::{LoadError, LoadResult};
use crate::registry::{RegistryInner, Slot};

/// A consumer's live subscription to a cache entry.
///
/// The binding holds the consumer-local configuration and derives the
/// externally visible [`Status`] from the shared entry on demand. Dropping
/// it detaches the subscriber; the entry itself is evicted once its last
/// binding detaches.
pub struct Binding<T>
where
    T: Clone + Send + Sync + 'static,
{
    registry: Arc<RegistryInner<T>>,
    slot: Arc<Slot<T>>,
    id: SubscriberId,
    config: LoadConfig<T>,
    changes: watch::Receiver<u64>,
}

impl<T> Binding<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn attach(
        registry: Arc<RegistryInner<T>>,
        slot: Arc<Slot<T>>,
        id: SubscriberId,
        config: LoadConfig<T>,
    ) -> Self {
        let changes = slot.watch();
        Binding {
            registry,
            slot,
            id,
            config,
            changes,
        }
    }

    /// The canonical key this binding is attached to.
    pub fn key(&self) -> &CacheKey {
        &self.slot.key
    }

    /// Derives the current status snapshot for this binding.
    pub fn status(&self) -> Status<T> {
        let state = self.slot.state.lock().unwrap();
        let polling = self.config.enabled
            && self
                .config
                .polling_interval
                .is_some_and(|interval| !interval.is_zero())
            && self.config.need_polling.evaluate(state.data.as_ref());
        Status {
            data: state.data.clone(),
            previous_data: if self.config.keep_previous_data {
                state.previous_data.clone()
            } else {
                None
            },
            error: state.error.clone(),
            status: state.status,
            polling,
        }
    }

    /// Forces a refetch of the entry, joining a call already in flight.
    /// Works even while the binding is disabled.
    pub async fn reload(&self) -> LoadResult<T> {
        match self.registry.start_load(&self.slot, StartReason::Reload) {
            Ok(shared) => shared.await,
            Err(error) => Err(error),
        }
    }

    /// Replaces this binding's configuration and re-evaluates start and
    /// polling conditions.
    pub fn set_config(&mut self, mut config: LoadConfig<T>) {
        self.registry.apply_defaults(&mut config);
        self.config = config.clone();
        self.registry.update_subscriber(&self.slot, self.id, config);
    }

    /// Flips the enabled flag; turning it on starts a load when the entry
    /// has no usable data.
    pub fn set_enabled(&mut self, enabled: bool) {
        let mut config = self.config.clone();
        config.enabled = enabled;
        self.set_config(config);
    }

    /// The configuration this binding currently runs under.
    pub fn config(&self) -> &LoadConfig<T> {
        &self.config
    }

    /// Waits until the entry changes after the last observed change.
    pub async fn changed(&mut self) {
        let _ = self.changes.changed().await;
    }
}

impl<T> Drop for Binding<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.slot, self.id);
    }
}

impl<T> fmt::Debug for Binding<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", &self.slot.key)
            .field("config", &self.config)
            .finish()
    }
}

/// The externally visible snapshot of an entry, as seen by one binding.
///
/// Exactly one of idle/loading/success/error holds. `previous_data` is
/// surfaced only while the binding keeps previous data, and `is_polling`
/// reflects whether polling is in effect for this binding independent of the
/// momentary load state.
#[derive(Debug, Clone)]
pub struct Status<T> {
    data: Option<T>,
    previous_data: Option<T>,
    error: Option<LoadError>,
    status: LoadStatus,
    polling: bool,
}

impl<T> Status<T> {
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn previous_data(&self) -> Option<&T> {
        self.previous_data.as_ref()
    }

    pub fn error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }

    pub fn status(&self) -> LoadStatus {
        self.status
    }

    pub fn is_idle(&self) -> bool {
        self.status == LoadStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == LoadStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == LoadStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == LoadStatus::Error
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    /// Consumes the snapshot, yielding the data if any.
    pub fn into_data(self) -> Option<T> {
        self.data
    }
}
