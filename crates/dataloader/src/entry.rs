use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, Shared};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;

use crate::config::LoadConfig;
use crate::error::{LoadError, LoadResult};

/// Externally visible state of a cache entry.
///
/// Exactly one of the four states holds at any instant; an entry is
/// `Loading` iff it has a call in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Idle,
    Loading,
    Success,
    Error,
}

pub(crate) type SubscriberId = u64;

/// The user-supplied load function, type-erased for storage on the entry.
pub(crate) type Fetcher<T> = Arc<dyn Fn() -> BoxFuture<'static, LoadResult<T>> + Send + Sync>;

/// A coalesced in-flight call: every joiner awaits the same execution and
/// settles with the same outcome.
pub(crate) type SharedLoad<T> = Shared<BoxFuture<'static, LoadResult<T>>>;

/// Bookkeeping for the single in-flight call of an entry.
///
/// A detached driver task keeps the shared execution moving, so dropping
/// this (eviction, clear) discards the eventual result without cancelling
/// the user's future.
pub(crate) struct InFlight<T> {
    /// Matches the entry generation at start time; a settlement whose
    /// generation no longer matches is discarded.
    pub generation: u64,
    pub shared: SharedLoad<T>,
}

/// A pending poll timer. Aborted deterministically on cancellation; the
/// serial number resolves abort-versus-fire races under the entry lock.
pub(crate) struct PollTimer {
    pub serial: u64,
    pub handle: JoinHandle<()>,
}

/// The per-key mutable cache record, owned exclusively by the registry.
pub(crate) struct EntryState<T> {
    pub status: LoadStatus,
    pub data: Option<T>,
    pub previous_data: Option<T>,
    pub error: Option<LoadError>,
    pub last_resolved_at: Option<Instant>,
    pub in_flight: Option<InFlight<T>>,
    pub poll_timer: Option<PollTimer>,
    pub poll_serial: u64,
    pub generation: u64,
    /// The most recently supplied load function; polls and reloads use it.
    pub fetcher: Option<Fetcher<T>>,
    pub subscribers: FxHashMap<SubscriberId, LoadConfig<T>>,
}

impl<T> EntryState<T> {
    pub fn new() -> Self {
        EntryState {
            status: LoadStatus::Idle,
            data: None,
            previous_data: None,
            error: None,
            last_resolved_at: None,
            in_flight: None,
            poll_timer: None,
            poll_serial: 0,
            generation: 0,
            fetcher: None,
            subscribers: FxHashMap::default(),
        }
    }

    /// True while any active subscriber wants the previous value retained
    /// across refetches.
    pub fn keeps_previous_data(&self) -> bool {
        self.subscribers
            .values()
            .any(|config| config.keep_previous_data)
    }

    /// The shortest polling interval wanted by any enabled subscriber whose
    /// predicate still holds for the current data, if any.
    pub fn poll_plan(&self) -> Option<Duration> {
        self.subscribers
            .values()
            .filter(|config| config.enabled)
            .filter(|config| config.need_polling.evaluate(self.data.as_ref()))
            .filter_map(|config| config.polling_interval)
            .filter(|interval| !interval.is_zero())
            .min()
    }

    /// Start condition for an automatic (non-forced) load: enabled, nothing
    /// in flight, and either no data or data past its configured lifetime.
    /// Freshness is keyed off successful resolutions only.
    pub fn wants_load(&self, config: &LoadConfig<T>) -> bool {
        if !config.enabled || self.in_flight.is_some() {
            return false;
        }
        match (&self.data, config.data_lifetime) {
            (None, _) => true,
            (Some(_), Some(lifetime)) => self
                .last_resolved_at
                .is_none_or(|at| at.elapsed() > lifetime),
            (Some(_), None) => false,
        }
    }

    pub fn cancel_poll(&mut self) {
        if let Some(timer) = self.poll_timer.take() {
            timer.handle.abort();
        }
    }
}
