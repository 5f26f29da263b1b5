//! The per-entry request controller: starting and coalescing calls, applying
//! settlements, and scheduling polls.
//!
//! All mutation of an entry happens under its lock and runs to completion
//! before another step for the same entry can begin. User callbacks and
//! change notifications fire only after the lock is released, so a callback
//! may itself call back into the registry.

use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::entry::{EntryState, InFlight, LoadStatus, PollTimer, SharedLoad};
use crate::error::{LoadError, LoadResult};
use crate::registry::{RegistryInner, Slot};

/// Why a load is being started. Reloads and polls bypass freshness checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartReason {
    Subscribe,
    Reload,
    Poll,
}

impl<T> RegistryInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Starts a call for the entry, or joins the one already in flight.
    ///
    /// At most one underlying execution exists per entry at any instant; the
    /// returned future is shared between every caller that joined it, and a
    /// spawned driver keeps it moving even when no caller awaits it.
    pub(crate) fn start_load(
        self: &Arc<Self>,
        slot: &Arc<Slot<T>>,
        reason: StartReason,
    ) -> LoadResult<SharedLoad<T>> {
        let mut state = slot.state.lock().unwrap();
        if let Some(in_flight) = &state.in_flight {
            tracing::trace!(key = %slot.key, ?reason, "joining in-flight load");
            return Ok(in_flight.shared.clone());
        }
        let Some(fetcher) = state.fetcher.clone() else {
            return Err(LoadError::NotTracked);
        };

        state.generation += 1;
        let generation = state.generation;

        // Stage the previous value now so it is observable for the whole
        // loading phase of a refetch. The current data stays visible too,
        // until the settlement replaces or clears it.
        if state.data.is_some() && state.keeps_previous_data() {
            state.previous_data = state.data.clone();
        }
        state.status = LoadStatus::Loading;
        // A pending poll would only re-trigger what is starting right now.
        state.cancel_poll();

        let registry = Arc::clone(self);
        let load_slot = Arc::clone(slot);
        let limiter = self.limiter.clone();
        let future = async move {
            let _permit = match limiter {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return Err(LoadError::InternalError),
                },
                None => None,
            };
            let outcome = fetcher().await;
            registry.settle(&load_slot, generation, outcome.clone());
            outcome
        };
        let shared: SharedLoad<T> = future.boxed().shared();
        tokio::spawn({
            let shared = shared.clone();
            async move {
                let _ = shared.await;
            }
        });
        state.in_flight = Some(InFlight {
            generation,
            shared: shared.clone(),
        });
        drop(state);

        tracing::debug!(key = %slot.key, ?reason, generation, "starting load");
        slot.publish();
        Ok(shared)
    }

    /// Applies a call's outcome to its entry and notifies subscribers.
    ///
    /// A superseded generation (the entry was cleared or evicted while the
    /// call was in flight) leaves the entry untouched.
    pub(crate) fn settle(self: &Arc<Self>, slot: &Arc<Slot<T>>, generation: u64, outcome: LoadResult<T>) {
        let mut state = slot.state.lock().unwrap();
        if state
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.generation)
            != Some(generation)
        {
            tracing::trace!(key = %slot.key, generation, "discarding superseded load result");
            return;
        }
        state.in_flight = None;

        match outcome {
            Ok(data) => {
                state.status = LoadStatus::Success;
                state.error = None;
                state.data = Some(data.clone());
                state.last_resolved_at = Some(Instant::now());
                let callbacks: Vec<_> = state
                    .subscribers
                    .values()
                    .filter_map(|config| config.on_success.clone())
                    .collect();

                self.arm_poll(slot, &mut state);
                drop(state);
                slot.publish();
                for callback in callbacks {
                    callback(&data);
                }
            }
            Err(error) => {
                tracing::debug!(key = %slot.key, %error, "load failed");
                state.status = LoadStatus::Error;
                state.data = None;
                state.error = Some(error.clone());
                let mut callbacks: Vec<_> = state
                    .subscribers
                    .values()
                    .filter_map(|config| config.on_error.clone())
                    .collect();
                if callbacks.is_empty() {
                    callbacks.extend(self.config.on_error.clone());
                }

                self.arm_poll(slot, &mut state);
                drop(state);
                slot.publish();
                for callback in callbacks {
                    callback(&error);
                }
            }
        }
    }

    /// Schedules, or cancels, the entry's single poll timer based on the
    /// current subscriber set and the freshly settled data.
    ///
    /// Must be called with the entry lock held.
    pub(crate) fn arm_poll(self: &Arc<Self>, slot: &Arc<Slot<T>>, state: &mut EntryState<T>) {
        let plan = state.poll_plan();
        state.cancel_poll();
        let Some(interval) = plan else { return };
        if state.in_flight.is_some() {
            // The settlement of the running call re-evaluates.
            return;
        }
        if !matches!(state.status, LoadStatus::Success | LoadStatus::Error) {
            return;
        }

        state.poll_serial += 1;
        let serial = state.poll_serial;
        let registry = Arc::clone(self);
        let poll_slot = Arc::clone(slot);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            registry.poll_fire(&poll_slot, serial);
        });
        state.poll_timer = Some(PollTimer { serial, handle });
        tracing::trace!(key = %slot.key, ?interval, "armed poll timer");
    }

    /// Timer expiry: re-checks that polling is still wanted, then forces a
    /// refetch.
    fn poll_fire(self: &Arc<Self>, slot: &Arc<Slot<T>>, serial: u64) {
        {
            let mut state = slot.state.lock().unwrap();
            if state.poll_timer.as_ref().map(|timer| timer.serial) != Some(serial) {
                return;
            }
            state.poll_timer = None;
            if state.in_flight.is_some() || state.poll_plan().is_none() {
                return;
            }
        }
        if let Err(error) = self.start_load(slot, StartReason::Poll) {
            tracing::debug!(key = %slot.key, %error, "poll refetch not started");
        }
    }
}
