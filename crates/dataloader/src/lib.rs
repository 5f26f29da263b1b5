//! # dataloader
//!
//! A client-side cache for asynchronously produced resources. Given a
//! logical key and a function that loads a value, the registry tracks the
//! per-key request state (idle/loading/success/error), deduplicates
//! concurrent requests for the same key, retains previous results across
//! refetches, re-fetches on a schedule ("polling"), and lets any part of the
//! program force a refetch of one key or of all tracked keys.
//!
//! ## Request coalescing
//!
//! Each entry has at most one call in flight at any instant. Whoever asks
//! while a call is running — another binding attaching, a reload, a poll —
//! joins the running call instead of issuing a second one; the execution is
//! a shared future, so every joiner settles with the same outcome. A spawned
//! driver task keeps the call moving even when nobody awaits it, which is
//! why a dropped [`Registry::reload`] future does not cancel anything.
//!
//! ## Entry lifecycle
//!
//! Entries are created on the first subscription to a key and evicted when
//! the last binding detaches, so memory stays bounded by active
//! subscriptions. Keys are canonical encodings of their components
//! ([`CacheKey`]); equal encodings always land on the same live entry, and a
//! registry-level `cache_key_prefix` keeps independently configured
//! registries apart. Calls are ordered by a per-entry generation: once an
//! entry is cleared or evicted, the settlement of a superseded call is
//! discarded rather than applied.
//!
//! ## Polling and freshness
//!
//! After every settlement, success or error, the controller re-evaluates
//! polling against the freshly settled data and arms at most one timer for
//! the shortest interval wanted by the enabled subscribers. `data_lifetime`
//! controls freshness the other way around: while a successful resolution is
//! younger than the lifetime, a new subscription does not refetch.
//!
//! ## Configuration
//!
//! Per-binding options live in [`LoadConfig`]; registry-scoped settings
//! ([`RegistrySettings`]) can be deserialized from the application config
//! and supply defaults plus the key prefix, a concurrency limit for load
//! functions, and the default error callback.

mod binding;
mod cache_key;
mod config;
mod controller;
mod entry;
mod error;
mod registry;

#[cfg(test)]
mod tests;

pub use binding::{Binding, Status};
pub use cache_key::{CacheKey, CacheKeyBuilder, KeyPart};
pub use config::{
    ErrorCallback, LoadConfig, NeedPolling, RegistryConfig, RegistrySettings, SuccessCallback,
};
pub use entry::LoadStatus;
pub use error::{LoadError, LoadResult};
pub use registry::{Registry, ReloadHandle};
