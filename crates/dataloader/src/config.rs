use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::LoadError;

/// Callback invoked with freshly loaded data after a successful settlement.
pub type SuccessCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callback invoked with the failure of a settlement.
pub type ErrorCallback = Arc<dyn Fn(&LoadError) + Send + Sync>;

/// Decides whether polling should continue for an entry.
pub enum NeedPolling<T> {
    /// Keep polling for as long as an interval is configured.
    Always,
    /// Never poll, even with an interval configured.
    Never,
    /// Keep polling while the predicate holds for the latest data.
    When(Arc<dyn Fn(&T) -> bool + Send + Sync>),
}

impl<T> NeedPolling<T> {
    /// Creates a predicate variant from a closure.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::When(Arc::new(predicate))
    }

    /// Evaluates against the latest settled data.
    ///
    /// Before anything has loaded there is no data to judge, so a predicate
    /// lets polling continue until it has seen a value.
    pub(crate) fn evaluate(&self, data: Option<&T>) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::When(predicate) => data.map(|data| predicate(data)).unwrap_or(true),
        }
    }
}

impl<T> Clone for NeedPolling<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Always => Self::Always,
            Self::Never => Self::Never,
            Self::When(predicate) => Self::When(Arc::clone(predicate)),
        }
    }
}

impl<T> Default for NeedPolling<T> {
    fn default() -> Self {
        Self::Always
    }
}

impl<T> fmt::Debug for NeedPolling<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("NeedPolling::Always"),
            Self::Never => f.write_str("NeedPolling::Never"),
            Self::When(_) => f.write_str("NeedPolling::When(..)"),
        }
    }
}

/// Per-binding configuration for one subscription to a cache entry.
///
/// Options left unset fall back to the registry-level defaults from
/// [`RegistrySettings`] where one exists.
pub struct LoadConfig<T> {
    /// Automatic loads only happen while the binding is enabled. An explicit
    /// reload runs either way.
    pub enabled: bool,
    /// Surface the previous value while a refetch is in flight.
    pub keep_previous_data: bool,
    /// How long a successful resolution counts as fresh. Without a lifetime,
    /// existing data never triggers a refetch on attach.
    pub data_lifetime: Option<Duration>,
    /// Re-fetch cadence; polling is off without an interval.
    pub polling_interval: Option<Duration>,
    /// Gate re-evaluated against the latest data after every settlement.
    pub need_polling: NeedPolling<T>,
    /// Invoked with the data of every successful settlement.
    pub on_success: Option<SuccessCallback<T>>,
    /// Invoked on failed settlements. When present, the registry-level
    /// default error callback is not.
    pub on_error: Option<ErrorCallback>,
}

impl<T> LoadConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn keep_previous_data(mut self, keep: bool) -> Self {
        self.keep_previous_data = keep;
        self
    }

    pub fn data_lifetime(mut self, lifetime: Duration) -> Self {
        self.data_lifetime = Some(lifetime);
        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    pub fn need_polling(mut self, need_polling: NeedPolling<T>) -> Self {
        self.need_polling = need_polling;
        self
    }

    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LoadError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl<T> Default for LoadConfig<T> {
    fn default() -> Self {
        LoadConfig {
            enabled: true,
            keep_previous_data: false,
            data_lifetime: None,
            polling_interval: None,
            need_polling: NeedPolling::default(),
            on_success: None,
            on_error: None,
        }
    }
}

impl<T> Clone for LoadConfig<T> {
    fn clone(&self) -> Self {
        LoadConfig {
            enabled: self.enabled,
            keep_previous_data: self.keep_previous_data,
            data_lifetime: self.data_lifetime,
            polling_interval: self.polling_interval,
            need_polling: self.need_polling.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

impl<T> fmt::Debug for LoadConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadConfig")
            .field("enabled", &self.enabled)
            .field("keep_previous_data", &self.keep_previous_data)
            .field("data_lifetime", &self.data_lifetime)
            .field("polling_interval", &self.polling_interval)
            .field("need_polling", &self.need_polling)
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Registry-scoped settings, deserializable from the application config.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// Prefix mixed into every canonical key, so independently configured
    /// registries never share entries even for identical logical keys.
    pub cache_key_prefix: Option<String>,
    /// Upper bound on simultaneously executing load functions. Loads beyond
    /// the bound queue up; they are reported as loading while they wait.
    pub max_concurrent_loads: Option<usize>,
    /// Default freshness lifetime for bindings that do not set one.
    #[serde(with = "humantime_serde")]
    pub data_lifetime: Option<Duration>,
    /// Default polling interval for bindings that do not set one.
    #[serde(with = "humantime_serde")]
    pub polling_interval: Option<Duration>,
}

/// Full registry configuration: the deserializable settings plus the
/// registry-level default error callback.
#[derive(Clone, Default)]
pub struct RegistryConfig {
    pub settings: RegistrySettings,
    /// Invoked for failed settlements where no subscriber supplies its own
    /// error callback.
    pub on_error: Option<ErrorCallback>,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.cache_key_prefix = Some(prefix.into());
        self
    }

    pub fn max_concurrent_loads(mut self, limit: usize) -> Self {
        self.settings.max_concurrent_loads = Some(limit);
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LoadError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl From<RegistrySettings> for RegistryConfig {
    fn from(settings: RegistrySettings) -> Self {
        RegistryConfig {
            settings,
            on_error: None,
        }
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("settings", &self.settings)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
