use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::test;
use crate::{
    CacheKey, KeyPart, LoadConfig, LoadError, NeedPolling, Registry, RegistryConfig,
};

const FETCH_DELAY: Duration = Duration::from_millis(50);

/// Counts invocations of the load functions it is shared with.
#[derive(Clone, Default)]
struct Counter(Arc<AtomicUsize>);

impl Counter {
    fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct User {
    name: String,
}

#[tokio::test]
async fn test_initial_load_lifecycle() {
    test::setup();
    let registry = Registry::new();

    let binding = registry.bind(
        "user",
        || async {
            tokio::time::sleep(FETCH_DELAY).await;
            Ok(User {
                name: "john".to_owned(),
            })
        },
        LoadConfig::new(),
    );

    let status = binding.status();
    assert!(status.is_loading());
    assert_eq!(status.data(), None);
    assert_eq!(status.previous_data(), None);

    wait_until(|| binding.status().is_success()).await;
    let status = binding.status();
    assert_eq!(status.data().unwrap().name, "john");
    assert!(!status.is_loading());
    assert_eq!(status.error(), None);
}

#[tokio::test]
async fn test_equal_keys_share_one_entry() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let key = || {
        CacheKey::from_parts([
            KeyPart::from("base"),
            KeyPart::List(vec![KeyPart::from("page"), KeyPart::from(10i64)]),
        ])
    };
    let flat_key = CacheKey::from_parts([
        KeyPart::from("base"),
        KeyPart::from("page"),
        KeyPart::from(10i64),
    ]);

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(FETCH_DELAY).await;
                Ok(calls.bump())
            }
        }
    };

    let first = registry.bind(key(), fetch.clone(), LoadConfig::new());
    let second = registry.bind(key(), fetch.clone(), LoadConfig::new());
    let third = registry.bind(flat_key, fetch, LoadConfig::new());

    assert_eq!(registry.len(), 1);
    wait_until(|| first.status().is_success()).await;
    assert!(second.status().is_success());
    assert!(third.status().is_success());
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_distinct_empty_like_keys_get_distinct_entries() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };

    let null = registry.bind(CacheKey::from(KeyPart::Null), fetch.clone(), LoadConfig::new());
    let unset = registry.bind(CacheKey::from(KeyPart::Unset), fetch.clone(), LoadConfig::new());
    let falsy = registry.bind(
        CacheKey::from(KeyPart::Bool(false)),
        fetch,
        LoadConfig::new(),
    );

    assert_eq!(registry.len(), 3);
    wait_until(|| null.status().is_success()).await;
    wait_until(|| unset.status().is_success()).await;
    wait_until(|| falsy.status().is_success()).await;
    assert_eq!(calls.count(), 3);
}

#[tokio::test]
async fn test_concurrent_bindings_share_one_call() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(FETCH_DELAY).await;
                Ok(calls.bump())
            }
        }
    };

    let bindings: Vec<_> = (0..3)
        .map(|_| registry.bind("shared", fetch.clone(), LoadConfig::new()))
        .collect();

    for binding in &bindings {
        assert!(binding.status().is_loading());
    }
    wait_until(|| bindings[0].status().is_success()).await;
    for binding in &bindings {
        assert_eq!(binding.status().data(), Some(&1));
    }
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_back_to_back_reloads_coalesce() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(FETCH_DELAY).await;
                Ok(calls.bump())
            }
        }
    };

    let binding = registry.bind("reloaded", fetch, LoadConfig::new());
    wait_until(|| binding.status().is_success()).await;
    assert_eq!(calls.count(), 1);

    let (first, second) = tokio::join!(binding.reload(), binding.reload());
    assert_eq!(first, Ok(2));
    assert_eq!(second, Ok(2));
    assert_eq!(calls.count(), 2);
    assert!(binding.status().is_success());
}

#[tokio::test]
async fn test_data_lifetime_controls_refetch_on_attach() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();
    let lifetime = Duration::from_millis(100);

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };
    let config = || LoadConfig::new().data_lifetime(lifetime);

    let first = registry.bind("fresh", fetch.clone(), config());
    wait_until(|| first.status().is_success()).await;
    assert_eq!(calls.count(), 1);

    // Well within the lifetime: the new subscription reuses the fresh data.
    let second = registry.bind("fresh", fetch.clone(), config());
    assert!(second.status().is_success());
    assert_eq!(calls.count(), 1);

    tokio::time::sleep(lifetime * 2).await;

    let third = registry.bind("fresh", fetch, config());
    wait_until(|| calls.count() == 2).await;
    wait_until(|| third.status().is_success()).await;
}

#[tokio::test]
async fn test_no_lifetime_means_data_never_goes_stale() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };

    let first = registry.bind("stable", fetch.clone(), LoadConfig::new());
    wait_until(|| first.status().is_success()).await;

    let second = registry.bind("stable", fetch, LoadConfig::new());
    assert!(second.status().is_success());
    assert_eq!(second.status().data(), Some(&1));
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_keep_previous_data_through_reload() {
    test::setup();
    let registry = Registry::new();
    let source = Arc::new(Mutex::new("alpha".to_owned()));

    let fetch = {
        let source = Arc::clone(&source);
        move || {
            let source = Arc::clone(&source);
            async move {
                tokio::time::sleep(FETCH_DELAY).await;
                Ok(source.lock().unwrap().clone())
            }
        }
    };

    let binding = registry.bind("page", fetch, LoadConfig::new().keep_previous_data(true));
    wait_until(|| binding.status().is_success()).await;
    let status = binding.status();
    assert_eq!(status.data().map(String::as_str), Some("alpha"));
    assert_eq!(status.previous_data(), None);

    *source.lock().unwrap() = "beta".to_owned();

    // Kick off the reload without awaiting it; dropping the returned future
    // must not cancel the underlying call.
    let pending = tokio::time::timeout(Duration::from_millis(10), binding.reload()).await;
    assert!(pending.is_err());

    let status = binding.status();
    assert!(status.is_loading());
    assert_eq!(status.data().map(String::as_str), Some("alpha"));
    assert_eq!(status.previous_data().map(String::as_str), Some("alpha"));

    wait_until(|| binding.status().is_success()).await;
    let status = binding.status();
    assert_eq!(status.data().map(String::as_str), Some("beta"));
    assert_eq!(status.previous_data().map(String::as_str), Some("alpha"));
}

#[tokio::test]
async fn test_previous_data_hidden_without_keep_previous_data() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };

    let binding = registry.bind("page", fetch, LoadConfig::new());
    wait_until(|| binding.status().is_success()).await;

    binding.reload().await.unwrap();
    let status = binding.status();
    assert!(status.is_success());
    assert_eq!(status.previous_data(), None);
}

#[tokio::test]
async fn test_error_then_successful_reload() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                match calls.bump() {
                    1 => Err(LoadError::failed("boom")),
                    n => Ok(n),
                }
            }
        }
    };

    let binding = registry.bind("flaky", fetch, LoadConfig::new());
    wait_until(|| binding.status().is_error()).await;
    let status = binding.status();
    assert_eq!(status.error(), Some(&LoadError::Failed("boom".into())));
    assert_eq!(status.data(), None);

    let reloaded = binding.reload().await;
    assert_eq!(reloaded, Ok(2));
    let status = binding.status();
    assert!(status.is_success());
    assert_eq!(status.error(), None);
    assert_eq!(status.data(), Some(&2));
}

#[tokio::test]
async fn test_error_retains_previous_data() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                match calls.bump() {
                    1 => Ok("alpha".to_owned()),
                    _ => Err(LoadError::failed("boom")),
                }
            }
        }
    };

    let binding = registry.bind("page", fetch, LoadConfig::new().keep_previous_data(true));
    wait_until(|| binding.status().is_success()).await;

    let outcome = binding.reload().await;
    assert_eq!(outcome, Err(LoadError::Failed("boom".into())));
    let status = binding.status();
    assert!(status.is_error());
    assert_eq!(status.data(), None);
    assert_eq!(status.previous_data().map(String::as_str), Some("alpha"));
}

#[tokio::test]
async fn test_disabled_binding_stays_idle_until_enabled() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };

    let mut binding = registry.bind("gated", fetch, LoadConfig::new().enabled(false));
    assert!(binding.status().is_idle());

    tokio::time::sleep(FETCH_DELAY).await;
    assert!(binding.status().is_idle());
    assert_eq!(calls.count(), 0);

    binding.set_enabled(true);
    wait_until(|| binding.status().is_success()).await;
    assert_eq!(calls.count(), 1);
    assert_eq!(binding.status().data(), Some(&1));
}

#[tokio::test]
async fn test_reload_runs_while_disabled() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };

    let binding = registry.bind("gated", fetch, LoadConfig::new().enabled(false));
    assert!(binding.status().is_idle());

    let outcome = binding.reload().await;
    assert_eq!(outcome, Ok(1));
    assert!(binding.status().is_success());
    assert_eq!(calls.count(), 1);
}

#[tokio::test]
async fn test_polling_repeats_until_predicate_fails() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };
    let config = LoadConfig::new()
        .polling_interval(Duration::from_millis(30))
        .need_polling(NeedPolling::when(|count: &usize| *count < 3));

    let binding = registry.bind("watched", fetch, config);
    // Nothing has settled yet, so the predicate keeps polling alive.
    assert!(binding.status().is_polling());

    wait_until(|| calls.count() == 3).await;
    wait_until(|| binding.status().is_success()).await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(calls.count(), 3);
    let status = binding.status();
    assert_eq!(status.data(), Some(&3));
    assert!(!status.is_polling());
}

#[tokio::test]
async fn test_no_polling_without_interval() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };
    let config = LoadConfig::new().need_polling(NeedPolling::<usize>::Always);

    let binding = registry.bind("static", fetch, config);
    assert!(!binding.status().is_polling());

    wait_until(|| binding.status().is_success()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.count(), 1);
    assert!(!binding.status().is_polling());
}

#[tokio::test]
async fn test_reload_all_joins_in_flight_calls() {
    test::setup();
    let registry = Registry::new();
    let calls_a = Counter::default();
    let calls_b = Counter::default();

    let slow_fetch = |calls: &Counter| {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(FETCH_DELAY).await;
                Ok(calls.bump())
            }
        }
    };

    let binding_a = registry.bind("a", slow_fetch(&calls_a), LoadConfig::new());
    let binding_b = registry.bind("b", slow_fetch(&calls_b), LoadConfig::new());
    wait_until(|| binding_a.status().is_success() && binding_b.status().is_success()).await;

    let (reloaded, all) = tokio::join!(binding_a.reload(), registry.reload_all());
    assert_eq!(reloaded, Ok(2));
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|(_, outcome)| outcome.is_ok()));

    // The reload of "a" was already in flight and must not run twice.
    assert_eq!(calls_a.count(), 2);
    assert_eq!(calls_b.count(), 2);
}

#[tokio::test]
async fn test_reload_handles_refresh_without_subscription() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };

    let binding = registry.bind("handled", fetch, LoadConfig::new());
    wait_until(|| binding.status().is_success()).await;

    let handles = registry.reload_handles();
    assert_eq!(handles.len(), 1);
    let handle = handles.values().next().unwrap();
    assert_eq!(handle.reload().await, Ok(2));
    assert_eq!(binding.status().data(), Some(&2));
}

#[tokio::test]
async fn test_reload_of_untracked_key_fails() {
    test::setup();
    let registry: Registry<usize> = Registry::new();
    assert_eq!(registry.reload("nope").await, Err(LoadError::NotTracked));
}

#[tokio::test]
async fn test_provider_default_error_callback() {
    test::setup();
    let default_errors = Counter::default();
    let registry = Registry::with_config({
        let default_errors = default_errors.clone();
        RegistryConfig::new().on_error(move |_| {
            default_errors.bump();
        })
    });

    let failing = || async { Err::<usize, _>(LoadError::failed("boom")) };

    let binding = registry.bind("plain", failing, LoadConfig::new());
    wait_until(|| binding.status().is_error()).await;
    assert_eq!(default_errors.count(), 1);

    // A subscriber-level callback fully overrides the provider default.
    let own_errors = Counter::default();
    let config = {
        let own_errors = own_errors.clone();
        LoadConfig::new().on_error(move |_| {
            own_errors.bump();
        })
    };
    let overriding = registry.bind("overridden", failing, config);
    wait_until(|| overriding.status().is_error()).await;
    assert_eq!(own_errors.count(), 1);
    assert_eq!(default_errors.count(), 1);
}

#[tokio::test]
async fn test_on_success_callback() {
    test::setup();
    let registry = Registry::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let config = {
        let seen = Arc::clone(&seen);
        LoadConfig::new().on_success(move |value: &usize| {
            seen.lock().unwrap().push(*value);
        })
    };

    let binding = registry.bind("observed", || async { Ok(7usize) }, config);
    wait_until(|| binding.status().is_success()).await;
    assert_eq!(seen.lock().unwrap().as_slice(), &[7]);
}

#[tokio::test]
async fn test_key_prefix_isolates_registries() {
    test::setup();
    let calls_a = Counter::default();
    let calls_b = Counter::default();

    let registry_a = Registry::with_config(RegistryConfig::new().cache_key_prefix("tenant-a"));
    let registry_b = Registry::with_config(RegistryConfig::new().cache_key_prefix("tenant-b"));

    let fetch = |calls: &Counter, value: usize| {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move {
                calls.bump();
                Ok(value)
            }
        }
    };

    let binding_a = registry_a.bind("user", fetch(&calls_a, 1), LoadConfig::new());
    let binding_b = registry_b.bind("user", fetch(&calls_b, 2), LoadConfig::new());

    wait_until(|| binding_a.status().is_success() && binding_b.status().is_success()).await;
    assert_eq!(calls_a.count(), 1);
    assert_eq!(calls_b.count(), 1);
    assert_eq!(registry_a.cached_data("user"), Some(1));
    assert_eq!(registry_b.cached_data("user"), Some(2));
}

#[tokio::test]
async fn test_max_concurrent_loads_serializes_execution() -> Result<()> {
    test::setup();
    let registry = Registry::with_config(RegistryConfig::new().max_concurrent_loads(1));
    let active = Arc::new(AtomicUsize::new(0));
    let overlapped = Arc::new(AtomicBool::new(false));

    let fetch = {
        let active = Arc::clone(&active);
        let overlapped = Arc::clone(&overlapped);
        move || {
            let active = Arc::clone(&active);
            let overlapped = Arc::clone(&overlapped);
            async move {
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlapped.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }
    };

    let first = registry.bind("one", fetch.clone(), LoadConfig::new());
    let second = registry.bind("two", fetch, LoadConfig::new());

    // Both report loading while the second call waits for the permit.
    assert!(first.status().is_loading());
    assert!(second.status().is_loading());

    wait_until(|| first.status().is_success() && second.status().is_success()).await;
    assert!(!overlapped.load(Ordering::SeqCst));
    Ok(())
}

#[tokio::test]
async fn test_clear_resets_entries_and_stops_polling() {
    test::setup();
    let registry = Registry::new();
    let calls = Counter::default();

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };
    let config = LoadConfig::new().polling_interval(Duration::from_millis(25));

    let binding = registry.bind("polled", fetch, config);
    wait_until(|| calls.count() >= 2).await;

    registry.clear();
    let settled = calls.count();
    assert!(binding.status().is_idle());
    assert_eq!(binding.status().data(), None);

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(calls.count(), settled);
}

#[tokio::test]
async fn test_superseded_result_is_discarded() {
    test::setup();
    let registry = Registry::new();

    let binding = registry.bind(
        "raced",
        || async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok("old".to_owned())
        },
        LoadConfig::new(),
    );
    assert!(binding.status().is_loading());

    tokio::time::sleep(Duration::from_millis(10)).await;
    registry.clear();

    // The in-flight call runs to completion, but its settlement no longer
    // belongs to the entry.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(binding.status().is_idle());
    assert_eq!(binding.status().data(), None);

    let reloaded = binding.reload().await;
    assert_eq!(reloaded, Ok("old".to_owned()));
    assert!(binding.status().is_success());
}

#[tokio::test]
async fn test_entry_evicted_when_last_binding_detaches() {
    test::setup();
    let registry = Registry::new();

    let binding = registry.bind("short-lived", || async { Ok(1usize) }, LoadConfig::new());
    wait_until(|| binding.status().is_success()).await;
    assert_eq!(registry.len(), 1);

    drop(binding);
    assert_eq!(registry.len(), 0);
    assert_eq!(registry.cached_data("short-lived"), None);
}

#[tokio::test]
async fn test_change_notifications_follow_settlements() {
    test::setup();
    let registry = Registry::new();

    let mut binding = registry.bind(
        "notified",
        || async {
            tokio::time::sleep(FETCH_DELAY).await;
            Ok(1usize)
        },
        LoadConfig::new(),
    );

    binding.changed().await;
    assert!(binding.status().is_success());
    assert_eq!(binding.status().data(), Some(&1));
}

#[tokio::test]
async fn test_registry_defaults_fill_unset_binding_options() {
    test::setup();
    let calls = Counter::default();
    let settings: crate::RegistrySettings =
        serde_yaml::from_str("data_lifetime: \"1h\"").unwrap();
    let registry = Registry::with_config(RegistryConfig::from(settings));

    let fetch = {
        let calls = calls.clone();
        move || {
            let calls = calls.clone();
            async move { Ok(calls.bump()) }
        }
    };

    let first = registry.bind("defaulted", fetch.clone(), LoadConfig::new());
    wait_until(|| first.status().is_success()).await;

    // The registry-wide lifetime keeps the second subscription from
    // refetching.
    let second = registry.bind("defaulted", fetch, LoadConfig::new());
    assert!(second.status().is_success());
    assert_eq!(calls.count(), 1);
    assert_eq!(second.config().data_lifetime, Some(Duration::from_secs(3600)));
}
