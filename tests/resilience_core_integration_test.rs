//! Bootstrapping from the shipped configuration and composing the primitives

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tasker_resilience::batch::ErrorHandlingStrategy;
use tasker_resilience::circuit_breaker::CircuitBreakerError;
use tasker_resilience::config::ConfigManager;
use tasker_resilience::{with_retry, CircuitState, ResilienceCore};

fn config_dir() -> Option<PathBuf> {
    Some(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config"))
}

#[test]
fn test_shipped_configuration_is_valid_for_every_environment() {
    for environment in ["development", "test", "production"] {
        let manager = ConfigManager::load_from_directory_with_env(config_dir(), environment)
            .unwrap_or_else(|e| panic!("{environment}: {e}"));
        assert_eq!(manager.environment(), environment);
    }

    let production = ConfigManager::load_from_directory_with_env(config_dir(), "production").unwrap();
    let batch = production.config().batch.to_batch_config();
    assert_eq!(batch.max_batch_size, 50);
    assert_eq!(batch.error_handling, ErrorHandlingStrategy::CollectErrors);
    assert_eq!(batch.max_queue_age, Some(Duration::from_millis(1000)));

    let test = ConfigManager::load_from_directory_with_env(config_dir(), "test").unwrap();
    assert_eq!(test.config().retry.max_attempts, 2);
    assert_eq!(test.config().timeouts.cleanup_interval_ms, None);
    assert_eq!(
        test.config()
            .circuit_breakers
            .config_for_component("database")
            .failure_threshold,
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_wraps_a_breaker_protected_call() {
    let manager = ConfigManager::load_from_directory_with_env(config_dir(), "test").unwrap();
    let core = ResilienceCore::from_config(manager.config()).unwrap();
    let breaker = core.circuit_breaker("external_api");

    let calls = Arc::new(AtomicU32::new(0));
    let policy = core
        .retry_policy::<CircuitBreakerError<anyhow::Error>>()
        .with_should_retry(|error, _attempt| !error.is_circuit_open());

    let outcome = with_retry(
        |_attempt| {
            let breaker = Arc::clone(&breaker);
            let calls = Arc::clone(&calls);
            async move {
                breaker
                    .call(|| async move {
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            anyhow::bail!("503 service unavailable");
                        }
                        Ok("accepted")
                    })
                    .await
            }
        },
        &policy,
    )
    .await;

    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.result.unwrap(), "accepted");
    assert_eq!(breaker.state(), CircuitState::Closed);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_rejects_without_invoking_the_operation() {
    let manager = ConfigManager::load_from_directory_with_env(config_dir(), "test").unwrap();
    let core = ResilienceCore::from_config(manager.config()).unwrap();
    // default_config: failure_threshold 5, minimum_calls_to_trip 10
    let breaker = core.circuit_breaker("payments");

    for n in 0..10u32 {
        let _ = breaker
            .call(|| async move {
                if n % 2 == 0 {
                    Err(anyhow::anyhow!("declined"))
                } else {
                    Ok(n)
                }
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let rejected = breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
        .await;

    assert!(rejected.unwrap_err().is_circuit_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(core.circuit_breakers().get_system_metrics().circuit_breakers.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trips_when_successes_complete_the_window() {
    let manager = ConfigManager::load_from_directory_with_env(config_dir(), "test").unwrap();
    let core = ResilienceCore::from_config(manager.config()).unwrap();
    let breaker = core.circuit_breaker("ledger");

    for n in 0..10u32 {
        let _ = breaker
            .call(|| async move {
                if n < 5 {
                    Err(anyhow::anyhow!("ledger unavailable"))
                } else {
                    Ok(n)
                }
            })
            .await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let rejected = breaker
        .call(|| async {
            invoked.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
        .await;

    assert!(rejected.unwrap_err().is_circuit_open());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}
