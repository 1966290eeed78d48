mod common;

use common::{MockConnectionFactory, settings};
use pretty_assertions::assert_eq;
use serde_json::json;
use sqlgate::cache::{CacheConfig, ResultCache};
use sqlgate::dispatch::Dispatcher;
use sqlgate::rate_limiter::{RateLimitConfig, RateLimiter};
use sqlgate::session::ConnectionPool;
use sqlgate::{ErrorKind, RetryPolicy, SessionManager};
use std::sync::Arc;
use std::time::Duration;

fn limited_manager(max_requests: u32, window: Duration) -> Arc<SessionManager> {
    let factory = MockConnectionFactory::new();
    Arc::new(SessionManager::new(
        ConnectionPool::new(common::pool_config(2), Arc::new(factory)),
        Arc::new(ResultCache::new(CacheConfig::default())),
        Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests,
            window,
        })),
        settings(),
    ))
}

#[test]
fn test_exactly_ceiling_admits_per_window() {
    let limiter = RateLimiter::new(RateLimitConfig {
        max_requests: 5,
        window: Duration::from_millis(100),
    });

    let admitted = (0..8).filter(|_| limiter.admit("agent")).count();
    assert_eq!(admitted, 5);

    std::thread::sleep(Duration::from_millis(120));
    assert!(limiter.admit("agent"));

    let stats = limiter.stats();
    assert_eq!(stats.admitted, 6);
    assert_eq!(stats.rejected, 3);
}

#[test]
fn test_concurrent_admits_never_exceed_ceiling() {
    let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
        max_requests: 50,
        window: Duration::from_secs(60),
    }));

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let limiter = limiter.clone();
            std::thread::spawn(move || (0..20).filter(|_| limiter.admit("shared")).count())
        })
        .collect();
    let admitted: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();

    assert_eq!(admitted, 50);
    assert_eq!(limiter.stats().rejected, 110);
}

#[tokio::test]
async fn test_manager_rate_limit_check() {
    let manager = limited_manager(2, Duration::from_secs(60));

    assert!(manager.rate_limit_admit("a"));
    assert!(manager.rate_limit_check("a").is_ok());
    let err = manager.rate_limit_check("a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
    assert!(!err.is_retryable());

    assert!(manager.rate_limit_check("b").is_ok());
}

#[tokio::test]
async fn test_dispatcher_rejects_over_limit_clients() {
    let manager = limited_manager(2, Duration::from_secs(60));
    let dispatcher = Dispatcher::new(manager.clone(), RetryPolicy::no_retry(), true);

    let line = |id: u64, client: &str| {
        json!({"id": id, "client": client, "method": "query", "sql": "SELECT 1"}).to_string()
    };

    assert!(dispatcher.handle_line(&line(1, "noisy")).await.error.is_none());
    assert!(dispatcher.handle_line(&line(2, "noisy")).await.error.is_none());

    let rejected = dispatcher.handle_line(&line(3, "noisy")).await;
    assert_eq!(rejected.id, json!(3));
    let error = rejected.error.unwrap();
    assert_eq!(error.kind, ErrorKind::RateLimitExceeded);
    assert!(error.retry_after_ms.is_some());
    assert!(!error.retryable);

    // a different client is unaffected
    assert!(dispatcher.handle_line(&line(4, "quiet")).await.error.is_none());
    // rejected calls never reach the database
    assert_eq!(manager.operational_stats().counters.queries, 1);
}

#[tokio::test]
async fn test_dispatcher_without_rate_limit() {
    let manager = limited_manager(1, Duration::from_secs(60));
    let dispatcher = Dispatcher::new(manager, RetryPolicy::no_retry(), false);

    for id in 0..5 {
        let response = dispatcher
            .handle_line(&json!({"id": id, "method": "pool_stats"}).to_string())
            .await;
        assert!(response.error.is_none());
    }
}
