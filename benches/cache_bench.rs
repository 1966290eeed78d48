use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::json;
use sqlgate::QueryOptions;
use sqlgate::cache::{CacheConfig, QueryFingerprint, ResultCache, ResultCacheKey};
use sqlgate::driver::{FieldInfo, QueryResult, SqliteConnectionFactory};
use sqlgate::session::{ConnectionPool, PoolConfig};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn sample_result(rows: usize) -> QueryResult {
    QueryResult {
        rows: (0..rows)
            .map(|i| vec![json!(i), json!(format!("user_{i}")), json!(i * 10)])
            .collect(),
        row_count: rows as u64,
        fields: ["id", "name", "score"]
            .iter()
            .map(|name| FieldInfo {
                name: name.to_string(),
                data_type: None,
            })
            .collect(),
        command: "SELECT".to_string(),
        duration_ms: 1,
    }
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let options = QueryOptions::default();

    group.bench_function("short_query", |b| {
        b.iter(|| {
            std::hint::black_box(QueryFingerprint::generate(
                "SELECT * FROM users WHERE id = ?",
                &[json!(42)],
                &options,
            ))
        });
    });

    let long_query = format!(
        "SELECT u.id, u.name, o.total FROM users u JOIN orders o ON o.user_id = u.id WHERE u.name IN ({}) ORDER BY o.total DESC",
        (0..50).map(|i| format!("'name_{i}'")).collect::<Vec<_>>().join(", ")
    );
    group.bench_function("long_query", |b| {
        b.iter(|| std::hint::black_box(QueryFingerprint::generate(&long_query, &[], &options)));
    });

    group.finish();
}

fn bench_result_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("result_cache");
    let options = QueryOptions::default();

    for rows in [1, 100, 1000] {
        let cache = ResultCache::new(CacheConfig::default());
        let key = ResultCacheKey::new("SELECT * FROM users", &[], &options);
        cache.set(&key, sample_result(rows));

        group.bench_with_input(BenchmarkId::new("hit", rows), &rows, |b, _| {
            b.iter(|| std::hint::black_box(cache.get(&key)));
        });
    }

    let cache = ResultCache::new(CacheConfig {
        max_entries: 256,
        ..CacheConfig::default()
    });
    let keys: Vec<ResultCacheKey> = (0..1024)
        .map(|i| ResultCacheKey::new("SELECT * FROM users WHERE id = ?", &[json!(i)], &options))
        .collect();
    let result = sample_result(10);
    group.bench_function("set_with_eviction", |b| {
        let mut i = 0;
        b.iter(|| {
            cache.set(&keys[i % keys.len()], result.clone());
            i += 1;
        });
    });

    group.finish();
}

fn bench_pool_acquire(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = ConnectionPool::new(
        PoolConfig::default().with_min_size(4).with_max_size(4),
        Arc::new(SqliteConnectionFactory::in_memory()),
    );
    rt.block_on(pool.ensure_min()).unwrap();

    c.bench_function("pool_acquire_release", |b| {
        b.iter(|| {
            rt.block_on(async {
                let conn = pool.acquire().await.unwrap();
                conn.release();
            })
        });
    });
}

criterion_group!(benches, bench_fingerprint, bench_result_cache, bench_pool_acquire);
criterion_main!(benches);
