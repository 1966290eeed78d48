use super::ResultCache;

/// Log result cache status to tracing
pub fn log_cache_status(cache: &ResultCache) {
    let stats = cache.stats();

    tracing::info!(
        "Result Cache Status - Hits: {} ({:.1}%), Misses: {}, Sets: {}, Evictions: {}, Expired: {}, Invalidated: {}, Size: {}/{} ({} bytes)",
        stats.hits,
        stats.hit_rate(),
        stats.misses,
        stats.sets,
        stats.evictions,
        stats.expirations,
        stats.invalidations,
        stats.entries,
        stats.capacity,
        stats.bytes
    );

    for (query, hits) in cache.top_queries(3).into_iter().filter(|(_, hits)| *hits > 0) {
        tracing::debug!("  {} hits: {}", hits, query);
    }
}
