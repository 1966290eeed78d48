pub mod query_fingerprint;
pub mod result_cache;
pub mod status;

pub use query_fingerprint::QueryFingerprint;
pub use result_cache::{CacheConfig, CacheStats, ResultCache, ResultCacheKey};
pub use status::log_cache_status;
