// Document cache: fingerprinting, tiered lookup, staleness, storage and eviction.
// Generation itself lives outside this service; callers look up first and store
// after a total miss.

pub mod eviction;
pub mod fingerprint;
pub mod handlers;
pub mod lookup;
pub mod memory_store;
pub mod pg_store;
pub mod similarity;
pub mod staleness;
pub mod stats;
pub mod store;
pub mod types;
