mod query_cache;

pub use query_cache::{QueryCacheEntry, QueryTableCache, orphan_table_in};
