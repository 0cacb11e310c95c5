pub mod batch;
pub mod indexer;
pub mod metrics;
pub mod pg;
pub mod record;
pub mod schema;
pub mod store;
pub mod tag_cache;
pub mod test_utils;
pub mod value;
