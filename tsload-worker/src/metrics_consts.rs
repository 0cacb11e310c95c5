pub const RECORDS_READ: &str = "tsload_records_read";
pub const WORKER_BLOCKED: &str = "tsload_worker_blocked";
pub const FORCED_SMALL_BATCH: &str = "tsload_forced_small_batch";
pub const BATCH_SIZE: &str = "tsload_batch_size";
pub const ROWS_WRITTEN: &str = "tsload_rows_written";
pub const METRICS_WRITTEN: &str = "tsload_metrics_written";
pub const BATCH_WRITE_TIME: &str = "tsload_batch_write_time_ms";
pub const TAGS_ASSIGNED: &str = "tsload_tags_assigned";
pub const TAG_CACHE_HITS: &str = "tsload_tag_cache_hits";
pub const WRITE_FAILED: &str = "tsload_write_failed";
