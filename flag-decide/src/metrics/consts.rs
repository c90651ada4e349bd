// Request counters
pub const FLAG_REQUESTS_COUNTER: &str = "flags_requests_total";
pub const FLAG_REQUESTS_DISABLED_COUNTER: &str = "flags_requests_disabled_total";
pub const FLAG_RATE_LIMIT_EXCEEDED_COUNTER: &str = "flags_rate_limit_exceeded_total";
pub const FLAG_RATE_LIMIT_LOG_ONLY_COUNTER: &str = "flags_rate_limit_log_only_total";
pub const TOKEN_VALIDATION_ERRORS_COUNTER: &str = "flags_token_validation_errors_total";
pub const FLAG_REQUEST_KLUDGE_COUNTER: &str = "flags_request_kludge_total";

// Flag evaluation counters
pub const FLAG_EVALUATION_ERROR_COUNTER: &str = "flags_flag_evaluation_error_total";
pub const FLAG_HASH_KEY_WRITES_COUNTER: &str = "flags_flag_hash_key_writes_total";
pub const FLAG_HASH_KEY_WRITE_FAILURES_COUNTER: &str = "flags_hash_key_write_failures_total";
pub const FLAG_REPLICA_ROUTING_COUNTER: &str = "flags_replica_routing_total";
pub const FLAG_DEFINITIONS_PRIMARY_FALLBACK_COUNTER: &str = "flags_definitions_primary_fallback_total";

// Cache counters
pub const TEAM_CACHE_HIT_COUNTER: &str = "flags_team_cache_hit_total";
pub const TEAM_CACHE_ERRORS_COUNTER: &str = "flags_team_cache_errors_total";
pub const FLAG_CACHE_HIT_COUNTER: &str = "flags_flag_cache_hit_total";
pub const FLAG_CACHE_ERRORS_COUNTER: &str = "flags_flag_cache_errors_total";
pub const DB_TEAM_READS_COUNTER: &str = "flags_db_team_reads_total";
pub const DB_FLAG_READS_COUNTER: &str = "flags_db_flag_reads_total";

// Pool utilisation
pub const DB_CONNECTION_POOL_ACTIVE_COUNTER: &str = "flags_db_connection_pool_active_total";
pub const DB_CONNECTION_POOL_IDLE_COUNTER: &str = "flags_db_connection_pool_idle_total";
pub const DB_CONNECTION_POOL_MAX_COUNTER: &str = "flags_db_connection_pool_max_total";
pub const FLAG_ACQUIRE_TIMEOUT_COUNTER: &str = "flags_acquire_timeout_total";

// Timings
pub const FLAG_EVALUATION_TIME: &str = "flags_evaluation_time";
pub const FLAG_HASH_KEY_PROCESSING_TIME: &str = "flags_hash_key_processing_time";
pub const FLAG_DB_PROPERTIES_FETCH_TIME: &str = "flags_properties_db_fetch_time";
pub const FLAG_DB_CONNECTION_TIME: &str = "flags_db_connection_time";
pub const FLAG_GET_MATCH_TIME: &str = "flags_get_match_time";
