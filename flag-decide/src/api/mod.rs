pub mod endpoint;
pub mod errors;
pub mod flags_rate_limiter;
pub mod request_handler;
pub mod types;
