pub mod experience_continuity;
pub mod flag_hashing;
pub mod flag_match_reason;
pub mod flag_matching;
pub mod flag_models;
pub mod flag_request;
pub mod flag_store;
pub mod flag_variants;
