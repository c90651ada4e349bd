pub mod cohort_models;
pub mod cohort_operations;
