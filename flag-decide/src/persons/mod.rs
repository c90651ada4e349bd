pub mod person_models;
pub mod person_operations;
