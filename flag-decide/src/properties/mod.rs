pub mod property_matching;
pub mod property_models;
