//! Database queries

pub mod job;
pub mod mapping;
pub mod target;
