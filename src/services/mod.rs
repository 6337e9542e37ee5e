//! Sync engine services

pub mod control;
pub mod controller;
pub mod crm;
pub mod job_store;
pub mod mapping;
pub mod notifier;
pub mod progress;
pub mod source;
pub mod supervisor;
pub mod uploads;
pub mod writer;

#[cfg(test)]
pub mod testing;
