//! Type definitions

pub mod job;
pub mod mapping;
pub mod messages;
pub mod record;

pub use job::*;
pub use mapping::*;
pub use messages::*;
pub use record::*;
