//! Classification engine: applying decisions, cascading them, moving messages

pub mod cascade;
pub mod scheduler;

pub use cascade::{CascadeReport, CascadeResolver};
pub use scheduler::MoveScheduler;
