//! API models

pub mod catalog;
pub mod task;
