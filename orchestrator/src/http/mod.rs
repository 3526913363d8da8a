//! Shared HTTP plumbing for external collaborators

pub mod client;
