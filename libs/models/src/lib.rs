//! Conveyor shared models
//!
//! Records exchanged between the task engine and whatever API layer sits in
//! front of it.

pub mod models;

pub use models::catalog::{BuildTemplate, ClusterCredential, DeploymentTemplate, Environment, Project};
pub use models::task::{DeployTask, NewDeployTask, TaskId, TaskStatus, TaskUpdate};
