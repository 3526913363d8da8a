//! Conveyor Library
//!
//! Deployment task engine: drives build, push verification and deploy for
//! each task against a build server, an image registry and a cluster.

pub mod app;
pub mod ci;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod logs;
pub mod storage;
pub mod store;
pub mod utils;
pub mod workers;
