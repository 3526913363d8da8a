//! External collaborators of the task engine
//!
//! Each stage of a run talks to exactly one of these: the build server, the
//! image registry, or a cluster.

pub mod cluster;
pub mod harbor;
pub mod jenkins;
pub mod kubernetes;
