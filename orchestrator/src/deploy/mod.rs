//! Deployment task engine

pub mod apply;
pub mod fsm;
pub mod journal;
pub mod manifest;
pub mod pipeline;
pub mod runner;
pub mod template;
