//! mediajob - Cloud media job orchestration
//!
//! Creates transforms, uploads inputs, submits encoding jobs, polls them to
//! completion and downloads or publishes the results.

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod service;
pub mod storage;
pub mod token;
pub mod workflow;
