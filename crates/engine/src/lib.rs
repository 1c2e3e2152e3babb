//! Workflow-engine boundary for jobsync.
//!
//! This crate provides a trait-based engine client with an in-memory
//! journaling implementation.

#![warn(missing_docs)]

pub mod client;
pub mod memory;

pub use client::{EngineClient, EngineError, JobCallback, Result, Subscription};
pub use memory::{EngineCall, EngineOp, InMemoryEngine};
