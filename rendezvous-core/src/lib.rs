//! Rendezvous - Core Library
//!
//! This crate provides the coordination primitives a multi-host job needs
//! before and while it runs: topology aggregation, barriers, liveness
//! tracking and a key-value exchange, together with error handling,
//! configuration and the gRPC client for the coordinator service.

pub mod config;
pub mod coordinator;
pub mod error;

// Re-export commonly used types for convenience
pub use config::{ClientConfig, CoordinatorConfig, RendezvousConfig, SliceIndexPolicy};
pub use error::{CoordinationError, Result};
