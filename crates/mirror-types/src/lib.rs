//! Core types for the mirror distributed-object layer.
//!
//! This crate defines the data structures shared by the wire core, the
//! sample objects and the CLI: object keys, routing declarations, configuration
//! and the top-level error type. It contains no business logic.

pub mod config;
pub mod error;
pub mod object;
