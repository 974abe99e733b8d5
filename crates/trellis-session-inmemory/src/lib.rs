//! In-memory session service for the Trellis runtime
//!
//! Implements the `SessionService` contract entirely in process memory.
//! Useful for development, testing and single-process deployments where
//! sessions need not survive a restart.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod service;
mod store;

pub use service::{InMemorySessionService, InMemorySessionServiceBuilder};
