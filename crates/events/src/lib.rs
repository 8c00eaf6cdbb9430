//! Event system for the learning orchestrator
//!
//! This crate provides the event bus and event types used to observe
//! session lifecycle, unit dispatch, and the tutor loop.

mod bus;
mod types;

pub use bus::EventBus;
pub use types::*;
