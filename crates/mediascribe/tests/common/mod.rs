//! Shared test utilities for mediascribe integration tests.
//!
//! This module provides:
//! - `TestHarness` for an isolated catalog and a fake mounted volume
//! - Builders for configs and catalog rows
//! - Fakes for the engine, the audio probe, the volume probe and workers

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{TestHarness, VOLUME_UUID};
