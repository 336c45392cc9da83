//! Testing utilities for genflow pipelines.
//!
//! This module provides:
//! - Scripted story, item and job providers
//! - An in-memory harness wiring a complete story pipeline

mod fixtures;
mod mocks;

pub use fixtures::{fast_config, TestHarness};
pub use mocks::{ScriptedItemGenerator, ScriptedJobGenerator, ScriptedStoryGenerator};
