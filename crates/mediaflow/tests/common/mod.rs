//! Shared test utilities for mediaflow integration tests.
//!
//! This module provides:
//! - `TestHarness` for an isolated orchestrator over an in-memory database
//! - `FakeProvider` and `FakeEngine` scripted collaborators

pub mod fakes;
pub mod harness;

pub use fakes::{FakeEngine, FakeProvider};
pub use harness::TestHarness;
