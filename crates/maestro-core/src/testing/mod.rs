//! Testing utilities for deterministic server tests.

pub mod stub_runner;

pub use stub_runner::StubRunner;
