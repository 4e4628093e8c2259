//! Test doubles for the connectivity contracts: a deterministic in-memory
//! relational driver plus shared row fixtures.

pub mod fake_driver;
pub mod fixtures;

pub use fake_driver::{FakeDriver, FakeDriverStats, FakeRows};
