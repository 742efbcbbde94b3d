//! Shared test utilities for orgpush integration tests.
//!
//! This module provides:
//! - `FakeConnector` / `FakeOrg`, an in-memory push API
//! - `TestEngine` and builders for catalog data and schedule requests

pub mod builders;
pub mod fake_org;

pub use builders::*;
pub use fake_org::{Call, FakeConnector, FakeOrg};
