//! Broadcasting of upgrade state changes.
//!
//! Listeners (UI, alerting) subscribe to the bus; the orchestrator publishes.

pub mod upgrade_events;

pub use upgrade_events::{ItemChange, JobChange, UpgradeEvent, UpgradeEventBus};
