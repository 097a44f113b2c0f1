//! Alert manager core: the lifecycle engine and the subsystems it
//! coordinates.
//!
//! Listeners push [`models::AlertEvent`]s onto a shared channel; the
//! [`engine::AlertEngine`] consumes them serially, reconciling each
//! against persisted state, applying suppression and enrichment, and
//! fanning accepted events out to the processor pipeline and the
//! notifier. Housekeeping tickers drive expiry and escalation.

pub mod clearer;
pub mod config;
pub mod engine;
pub mod listener;
pub mod models;
pub mod notifier;
pub mod output;
pub mod pipeline;
pub mod stats;
pub mod store;
pub mod suppressor;
pub mod transform;

pub use engine::AlertEngine;
pub use models::{Alert, AlertEvent, EventType, Severity, Status};

#[cfg(test)]
pub(crate) mod testutil;
