//! Shared configuration and time helpers for the fleet crates.

pub mod config;
pub mod duration;

pub use config::FleetConfig;
pub use duration::{epoch_secs, parse_duration};
