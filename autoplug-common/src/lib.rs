//! # Autoplug Common Library
//!
//! Shared code for the autoplugging engine and its front-ends:
//! - Capability descriptors (`Caps`) with intersection and raw classification
//! - Clock time values used by buffering thresholds
//! - Event types (`AutoplugEvent`) and the broadcast `EventBus`
//! - Configuration loading (`EngineConfig`)

pub mod caps;
pub mod config;
pub mod error;
pub mod events;
pub mod time;

pub use caps::{Caps, Structure, Value};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{AutoplugEvent, EventBus};
pub use time::ClockTime;
