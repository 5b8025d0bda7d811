//! # Autoplug Engine Library (autoplug-engine)
//!
//! Caps-driven autoplugging and decode-group lifecycle.
//!
//! **Purpose:** Given an input source, discover its content type, chain
//! demuxers/parsers/decoders until raw elementary streams are reached, and
//! organize those streams into groups that commit, queue, and switch for
//! gapless playback of consecutive inputs.
//!
//! **Architecture:** `AutoplugEngine` (search) feeds a `GroupManager`
//! (lifecycle) which owns per-type `PrerollBuffer`s; `DecodeBin` is the
//! front-end facade. Processing elements are opaque `Element` trait
//! objects; `sim` provides scripted ones.

pub mod autoplug;
pub mod decodebin;
pub mod dynamic;
pub mod element;
pub mod error;
pub mod group;
pub mod preroll;
pub mod registry;
pub mod sim;

pub use autoplug::{AutoplugEngine, AutoplugHooks, DefaultHooks, Selection, StreamTypeFilter};
pub use decodebin::{DecodeBin, Input};
pub use element::{Element, ElementFactory, ElementId, FactoryKind, Port, PortEvent, Presence};
pub use error::{Error, Result};
pub use group::{GroupManager, GroupState, ManagerSnapshot, OutputSlot};
pub use preroll::{MediaBuffer, PrerollBuffer, PushOutcome, QueueItem};
pub use registry::FactoryRegistry;
