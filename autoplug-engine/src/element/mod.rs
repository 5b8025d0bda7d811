//! Element and port model
//!
//! Processing elements are opaque units consumed through the `Element`
//! trait. The engine never looks inside them: it only reads their port
//! templates, realized output ports and capability descriptors, links an
//! upstream output port to their input, drives their state, and listens to
//! their asynchronous port events.

pub mod arena;

pub use arena::{ElementArena, ElementId, PortRef};

use crate::error::Result;
use autoplug_common::Caps;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Port direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Presence classification of a port template
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Presence {
    /// Exists as soon as the element is instantiated
    Always,
    /// Created at an unpredictable later time and announced
    CreatedLater,
    /// Created on explicit request
    OnDemand,
}

/// Declared shape of a port an element may have
#[derive(Debug, Clone)]
pub struct PortTemplate {
    /// Name or pattern (e.g. `src_%u`)
    pub name_template: String,
    pub direction: PortDirection,
    pub presence: Presence,
    pub caps: Caps,
}

impl PortTemplate {
    pub fn new(
        name_template: impl Into<String>,
        direction: PortDirection,
        presence: Presence,
        caps: Caps,
    ) -> Self {
        Self {
            name_template: name_template.into(),
            direction,
            presence,
            caps,
        }
    }

    /// True if a realized port name was produced by this template
    pub fn matches(&self, port_name: &str) -> bool {
        match self.name_template.find('%') {
            Some(idx) => port_name.starts_with(&self.name_template[..idx]),
            None => self.name_template == port_name,
        }
    }
}

/// A realized connection point on an element
#[derive(Debug, Clone, PartialEq)]
pub struct Port {
    pub name: String,
    pub direction: PortDirection,
    pub presence: Presence,
    /// Negotiated (or announced) caps; ANY while unknown
    pub caps: Caps,
}

impl Port {
    pub fn output(name: impl Into<String>, presence: Presence, caps: Caps) -> Self {
        Self {
            name: name.into(),
            direction: PortDirection::Output,
            presence,
            caps,
        }
    }
}

/// Element lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElementState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for ElementState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementState::Null => write!(f, "NULL"),
            ElementState::Ready => write!(f, "READY"),
            ElementState::Paused => write!(f, "PAUSED"),
            ElementState::Playing => write!(f, "PLAYING"),
        }
    }
}

/// Asynchronous port notifications from an element
#[derive(Debug, Clone)]
pub enum PortEvent {
    /// A new output port was realized
    Added(Port),
    /// An output port went away (its peer disconnected)
    Removed(String),
    /// A port's caps became known after being announced as ANY
    CapsKnown { port: String, caps: Caps },
    /// The element will create no further ports
    NoMorePorts,
}

/// Coarse role of a factory, used for classification instead of string
/// matching on class names
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactoryKind {
    Demuxer,
    Decoder,
    Parser,
    Depayloader,
    Decryptor,
    /// Consumes the stream itself; terminates a branch
    Sink,
    Source,
    Other,
}

impl FactoryKind {
    /// Kinds the registry offers as autoplug candidates
    pub fn is_autopluggable(self) -> bool {
        !matches!(self, FactoryKind::Source | FactoryKind::Other)
    }
}

/// Factory rank constants
pub mod rank {
    pub const NONE: u32 = 0;
    pub const MARGINAL: u32 = 64;
    pub const SECONDARY: u32 = 128;
    pub const PRIMARY: u32 = 256;
}

/// Opaque processing element
pub trait Element: Send + Sync + fmt::Debug {
    /// Instance name, unique within the engine
    fn name(&self) -> &str;

    /// Name of the factory that created this element
    fn factory_name(&self) -> &str;

    /// Port templates in declaration order
    fn templates(&self) -> Vec<PortTemplate>;

    /// Currently realized output ports in template-declaration order
    fn output_ports(&self) -> Vec<Port>;

    /// Attach the element's input to an upstream output port
    fn link_input(&self, upstream: &Port) -> Result<()>;

    /// Detach the element's input
    fn unlink_input(&self);

    fn set_state(&self, state: ElementState) -> Result<()>;

    /// Take the receiving end of the element's port event channel
    ///
    /// Returns `None` for elements that never announce ports, or when the
    /// channel was already taken.
    fn take_port_events(&self) -> Option<mpsc::UnboundedReceiver<PortEvent>>;
}

/// Creates elements of one class
pub trait ElementFactory: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn rank(&self) -> u32;

    fn kind(&self) -> FactoryKind;

    /// Caps accepted on the input port
    fn sink_caps(&self) -> &Caps;

    /// Instantiate a new element with the given instance name
    fn create(&self, instance_name: &str) -> Result<Arc<dyn Element>>;
}

/// True if the element declares a `CreatedLater` output template with no
/// realized port yet
pub fn has_unrealized_dynamic_output(element: &dyn Element) -> bool {
    let ports = element.output_ports();
    element.templates().iter().any(|t| {
        t.direction == PortDirection::Output
            && t.presence == Presence::CreatedLater
            && !ports.iter().any(|p| t.matches(&p.name))
    })
}
