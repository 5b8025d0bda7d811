//! Scripted in-process elements
//!
//! Deterministic stand-ins for real processing elements. A `ScriptedFactory`
//! describes a class (sink caps, output templates, failure injection, a
//! script of dynamic ports announced when the element starts), and keeps a
//! handle to every instance it creates so callers can drive them.

use crate::element::{
    Element, ElementFactory, ElementState, FactoryKind, Port, PortDirection, PortEvent,
    PortTemplate, Presence,
};
use crate::error::{Error, Result};
use autoplug_common::Caps;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Output port declared by a scripted class
#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub name: String,
    pub presence: Presence,
    pub caps: Caps,
}

/// Dynamic port announcements played when the element reaches PAUSED
#[derive(Debug, Clone, Default)]
pub struct PortScript {
    pub ports: Vec<Port>,
    pub no_more_ports: bool,
}

struct ElementInner {
    state: ElementState,
    outputs: Vec<Port>,
    upstream: Option<Port>,
    script: Option<PortScript>,
}

/// Scripted element instance
pub struct ScriptedElement {
    name: String,
    factory_name: String,
    templates: Vec<PortTemplate>,
    sink_caps: Caps,
    fail_link: bool,
    fail_state: bool,
    inner: Mutex<ElementInner>,
    events_tx: mpsc::UnboundedSender<PortEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PortEvent>>>,
}

impl std::fmt::Debug for ScriptedElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedElement")
            .field("name", &self.name)
            .field("factory", &self.factory_name)
            .finish()
    }
}

/// Builder for `ScriptedElement`
pub struct ScriptedElementBuilder {
    name: String,
    factory_name: String,
    sink_caps: Caps,
    templates: Vec<PortTemplate>,
    outputs: Vec<Port>,
    fail_link: bool,
    fail_state: bool,
    script: Option<PortScript>,
}

impl ScriptedElementBuilder {
    pub fn factory(mut self, name: impl Into<String>) -> Self {
        self.factory_name = name.into();
        self
    }

    pub fn sink_caps(mut self, caps: Caps) -> Self {
        self.sink_caps = caps;
        self
    }

    /// Output port that exists from instantiation
    pub fn always_output(mut self, name: &str, caps: Caps) -> Self {
        self.templates.push(PortTemplate::new(
            name,
            PortDirection::Output,
            Presence::Always,
            caps.clone(),
        ));
        self.outputs.push(Port::output(name, Presence::Always, caps));
        self
    }

    /// Output template whose ports are announced later
    pub fn dynamic_output(mut self, template: &str, caps: Caps) -> Self {
        self.templates.push(PortTemplate::new(
            template,
            PortDirection::Output,
            Presence::CreatedLater,
            caps,
        ));
        self
    }

    pub fn fail_link(mut self, fail: bool) -> Self {
        self.fail_link = fail;
        self
    }

    pub fn fail_state(mut self, fail: bool) -> Self {
        self.fail_state = fail;
        self
    }

    /// Ports announced automatically on the first transition to PAUSED
    pub fn script(mut self, script: PortScript) -> Self {
        self.script = Some(script);
        self
    }

    pub fn build(self) -> ScriptedElement {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut templates = vec![PortTemplate::new(
            "sink",
            PortDirection::Input,
            Presence::Always,
            self.sink_caps.clone(),
        )];
        templates.extend(self.templates);
        ScriptedElement {
            name: self.name,
            factory_name: self.factory_name,
            templates,
            sink_caps: self.sink_caps,
            fail_link: self.fail_link,
            fail_state: self.fail_state,
            inner: Mutex::new(ElementInner {
                state: ElementState::Null,
                outputs: self.outputs,
                upstream: None,
                script: self.script,
            }),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }
}

impl ScriptedElement {
    pub fn builder(name: impl Into<String>) -> ScriptedElementBuilder {
        let name = name.into();
        ScriptedElementBuilder {
            factory_name: name.clone(),
            name,
            sink_caps: Caps::new_any(),
            templates: Vec::new(),
            outputs: Vec::new(),
            fail_link: false,
            fail_state: false,
            script: None,
        }
    }

    /// Realize a new output port and announce it
    pub fn add_port(&self, name: &str, caps: Caps) {
        let port = Port::output(name, Presence::CreatedLater, caps);
        lock(&self.inner).outputs.push(port.clone());
        trace!("{}: announcing port {}", self.name, name);
        let _ = self.events_tx.send(PortEvent::Added(port));
    }

    /// Drop an output port, as when its peer disconnects
    pub fn remove_port(&self, name: &str) {
        lock(&self.inner).outputs.retain(|p| p.name != name);
        let _ = self.events_tx.send(PortEvent::Removed(name.to_string()));
    }

    /// Fix the caps of a port that was announced as ANY
    pub fn set_port_caps(&self, name: &str, caps: Caps) {
        if let Some(port) = lock(&self.inner).outputs.iter_mut().find(|p| p.name == name) {
            port.caps = caps.clone();
        }
        let _ = self.events_tx.send(PortEvent::CapsKnown {
            port: name.to_string(),
            caps,
        });
    }

    pub fn no_more_ports(&self) {
        let _ = self.events_tx.send(PortEvent::NoMorePorts);
    }

    pub fn state(&self) -> ElementState {
        lock(&self.inner).state
    }

    pub fn upstream(&self) -> Option<Port> {
        lock(&self.inner).upstream.clone()
    }
}

impl Element for ScriptedElement {
    fn name(&self) -> &str {
        &self.name
    }

    fn factory_name(&self) -> &str {
        &self.factory_name
    }

    fn templates(&self) -> Vec<PortTemplate> {
        self.templates.clone()
    }

    fn output_ports(&self) -> Vec<Port> {
        lock(&self.inner).outputs.clone()
    }

    fn link_input(&self, upstream: &Port) -> Result<()> {
        let refuse = |reason: &str| Error::Link {
            src: upstream.name.clone(),
            sink: format!("{}:sink", self.name),
            reason: reason.to_string(),
        };
        if self.fail_link {
            return Err(refuse("link refused"));
        }
        if !self.sink_caps.can_intersect(&upstream.caps) {
            return Err(refuse("incompatible caps"));
        }
        lock(&self.inner).upstream = Some(upstream.clone());
        Ok(())
    }

    fn unlink_input(&self) {
        lock(&self.inner).upstream = None;
    }

    fn set_state(&self, state: ElementState) -> Result<()> {
        if self.fail_state && state > ElementState::Ready {
            return Err(Error::StateChange {
                element: self.name.clone(),
                reason: "scripted state failure".to_string(),
            });
        }
        let script = {
            let mut inner = lock(&self.inner);
            inner.state = state;
            if state >= ElementState::Paused {
                inner.script.take()
            } else {
                None
            }
        };
        if let Some(script) = script {
            for port in script.ports {
                self.add_port(&port.name, port.caps);
            }
            if script.no_more_ports {
                self.no_more_ports();
            }
        }
        Ok(())
    }

    fn take_port_events(&self) -> Option<mpsc::UnboundedReceiver<PortEvent>> {
        let has_dynamic = self.templates.iter().any(|t| {
            t.direction == PortDirection::Output && t.presence == Presence::CreatedLater
        });
        if !has_dynamic {
            return None;
        }
        lock(&self.events_rx).take()
    }
}

/// Scripted element class
pub struct ScriptedFactory {
    name: String,
    rank: u32,
    kind: FactoryKind,
    sink_caps: Caps,
    outputs: Vec<OutputSpec>,
    script: Option<PortScript>,
    fail_create: bool,
    fail_link: bool,
    fail_state: bool,
    instances: Mutex<Vec<Arc<ScriptedElement>>>,
}

impl std::fmt::Debug for ScriptedFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedFactory")
            .field("name", &self.name)
            .field("rank", &self.rank)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Builder for `ScriptedFactory`
pub struct ScriptedFactoryBuilder {
    inner: ScriptedFactory,
}

impl ScriptedFactoryBuilder {
    pub fn rank(mut self, rank: u32) -> Self {
        self.inner.rank = rank;
        self
    }

    pub fn sink_caps(mut self, caps: Caps) -> Self {
        self.inner.sink_caps = caps;
        self
    }

    pub fn always_output(mut self, name: &str, caps: Caps) -> Self {
        self.inner.outputs.push(OutputSpec {
            name: name.to_string(),
            presence: Presence::Always,
            caps,
        });
        self
    }

    pub fn dynamic_output(mut self, template: &str, caps: Caps) -> Self {
        self.inner.outputs.push(OutputSpec {
            name: template.to_string(),
            presence: Presence::CreatedLater,
            caps,
        });
        self
    }

    pub fn script(mut self, script: PortScript) -> Self {
        self.inner.script = Some(script);
        self
    }

    pub fn fail_create(mut self, fail: bool) -> Self {
        self.inner.fail_create = fail;
        self
    }

    pub fn fail_link(mut self, fail: bool) -> Self {
        self.inner.fail_link = fail;
        self
    }

    pub fn fail_state(mut self, fail: bool) -> Self {
        self.inner.fail_state = fail;
        self
    }

    pub fn build(self) -> ScriptedFactory {
        self.inner
    }
}

impl ScriptedFactory {
    pub fn builder(name: impl Into<String>, kind: FactoryKind) -> ScriptedFactoryBuilder {
        ScriptedFactoryBuilder {
            inner: ScriptedFactory {
                name: name.into(),
                rank: crate::element::rank::PRIMARY,
                kind,
                sink_caps: Caps::new_any(),
                outputs: Vec::new(),
                script: None,
                fail_create: false,
                fail_link: false,
                fail_state: false,
                instances: Mutex::new(Vec::new()),
            },
        }
    }

    /// Every element this factory created, in creation order
    pub fn instances(&self) -> Vec<Arc<ScriptedElement>> {
        lock(&self.instances).clone()
    }

    pub fn instance_count(&self) -> usize {
        lock(&self.instances).len()
    }
}

impl ElementFactory for ScriptedFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn rank(&self) -> u32 {
        self.rank
    }

    fn kind(&self) -> FactoryKind {
        self.kind
    }

    fn sink_caps(&self) -> &Caps {
        &self.sink_caps
    }

    fn create(&self, instance_name: &str) -> Result<Arc<dyn Element>> {
        if self.fail_create {
            return Err(Error::Instantiate {
                factory: self.name.clone(),
                reason: "scripted creation failure".to_string(),
            });
        }
        let mut builder = ScriptedElement::builder(instance_name)
            .factory(self.name.clone())
            .sink_caps(self.sink_caps.clone())
            .fail_link(self.fail_link)
            .fail_state(self.fail_state);
        for out in &self.outputs {
            builder = match out.presence {
                Presence::Always => builder.always_output(&out.name, out.caps.clone()),
                _ => builder.dynamic_output(&out.name, out.caps.clone()),
            };
        }
        if let Some(script) = &self.script {
            builder = builder.script(script.clone());
        }
        let element = Arc::new(builder.build());
        lock(&self.instances).push(Arc::clone(&element));
        Ok(element)
    }
}
