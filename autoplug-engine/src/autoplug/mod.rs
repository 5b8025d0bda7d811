//! AutoplugEngine
//!
//! Recursive, caps-driven search that turns an output port into terminal
//! streams. For every port whose caps become known it decides, in order:
//!
//! 1. EMPTY caps: unknown type, recorded as an `Unknown` stream
//! 2. ANY caps: deferred until concrete caps are announced on the port;
//!    the building group stays open meanwhile
//! 3. Raw caps with a single media type: exposed as a terminal stream
//! 4. Anything else: ranked candidates are tried until one links and
//!    starts; its own output ports are autoplugged in turn. If none
//!    succeeds the port is handled as in 1.
//!
//! Candidate failures are absorbed here; the next candidate is tried and
//! nothing is reported.

mod hooks;

pub use hooks::{AutoplugHooks, DefaultHooks, Selection, StreamTypeFilter};

use crate::dynamic::{DynamicPortTracker, PortEventSink};
use crate::element::{
    has_unrealized_dynamic_output, Element, ElementFactory, ElementId, ElementState, FactoryKind,
    Port, PortEvent, PortRef, Presence,
};
use crate::error::{Error, Result};
use crate::group::GroupManager;
use crate::registry::FactoryRegistry;
use autoplug_common::events::StreamClassification;
use autoplug_common::Caps;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

/// Ports whose name starts with this marker were already consumed and are
/// never autoplugged
pub const IGNORED_PORT_PREFIX: &str = "current_";

pub struct AutoplugEngine {
    registry: Arc<FactoryRegistry>,
    manager: Arc<GroupManager>,
    hooks: Arc<dyn AutoplugHooks>,
    tracker: DynamicPortTracker,
    raw_caps: Caps,
    instances: AtomicU64,
    self_ref: Weak<AutoplugEngine>,
}

impl std::fmt::Debug for AutoplugEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoplugEngine")
            .field("factories", &self.registry.len())
            .field("raw_caps", &self.raw_caps)
            .finish_non_exhaustive()
    }
}

impl AutoplugEngine {
    pub fn new(
        registry: Arc<FactoryRegistry>,
        manager: Arc<GroupManager>,
        hooks: Arc<dyn AutoplugHooks>,
        raw_caps: Caps,
        handle: Handle,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            registry,
            manager,
            hooks,
            tracker: DynamicPortTracker::new(handle),
            raw_caps,
            instances: AtomicU64::new(0),
            self_ref: weak.clone(),
        })
    }

    pub fn manager(&self) -> &Arc<GroupManager> {
        &self.manager
    }

    pub fn registry(&self) -> &FactoryRegistry {
        &self.registry
    }

    /// Plug a source element and everything reachable from it
    ///
    /// The building group is held for the duration, so it cannot commit
    /// before every synchronously discovered branch is in place.
    pub fn build(&self, source: Arc<dyn Element>) -> Result<()> {
        let hold = self.manager.hold_building()?;
        let result = self.activate_element(Arc::clone(&source), None);
        if let Err(e) = &result {
            warn!("Failed to start input {}: {}", source.name(), e);
            if !matches!(e, Error::Flushing) {
                source.unlink_input();
                let _ = source.set_state(ElementState::Null);
                if let Err(commit_err) = self.manager.commit(true, false) {
                    debug!("Forced commit after setup failure: {}", commit_err);
                }
            }
        }
        let committed = self.manager.release_hold(hold);
        result.and(committed)
    }

    /// Register a linked element, start it, and autoplug its ports
    ///
    /// Elements with unrealized `CreatedLater` outputs get a watcher. The
    /// watcher task only starts after the ports present now are handled,
    /// so "no more ports" can never overtake them.
    pub fn activate_element(
        &self,
        element: Arc<dyn Element>,
        upstream: Option<PortRef>,
    ) -> Result<ElementId> {
        let dynamic = has_unrealized_dynamic_output(element.as_ref());
        let id = self
            .manager
            .register_element(Arc::clone(&element), upstream)?;

        let events = if dynamic {
            element.take_port_events()
        } else {
            None
        };
        if events.is_some() {
            if let Err(e) = self.manager.register_watcher(id) {
                self.manager.unregister_element(id);
                return Err(e);
            }
        }

        if let Err(e) = element.set_state(ElementState::Paused) {
            self.manager.unregister_element(id);
            return Err(e);
        }

        for port in element.output_ports() {
            self.autoplug_port(id, port);
        }

        if let Some(events) = events {
            let sink: Weak<dyn PortEventSink> = self.self_ref.clone();
            self.tracker.watch(id, events, sink);
        }
        Ok(id)
    }

    /// Decide what to do with an output port whose caps are known
    pub fn autoplug_port(&self, src: ElementId, port: Port) {
        if port.name.starts_with(IGNORED_PORT_PREFIX) {
            trace!("Ignoring internal port {}", port.name);
            return;
        }
        let Some(owner) = self.manager.element(src) else {
            debug!("Port {} of released element {}, ignoring", port.name, src);
            return;
        };
        let source = PortRef::new(src, &port.name);
        if !self.manager.claim_port(&source) {
            trace!("Port {}:{} already handled", owner.name(), port.name);
            return;
        }
        let caps = port.caps.clone();

        if caps.is_empty() {
            self.unknown_type(owner.name(), source, caps);
            return;
        }
        if caps.is_any() {
            debug!(
                "Caps of {}:{} not known yet, deferring",
                owner.name(),
                port.name
            );
            if let Err(e) = self.manager.defer_port(&source) {
                debug!("Port {}:{} not deferred: {}", owner.name(), port.name, e);
            }
            return;
        }

        let classification = StreamClassification::from_caps(&caps);
        if !self.hooks.should_continue(&port, &caps) {
            debug!("Front-end stops autoplugging at {}:{}", owner.name(), port.name);
            self.expose(owner.name(), source, caps, classification);
            return;
        }
        if caps.distinct_type_count() == 1 && caps.is_raw_media(&self.raw_caps) {
            self.expose(owner.name(), source, caps, classification);
            return;
        }

        self.plug_candidates(owner.as_ref(), source, &port);
    }

    fn plug_candidates(&self, owner: &dyn Element, source: PortRef, port: &Port) {
        let ranked = self.registry.find_candidates(&port.caps);
        let found = ranked.len();
        let candidates = self.hooks.sort(port, &port.caps, ranked);
        if candidates.len() != found {
            trace!("Front-end kept {} of {} candidates", candidates.len(), found);
        }
        debug!(
            "{} candidates for {}:{} ({})",
            candidates.len(),
            owner.name(),
            port.name,
            port.caps
        );

        for factory in &candidates {
            match self.hooks.select(port, &port.caps, factory.as_ref()) {
                Selection::Skip => {
                    trace!("Front-end skipped {}", factory.name());
                    continue;
                }
                Selection::Expose => {
                    let classification = StreamClassification::from_caps(&port.caps);
                    self.expose(owner.name(), source, port.caps.clone(), classification);
                    return;
                }
                Selection::Try => {}
            }

            match self.try_candidate(&source, port, factory) {
                Ok(()) => {
                    debug!("Plugged {} after {}:{}", factory.name(), owner.name(), port.name);
                    return;
                }
                Err(Error::Flushing) => {
                    debug!("Flushing, abandoning {}:{}", owner.name(), port.name);
                    return;
                }
                Err(e) => debug!("Candidate {} rejected: {}", factory.name(), e),
            }
        }

        self.unknown_type(owner.name(), source, port.caps.clone());
    }

    fn try_candidate(
        &self,
        source: &PortRef,
        port: &Port,
        factory: &Arc<dyn ElementFactory>,
    ) -> Result<()> {
        let n = self.instances.fetch_add(1, Ordering::Relaxed);
        let element = factory.create(&format!("{}{}", factory.name(), n))?;
        element.link_input(port)?;

        if let Err(e) = self.activate_element(Arc::clone(&element), Some(source.clone())) {
            element.unlink_input();
            let _ = element.set_state(ElementState::Null);
            return Err(e);
        }

        if factory.kind() == FactoryKind::Sink {
            let upstream = self
                .manager
                .element(source.element)
                .map(|e| e.name().to_string())
                .unwrap_or_default();
            self.manager.add_stream(
                source.clone(),
                &upstream,
                port.caps.clone(),
                StreamClassification::Element,
            )?;
        }
        Ok(())
    }

    fn expose(
        &self,
        element: &str,
        source: PortRef,
        caps: Caps,
        classification: StreamClassification,
    ) {
        if !self.hooks.accept_stream(classification, &caps) {
            debug!("Discarding {} stream {}:{}", classification, element, source.port);
            return;
        }
        if let Err(e) = self.manager.add_stream(source, element, caps, classification) {
            debug!("Stream not added: {}", e);
        }
    }

    fn unknown_type(&self, element: &str, source: PortRef, caps: Caps) {
        if let Err(e) = self.manager.add_unknown(source, element, caps) {
            debug!("Unknown stream not recorded: {}", e);
        }
    }

    /// Re-enter the search for a port whose caps became known
    pub fn reenter(&self, element: ElementId, port: &str, caps: Caps) -> Result<()> {
        let el = self
            .manager
            .element(element)
            .ok_or_else(|| Error::InvalidState(format!("element {} is gone", element)))?;
        let presence = el
            .output_ports()
            .iter()
            .find(|p| p.name == port)
            .map(|p| p.presence)
            .unwrap_or(Presence::CreatedLater);
        info!("Caps {} announced on {}:{}", caps, el.name(), port);

        let hold = self.manager.hold_building()?;
        let resolved = self.manager.resolve_deferred(&PortRef::new(element, port));
        self.autoplug_port(element, Port::output(port, presence, caps));
        let committed = self.manager.release_hold(hold);
        resolved.and(committed)
    }

    /// Front-end announcement of caps on a deferred port
    pub fn announce_caps(&self, element: &str, port: &str, caps: Caps) -> Result<()> {
        let (id, _) = self
            .manager
            .find_element(element)
            .ok_or_else(|| Error::InvalidState(format!("no element named {}", element)))?;
        self.reenter(id, port, caps)
    }

    /// Stop all dynamic port watchers
    pub fn shutdown(&self) {
        self.tracker.shutdown();
    }
}

impl PortEventSink for AutoplugEngine {
    fn handle_port_event(&self, element: ElementId, event: PortEvent) {
        match event {
            PortEvent::Added(port) => {
                if self.manager.watcher_port_added(element) {
                    self.autoplug_port(element, port);
                }
            }
            PortEvent::CapsKnown { port, caps } => {
                if let Err(e) = self.reenter(element, &port, caps) {
                    debug!("Caps announcement on {} dropped: {}", element, e);
                }
            }
            PortEvent::Removed(port) => {
                if let Err(e) = self.manager.port_removed(element, &port) {
                    debug!("Port removal on {} failed: {}", element, e);
                }
            }
            PortEvent::NoMorePorts => {
                if let Err(e) = self.manager.watcher_finished(element) {
                    debug!("Commit after no-more-ports of {} failed: {}", element, e);
                }
            }
        }
    }
}
