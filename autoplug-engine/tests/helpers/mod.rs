//! Test helpers for autoplug-engine integration tests
//!
//! Provides reusable fixtures:
//! - Scripted factory shorthands (decoders, demuxers)
//! - Harness: a DecodeBin plus its event receiver and factories
//! - Event collection with a timeout

#![allow(dead_code)]

use autoplug_common::{AutoplugEvent, Caps, EngineConfig};
use autoplug_engine::sim::{ScriptedElement, ScriptedFactory, ScriptedFactoryBuilder};
use autoplug_engine::{
    AutoplugHooks, DecodeBin, DefaultHooks, ElementFactory, FactoryKind, FactoryRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Fixtures
// ============================================================================

pub fn caps(s: &str) -> Caps {
    s.parse().expect("valid caps")
}

/// Source element named `source` with one always port `src`
pub fn source(caps_str: &str) -> Arc<ScriptedElement> {
    named_source("source", caps_str)
}

pub fn named_source(name: &str, caps_str: &str) -> Arc<ScriptedElement> {
    Arc::new(
        ScriptedElement::builder(name)
            .factory("testsrc")
            .always_output("src", caps(caps_str))
            .build(),
    )
}

/// One-in one-out decoder
pub fn decoder(name: &str, sink: &str, src: &str) -> ScriptedFactoryBuilder {
    ScriptedFactory::builder(name, FactoryKind::Decoder)
        .sink_caps(caps(sink))
        .always_output("src", caps(src))
}

/// Demuxer whose ports are all created later, driven by the test
pub fn demuxer(name: &str, sink: &str) -> ScriptedFactoryBuilder {
    ScriptedFactory::builder(name, FactoryKind::Demuxer)
        .sink_caps(caps(sink))
        .dynamic_output("src_%u", Caps::new_any())
}

pub fn names(events: &[AutoplugEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

/// Everything already on the bus
pub fn drain(rx: &mut broadcast::Receiver<AutoplugEvent>) -> Vec<AutoplugEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Events up to and including the first one matching `pred`
pub async fn collect_until(
    rx: &mut broadcast::Receiver<AutoplugEvent>,
    pred: impl Fn(&AutoplugEvent) -> bool,
) -> Vec<AutoplugEvent> {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .unwrap_or_else(|_| panic!("timed out, got {:?}", names(&events)))
            .expect("event bus closed");
        let done = pred(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

pub fn is_switched(event: &AutoplugEvent) -> bool {
    matches!(event, AutoplugEvent::GroupSwitched { .. })
}

pub fn is_committed(event: &AutoplugEvent) -> bool {
    matches!(event, AutoplugEvent::GroupCommitted { .. })
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub bin: DecodeBin,
    pub rx: broadcast::Receiver<AutoplugEvent>,
    factories: Vec<Arc<ScriptedFactory>>,
}

impl Harness {
    pub fn new(factories: Vec<ScriptedFactory>) -> Self {
        Self::build(EngineConfig::default(), factories, Arc::new(DefaultHooks))
    }

    pub fn with_config(config: EngineConfig, factories: Vec<ScriptedFactory>) -> Self {
        Self::build(config, factories, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(factories: Vec<ScriptedFactory>, hooks: Arc<dyn AutoplugHooks>) -> Self {
        Self::build(EngineConfig::default(), factories, hooks)
    }

    fn build(
        config: EngineConfig,
        factories: Vec<ScriptedFactory>,
        hooks: Arc<dyn AutoplugHooks>,
    ) -> Self {
        let factories: Vec<Arc<ScriptedFactory>> = factories.into_iter().map(Arc::new).collect();
        let registry = FactoryRegistry::new(
            factories
                .iter()
                .map(|f| Arc::clone(f) as Arc<dyn ElementFactory>),
        );
        let bin = DecodeBin::with_hooks(config, registry, hooks).expect("DecodeBin");
        let rx = bin.subscribe();
        Self {
            bin,
            rx,
            factories,
        }
    }

    pub fn factory(&self, name: &str) -> Arc<ScriptedFactory> {
        self.factories
            .iter()
            .find(|f| f.name() == name)
            .cloned()
            .unwrap_or_else(|| panic!("no factory {}", name))
    }

    /// The `n`th element created by a factory
    pub fn element(&self, factory: &str, n: usize) -> Arc<ScriptedElement> {
        self.factory(factory)
            .instances()
            .get(n)
            .cloned()
            .unwrap_or_else(|| panic!("{} has no instance {}", factory, n))
    }

    pub fn drain(&mut self) -> Vec<AutoplugEvent> {
        drain(&mut self.rx)
    }

    pub async fn collect_until(
        &mut self,
        pred: impl Fn(&AutoplugEvent) -> bool,
    ) -> Vec<AutoplugEvent> {
        collect_until(&mut self.rx, pred).await
    }

    /// Let watcher tasks run, then return what they emitted
    pub async fn settle(&mut self) -> Vec<AutoplugEvent> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.drain()
    }

    pub fn element_names(&self) -> Vec<String> {
        self.bin
            .snapshot()
            .elements
            .into_iter()
            .map(|e| e.name)
            .collect()
    }
}
