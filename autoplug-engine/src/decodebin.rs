//! DecodeBin front-end facade
//!
//! Wires the factory registry, GroupManager and AutoplugEngine together and
//! exposes the operations a player front-end needs: set the input, queue
//! the next input for gapless playback, select streams, report end of
//! stream, and observe notifications on the event bus.

use crate::autoplug::{AutoplugEngine, AutoplugHooks, DefaultHooks};
use crate::element::Element;
use crate::error::{Error, Result};
use crate::group::{GroupManager, ManagerSnapshot, OutputSlot};
use crate::preroll::PrerollBuffer;
use crate::registry::FactoryRegistry;
use autoplug_common::events::StreamClassification;
use autoplug_common::{AutoplugEvent, Caps, EngineConfig, EventBus};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

/// An input to decode: a source element and, optionally, the URI it reads
pub struct Input {
    source: Arc<dyn Element>,
    uri: Option<String>,
}

impl Input {
    pub fn from_element(source: Arc<dyn Element>) -> Self {
        Self { source, uri: None }
    }

    /// The URI scheme decides whether the input is streamed
    pub fn from_uri(uri: impl Into<String>, source: Arc<dyn Element>) -> Self {
        Self {
            source,
            uri: Some(uri.into()),
        }
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn source(&self) -> &Arc<dyn Element> {
        &self.source
    }
}

pub struct DecodeBin {
    config: Arc<EngineConfig>,
    bus: EventBus,
    manager: Arc<GroupManager>,
    engine: Arc<AutoplugEngine>,
}

impl DecodeBin {
    /// Create a DecodeBin with permissive hooks
    ///
    /// Must be called from within a tokio runtime; dynamic port watchers
    /// are spawned on it.
    pub fn new(config: EngineConfig, registry: FactoryRegistry) -> Result<Self> {
        Self::with_hooks(config, registry, Arc::new(DefaultHooks))
    }

    pub fn with_hooks(
        config: EngineConfig,
        registry: FactoryRegistry,
        hooks: Arc<dyn AutoplugHooks>,
    ) -> Result<Self> {
        config.validate()?;
        let handle = Handle::try_current()
            .map_err(|_| Error::Config("DecodeBin requires a tokio runtime".to_string()))?;

        let config = Arc::new(config);
        let bus = EventBus::new(config.event_capacity);
        let manager = GroupManager::new(Arc::clone(&config), bus.clone());
        info!("DecodeBin ready with {} factories", registry.len());
        let engine = AutoplugEngine::new(
            Arc::new(registry),
            Arc::clone(&manager),
            hooks,
            config.raw_caps.clone(),
            handle,
        );

        Ok(Self {
            config,
            bus,
            manager,
            engine,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutoplugEvent> {
        self.bus.subscribe()
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn manager(&self) -> &Arc<GroupManager> {
        &self.manager
    }

    pub fn engine(&self) -> &Arc<AutoplugEngine> {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn streamed(&self, input: &Input) -> bool {
        input
            .uri()
            .is_some_and(|uri| self.config.is_stream_uri(uri))
    }

    /// Replace whatever is playing with a new input
    ///
    /// Tears down every group, then autoplugs the source. Returns once the
    /// synchronous part of the build is done; groups with dynamic ports
    /// commit later from their watchers.
    pub fn set_input(&self, input: Input) -> Result<()> {
        self.stop();
        self.manager.reset();
        let streamed = self.streamed(&input);
        self.manager.set_streamed(streamed);
        info!(
            "Setting input {} ({}streamed)",
            input.uri().unwrap_or(input.source.name()),
            if streamed { "" } else { "not " }
        );
        self.engine.build(input.source)
    }

    /// Queue the input that follows the current one
    ///
    /// Its group is committed behind the active group and promoted when
    /// the active group finishes.
    pub fn set_next_input(&self, input: Input) -> Result<()> {
        let streamed = self.streamed(&input);
        self.manager.expect_next_input(true);
        self.manager.set_streamed(streamed);
        info!(
            "Queueing next input {}",
            input.uri().unwrap_or(input.source.name())
        );
        let result = self.engine.build(input.source);
        self.manager.expect_next_input(false);
        result
    }

    /// Announce that `set_next_input` will be called before the active
    /// group drains
    pub fn expect_next_input(&self) {
        self.manager.expect_next_input(true);
    }

    /// Caps became known on a port that was announced as ANY
    pub fn announce_caps(&self, element: &str, port: &str, caps: Caps) -> Result<()> {
        self.engine.announce_caps(element, port, caps)
    }

    pub fn select_stream(&self, classification: StreamClassification, index: usize) -> Result<()> {
        self.manager.select_stream(classification, index)
    }

    /// Report end of stream on a stream
    ///
    /// May block until the successor group is committed; call it from a
    /// streaming thread (or `spawn_blocking`), never from an async task.
    pub fn stream_eos(&self, stream_id: Uuid) -> Result<()> {
        self.manager.stream_eos(stream_id)
    }

    /// Attach codec/language metadata to a stream
    pub fn set_stream_tags(
        &self,
        stream_id: Uuid,
        codec: Option<String>,
        language: Option<String>,
    ) -> Result<()> {
        let stream = self
            .manager
            .stream(stream_id)
            .ok_or_else(|| Error::InvalidSelection(format!("unknown stream {}", stream_id)))?;
        stream.set_tags(codec, language);
        Ok(())
    }

    pub fn active_outputs(&self) -> Vec<OutputSlot> {
        self.manager.active_outputs()
    }

    pub fn preroll_buffer(&self, stream_id: Uuid) -> Option<Arc<PrerollBuffer>> {
        self.manager.preroll_buffer(stream_id)
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        self.manager.snapshot()
    }

    /// Stop watchers and release every group
    pub fn stop(&self) {
        self.engine.shutdown();
        self.manager.teardown();
    }
}

impl Drop for DecodeBin {
    fn drop(&mut self) {
        self.stop();
    }
}
