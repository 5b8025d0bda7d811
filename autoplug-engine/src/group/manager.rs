//! GroupManager
//!
//! Owns the building group, the ordered list of queued groups (head is the
//! active group) and the element arena, all behind a single mutex with a
//! condition variable for "wait until a successor group exists".
//!
//! Every routine holding the lock records notifications and element
//! releases as deferred effects; they are applied after the lock is
//! dropped, so no routine here ever re-enters itself through a callback.

use super::{Effects, Group, GroupSnapshot, GroupState, StreamDescriptor};
use crate::element::{Element, ElementArena, ElementId, PortRef};
use crate::error::{Error, Result};
use crate::preroll::{PrerollBuffer, PrerollLimits, PrerollListener};
use autoplug_common::events::{FailureKind, StreamClassification, StreamInfo};
use autoplug_common::{time, AutoplugEvent, Caps, EngineConfig, EventBus};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

struct ManagerState {
    building: Option<Group>,
    queued: VecDeque<Group>,
    arena: ElementArena,
    /// Watched element -> group whose pending counter it holds
    watchers: HashMap<ElementId, Uuid>,
    /// Output ports the autoplugger already took a decision on
    claimed: HashSet<PortRef>,
    /// Ports with ANY caps -> group whose pending counter they hold
    deferred: HashMap<PortRef, Uuid>,
    /// Last selected type-relative index per stream type
    selected: HashMap<StreamClassification, usize>,
    flushing: bool,
    streamed: bool,
    next_input_expected: bool,
    outputs_prepared: bool,
    side_channel_done: bool,
}

impl ManagerState {
    fn new() -> Self {
        Self {
            building: None,
            queued: VecDeque::new(),
            arena: ElementArena::new(),
            watchers: HashMap::new(),
            claimed: HashSet::new(),
            deferred: HashMap::new(),
            selected: HashMap::new(),
            flushing: false,
            streamed: false,
            next_input_expected: false,
            outputs_prepared: false,
            side_channel_done: false,
        }
    }

    fn building_id(&self) -> Option<Uuid> {
        self.building.as_ref().map(|g| g.id())
    }

    fn group_mut(&mut self, id: Uuid) -> Option<&mut Group> {
        match &mut self.building {
            Some(g) if g.id() == id => Some(g),
            _ => self.queued.iter_mut().find(|g| g.id() == id),
        }
    }

    fn groups(&self) -> impl Iterator<Item = &Group> {
        self.building.iter().chain(self.queued.iter())
    }

    fn groups_mut(&mut self) -> impl Iterator<Item = &mut Group> {
        self.building.iter_mut().chain(self.queued.iter_mut())
    }

    /// The building group, created on demand
    fn building_group(&mut self) -> &mut Group {
        let streamed = self.streamed;
        self.building.get_or_insert_with(|| {
            let group = Group::new(streamed);
            info!("Created building group {}", group.id());
            group
        })
    }

    fn drop_watcher(&mut self, element: ElementId) -> Option<Uuid> {
        let owner = self.watchers.remove(&element)?;
        if let Some(group) = self.group_mut(owner) {
            group.remove_pending();
        }
        Some(owner)
    }

    /// Forget every deferred port of `element`; true if there was one
    fn drop_deferred_of(&mut self, element: ElementId) -> bool {
        let ports: Vec<PortRef> = self
            .deferred
            .keys()
            .filter(|p| p.element == element)
            .cloned()
            .collect();
        for port in &ports {
            if let Some(owner) = self.deferred.remove(port) {
                if let Some(group) = self.group_mut(owner) {
                    group.remove_pending();
                }
            }
        }
        !ports.is_empty()
    }

    fn building_settled(&self) -> bool {
        self.building.as_ref().is_some_and(|g| g.pending() == 0)
    }
}

/// One per-type output of the active group
#[derive(Debug, Clone)]
pub struct OutputSlot {
    pub group_id: Uuid,
    pub classification: StreamClassification,
    pub preroll: Arc<PrerollBuffer>,
    pub active_stream: Option<StreamInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ElementSnapshot {
    pub id: u64,
    pub name: String,
    pub owner: Uuid,
}

/// Serializable view of the manager state
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub building: Option<GroupSnapshot>,
    pub queued: Vec<GroupSnapshot>,
    pub elements: Vec<ElementSnapshot>,
    pub watchers: usize,
    pub deferred: usize,
    pub flushing: bool,
}

impl ManagerSnapshot {
    pub fn active(&self) -> Option<&GroupSnapshot> {
        self.queued.first()
    }
}

/// Routes PrerollBuffer watermark callbacks back to the owning group
struct GroupBufferListener {
    manager: Weak<GroupManager>,
    group_id: Uuid,
}

impl PrerollListener for GroupBufferListener {
    fn on_overrun(&self, _buffer: &PrerollBuffer) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_overrun(self.group_id);
        }
    }

    fn on_buffering(&self, buffer: &PrerollBuffer, percent: u8) {
        trace!("{} buffer of group {} at {}%", buffer.classification(), self.group_id, percent);
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_buffering(self.group_id);
        }
    }
}

pub struct GroupManager {
    state: Mutex<ManagerState>,
    cond: Condvar,
    publish: Mutex<()>,
    config: Arc<EngineConfig>,
    bus: EventBus,
    self_ref: Weak<GroupManager>,
}

impl std::fmt::Debug for GroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupManager")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

impl GroupManager {
    pub fn new(config: Arc<EngineConfig>, bus: EventBus) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            state: Mutex::new(ManagerState::new()),
            cond: Condvar::new(),
            publish: Mutex::new(()),
            config,
            bus,
            self_ref: weak.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` under the group lock, then apply its deferred effects
    fn run<R>(&self, f: impl FnOnce(&mut ManagerState, &mut Effects) -> R) -> R {
        let mut fx = Effects::new();
        let mut st = self.lock();
        let result = f(&mut st, &mut fx);
        self.finish(st, fx);
        result
    }

    /// Drop the group lock and apply `fx`
    ///
    /// The publish lock is taken before the group lock is released, so
    /// notifications go out in the order their lock sections ran.
    fn finish(&self, st: MutexGuard<'_, ManagerState>, mut fx: Effects) {
        let order = self.publish.lock().unwrap_or_else(|e| e.into_inner());
        drop(st);
        fx.publish(&self.bus);
        drop(order);
        fx.apply(&self.bus);
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================
    // Input lifecycle
    // ========================================

    /// Leave the flushing state after a teardown
    pub fn reset(&self) {
        let mut st = self.lock();
        st.flushing = false;
        st.outputs_prepared = false;
        st.side_channel_done = false;
        st.next_input_expected = false;
        st.selected.clear();
    }

    /// Streams of groups created from now on come from a network-style input
    pub fn set_streamed(&self, streamed: bool) {
        self.lock().streamed = streamed;
    }

    pub fn is_streamed(&self) -> bool {
        self.lock().streamed
    }

    pub fn is_flushing(&self) -> bool {
        self.lock().flushing
    }

    /// Announce that another input will follow the current one
    ///
    /// While set, retiring the last group waits for a successor instead of
    /// reporting the end of playback.
    pub fn expect_next_input(&self, expected: bool) {
        let mut st = self.lock();
        st.next_input_expected = expected;
        if !expected {
            self.cond.notify_all();
        }
    }

    pub fn get_or_create_building_group(&self) -> Result<Uuid> {
        let mut st = self.lock();
        if st.flushing {
            return Err(Error::Flushing);
        }
        Ok(st.building_group().id())
    }

    /// Keep the building group from committing during a synchronous build
    pub fn hold_building(&self) -> Result<Uuid> {
        let mut st = self.lock();
        if st.flushing {
            return Err(Error::Flushing);
        }
        let group = st.building_group();
        group.add_pending();
        Ok(group.id())
    }

    /// Drop a hold; commits the group if nothing else is pending
    pub fn release_hold(&self, group_id: Uuid) -> Result<()> {
        self.run(|st, fx| {
            let remaining = match st.group_mut(group_id) {
                Some(group) => group.remove_pending(),
                None => return Ok(()),
            };
            if remaining == 0 && st.building_id() == Some(group_id) {
                self.commit_locked(st, false, false, fx)
            } else {
                Ok(())
            }
        })
    }

    // ========================================
    // Elements and ports
    // ========================================

    /// Add a linked element to the arena, owned by the building group
    pub fn register_element(
        &self,
        element: Arc<dyn Element>,
        upstream: Option<PortRef>,
    ) -> Result<ElementId> {
        let mut st = self.lock();
        if st.flushing {
            return Err(Error::Flushing);
        }
        let owner = st.building_group().id();
        let name = element.name().to_string();
        let id = st.arena.insert(element, owner, upstream);
        debug!("Added {} as {} to group {}", name, id, owner);
        Ok(id)
    }

    /// Undo `register_element` for an element that failed to start
    pub fn unregister_element(&self, id: ElementId) -> Option<Arc<dyn Element>> {
        let mut st = self.lock();
        st.drop_watcher(id);
        st.drop_deferred_of(id);
        st.claimed.retain(|p| p.element != id);
        st.arena.remove(id)
    }

    pub fn element(&self, id: ElementId) -> Option<Arc<dyn Element>> {
        self.lock().arena.get(id).cloned()
    }

    pub fn find_element(&self, name: &str) -> Option<(ElementId, Arc<dyn Element>)> {
        let st = self.lock();
        let id = st.arena.find_by_name(name)?;
        st.arena.get(id).map(|e| (id, Arc::clone(e)))
    }

    /// Take the decision on an output port; false if it is already handled,
    /// its element is gone, or the engine is flushing
    pub fn claim_port(&self, port: &PortRef) -> bool {
        let mut st = self.lock();
        if st.flushing || !st.arena.contains(port.element) {
            return false;
        }
        st.claimed.insert(port.clone())
    }

    /// Hold the building group open for a port whose caps are still ANY
    ///
    /// The port is released for a later decision; the hold lasts until
    /// `resolve_deferred`, or until the port or its element goes away.
    pub fn defer_port(&self, port: &PortRef) -> Result<()> {
        let mut st = self.lock();
        if st.flushing {
            return Err(Error::Flushing);
        }
        st.claimed.remove(port);
        if st.deferred.contains_key(port) {
            return Ok(());
        }
        let group = st.building_group();
        group.add_pending();
        let (group_id, pending) = (group.id(), group.pending());
        st.deferred.insert(port.clone(), group_id);
        debug!(
            "Deferring {}:{} (group {}, pending {})",
            port.element, port.port, group_id, pending
        );
        Ok(())
    }

    /// Caps became known on a deferred port; returns false if it was not
    /// deferred
    pub fn resolve_deferred(&self, port: &PortRef) -> Result<bool> {
        self.run(|st, fx| {
            let Some(owner) = st.deferred.remove(port) else {
                return Ok(false);
            };
            let remaining = match st.group_mut(owner) {
                Some(group) => group.remove_pending(),
                None => return Ok(true),
            };
            trace!(
                "Resolved {}:{} (group {}, pending {})",
                port.element,
                port.port,
                owner,
                remaining
            );
            if remaining == 0 && st.building_id() == Some(owner) {
                self.commit_locked(st, false, false, fx)?;
            }
            Ok(true)
        })
    }

    // ========================================
    // Dynamic port watchers
    // ========================================

    /// Start counting a watcher against the building group
    pub fn register_watcher(&self, element: ElementId) -> Result<()> {
        let mut st = self.lock();
        if st.flushing {
            return Err(Error::Flushing);
        }
        let group = st.building_group();
        group.add_pending();
        let (group_id, pending) = (group.id(), group.pending());
        st.watchers.insert(element, group_id);
        debug!(
            "Watching {} for new ports (group {}, pending {})",
            element, group_id, pending
        );
        Ok(())
    }

    /// A watched element realized a port
    ///
    /// Returns false when the element is no longer watched. A watcher whose
    /// group already committed moves to the building group first.
    pub fn watcher_port_added(&self, element: ElementId) -> bool {
        let mut st = self.lock();
        if st.flushing {
            return false;
        }
        let Some(owner) = st.watchers.get(&element).copied() else {
            debug!("Port from unwatched element {}, ignoring", element);
            return false;
        };
        if st.building_id() != Some(owner) {
            if let Some(old) = st.group_mut(owner) {
                old.remove_pending();
            }
            let group = st.building_group();
            group.add_pending();
            let new_owner = group.id();
            st.watchers.insert(element, new_owner);
            debug!(
                "Watcher of {} moved from group {} to building group {}",
                element, owner, new_owner
            );
        }
        true
    }

    /// A watched element will create no further ports
    pub fn watcher_finished(&self, element: ElementId) -> Result<()> {
        self.run(|st, fx| {
            let Some(owner) = st.watchers.remove(&element) else {
                trace!("No-more-ports from unwatched element {}", element);
                return Ok(());
            };
            let remaining = match st.group_mut(owner) {
                Some(group) => group.remove_pending(),
                None => return Ok(()),
            };
            debug!(
                "{} has no more ports (group {}, pending {})",
                element, owner, remaining
            );
            if remaining == 0 && st.building_id() == Some(owner) {
                self.commit_locked(st, false, false, fx)
            } else {
                Ok(())
            }
        })
    }

    /// An element lost a previously linked output port
    ///
    /// Everything chained downstream of the port is released depth-first;
    /// terminal streams that were already announced are reported removed.
    /// The element gets a fresh watcher since it may produce a replacement.
    pub fn port_removed(&self, element: ElementId, port: &str) -> Result<()> {
        self.run(|st, fx| {
            if st.flushing {
                return Ok(());
            }
            let lost = PortRef::new(element, port);
            st.claimed.remove(&lost);
            let mut dropped_deferred = false;
            if let Some(owner) = st.deferred.remove(&lost) {
                if let Some(group) = st.group_mut(owner) {
                    group.remove_pending();
                }
                dropped_deferred = true;
            }
            let chain = st.arena.downstream_of(&lost);
            info!(
                "Port {}:{} removed, tearing down {} downstream elements",
                element,
                port,
                chain.len()
            );

            let in_chain = |p: &PortRef| *p == lost || chain.contains(&p.element);
            for group in st.groups_mut() {
                let group_id = group.id();
                let announced = group.state() != GroupState::Building;
                for stream in group.remove_streams(in_chain) {
                    debug!("Stream {} removed from group {}", stream.id(), group_id);
                    if announced {
                        fx.emit(AutoplugEvent::StreamRemoved {
                            group_id,
                            stream: stream.info(),
                            timestamp: time::now(),
                        });
                    }
                }
            }

            let mut dropped_watcher = false;
            for id in &chain {
                dropped_watcher |= st.drop_watcher(*id).is_some();
                dropped_deferred |= st.drop_deferred_of(*id);
                st.claimed.retain(|p| p.element != *id);
                if let Some(removed) = st.arena.remove(*id) {
                    fx.release(removed);
                }
            }

            if !st.watchers.contains_key(&element) {
                if let Some(owner) = st.arena.owner(element) {
                    if let Some(group) = st.group_mut(owner) {
                        group.add_pending();
                        st.watchers.insert(element, owner);
                        debug!("Re-watching {} in group {}", element, owner);
                    }
                }
            }

            if (dropped_watcher || dropped_deferred) && st.building_settled() {
                self.commit_locked(st, false, false, fx)
            } else {
                Ok(())
            }
        })
    }

    // ========================================
    // Streams
    // ========================================

    /// Append a terminal stream to the building group
    pub fn add_stream(
        &self,
        source: PortRef,
        element: &str,
        caps: Caps,
        classification: StreamClassification,
    ) -> Result<Arc<StreamDescriptor>> {
        let mut st = self.lock();
        if st.flushing {
            return Err(Error::Flushing);
        }
        let group = st.building_group();
        let group_id = group.id();
        let make_preroll = self.preroll_factory(group_id, group.is_streamed());
        let stream = group.add_stream(classification, caps, source, element, make_preroll);
        info!(
            "New {} stream {} in group {} from {}:{}",
            classification,
            stream.index(),
            group_id,
            element,
            stream.source().port
        );
        Ok(stream)
    }

    /// Builds the PrerollBuffer of a group's first stream of a type
    fn preroll_factory(
        &self,
        group_id: Uuid,
        streamed: bool,
    ) -> impl FnOnce(StreamClassification) -> Arc<PrerollBuffer> {
        let config = Arc::clone(&self.config);
        let manager = self.self_ref.clone();
        move |c| {
            debug!("Creating {} preroll buffer for group {}", c, group_id);
            let listener = Arc::new(GroupBufferListener { manager, group_id });
            Arc::new(PrerollBuffer::new(
                c,
                PrerollLimits::for_stream(&config.buffering, c, streamed),
                Some(listener),
            ))
        }
    }

    /// Record a port no element could handle
    pub fn add_unknown(&self, source: PortRef, element: &str, caps: Caps) -> Result<()> {
        self.run(|st, fx| {
            if st.flushing {
                return Err(Error::Flushing);
            }
            let port = source.port.clone();
            let group = st.building_group();
            let make_preroll = self.preroll_factory(group.id(), group.is_streamed());
            group.add_stream(
                StreamClassification::Unknown,
                caps.clone(),
                source,
                element,
                make_preroll,
            );
            warn!("Unknown type {} on {}:{}", caps, element, port);
            fx.emit(AutoplugEvent::UnknownType {
                element: element.to_string(),
                port,
                caps,
                timestamp: time::now(),
            });
            Ok(())
        })
    }

    pub fn preroll_buffer(&self, stream_id: Uuid) -> Option<Arc<PrerollBuffer>> {
        let st = self.lock();
        let found = st.groups().find_map(|g| {
            let stream = g.stream(stream_id)?;
            g.slot(stream.classification())
                .map(|slot| Arc::clone(&slot.preroll))
        });
        found
    }

    pub fn stream(&self, stream_id: Uuid) -> Option<Arc<StreamDescriptor>> {
        let st = self.lock();
        let found = st.groups().find_map(|g| g.stream(stream_id).cloned());
        found
    }

    /// Per-type outputs of the active group
    pub fn active_outputs(&self) -> Vec<OutputSlot> {
        let st = self.lock();
        let Some(active) = st.queued.front() else {
            return Vec::new();
        };
        active
            .slots()
            .iter()
            .map(|slot| OutputSlot {
                group_id: active.id(),
                classification: slot.selector.classification(),
                preroll: Arc::clone(&slot.preroll),
                active_stream: slot.selector.active_stream().map(|s| s.info()),
            })
            .collect()
    }

    /// Front-end stream selection on the active group
    pub fn select_stream(&self, classification: StreamClassification, index: usize) -> Result<()> {
        let mut st = self.lock();
        let active = st
            .queued
            .front_mut()
            .ok_or_else(|| Error::InvalidState("no active group".to_string()))?;
        active.select(classification, index)?;
        debug!("Selected {} stream {}", classification, index);
        st.selected.insert(classification, index);
        Ok(())
    }

    /// A stream reached end of stream
    ///
    /// When this finishes the active group it is retired and its successor
    /// promoted, which may block until the successor is committed.
    pub fn stream_eos(&self, stream_id: Uuid) -> Result<()> {
        let finished = {
            let mut st = self.lock();
            if st.flushing {
                return Ok(());
            }
            let mut found = None;
            for (i, group) in st.groups_mut().enumerate() {
                if group.mark_eos(stream_id) {
                    let is_active = group.state() == GroupState::Active;
                    found = Some(is_active && group.is_finished());
                    trace!("EOS on stream {} (group #{})", stream_id, i);
                    break;
                }
            }
            found.ok_or_else(|| Error::InvalidSelection(format!("unknown stream {}", stream_id)))?
        };
        if !finished {
            return Ok(());
        }
        match self.retire_active_and_promote() {
            Ok(_) | Err(Error::Flushing) => Ok(()),
            Err(e) => Err(e),
        }
    }

    // ========================================
    // Commit / promotion / teardown
    // ========================================

    /// Move the building group to the queued list
    ///
    /// No-op without a building group unless `force`. The first group
    /// queued since the input was set goes through output preparation and
    /// becomes active immediately. Side-channel commits only mark the side
    /// channel done and wake waiters.
    pub fn commit(&self, force: bool, side_channel: bool) -> Result<()> {
        self.run(|st, fx| self.commit_locked(st, force, side_channel, fx))
    }

    fn commit_locked(
        &self,
        st: &mut ManagerState,
        force: bool,
        side_channel: bool,
        fx: &mut Effects,
    ) -> Result<()> {
        if side_channel {
            if !st.side_channel_done {
                debug!("Side-channel group done");
                st.side_channel_done = true;
                self.cond.notify_all();
            }
            return Ok(());
        }

        let mut group = match st.building.take() {
            Some(group) => group,
            None if force => {
                debug!("Forced commit without building group");
                Group::new(st.streamed)
            }
            None => {
                trace!("Commit without building group, ignoring");
                return Ok(());
            }
        };
        let group_id = group.id();

        let first = !st.outputs_prepared;
        if first {
            if let Err(e) = group.validate() {
                warn!("Group {} failed output preparation: {}", group_id, e);
                let kind = match e {
                    Error::SubtitleWithoutVideo => FailureKind::SubtitleWithoutVideo,
                    Error::NoCandidates(_) => FailureKind::MissingElement,
                    _ => FailureKind::NoPlayableStream,
                };
                fx.emit(AutoplugEvent::Error {
                    kind,
                    message: e.to_string(),
                    timestamp: time::now(),
                });
                self.dispose_group(st, group, fx);
                self.cond.notify_all();
                return Err(e);
            }
            group.set_state(GroupState::Active);
            let chosen = group.activate(&st.selected);
            st.selected.extend(chosen);
            st.outputs_prepared = true;
        } else if group.streams().is_empty() {
            warn!("Discarding empty group {}", group_id);
            self.dispose_group(st, group, fx);
            self.cond.notify_all();
            return Ok(());
        } else {
            group.set_state(GroupState::Queued);
        }

        let count = group.streams().len();
        for (i, stream) in group.streams().iter().enumerate() {
            fx.emit(AutoplugEvent::NewElementaryStream {
                group_id,
                stream: stream.info(),
                is_last_in_batch: i + 1 == count,
                timestamp: time::now(),
            });
        }
        fx.emit(AutoplugEvent::GroupCommitted {
            group_id,
            stream_count: count,
            timestamp: time::now(),
        });
        if first {
            info!("Group {} committed and activated ({} streams)", group_id, count);
            fx.emit(AutoplugEvent::GroupSwitched {
                group_id,
                streams: group.infos(),
                timestamp: time::now(),
            });
        } else {
            info!("Group {} committed and queued ({} streams)", group_id, count);
        }

        st.queued.push_back(group);
        self.cond.notify_all();
        Ok(())
    }

    /// Block until a side-channel commit happened
    pub fn wait_side_channel(&self) -> Result<()> {
        let mut st = self.lock();
        while !st.side_channel_done {
            if st.flushing {
                return Err(Error::Flushing);
            }
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    /// Retire the active group and make the next queued group active
    ///
    /// Waits (lock released) while a successor is still being built or
    /// another input is expected. Returns the new active group, or `None`
    /// when playback drained.
    pub fn retire_active_and_promote(&self) -> Result<Option<Uuid>> {
        let mut fx = Effects::new();
        let (st, result) = self.retire_locked(self.lock(), &mut fx);
        self.finish(st, fx);
        result
    }

    fn retire_locked<'a>(
        &'a self,
        mut st: MutexGuard<'a, ManagerState>,
        fx: &mut Effects,
    ) -> (MutexGuard<'a, ManagerState>, Result<Option<Uuid>>) {
        let Some(old) = st.queued.pop_front() else {
            let err = Error::InvalidState("no active group to retire".to_string());
            return (st, Err(err));
        };
        old.shutdown_buffers();
        info!("Retiring group {}", old.id());

        loop {
            if st.flushing {
                debug!("Flushing, abandoning promotion");
                return (st, Err(Error::Flushing));
            }
            if !st.queued.is_empty() {
                break;
            }
            if st.building.is_none() && !st.next_input_expected {
                let group_id = old.id();
                self.dispose_group(&mut st, old, fx);
                st.outputs_prepared = false;
                info!("Group {} drained with no successor", group_id);
                fx.emit(AutoplugEvent::Drained {
                    group_id,
                    timestamp: time::now(),
                });
                return (st, Ok(None));
            }
            debug!("Waiting for a successor group");
            st = self.cond.wait(st).unwrap_or_else(|e| e.into_inner());
        }

        self.dispose_group(&mut st, old, fx);
        let preferred = st.selected.clone();
        let promoted = st.queued.front_mut().map(|head| {
            head.set_state(GroupState::Active);
            let chosen = head.activate(&preferred);
            (head.id(), head.infos(), chosen)
        });
        let Some((group_id, streams, chosen)) = promoted else {
            return (st, Err(Error::InvalidState("successor vanished".to_string())));
        };
        st.selected.extend(chosen);
        info!("Switched to group {}", group_id);
        fx.emit(AutoplugEvent::GroupSwitched {
            group_id,
            streams,
            timestamp: time::now(),
        });
        (st, Ok(Some(group_id)))
    }

    /// Release a group's elements
    ///
    /// Elements something in a surviving group still hangs off (a linked
    /// element or a stream taken from one of their ports) are handed to
    /// the next group (queued head, else the building group) instead.
    fn dispose_group(&self, st: &mut ManagerState, mut group: Group, fx: &mut Effects) {
        let group_id = group.id();
        group.shutdown_buffers();
        group.set_state(GroupState::Retired);
        let heir = st.queued.front().map(|g| g.id()).or_else(|| st.building_id());
        let sourced: HashSet<ElementId> = st
            .groups()
            .flat_map(|g| g.streams().iter().map(|s| s.source().element))
            .collect();

        for id in st.arena.owned_by(group_id) {
            let needed =
                st.arena.has_foreign_dependents(id) || st.arena.chain_reaches(id, &sourced);
            match heir {
                Some(heir) if needed => {
                    st.arena.set_owner(id, heir);
                    if st.watchers.get(&id) == Some(&group_id) {
                        st.watchers.insert(id, heir);
                        if let Some(g) = st.group_mut(heir) {
                            g.add_pending();
                        }
                    }
                    debug!("Element {} handed from group {} to {}", id, group_id, heir);
                }
                _ => {
                    st.watchers.remove(&id);
                    st.drop_deferred_of(id);
                    st.claimed.retain(|p| p.element != id);
                    if let Some(element) = st.arena.remove(id) {
                        fx.release(element);
                    }
                }
            }
        }

        let held: Vec<PortRef> = st
            .deferred
            .iter()
            .filter(|(_, owner)| **owner == group_id)
            .map(|(port, _)| port.clone())
            .collect();
        for port in held {
            match heir {
                Some(heir) if st.arena.contains(port.element) => {
                    if let Some(g) = st.group_mut(heir) {
                        g.add_pending();
                    }
                    st.deferred.insert(port, heir);
                }
                _ => {
                    st.deferred.remove(&port);
                }
            }
        }
        debug!("Disposed group {}", group_id);
    }

    /// Handle a full PrerollBuffer of `group_id`
    fn handle_overrun(&self, group_id: Uuid) {
        self.run(|st, fx| {
            if st.building_id() != Some(group_id) {
                return;
            }
            info!("Preroll overrun in building group {}, forcing commit", group_id);
            if let Err(e) = self.commit_locked(st, false, false, fx) {
                debug!("Overrun commit failed: {}", e);
            }
        })
    }

    /// Report the overall buffering level of `group_id` if it changed
    fn handle_buffering(&self, group_id: Uuid) {
        self.run(|st, fx| {
            let Some(percent) = st.group_mut(group_id).and_then(|g| g.update_buffering()) else {
                return;
            };
            debug!("Group {} buffering at {}%", group_id, percent);
            fx.emit(AutoplugEvent::BufferingPercent {
                percent,
                timestamp: time::now(),
            });
        })
    }

    /// Destroy every group and release every element
    pub fn teardown(&self) {
        self.run(|st, fx| {
            st.flushing = true;
            let mut count = 0;
            let building = st.building.take();
            let queued: Vec<Group> = st.queued.drain(..).collect();
            for mut group in building.into_iter().chain(queued) {
                group.shutdown_buffers();
                group.set_state(GroupState::Retired);
                count += 1;
            }
            for element in st.arena.drain() {
                fx.release(element);
            }
            st.watchers.clear();
            st.claimed.clear();
            st.deferred.clear();
            self.cond.notify_all();
            info!("Teardown released {} groups", count);
        })
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let st = self.lock();
        let elements = st
            .arena
            .ids()
            .into_iter()
            .filter_map(|id| {
                Some(ElementSnapshot {
                    id: id.raw(),
                    name: st.arena.get(id)?.name().to_string(),
                    owner: st.arena.owner(id)?,
                })
            })
            .collect();
        ManagerSnapshot {
            building: st.building.as_ref().map(|g| g.snapshot()),
            queued: st.queued.iter().map(|g| g.snapshot()).collect(),
            elements,
            watchers: st.watchers.len(),
            deferred: st.deferred.len(),
            flushing: st.flushing,
        }
    }
}
