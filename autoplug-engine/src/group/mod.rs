//! Groups of discovered streams
//!
//! A group aggregates every elementary stream found for one edition of the
//! input. Streams of the same classification share one PrerollBuffer and one
//! StreamSelector (a "type slot"); unknown and sink-handled streams have no
//! slot.

mod effects;
pub mod manager;
mod selector;

pub(crate) use effects::Effects;
pub use manager::{GroupManager, ManagerSnapshot, OutputSlot};
pub use selector::StreamSelector;

use crate::element::PortRef;
use crate::error::{Error, Result};
use crate::preroll::PrerollBuffer;
use autoplug_common::events::{StreamClassification, StreamInfo};
use autoplug_common::Caps;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Group lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupState {
    /// Streams are still being discovered
    Building,
    /// Committed, waiting to become active
    Queued,
    /// Feeding the front-end's outputs
    Active,
    Retired,
}

impl fmt::Display for GroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupState::Building => write!(f, "building"),
            GroupState::Queued => write!(f, "queued"),
            GroupState::Active => write!(f, "active"),
            GroupState::Retired => write!(f, "retired"),
        }
    }
}

#[derive(Debug, Default)]
struct StreamFlags {
    muted: bool,
    eos: bool,
    codec: Option<String>,
    language: Option<String>,
}

/// One discovered elementary stream
///
/// Shape fields are immutable; data-path flags sit behind the descriptor's
/// own lock so they can change without the group lock.
#[derive(Debug)]
pub struct StreamDescriptor {
    id: Uuid,
    index: usize,
    classification: StreamClassification,
    caps: Caps,
    source: PortRef,
    element: String,
    flags: Mutex<StreamFlags>,
}

impl StreamDescriptor {
    pub fn new(
        index: usize,
        classification: StreamClassification,
        caps: Caps,
        source: PortRef,
        element: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            index,
            classification,
            caps,
            source,
            element: element.into(),
            flags: Mutex::new(StreamFlags::default()),
        }
    }

    fn flags(&self) -> MutexGuard<'_, StreamFlags> {
        self.flags.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn classification(&self) -> StreamClassification {
        self.classification
    }

    pub fn caps(&self) -> &Caps {
        &self.caps
    }

    /// Port the stream was exposed from
    pub fn source(&self) -> &PortRef {
        &self.source
    }

    pub fn is_muted(&self) -> bool {
        self.flags().muted
    }

    pub fn set_muted(&self, muted: bool) {
        self.flags().muted = muted;
    }

    pub fn is_eos(&self) -> bool {
        self.flags().eos
    }

    pub fn set_eos(&self, eos: bool) {
        self.flags().eos = eos;
    }

    /// Record codec/language discovered from in-band tags
    pub fn set_tags(&self, codec: Option<String>, language: Option<String>) {
        let mut flags = self.flags();
        if codec.is_some() {
            flags.codec = codec;
        }
        if language.is_some() {
            flags.language = language;
        }
    }

    /// No more data is expected from this stream for playback purposes
    pub fn is_done(&self) -> bool {
        let flags = self.flags();
        flags.muted || flags.eos || self.classification == StreamClassification::Unknown
    }

    pub fn info(&self) -> StreamInfo {
        let flags = self.flags();
        StreamInfo {
            stream_id: self.id,
            index: self.index,
            classification: self.classification,
            caps: self.caps.clone(),
            element: self.element.clone(),
            port: self.source.port.clone(),
            muted: flags.muted,
            codec: flags.codec.clone(),
            language: flags.language.clone(),
        }
    }
}

/// PrerollBuffer, selector and done flag for one stream type
#[derive(Debug)]
pub struct TypeSlot {
    pub preroll: Arc<PrerollBuffer>,
    pub selector: StreamSelector,
    pub done: bool,
}

/// Serializable view of a group
#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub id: Uuid,
    pub state: GroupState,
    pub pending: usize,
    pub streams: Vec<StreamInfo>,
}

#[derive(Debug)]
pub struct Group {
    id: Uuid,
    state: GroupState,
    streamed: bool,
    streams: Vec<Arc<StreamDescriptor>>,
    slots: Vec<TypeSlot>,
    /// Streams discovered so far, including removed ones
    discovered: usize,
    /// Outstanding asynchronous extensions (watchers, deferred ports and
    /// build passes)
    pending: usize,
    /// Last reported overall buffering level
    buffering_percent: Option<u8>,
}

impl Group {
    pub fn new(streamed: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: GroupState::Building,
            streamed,
            streams: Vec::new(),
            slots: Vec::new(),
            discovered: 0,
            pending: 0,
            buffering_percent: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: GroupState) {
        self.state = state;
    }

    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub(crate) fn add_pending(&mut self) {
        self.pending += 1;
    }

    pub(crate) fn remove_pending(&mut self) -> usize {
        self.pending = self.pending.saturating_sub(1);
        self.pending
    }

    pub fn streams(&self) -> &[Arc<StreamDescriptor>] {
        &self.streams
    }

    pub fn stream(&self, id: Uuid) -> Option<&Arc<StreamDescriptor>> {
        self.streams.iter().find(|s| s.id() == id)
    }

    pub fn slots(&self) -> &[TypeSlot] {
        &self.slots
    }

    pub fn slot(&self, classification: StreamClassification) -> Option<&TypeSlot> {
        self.slots
            .iter()
            .find(|s| s.selector.classification() == classification)
    }

    fn slot_mut(&mut self, classification: StreamClassification) -> Option<&mut TypeSlot> {
        self.slots
            .iter_mut()
            .find(|s| s.selector.classification() == classification)
    }

    pub fn has(&self, classification: StreamClassification) -> bool {
        self.streams
            .iter()
            .any(|s| s.classification() == classification)
    }

    /// Append a stream; the first stream of a selectable type creates the
    /// type slot with the buffer from `make_preroll`
    pub(crate) fn add_stream(
        &mut self,
        classification: StreamClassification,
        caps: Caps,
        source: PortRef,
        element: &str,
        make_preroll: impl FnOnce(StreamClassification) -> Arc<PrerollBuffer>,
    ) -> Arc<StreamDescriptor> {
        let stream = Arc::new(StreamDescriptor::new(
            self.discovered,
            classification,
            caps,
            source,
            element,
        ));
        self.discovered += 1;

        if StreamClassification::SELECTABLE.contains(&classification) {
            if self.slot(classification).is_none() {
                self.slots.push(TypeSlot {
                    preroll: make_preroll(classification),
                    selector: StreamSelector::new(classification),
                    done: false,
                });
            }
            if let Some(slot) = self.slot_mut(classification) {
                slot.selector.add(Arc::clone(&stream));
            }
        }
        self.streams.push(Arc::clone(&stream));
        stream
    }

    /// Remove every stream whose source port matches
    pub(crate) fn remove_streams(
        &mut self,
        matches: impl Fn(&PortRef) -> bool,
    ) -> Vec<Arc<StreamDescriptor>> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.streams)
            .into_iter()
            .partition(|s| matches(s.source()));
        self.streams = kept;
        for stream in &removed {
            if let Some(slot) = self.slot_mut(stream.classification()) {
                slot.selector.remove(stream.id());
            }
        }
        removed
    }

    /// Mute all but one stream of each type
    pub(crate) fn activate(
        &mut self,
        preferred: &HashMap<StreamClassification, usize>,
    ) -> HashMap<StreamClassification, usize> {
        let mut chosen = HashMap::new();
        for slot in &mut self.slots {
            let c = slot.selector.classification();
            if let Some(index) = slot.selector.activate(preferred.get(&c).copied()) {
                chosen.insert(c, index);
            }
        }
        chosen
    }

    pub(crate) fn select(&mut self, classification: StreamClassification, index: usize) -> Result<()> {
        match self.slot_mut(classification) {
            Some(slot) => slot.selector.select(index),
            None => Err(Error::InvalidSelection(format!(
                "no {} streams in group",
                classification
            ))),
        }
    }

    /// Mark a stream as ended; returns false if it is not in this group
    pub(crate) fn mark_eos(&mut self, stream_id: Uuid) -> bool {
        let Some(stream) = self.stream(stream_id).cloned() else {
            return false;
        };
        stream.set_eos(true);
        if let Some(slot) = self.slot_mut(stream.classification()) {
            slot.done = slot.selector.streams().iter().all(|s| s.is_done());
        }
        true
    }

    /// Every stream is muted, ended or ignored
    pub fn is_finished(&self) -> bool {
        self.streams.iter().all(|s| s.is_done())
    }

    /// Output preparation checks for the first committed group
    pub fn validate(&self) -> Result<()> {
        use StreamClassification::*;
        let subtitle = self.has(Text) || self.has(Subpicture);
        let playable = self.has(Audio) || self.has(Video) || self.has(Element);
        if subtitle && !self.has(Video) {
            return Err(Error::SubtitleWithoutVideo);
        }
        if !playable {
            let unknown: Vec<String> = self
                .streams
                .iter()
                .filter(|s| s.classification() == Unknown)
                .map(|s| s.caps().to_string())
                .collect();
            if unknown.is_empty() {
                return Err(Error::NoPlayableStream);
            }
            return Err(Error::NoCandidates(unknown.join(", ")));
        }
        Ok(())
    }

    /// Recompute the group's buffering level
    ///
    /// The level is the lowest progress across the type slots; a slot whose
    /// output is flowing counts as full. Returns the level only when it
    /// differs from the last one returned.
    pub(crate) fn update_buffering(&mut self) -> Option<u8> {
        let percent = self
            .slots
            .iter()
            .map(|slot| slot.preroll.buffering_percent().unwrap_or(100))
            .min()?;
        if self.buffering_percent == Some(percent) {
            return None;
        }
        self.buffering_percent = Some(percent);
        Some(percent)
    }

    /// Stop data flow into every PrerollBuffer of the group
    pub(crate) fn shutdown_buffers(&self) {
        for slot in &self.slots {
            slot.preroll.set_flushing(true);
        }
    }

    pub fn infos(&self) -> Vec<StreamInfo> {
        self.streams.iter().map(|s| s.info()).collect()
    }

    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            id: self.id,
            state: self.state,
            pending: self.pending,
            streams: self.infos(),
        }
    }
}
