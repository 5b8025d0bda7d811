//! Per-type stream selector
//!
//! Holds the streams of one classification in type-relative order and keeps
//! exactly one of them unmuted once activated.

use super::StreamDescriptor;
use crate::error::{Error, Result};
use autoplug_common::events::StreamClassification;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug)]
pub struct StreamSelector {
    classification: StreamClassification,
    streams: Vec<Arc<StreamDescriptor>>,
    active: Option<usize>,
}

impl StreamSelector {
    pub fn new(classification: StreamClassification) -> Self {
        Self {
            classification,
            streams: Vec::new(),
            active: None,
        }
    }

    pub fn classification(&self) -> StreamClassification {
        self.classification
    }

    pub fn add(&mut self, stream: Arc<StreamDescriptor>) {
        self.streams.push(stream);
    }

    /// Remove a stream; the active selection falls back to the first
    /// remaining stream if it was the one removed
    pub fn remove(&mut self, stream_id: Uuid) -> bool {
        let Some(pos) = self.streams.iter().position(|s| s.id() == stream_id) else {
            return false;
        };
        self.streams.remove(pos);
        if let Some(active) = self.active {
            if active == pos {
                self.active = None;
                if !self.streams.is_empty() {
                    self.apply(0);
                }
            } else if active > pos {
                self.active = Some(active - 1);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn streams(&self) -> &[Arc<StreamDescriptor>] {
        &self.streams
    }

    pub fn active_index(&self) -> Option<usize> {
        self.active
    }

    pub fn active_stream(&self) -> Option<&Arc<StreamDescriptor>> {
        self.active.and_then(|i| self.streams.get(i))
    }

    /// Mute all but one stream, preferring `preferred` when in range
    pub fn activate(&mut self, preferred: Option<usize>) -> Option<usize> {
        if self.streams.is_empty() {
            self.active = None;
            return None;
        }
        let index = preferred.filter(|&i| i < self.streams.len()).unwrap_or(0);
        self.apply(index);
        Some(index)
    }

    /// Explicit front-end selection
    pub fn select(&mut self, index: usize) -> Result<()> {
        if index >= self.streams.len() {
            return Err(Error::InvalidSelection(format!(
                "{} stream {} of {}",
                self.classification,
                index,
                self.streams.len()
            )));
        }
        self.apply(index);
        Ok(())
    }

    fn apply(&mut self, index: usize) {
        for (i, stream) in self.streams.iter().enumerate() {
            stream.set_muted(i != index);
        }
        self.active = Some(index);
    }
}
