//! Front-end hooks consulted during autoplugging

use crate::element::{ElementFactory, Port};
use autoplug_common::events::StreamClassification;
use autoplug_common::Caps;
use std::sync::Arc;

/// What to do with one candidate factory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Instantiate and link the candidate
    Try,
    /// Stop searching and expose the port as-is
    Expose,
    /// Move on to the next candidate
    Skip,
}

/// Decision points the front-end can override
///
/// All methods have permissive defaults.
pub trait AutoplugHooks: Send + Sync {
    /// Returning false exposes the port as a terminal stream even if its
    /// caps are not raw
    fn should_continue(&self, _port: &Port, _caps: &Caps) -> bool {
        true
    }

    /// Filter or reorder the ranked candidates for a port before any is tried
    fn sort(
        &self,
        _port: &Port,
        _caps: &Caps,
        candidates: Vec<Arc<dyn ElementFactory>>,
    ) -> Vec<Arc<dyn ElementFactory>> {
        candidates
    }

    fn select(&self, _port: &Port, _caps: &Caps, _factory: &dyn ElementFactory) -> Selection {
        Selection::Try
    }

    /// Returning false discards a terminal stream silently
    fn accept_stream(&self, _classification: StreamClassification, _caps: &Caps) -> bool {
        true
    }
}

/// Hooks with every default
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl AutoplugHooks for DefaultHooks {}

/// Accepts only the listed stream types; e.g. an audio-only front-end
/// drops video streams without reporting them
#[derive(Debug, Clone)]
pub struct StreamTypeFilter {
    accepted: Vec<StreamClassification>,
}

impl StreamTypeFilter {
    pub fn new(accepted: impl IntoIterator<Item = StreamClassification>) -> Self {
        Self {
            accepted: accepted.into_iter().collect(),
        }
    }

    /// Every type except `rejected`
    pub fn without(rejected: &[StreamClassification]) -> Self {
        Self::new(
            StreamClassification::SELECTABLE
                .into_iter()
                .chain([StreamClassification::Element, StreamClassification::Unknown])
                .filter(|c| !rejected.contains(c)),
        )
    }
}

impl AutoplugHooks for StreamTypeFilter {
    fn accept_stream(&self, classification: StreamClassification, _caps: &Caps) -> bool {
        self.accepted.contains(&classification)
    }
}
