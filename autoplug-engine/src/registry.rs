//! Element factory registry
//!
//! A typed capability index built once at startup. Factories are indexed by
//! the media type names of their sink caps; a query intersects the candidate
//! set with the requested caps instead of matching class-name substrings.
//!
//! Candidate order is deterministic: rank descending, ties broken by
//! reverse-lexicographic factory name.

use crate::element::ElementFactory;
use autoplug_common::Caps;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

/// Registry of autopluggable element factories
#[derive(Debug, Default)]
pub struct FactoryRegistry {
    factories: Vec<Arc<dyn ElementFactory>>,
    /// Sink structure name -> factory indices
    by_type: HashMap<String, Vec<usize>>,
    /// Factories accepting ANY caps
    wildcard: Vec<usize>,
}

impl FactoryRegistry {
    /// Build the index from a factory list
    ///
    /// Factories whose kind is not autopluggable (sources, generic
    /// elements) are left out.
    pub fn new(factories: impl IntoIterator<Item = Arc<dyn ElementFactory>>) -> Self {
        let mut registry = Self::default();
        for factory in factories {
            registry.register(factory);
        }
        registry
    }

    fn register(&mut self, factory: Arc<dyn ElementFactory>) {
        if !factory.kind().is_autopluggable() {
            trace!("Skipping non-autopluggable factory {}", factory.name());
            return;
        }
        let idx = self.factories.len();
        let caps = factory.sink_caps();
        if caps.is_any() {
            self.wildcard.push(idx);
        } else {
            let mut names: Vec<&str> = caps.structures().iter().map(|s| s.name()).collect();
            names.sort_unstable();
            names.dedup();
            for name in names {
                self.by_type.entry(name.to_string()).or_default().push(idx);
            }
        }
        self.factories.push(factory);
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ElementFactory>> {
        self.factories.iter().find(|f| f.name() == name)
    }

    /// Factories whose sink caps intersect `caps`, in try order
    pub fn find_candidates(&self, caps: &Caps) -> Vec<Arc<dyn ElementFactory>> {
        if caps.is_empty() {
            return Vec::new();
        }

        let mut indices: Vec<usize> = if caps.is_any() {
            (0..self.factories.len()).collect()
        } else {
            let mut v: Vec<usize> = caps
                .structures()
                .iter()
                .filter_map(|s| self.by_type.get(s.name()))
                .flatten()
                .copied()
                .chain(self.wildcard.iter().copied())
                .collect();
            v.sort_unstable();
            v.dedup();
            v
        };

        indices.retain(|&i| self.factories[i].sink_caps().can_intersect(caps));

        let mut candidates: Vec<Arc<dyn ElementFactory>> =
            indices.into_iter().map(|i| Arc::clone(&self.factories[i])).collect();
        sort_candidates(&mut candidates);
        candidates
    }
}

/// Rank descending, then reverse-lexicographic name
pub fn sort_candidates(candidates: &mut [Arc<dyn ElementFactory>]) {
    candidates.sort_by(|a, b| {
        (Reverse(a.rank()), Reverse(a.name())).cmp(&(Reverse(b.rank()), Reverse(b.name())))
    });
}
