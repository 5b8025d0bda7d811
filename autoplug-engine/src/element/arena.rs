//! Element arena
//!
//! Every successfully linked element lives in a single arena, indexed by a
//! stable `ElementId`. Cross-references (the port a stream came from, the
//! upstream port an element is linked to) are `PortRef` lookups into the
//! arena, never ownership. Each entry records the group that owns it.

use super::Element;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Stable arena index of an element
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElementId(u64);

impl ElementId {
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Weak reference to a port: owning element plus port name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortRef {
    pub element: ElementId,
    pub port: String,
}

impl PortRef {
    pub fn new(element: ElementId, port: impl Into<String>) -> Self {
        Self {
            element,
            port: port.into(),
        }
    }
}

struct ElementEntry {
    element: Arc<dyn Element>,
    owner: Uuid,
    /// Output port this element's input is linked to
    upstream: Option<PortRef>,
}

/// Arena of linked elements
#[derive(Default)]
pub struct ElementArena {
    next_id: u64,
    entries: BTreeMap<ElementId, ElementEntry>,
}

impl ElementArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        element: Arc<dyn Element>,
        owner: Uuid,
        upstream: Option<PortRef>,
    ) -> ElementId {
        let id = ElementId(self.next_id);
        self.next_id += 1;
        self.entries.insert(
            id,
            ElementEntry {
                element,
                owner,
                upstream,
            },
        );
        id
    }

    pub fn get(&self, id: ElementId) -> Option<&Arc<dyn Element>> {
        self.entries.get(&id).map(|e| &e.element)
    }

    pub fn owner(&self, id: ElementId) -> Option<Uuid> {
        self.entries.get(&id).map(|e| e.owner)
    }

    pub fn upstream(&self, id: ElementId) -> Option<&PortRef> {
        self.entries.get(&id).and_then(|e| e.upstream.as_ref())
    }

    pub fn contains(&self, id: ElementId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every id, in insertion order
    pub fn ids(&self) -> Vec<ElementId> {
        self.entries.keys().copied().collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<ElementId> {
        self.entries
            .iter()
            .find(|(_, e)| e.element.name() == name)
            .map(|(id, _)| *id)
    }

    /// Element linked to the given output port, if any
    pub fn linked_to(&self, port: &PortRef) -> Option<ElementId> {
        self.entries
            .iter()
            .find(|(_, e)| e.upstream.as_ref() == Some(port))
            .map(|(id, _)| *id)
    }

    pub fn remove(&mut self, id: ElementId) -> Option<Arc<dyn Element>> {
        self.entries.remove(&id).map(|e| e.element)
    }

    /// Elements chained downstream of an output port
    ///
    /// Depth-first pre-order: every element precedes the elements linked to
    /// its outputs.
    pub fn downstream_of(&self, port: &PortRef) -> Vec<ElementId> {
        let mut out = Vec::new();
        if let Some(first) = self.linked_to(port) {
            self.collect_chain(first, &mut out);
        }
        out
    }

    fn collect_chain(&self, id: ElementId, out: &mut Vec<ElementId>) {
        out.push(id);
        let children: Vec<ElementId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.upstream.as_ref().map(|u| u.element) == Some(id))
            .map(|(child, _)| *child)
            .collect();
        for child in children {
            self.collect_chain(child, out);
        }
    }

    /// Ids owned by a group, in insertion order
    pub fn owned_by(&self, group: Uuid) -> Vec<ElementId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.owner == group)
            .map(|(id, _)| *id)
            .collect()
    }

    /// True if an element owned by another group is linked (directly or
    /// transitively) downstream of `id`
    pub fn has_foreign_dependents(&self, id: ElementId) -> bool {
        let owner = match self.owner(id) {
            Some(o) => o,
            None => return false,
        };
        let mut chain = Vec::new();
        self.collect_chain(id, &mut chain);
        chain
            .iter()
            .skip(1)
            .any(|child| self.owner(*child).is_some_and(|o| o != owner))
    }

    /// True if `id` or anything chained downstream of it is in `anchors`
    pub fn chain_reaches(&self, id: ElementId, anchors: &HashSet<ElementId>) -> bool {
        let mut chain = Vec::new();
        self.collect_chain(id, &mut chain);
        chain.iter().any(|e| anchors.contains(e))
    }

    pub fn set_owner(&mut self, id: ElementId, owner: Uuid) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.owner = owner;
        }
    }

    /// Remove every element, returning them in insertion order
    pub fn drain(&mut self) -> Vec<Arc<dyn Element>> {
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|e| e.element)
            .collect()
    }
}

impl fmt::Debug for ElementArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(id, e)| (id, e.element.name())))
            .finish()
    }
}
