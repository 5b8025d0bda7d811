//! Deferred side effects of group-lock holders
//!
//! Routines running under the group lock never emit notifications or touch
//! elements directly. They record what has to happen in an `Effects` list
//! which the caller applies once the lock is released: notifications first,
//! under the manager's publish lock, then element releases with no lock held.

use crate::element::{Element, ElementState};
use autoplug_common::{AutoplugEvent, EventBus};
use std::sync::Arc;
use tracing::{trace, warn};

pub(crate) enum Deferred {
    Emit(AutoplugEvent),
    /// Unlink and shut down an element removed from the arena
    Release(Arc<dyn Element>),
}

#[derive(Default)]
pub(crate) struct Effects {
    queue: Vec<Deferred>,
}

impl Effects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, event: AutoplugEvent) {
        self.queue.push(Deferred::Emit(event));
    }

    pub fn release(&mut self, element: Arc<dyn Element>) {
        self.queue.push(Deferred::Release(element));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Emit the recorded notifications, keeping element releases queued
    pub fn publish(&mut self, bus: &EventBus) {
        let mut kept = Vec::new();
        for effect in self.queue.drain(..) {
            match effect {
                Deferred::Emit(event) => {
                    trace!("Emitting {}", event.name());
                    bus.emit_lossy(event);
                }
                release => kept.push(release),
            }
        }
        self.queue = kept;
    }

    /// Run every remaining deferred effect in recording order
    pub fn apply(self, bus: &EventBus) {
        for effect in self.queue {
            match effect {
                Deferred::Emit(event) => {
                    trace!("Emitting {}", event.name());
                    bus.emit_lossy(event);
                }
                Deferred::Release(element) => {
                    trace!("Releasing element {}", element.name());
                    element.unlink_input();
                    if let Err(e) = element.set_state(ElementState::Null) {
                        warn!("Failed to shut down {}: {}", element.name(), e);
                    }
                }
            }
        }
    }
}
