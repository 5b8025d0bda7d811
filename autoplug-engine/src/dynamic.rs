//! DynamicPortTracker
//!
//! Elements that create output ports at unpredictable times hand out the
//! receiving end of a `PortEvent` channel. The tracker drains each channel
//! on its own tokio task and forwards the events, one at a time and in
//! arrival order, to a `PortEventSink` (the autoplug engine).
//!
//! Pending-counter bookkeeping is not done here: the sink resolves each
//! event against the GroupManager, where a watcher whose group is gone is
//! a no-op.

use crate::element::{ElementId, PortEvent};
use std::sync::{Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Consumer of dynamic port events
pub trait PortEventSink: Send + Sync {
    fn handle_port_event(&self, element: ElementId, event: PortEvent);
}

pub struct DynamicPortTracker {
    handle: Handle,
    /// Dropping the sender stops every watcher subscribed to it
    stop: Mutex<watch::Sender<bool>>,
}

impl std::fmt::Debug for DynamicPortTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPortTracker").finish_non_exhaustive()
    }
}

impl DynamicPortTracker {
    pub fn new(handle: Handle) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            handle,
            stop: Mutex::new(stop),
        }
    }

    fn stop_sender(&self) -> MutexGuard<'_, watch::Sender<bool>> {
        self.stop.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a watcher task for one element
    pub fn watch(
        &self,
        element: ElementId,
        mut events: mpsc::UnboundedReceiver<PortEvent>,
        sink: Weak<dyn PortEventSink>,
    ) {
        let mut stop = self.stop_sender().subscribe();
        debug!("Spawning port watcher for {}", element);
        self.handle.spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let Some(event) = event else {
                            trace!("Port channel of {} closed", element);
                            break;
                        };
                        let Some(sink) = sink.upgrade() else {
                            break;
                        };
                        sink.handle_port_event(element, event);
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Port watcher for {} finished", element);
        });
    }

    /// Stop every running watcher; later `watch` calls start fresh
    pub fn shutdown(&self) {
        let mut stop = self.stop_sender();
        let _ = stop.send(true);
        let (fresh, _) = watch::channel(false);
        *stop = fresh;
    }
}
