//! Bounded device-hotplug queue consumed by the session runner
//!
//! Events carry the udev environment and hardware-database entries of a
//! virtual device. Applying an event twice must yield the same guest
//! device node, so the consumer never needs to deduplicate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{Result, ServerError};

use super::InputDeviceHandle;

pub const DEFAULT_PLUG_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugAction {
    Add,
    Remove,
}

#[derive(Debug, Clone)]
pub struct PlugEvent {
    pub action: PlugAction,
    pub device: InputDeviceHandle,
}

impl PlugEvent {
    /// Events with hardware-database entries must reach the guest; they
    /// are never dropped on overflow.
    pub fn is_critical(&self) -> bool {
        !self.device.hw_db_entries.is_empty()
    }
}

/// Thread-safe bounded FIFO of hotplug events.
pub struct PlugQueue {
    inner: Mutex<VecDeque<PlugEvent>>,
    available: Condvar,
    capacity: usize,
}

impl Default for PlugQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_PLUG_QUEUE_CAPACITY)
    }
}

impl PlugQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Non-blocking push. On overflow the oldest non-critical event is
    /// dropped to make room; if every queued event is critical the push
    /// fails instead.
    pub fn try_push(&self, event: PlugEvent) -> Result<()> {
        let mut queue = self.inner.lock();
        if queue.len() == self.capacity {
            match queue.iter().position(|e| !e.is_critical()) {
                Some(pos) => {
                    let dropped = queue.remove(pos);
                    warn!(?dropped, "plug queue full, dropped oldest non-critical event");
                }
                None => {
                    return Err(ServerError::ResourceExhausted {
                        resource: "device plug queue".into(),
                    });
                }
            }
        }
        queue.push_back(event);
        drop(queue);
        self.available.notify_one();
        Ok(())
    }

    /// Blocking pop with a deadline; `None` on timeout.
    pub fn pop_with_timeout(&self, timeout: Duration) -> Option<PlugEvent> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.lock();
        loop {
            if let Some(event) = queue.pop_front() {
                return Some(event);
            }
            if self
                .available
                .wait_until(&mut queue, deadline)
                .timed_out()
            {
                return queue.pop_front();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
