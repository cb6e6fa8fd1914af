//! Per-dashboard bounded outbound queue.
//!
//! A slow dashboard must never block the router, so writes go through this
//! queue and a per-connection writer task drains it. Log-class frames
//! occupy a bounded region and drop oldest-first under pressure;
//! status-class frames always enqueue so no state transition is ever lost.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Backpressure class of an outbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// May be dropped oldest-first when the dashboard is slow.
    Log,
    /// Never dropped.
    Status,
}

struct QueueInner {
    frames: VecDeque<(FrameClass, String)>,
    log_count: usize,
    closed: bool,
}

/// A bounded FIFO of outbound frames with class-aware drop policy.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    log_capacity: usize,
    notify: Notify,
}

impl OutboundQueue {
    /// Create a queue whose log-class region holds `log_capacity` frames.
    #[must_use]
    pub fn new(log_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                log_count: 0,
                closed: false,
            }),
            log_capacity: log_capacity.max(1),
            notify: Notify::new(),
        }
    }

    /// Enqueue a frame. Returns the number of log frames dropped to make
    /// room (always 0 for status-class frames).
    pub fn push(&self, class: FrameClass, frame: String) -> usize {
        let mut dropped = 0;
        {
            let Ok(mut inner) = self.inner.lock() else {
                return 0;
            };
            if inner.closed {
                return 0;
            }
            if class == FrameClass::Log && inner.log_count >= self.log_capacity {
                // Drop the oldest log frame; status frames stay put.
                if let Some(pos) = inner.frames.iter().position(|(c, _)| *c == FrameClass::Log)
                {
                    let _ = inner.frames.remove(pos);
                    inner.log_count = inner.log_count.saturating_sub(1);
                    dropped = 1;
                }
            }
            if class == FrameClass::Log {
                inner.log_count = inner.log_count.saturating_add(1);
            }
            inner.frames.push_back((class, frame));
        }
        self.notify.notify_one();
        dropped
    }

    /// Dequeue the next frame, waiting until one is available.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let Ok(mut inner) = self.inner.lock() else {
                    return None;
                };
                if let Some((class, frame)) = inner.frames.pop_front() {
                    if class == FrameClass::Log {
                        inner.log_count = inner.log_count.saturating_sub(1);
                    }
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue; `pop` returns `None` once drained.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Current queue depth (both classes).
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.frames.len()).unwrap_or(0)
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
