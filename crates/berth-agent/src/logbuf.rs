//! Bounded in-memory log rings.

use std::collections::VecDeque;
use std::sync::Mutex;

/// A bounded ring of log lines, oldest evicted first.
pub struct LogRing {
    inner: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogRing {
    /// Create a ring holding at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        if let Ok(mut lines) = self.inner.lock() {
            if lines.len() >= self.capacity {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    /// The most recent `limit` lines, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<String> {
        self.inner
            .lock()
            .map(|lines| {
                let skip = lines.len().saturating_sub(limit);
                lines.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Drop every retained line.
    pub fn clear(&self) {
        if let Ok(mut lines) = self.inner.lock() {
            lines.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let ring = LogRing::new(3);
        for n in 0..5 {
            ring.push(format!("line-{n}"));
        }
        assert_eq!(ring.recent(10), vec!["line-2", "line-3", "line-4"]);
    }

    #[test]
    fn recent_limits_from_the_tail() {
        let ring = LogRing::new(10);
        for n in 0..5 {
            ring.push(format!("line-{n}"));
        }
        assert_eq!(ring.recent(2), vec!["line-3", "line-4"]);
    }

    #[test]
    fn clear_empties() {
        let ring = LogRing::new(4);
        ring.push("x".into());
        ring.clear();
        assert!(ring.recent(10).is_empty());
    }
}
