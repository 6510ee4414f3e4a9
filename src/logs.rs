//! Error & state logs (C8)
//!
//! Grounded on the original firmware's `diag_logger.c` ring-buffered log
//! entries (`LOG_BUFFER_SIZE`, overwrite-oldest) and `event_handler.c`'s
//! separate transition events, folded per spec.md §4.8 into two independent
//! fixed-capacity rings rather than the firmware's one buffer plus registered
//! callbacks — this crate uses the `log` facade for live output (§6.2) and
//! keeps these rings purely for post-mortem snapshotting.

/// Category of a logged error, matching spec.md §7's taxonomy.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCategory {
    /// ISO-TP framing/sequencing failure.
    Protocol,
    /// A timer deadline was missed.
    Timing,
    /// Session transition was rejected or forced.
    Session,
    /// Security handshake failure or lockout.
    Security,
    /// A bounded table was exhausted.
    Resource,
    /// Caller supplied an invalid configuration.
    Config,
}

/// One entry in the `last_errors` ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorEntry {
    /// Millisecond timestamp the error was logged at.
    pub timestamp: u32,
    /// Category per spec.md §7.
    pub category: ErrorCategory,
    /// Free-form message, not formatted with any particular structure.
    pub message: String,
}

/// One entry in the `last_transitions` ring (session or ISO-TP state changes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionEntry {
    /// Millisecond timestamp the transition occurred at.
    pub timestamp: u32,
    /// Free-form description of the from/to states.
    pub description: String,
}

struct Ring<T> {
    entries: Vec<T>,
    capacity: usize,
    next_write: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity: capacity.max(1),
            next_write: 0,
        }
    }

    fn push(&mut self, item: T) {
        if self.entries.len() < self.capacity {
            self.entries.push(item);
        } else {
            self.entries[self.next_write] = item;
        }
        self.next_write = (self.next_write + 1) % self.capacity;
    }

    /// Oldest-to-newest snapshot of the ring's current contents.
    fn snapshot(&self) -> Vec<&T> {
        if self.entries.len() < self.capacity {
            return self.entries.iter().collect();
        }
        let (tail, head) = self.entries.split_at(self.next_write);
        head.iter().chain(tail.iter()).collect()
    }
}

/// Two fixed-capacity rings recording recent errors and state transitions
/// (C8). Oldest entry is overwritten first; readers see a best-effort
/// snapshot (a writer racing a reader may cause one in-progress entry to be
/// skipped, never torn).
pub struct DiagnosticLogs {
    errors: Ring<ErrorEntry>,
    transitions: Ring<TransitionEntry>,
}

/// Default ring capacity, matching the firmware's `LOG_BUFFER_SIZE`.
pub const DEFAULT_LOG_CAPACITY: usize = 32;

impl DiagnosticLogs {
    /// Builds logs with the given ring capacities.
    pub fn new(error_capacity: usize, transition_capacity: usize) -> Self {
        Self {
            errors: Ring::new(error_capacity),
            transitions: Ring::new(transition_capacity),
        }
    }

    /// Records an error entry, evicting the oldest if the ring is full.
    pub fn record_error(&mut self, timestamp: u32, category: ErrorCategory, message: impl Into<String>) {
        self.errors.push(ErrorEntry {
            timestamp,
            category,
            message: message.into(),
        });
    }

    /// Records a transition entry, evicting the oldest if the ring is full.
    pub fn record_transition(&mut self, timestamp: u32, description: impl Into<String>) {
        self.transitions.push(TransitionEntry {
            timestamp,
            description: description.into(),
        });
    }

    /// Oldest-to-newest snapshot of recorded errors.
    pub fn errors(&self) -> Vec<&ErrorEntry> {
        self.errors.snapshot()
    }

    /// Oldest-to-newest snapshot of recorded transitions.
    pub fn transitions(&self) -> Vec<&TransitionEntry> {
        self.transitions.snapshot()
    }
}

impl Default for DiagnosticLogs {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY, DEFAULT_LOG_CAPACITY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn snapshot_is_oldest_to_newest() {
        let mut logs = DiagnosticLogs::new(3, 3);
        logs.record_error(1, ErrorCategory::Protocol, "a");
        logs.record_error(2, ErrorCategory::Protocol, "b");
        logs.record_error(3, ErrorCategory::Protocol, "c");
        let snapshot: Vec<&str> = logs.errors().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(snapshot, vec!["a", "b", "c"]);
    }

    #[test]
    fn ring_overwrites_oldest_first() {
        let mut logs = DiagnosticLogs::new(2, 2);
        logs.record_error(1, ErrorCategory::Timing, "a");
        logs.record_error(2, ErrorCategory::Timing, "b");
        logs.record_error(3, ErrorCategory::Timing, "c");
        let snapshot: Vec<&str> = logs.errors().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(snapshot, vec!["b", "c"]);
    }

    #[test]
    fn transitions_ring_is_independent_of_errors() {
        let mut logs = DiagnosticLogs::new(4, 1);
        logs.record_transition(1, "Default -> Extended");
        logs.record_transition(2, "Extended -> Default");
        assert_eq!(logs.transitions().len(), 1);
        assert_eq!(logs.transitions()[0].description, "Extended -> Default");
        assert!(logs.errors().is_empty());
    }
}
