//! Clock & timer wheel (C1)
//!
//! A monotonic millisecond clock plus a bounded table of one-shot callbacks,
//! grounded on the original firmware's `diag_timer.c` and generalized from a
//! fixed C array to an indexed `Vec<Option<Slot>>` table.
//!
//! Durations and timestamps are `u32` milliseconds. Comparisons use wrapping
//! subtraction (`now.wrapping_sub(start) >= duration`) so that a clock near
//! `u32::MAX` still expires timers correctly.

use log::{error, trace};

/// Nonzero timer identifier. `0` is reserved to mean "no timer" / "start failed".
pub type TimerId = u32;

/// Minimum capacity guaranteed by any [TimerWheel] the core constructs.
pub const MIN_TIMER_CAPACITY: usize = 32;

/// Categorizes what a timer is for, purely for logging/diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// ISO-TP consecutive-frame reception deadline.
    IsoTpRx,
    /// ISO-TP flow-control / STmin gap deadline.
    IsoTpTx,
    /// Session S3 keepalive timeout.
    SessionS3,
    /// Security access lockout delay.
    SecurityLockout,
    /// DTC aging / broadcast tick.
    DtcTick,
    /// Caller-defined use, e.g. a RoutineControl timeout.
    Application,
}

struct Slot {
    id: TimerId,
    kind: TimerKind,
    start_ts: u32,
    duration: u32,
}

/// A bounded, polled table of one-shot timers.
///
/// `start` returns a nonzero id or `0` if the table is full. `process` must
/// be called regularly (from [`crate::core::DiagnosticCore::process`]); it
/// walks the active set once, invokes the callback of every timer whose
/// deadline has passed, and removes it unless the callback restarted it.
/// Timers started from within a callback join the active set but cannot
/// fire during the same `process` pass, since the pass iterates over a
/// fixed snapshot of ids collected up front.
pub struct TimerWheel {
    slots: Vec<Option<Slot>>,
    next_id: TimerId,
    min_duration: u32,
}

impl TimerWheel {
    /// Builds a wheel with the given slot capacity. [`DiagnosticCore`] always
    /// requests at least [`MIN_TIMER_CAPACITY`] slots.
    ///
    /// `poll_interval_ms` is the cadence at which the caller intends to call
    /// `process`; durations shorter than this are silently clamped upward,
    /// since a timer can never be observed as expired before the next poll.
    ///
    /// [`DiagnosticCore`]: crate::core::DiagnosticCore
    pub fn new(capacity: usize, poll_interval_ms: u32) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            next_id: 1,
            min_duration: poll_interval_ms.max(1),
        }
    }

    /// Starts a new one-shot timer. Returns `0` if the table is full.
    pub fn start(&mut self, kind: TimerKind, duration_ms: u32, now: u32) -> TimerId {
        let duration = duration_ms.max(self.min_duration);
        let Some(free) = self.slots.iter().position(Option::is_none) else {
            error!("timer wheel exhausted ({} slots in use)", self.slots.len());
            return 0;
        };
        let id = self.alloc_id();
        self.slots[free] = Some(Slot {
            id,
            kind,
            start_ts: now,
            duration,
        });
        trace!("timer {id} ({kind:?}) armed for {duration}ms");
        id
    }

    /// Cancels a timer. A no-op if `id` is unknown (already fired or never existed).
    pub fn cancel(&mut self, id: TimerId) {
        if id == 0 {
            return;
        }
        if let Some(slot) = self.slots.iter_mut().find(|s| matches!(s, Some(s) if s.id == id)) {
            *slot = None;
        }
    }

    /// Restarts an existing timer's deadline from `now`, keeping its duration
    /// unless `new_duration_ms` is given. A no-op if `id` is unknown.
    pub fn restart(&mut self, id: TimerId, now: u32, new_duration_ms: Option<u32>) {
        if id == 0 {
            return;
        }
        if let Some(Some(slot)) = self.slots.iter_mut().find(|s| matches!(s, Some(s) if s.id == id))
        {
            slot.start_ts = now;
            if let Some(d) = new_duration_ms {
                slot.duration = d.max(self.min_duration);
            }
        }
    }

    /// True if `id` still names an armed timer.
    pub fn is_armed(&self, id: TimerId) -> bool {
        id != 0 && self.slots.iter().any(|s| matches!(s, Some(s) if s.id == id))
    }

    /// Walks the active set and invokes `on_expire(id, kind)` for every timer
    /// whose `(now - start) >= duration`, then removes it. Timers armed by
    /// `on_expire` itself are appended to the table but excluded from this pass,
    /// since the pass only visits the slots that existed when it began.
    pub fn process(&mut self, now: u32, mut on_expire: impl FnMut(TimerId, TimerKind)) {
        let due: Vec<(usize, TimerId, TimerKind)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let slot = slot.as_ref()?;
                (now.wrapping_sub(slot.start_ts) >= slot.duration)
                    .then_some((i, slot.id, slot.kind))
            })
            .collect();

        for (i, id, kind) in due {
            // The slot may have been cancelled by an earlier callback in this
            // same pass (e.g. session change to Default cancelling S3).
            if !matches!(&self.slots[i], Some(s) if s.id == id) {
                continue;
            }
            self.slots[i] = None;
            trace!("timer {id} ({kind:?}) expired");
            on_expire(id, kind);
        }
    }

    fn alloc_id(&mut self) -> TimerId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == 0 {
                self.next_id = 1;
            }
            if !self.slots.iter().any(|s| matches!(s, Some(s) if s.id == id)) {
                return id;
            }
        }
    }
}

/// Compares two `u32` timestamps tolerating wraparound: true if `a` is at or
/// after `b + delta_min` when measured modulo 2^32.
pub fn elapsed_at_least(now: u32, start: u32, duration: u32) -> bool {
    now.wrapping_sub(start) >= duration
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn start_and_expire() {
        let mut wheel = TimerWheel::new(4, 10);
        let id = wheel.start(TimerKind::Application, 100, 0);
        assert_ne!(id, 0);

        let mut fired = Vec::new();
        wheel.process(50, |id, kind| fired.push((id, kind)));
        assert!(fired.is_empty(), "must not fire before duration elapses");

        wheel.process(100, |id, kind| fired.push((id, kind)));
        assert_eq!(fired, vec![(id, TimerKind::Application)]);
        assert!(!wheel.is_armed(id));
    }

    #[test]
    fn cancel_is_noop_on_unknown_id() {
        let mut wheel = TimerWheel::new(4, 10);
        wheel.cancel(9999);
        wheel.cancel(0);
    }

    #[test]
    fn table_exhaustion_returns_zero() {
        let mut wheel = TimerWheel::new(2, 10);
        assert_ne!(wheel.start(TimerKind::Application, 100, 0), 0);
        assert_ne!(wheel.start(TimerKind::Application, 100, 0), 0);
        assert_eq!(wheel.start(TimerKind::Application, 100, 0), 0);
    }

    #[test]
    fn minimum_duration_is_clamped() {
        let mut wheel = TimerWheel::new(4, 50);
        let id = wheel.start(TimerKind::Application, 1, 0);
        let mut fired = false;
        wheel.process(1, |_, _| fired = true);
        assert!(!fired, "duration below poll interval must be clamped up");
        wheel.process(50, |_, _| fired = true);
        assert!(fired);
        let _ = id;
    }

    #[test]
    fn wraparound_is_tolerated() {
        let mut wheel = TimerWheel::new(4, 10);
        let start = u32::MAX - 5;
        wheel.start(TimerKind::Application, 100, start);
        let mut fired = false;
        // now has wrapped around past 0
        wheel.process(start.wrapping_add(100), |_, _| fired = true);
        assert!(fired);
    }

    #[test]
    fn callback_restarting_a_timer_does_not_refire_this_pass() {
        let mut wheel = TimerWheel::new(4, 10);
        let id = wheel.start(TimerKind::Application, 10, 0);
        let mut fires = 0;
        wheel.process(10, |_, _| {
            fires += 1;
        });
        assert_eq!(fires, 1);
        assert!(!wheel.is_armed(id));
    }
}
