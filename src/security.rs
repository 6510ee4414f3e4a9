//! Security manager (C5)
//!
//! Grounded on `security_manager.c`'s per-level state (attempt counter, lockout
//! delay timer, seed/key handshake) and the teacher's
//! `uds/security_access.rs` `SecurityOperation` framing, generalized from the
//! C firmware's fixed `SecurityLevelState[MAX_SECURITY_LEVELS]` array to a `Vec`.
//!
//! The firmware's `timer_expired(&level_state->delay_timer)` check at the top
//! of `Security_Manager_RequestSeed` reads backwards for the intended ISO
//! semantics (it rejects once the delay timer *has* expired, the opposite of
//! a lockout). This implementation instead rejects while `now < lockout_until_ts`,
//! matching the ISO 14229-1 intent; see DESIGN.md.

use log::{debug, warn};

/// Security level ordinal. `Locked` (0) requires no seed/key exchange and is
/// always the current level of a freshly booted or Default-session ECU.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityLevel {
    /// No security unlocked.
    Locked,
    /// An unlocked level, numbered 1..=n as configured.
    Level(u8),
}

impl SecurityLevel {
    /// Decodes a `SecurityAccess` sub-function's level half (odd = request
    /// seed, even = send key; both map to the same level number).
    pub fn from_request_level(n: u8) -> Self {
        if n == 0 {
            Self::Locked
        } else {
            Self::Level(n)
        }
    }

    fn ordinal(self) -> u8 {
        match self {
            Self::Locked => 0,
            Self::Level(n) => n,
        }
    }
}

/// Function the core injects to compute the expected key for a level/seed
/// pair. The manager never standardizes an algorithm; a real ECU supplies a
/// manufacturer-specific key derivation here.
pub trait KeyFunction {
    /// Computes the expected key bytes for `level` given `seed`.
    fn expected_key(&self, level: SecurityLevel, seed: &[u8]) -> Vec<u8>;
}

impl<F: Fn(SecurityLevel, &[u8]) -> Vec<u8>> KeyFunction for F {
    fn expected_key(&self, level: SecurityLevel, seed: &[u8]) -> Vec<u8> {
        self(level, seed)
    }
}

/// Function the core injects to draw a fresh nonzero seed for a level.
pub trait SeedSource {
    /// Produces a seed of the configured length for `level`.
    fn draw_seed(&mut self, level: SecurityLevel) -> Vec<u8>;
}

impl<F: FnMut(SecurityLevel) -> Vec<u8>> SeedSource for F {
    fn draw_seed(&mut self, level: SecurityLevel) -> Vec<u8> {
        self(level)
    }
}

/// Per-level configuration. Carries the manufacturer-specific seed/key
/// functions injected at configuration time (§6): the manager never
/// standardizes an algorithm itself.
pub struct SecurityLevelConfig {
    /// The level this config applies to.
    pub level: SecurityLevel,
    /// Number of wrong keys allowed before lockout.
    pub max_attempts: u8,
    /// Lockout duration once `max_attempts` is reached, in ms.
    pub lockout_delay_ms: u32,
    /// Draws a fresh seed for this level on request.
    pub seed_fn: Box<dyn SeedSource>,
    /// Computes the expected key for a drawn seed.
    pub key_fn: Box<dyn KeyFunction>,
}

struct LevelState {
    config: SecurityLevelConfig,
    granted: bool,
    attempt_count: u8,
    lockout_until_ts: u32,
    pending_seed: Option<Vec<u8>>,
}

/// Outcome of a seed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOutcome {
    /// Seed bytes to return to the tester (all-zero if already granted, per ISO semantics).
    Seed(Vec<u8>),
    /// Rejected: still within the lockout window.
    StillLockedOut,
    /// The level is not configured.
    UnknownLevel,
}

/// Outcome of a key submission.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyOutcome {
    /// Key matched; level is now granted.
    Granted,
    /// Key did not match; attempt counted.
    Invalid,
    /// Key did not match and this attempt triggered a lockout.
    InvalidLockedOut,
    /// No seed was pending for this level (protocol sequence error).
    NoPendingSeed,
    /// The level is not configured.
    UnknownLevel,
}

/// Security manager state (C5): per-level granted flag, attempt counter,
/// lockout deadline and in-flight seed.
pub struct SecurityManager {
    levels: Vec<LevelState>,
}

impl SecurityManager {
    /// Builds a manager with one state slot per configured level.
    pub fn new(configs: Vec<SecurityLevelConfig>) -> Self {
        Self {
            levels: configs
                .into_iter()
                .map(|config| LevelState {
                    config,
                    granted: false,
                    attempt_count: 0,
                    lockout_until_ts: 0,
                    pending_seed: None,
                })
                .collect(),
        }
    }

    /// The highest granted level, or [`SecurityLevel::Locked`] if none.
    pub fn current_level(&self) -> SecurityLevel {
        self.levels
            .iter()
            .filter(|l| l.granted)
            .map(|l| l.config.level)
            .max_by_key(|l| l.ordinal())
            .unwrap_or(SecurityLevel::Locked)
    }

    /// True if `level` is currently granted.
    pub fn is_granted(&self, level: SecurityLevel) -> bool {
        if level == SecurityLevel::Locked {
            return true;
        }
        self.find(level).is_some_and(|l| l.granted)
    }

    fn find(&self, level: SecurityLevel) -> Option<&LevelState> {
        self.levels.iter().find(|l| l.config.level == level)
    }

    fn find_mut(&mut self, level: SecurityLevel) -> Option<&mut LevelState> {
        self.levels.iter_mut().find(|l| l.config.level == level)
    }

    /// Requests a seed for `level` (§4.5 step 1), drawn from the level's
    /// configured [`SeedSource`].
    pub fn request_seed(&mut self, level: SecurityLevel, now: u32) -> SeedOutcome {
        let Some(state) = self.find_mut(level) else {
            return SeedOutcome::UnknownLevel;
        };

        if now < state.lockout_until_ts {
            warn!("seed request for {level:?} rejected: still locked out");
            return SeedOutcome::StillLockedOut;
        }

        if state.granted {
            // Already unlocked: ISO semantics return an all-zero seed rather
            // than drawing a fresh one.
            let len = state.pending_seed.as_ref().map_or(4, Vec::len);
            return SeedOutcome::Seed(vec![0u8; len]);
        }

        let seed = state.config.seed_fn.draw_seed(level);
        state.pending_seed = Some(seed.clone());
        debug!("seed drawn for {level:?}");
        SeedOutcome::Seed(seed)
    }

    /// Submits a key for `level` (§4.5 step 2), checked against the level's
    /// configured [`KeyFunction`] in constant time.
    ///
    /// A wrong key does not consume the pending seed: the tester may retry
    /// against the same seed until it gets it right or hits `max_attempts`,
    /// matching `security_manager.c`'s `Security_ValidateKey`, which only
    /// clears `ctx->seed` on `Security_RevokeAccess`.
    pub fn send_key(&mut self, level: SecurityLevel, key: &[u8], now: u32) -> KeyOutcome {
        let Some(state) = self.find_mut(level) else {
            return KeyOutcome::UnknownLevel;
        };

        let Some(seed) = state.pending_seed.clone() else {
            return KeyOutcome::NoPendingSeed;
        };

        let expected = state.config.key_fn.expected_key(level, &seed);
        if constant_time_eq(&expected, key) {
            state.granted = true;
            state.attempt_count = 0;
            state.pending_seed = None;
            debug!("security level {level:?} granted");
            return KeyOutcome::Granted;
        }

        state.attempt_count += 1;
        if state.attempt_count >= state.config.max_attempts {
            state.lockout_until_ts = now + state.config.lockout_delay_ms;
            warn!("security level {level:?} locked out until {}", state.lockout_until_ts);
            return KeyOutcome::InvalidLockedOut;
        }
        KeyOutcome::Invalid
    }

    /// Clears granted flags on every level. Attempt counters and lockout
    /// deadlines are untouched (§4.5 Reset rules: they persist across
    /// session changes and, per configuration, across power-on).
    pub fn clear_granted(&mut self) {
        for l in &mut self.levels {
            l.granted = false;
            l.pending_seed = None;
        }
    }

    /// Clears attempt counters and lockouts on every level. Called by
    /// `DiagnosticCore`'s ECUReset (0x11) handler for a hard reset
    /// (§4.5 Reset rules: hard reset is the "reset" option of the two a
    /// power-on must support; `clear_granted` alone is the "persist" option).
    pub fn reset_attempts(&mut self) {
        for l in &mut self.levels {
            l.attempt_count = 0;
            l.lockout_until_ts = 0;
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager_with_seed(seed: Vec<u8>) -> SecurityManager {
        SecurityManager::new(vec![SecurityLevelConfig {
            level: SecurityLevel::Level(1),
            max_attempts: 3,
            lockout_delay_ms: 10_000,
            seed_fn: Box::new(move |_: SecurityLevel| seed.clone()),
            key_fn: Box::new(|_level: SecurityLevel, seed: &[u8]| seed.iter().map(|b| b.wrapping_add(1)).collect()),
        }])
    }

    #[test]
    fn full_seed_key_handshake_grants_level() {
        let mut mgr = manager_with_seed(vec![0x11, 0x22, 0x33, 0x44]);
        let outcome = mgr.request_seed(SecurityLevel::Level(1), 0);
        let SeedOutcome::Seed(seed) = outcome else { panic!() };

        let key: Vec<u8> = seed.iter().map(|b| b.wrapping_add(1)).collect();
        let result = mgr.send_key(SecurityLevel::Level(1), &key, 0);
        assert_eq!(result, KeyOutcome::Granted);
        assert!(mgr.is_granted(SecurityLevel::Level(1)));
    }

    #[test]
    fn wrong_key_increments_attempts_then_locks_out() {
        let mut mgr = manager_with_seed(vec![1, 2, 3, 4]);

        for i in 0..2 {
            mgr.request_seed(SecurityLevel::Level(1), 0);
            let result = mgr.send_key(SecurityLevel::Level(1), &[0, 0, 0, 0], 0);
            assert_eq!(result, KeyOutcome::Invalid, "attempt {i}");
        }

        mgr.request_seed(SecurityLevel::Level(1), 0);
        let result = mgr.send_key(SecurityLevel::Level(1), &[0, 0, 0, 0], 0);
        assert_eq!(result, KeyOutcome::InvalidLockedOut);

        let outcome = mgr.request_seed(SecurityLevel::Level(1), 5000);
        assert_eq!(outcome, SeedOutcome::StillLockedOut);

        let outcome = mgr.request_seed(SecurityLevel::Level(1), 10_000);
        assert!(matches!(outcome, SeedOutcome::Seed(_)));
    }

    #[test]
    fn already_granted_returns_zero_seed() {
        let mut mgr = manager_with_seed(vec![9, 9, 9, 9]);
        mgr.request_seed(SecurityLevel::Level(1), 0);
        let key: Vec<u8> = vec![10, 10, 10, 10];
        mgr.send_key(SecurityLevel::Level(1), &key, 0);

        let outcome = mgr.request_seed(SecurityLevel::Level(1), 1);
        assert_eq!(outcome, SeedOutcome::Seed(vec![0, 0, 0, 0]));
    }

    #[test]
    fn clear_granted_does_not_reset_attempts_or_lockout() {
        let mut mgr = manager_with_seed(vec![1, 2, 3, 4]);
        mgr.request_seed(SecurityLevel::Level(1), 0);
        mgr.send_key(SecurityLevel::Level(1), &[0, 0, 0, 0], 0);
        assert_eq!(mgr.find(SecurityLevel::Level(1)).unwrap().attempt_count, 1);

        mgr.clear_granted();
        assert!(!mgr.is_granted(SecurityLevel::Level(1)));
        assert_eq!(mgr.find(SecurityLevel::Level(1)).unwrap().attempt_count, 1);
    }

    #[test]
    fn reset_attempts_clears_counters_and_lockout() {
        let mut mgr = manager_with_seed(vec![1, 2, 3, 4]);
        for _ in 0..3 {
            mgr.request_seed(SecurityLevel::Level(1), 0);
            mgr.send_key(SecurityLevel::Level(1), &[0, 0, 0, 0], 0);
        }
        assert_eq!(
            mgr.request_seed(SecurityLevel::Level(1), 100),
            SeedOutcome::StillLockedOut
        );

        mgr.reset_attempts();
        assert!(matches!(
            mgr.request_seed(SecurityLevel::Level(1), 100),
            SeedOutcome::Seed(_)
        ));
    }

    #[test]
    fn no_pending_seed_is_a_sequence_error() {
        let mut mgr = manager_with_seed(vec![1, 2, 3, 4]);
        let result = mgr.send_key(SecurityLevel::Level(1), &[0, 0, 0, 0], 0);
        assert_eq!(result, KeyOutcome::NoPendingSeed);
    }
}
