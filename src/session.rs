//! Session manager (C4)
//!
//! Grounded on the original firmware's `session_manager.c` (the session
//! state, the S3/P2 timers, the "reset security on change" rule) and the
//! teacher's `uds/diagnostic_session_control.rs` `UDSSessionType` enum shape,
//! reused here including its `Other(u8)` manufacturer-session pattern.
//!
//! Deviates from `session_manager.c` in one place, per spec: the C firmware
//! clears `security_level` on *every* session change, while this
//! implementation clears granted security only on a transition *into*
//! Default (ISO 14229-1 §9.4.5 permits attempt counters and lockouts to
//! persist across session changes; spec.md makes this explicit). See
//! DESIGN.md.

use log::debug;

use crate::timer::{TimerId, TimerKind, TimerWheel};

/// Maximum number of transition listeners a [SessionManager] will accept.
pub const MAX_LISTENERS: usize = 8;

/// The active diagnostic session.
#[derive(Debug, Copy, Clone)]
pub enum Session {
    /// 0x01 Default session: always available, no security required.
    Default,
    /// 0x02 Programming session: reprogramming operations.
    Programming,
    /// 0x03 Extended diagnostic session: most services unlocked.
    Extended,
    /// 0x04 Safety system diagnostic session.
    Safety,
    /// Manufacturer-defined session id.
    Other(u8),
}

impl Session {
    /// Decodes a `DiagnosticSessionControl` sub-function byte.
    pub fn from_u8(v: u8) -> Self {
        match v {
            0x01 => Self::Default,
            0x02 => Self::Programming,
            0x03 => Self::Extended,
            0x04 => Self::Safety,
            other => Self::Other(other),
        }
    }

    /// Encodes back to the sub-function byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::Extended => 0x03,
            Self::Safety => 0x04,
            Self::Other(v) => v,
        }
    }
}

/// Per-session timing parameters (§3 record, §6.1 response framing).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    /// Default server response timeout, in ms.
    pub p2_ms: u16,
    /// Extended response timeout after a `RequestCorrectlyReceivedResponsePending`, in ms.
    pub p2_star_ms: u16,
    /// S3 keepalive timeout: how long the session survives without tester activity, in ms.
    pub s3_ms: u32,
    /// Whether any service in this session requires security to be unlocked
    /// beyond what each route independently specifies (informational).
    pub requires_security: bool,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            p2_ms: 50,
            p2_star_ms: 5000,
            s3_ms: 5000,
            requires_security: false,
        }
    }
}

/// Reasons a `start` transition can be rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The target session is not reachable from the current one.
    TransitionNotAllowed,
    /// The listener table is full; caller must free a slot before registering more.
    ListenerTableFull,
}

/// Session manager state (C4).
pub struct SessionManager {
    active: Session,
    start_ts: u32,
    timing_of: Box<dyn Fn(Session) -> SessionTiming>,
    s3_timer: TimerId,
    listeners: Vec<fn(Session, Session)>,
}

impl SessionManager {
    /// Builds a manager starting in [`Session::Default`].
    ///
    /// `timing_of` resolves the timing parameters for any session, including
    /// manufacturer-defined ones; the core supplies this from its
    /// configuration table rather than the manager hardcoding values.
    pub fn new(timing_of: impl Fn(Session) -> SessionTiming + 'static) -> Self {
        Self {
            active: Session::Default,
            start_ts: 0,
            timing_of: Box::new(timing_of),
            s3_timer: 0,
            listeners: Vec::new(),
        }
    }

    /// The currently active session.
    pub fn active(&self) -> Session {
        self.active
    }

    /// Timing parameters of the active session.
    pub fn active_timing(&self) -> SessionTiming {
        (self.timing_of)(self.active)
    }

    /// Registers a listener invoked on every transition. Bounded to
    /// [`MAX_LISTENERS`]; further registrations fail deterministically.
    pub fn add_listener(&mut self, listener: fn(Session, Session)) -> Result<(), SessionError> {
        if self.listeners.len() >= MAX_LISTENERS {
            return Err(SessionError::ListenerTableFull);
        }
        self.listeners.push(listener);
        Ok(())
    }

    /// Every session can reach every other session (spec.md's
    /// `validate_session_transition` carries this forward from the C
    /// firmware's permissive `0xFFFF` transition matrix — preconditions for
    /// entering Programming/Extended/Safety live in the route table's
    /// security/session gates, not here).
    fn transition_allowed(&self, _target: Session) -> bool {
        true
    }

    /// Starts a transition to `new_session`. Arms the S3 timer with the
    /// target session's `s3_ms` (disarmed while Default). Clears granted
    /// security only when transitioning into Default.
    pub fn start(
        &mut self,
        new_session: Session,
        now: u32,
        timers: &mut TimerWheel,
        on_enter_default: impl FnOnce(),
    ) -> Result<(), SessionError> {
        if !self.transition_allowed(new_session) {
            return Err(SessionError::TransitionNotAllowed);
        }

        let old = self.active;
        self.active = new_session;
        self.start_ts = now;

        timers.cancel(self.s3_timer);
        self.s3_timer = if new_session == Session::Default {
            0
        } else {
            timers.start(TimerKind::SessionS3, (self.timing_of)(new_session).s3_ms, now)
        };

        if new_session == Session::Default && old != Session::Default {
            on_enter_default();
        }

        debug!("session {old:?} -> {new_session:?}");
        for listener in &self.listeners {
            listener(old, new_session);
        }
        Ok(())
    }

    /// Restarts the S3 timer without changing session (TesterPresent 0x3E).
    pub fn tester_present(&mut self, now: u32, timers: &mut TimerWheel) {
        if self.active != Session::Default {
            timers.restart(self.s3_timer, now, None);
        }
    }

    /// Called when the S3 timer expires: forces a return to Default and
    /// clears security via `on_enter_default`.
    pub fn on_s3_expiry(&mut self, now: u32, timers: &mut TimerWheel, on_enter_default: impl FnOnce()) {
        if self.active == Session::Default {
            return;
        }
        let _ = self.start(Session::Default, now, timers, on_enter_default);
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.as_u8() == other.as_u8()
    }
}
impl Eq for Session {}

impl std::hash::Hash for Session {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_u8().hash(state);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn timing(_s: Session) -> SessionTiming {
        SessionTiming::default()
    }

    #[test]
    fn starts_in_default() {
        let mgr = SessionManager::new(timing);
        assert_eq!(mgr.active(), Session::Default);
    }

    #[test]
    fn transition_arms_s3_unless_default() {
        let mut mgr = SessionManager::new(timing);
        let mut timers = TimerWheel::new(8, 10);
        mgr.start(Session::Extended, 0, &mut timers, || {}).unwrap();
        assert_eq!(mgr.active(), Session::Extended);

        let mut fired = false;
        timers.process(4999, |_, _| fired = true);
        assert!(!fired);
        timers.process(5000, |_, _| fired = true);
        assert!(fired, "S3 timer should fire at s3_ms");
    }

    #[test]
    fn s3_expiry_returns_to_default_and_clears_security() {
        let mut mgr = SessionManager::new(timing);
        let mut timers = TimerWheel::new(8, 10);
        mgr.start(Session::Extended, 0, &mut timers, || {}).unwrap();

        let mut cleared = false;
        mgr.on_s3_expiry(5000, &mut timers, || cleared = true);
        assert_eq!(mgr.active(), Session::Default);
        assert!(cleared);
    }

    #[test]
    fn entering_default_from_default_does_not_reclear() {
        let mut mgr = SessionManager::new(timing);
        let mut timers = TimerWheel::new(8, 10);
        let mut calls = 0;
        mgr.start(Session::Default, 0, &mut timers, || calls += 1).unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn listener_table_is_bounded() {
        let mut mgr = SessionManager::new(timing);
        for _ in 0..MAX_LISTENERS {
            mgr.add_listener(|_, _| {}).unwrap();
        }
        assert_eq!(mgr.add_listener(|_, _| {}), Err(SessionError::ListenerTableFull));
    }

    #[test]
    fn other_session_roundtrips_through_byte() {
        assert_eq!(Session::from_u8(0x60).as_u8(), 0x60);
        assert_eq!(Session::from_u8(0x01), Session::Default);
    }
}
