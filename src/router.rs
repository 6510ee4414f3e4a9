//! Service router (C6)
//!
//! Grounded on `service_router.c`'s fixed route table keyed by service id
//! and its session/security gating order, generalized from the firmware's
//! `ServiceRoute[MAX_ROUTES]` array plus function-pointer handler to a `Vec`
//! of routes paired with boxed [ServiceHandler] closures.

use log::{debug, warn};

use crate::security::SecurityLevel;
use crate::session::Session;
use crate::uds::{self, NegativeResponseCode, Request};

/// Maximum routes the table will hold, matching the firmware's `MAX_ROUTES`.
pub const MAX_ROUTES: usize = 50;

/// What a service handler returns for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Positive response payload (sans SID).
    Positive(Vec<u8>),
    /// Handler needs more time; router sends NRC 0x78 and will call again.
    Pending,
    /// Reject with a specific negative response code.
    Negative(NegativeResponseCode),
}

/// A service's request handler.
pub trait ServiceHandler {
    /// Processes one request in the given session/security context. `now` is
    /// the current millisecond clock reading, for handlers that need it to
    /// evaluate their own timers (e.g. a security lockout deadline).
    fn handle(&mut self, request: &Request, session: Session, security: SecurityLevel, now: u32) -> HandlerOutcome;
}

impl<F> ServiceHandler for F
where
    F: FnMut(&Request, Session, SecurityLevel, u32) -> HandlerOutcome,
{
    fn handle(&mut self, request: &Request, session: Session, security: SecurityLevel, now: u32) -> HandlerOutcome {
        self(request, session, security, now)
    }
}

/// Static gating rules for one service id (§4.6).
pub struct Route {
    /// Service id this route answers.
    pub sid: u8,
    /// Length predicate applied to the full request (SID + params).
    pub length_ok: fn(&[u8]) -> bool,
    /// Sub-function values this service accepts, if it carries one.
    pub allowed_sub_functions: Option<&'static [u8]>,
    /// Predicate selecting which sessions may invoke this service.
    pub allowed_sessions: fn(Session) -> bool,
    /// Minimum security level required.
    pub required_security: SecurityLevel,
    /// Whether the suppress-positive-response bit is honored for this service.
    pub suppressible: bool,
}

struct RouteEntry {
    route: Route,
    handler: Box<dyn ServiceHandler>,
}

/// Result of dispatching one request through the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A complete framed response (positive or negative) ready to transmit.
    Respond(Vec<u8>),
    /// Positive response suppressed at the tester's request.
    Suppressed,
    /// Framed NRC 0x78 to transmit now; call `dispatch` again to keep polling.
    Pending(Vec<u8>),
}

/// Failure registering a route.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    /// A route for this SID is already registered.
    #[error("route for this service id already exists")]
    AlreadyRegistered,
    /// The route table is at capacity.
    #[error("route table is full")]
    TableFull,
    /// Routes cannot be added once the router is locked (post-init).
    #[error("router is locked; routes may only be added before init completes")]
    Locked,
}

/// Fixed route table and dispatcher (C6).
pub struct ServiceRouter {
    routes: Vec<RouteEntry>,
    locked: bool,
}

impl ServiceRouter {
    /// Builds an empty, unlocked router.
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            locked: false,
        }
    }

    /// Registers a route. Fails if the SID is already routed, the table is
    /// full, or the router has been locked (§4.6: "Handlers may register
    /// dynamically before init completes but not after").
    pub fn add_route(&mut self, route: Route, handler: impl ServiceHandler + 'static) -> Result<(), RouterError> {
        if self.locked {
            return Err(RouterError::Locked);
        }
        if self.routes.iter().any(|e| e.route.sid == route.sid) {
            return Err(RouterError::AlreadyRegistered);
        }
        if self.routes.len() >= MAX_ROUTES {
            return Err(RouterError::TableFull);
        }
        self.routes.push(RouteEntry {
            route,
            handler: Box::new(handler),
        });
        Ok(())
    }

    /// Locks the table; further `add_route` calls fail. Called once by
    /// `DiagnosticCore::new` after the caller's configuration is applied.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    fn find_mut(&mut self, sid: u8) -> Option<&mut RouteEntry> {
        self.routes.iter_mut().find(|e| e.route.sid == sid)
    }

    /// Runs one request through the gates (§4.6 steps 1-4), dispatches to the
    /// handler (step 5), and frames the result (step 6). `now` is passed
    /// through to the handler unchanged.
    pub fn dispatch(&mut self, request: &Request, session: Session, security: SecurityLevel, now: u32) -> DispatchOutcome {
        let sid = request.sid;
        let full_message: Vec<u8> = std::iter::once(sid).chain(request.params.iter().copied()).collect();

        let Some(entry) = self.find_mut(sid) else {
            warn!("no route for SID {sid:#04x}");
            return DispatchOutcome::Respond(uds::negative_response(sid, NegativeResponseCode::ServiceNotSupported));
        };

        if !(entry.route.length_ok)(&full_message) {
            return DispatchOutcome::Respond(uds::negative_response(
                sid,
                NegativeResponseCode::IncorrectMessageLengthOrInvalidFormat,
            ));
        }

        if let Some(allowed) = entry.route.allowed_sub_functions {
            let got = request.sub_function();
            if !got.is_some_and(|sf| allowed.contains(&sf)) {
                return DispatchOutcome::Respond(uds::negative_response(
                    sid,
                    NegativeResponseCode::SubFunctionNotSupported,
                ));
            }
        }

        if !(entry.route.allowed_sessions)(session) {
            return DispatchOutcome::Respond(uds::negative_response(
                sid,
                NegativeResponseCode::ServiceNotSupportedInActiveSession,
            ));
        }

        if security < entry.route.required_security {
            return DispatchOutcome::Respond(uds::negative_response(sid, NegativeResponseCode::SecurityAccessDenied));
        }

        match entry.handler.handle(request, session, security, now) {
            HandlerOutcome::Positive(data) => {
                if request.suppress_positive_response() && entry.route.suppressible {
                    DispatchOutcome::Suppressed
                } else {
                    debug!("SID {sid:#04x} handled positively");
                    DispatchOutcome::Respond(uds::positive_response(sid, &data))
                }
            }
            HandlerOutcome::Negative(nrc) => DispatchOutcome::Respond(uds::negative_response(sid, nrc)),
            HandlerOutcome::Pending => {
                debug!("SID {sid:#04x} response pending");
                DispatchOutcome::Pending(uds::negative_response(
                    sid,
                    NegativeResponseCode::RequestCorrectlyReceivedResponsePending,
                ))
            }
        }
    }
}

impl Default for ServiceRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn always_allowed(_: Session) -> bool {
        true
    }

    fn any_length(_: &[u8]) -> bool {
        true
    }

    #[test]
    fn unknown_sid_yields_service_not_supported() {
        let mut router = ServiceRouter::new();
        let req = Request::parse(&[0x10, 0x01]).unwrap();
        let result = router.dispatch(&req, Session::Default, SecurityLevel::Locked, 0);
        assert_eq!(
            result,
            DispatchOutcome::Respond(vec![0x7F, 0x10, 0x11])
        );
    }

    #[test]
    fn positive_response_is_framed_with_sid_plus_0x40() {
        let mut router = ServiceRouter::new();
        router
            .add_route(
                Route {
                    sid: 0x22,
                    length_ok: any_length,
                    allowed_sub_functions: None,
                    allowed_sessions: always_allowed,
                    required_security: SecurityLevel::Locked,
                    suppressible: false,
                },
                |_: &Request, _: Session, _: SecurityLevel, _: u32| HandlerOutcome::Positive(vec![0xF1, 0x90, 0x41]),
            )
            .unwrap();

        let req = Request::parse(&[0x22, 0xF1, 0x90]).unwrap();
        let result = router.dispatch(&req, Session::Default, SecurityLevel::Locked, 0);
        assert_eq!(result, DispatchOutcome::Respond(vec![0x62, 0xF1, 0x90, 0x41]));
    }

    #[test]
    fn security_gate_rejects_below_required_level() {
        let mut router = ServiceRouter::new();
        router
            .add_route(
                Route {
                    sid: 0x2E,
                    length_ok: any_length,
                    allowed_sub_functions: None,
                    allowed_sessions: always_allowed,
                    required_security: SecurityLevel::Level(1),
                    suppressible: false,
                },
                |_: &Request, _: Session, _: SecurityLevel, _: u32| HandlerOutcome::Positive(vec![]),
            )
            .unwrap();

        let req = Request::parse(&[0x2E, 0xF1, 0x90, 0x01]).unwrap();
        let result = router.dispatch(&req, Session::Default, SecurityLevel::Locked, 0);
        assert_eq!(result, DispatchOutcome::Respond(vec![0x7F, 0x2E, 0x33]));
    }

    #[test]
    fn suppress_bit_suppresses_positive_response_when_allowed() {
        let mut router = ServiceRouter::new();
        router
            .add_route(
                Route {
                    sid: 0x3E,
                    length_ok: any_length,
                    allowed_sub_functions: Some(&[0x00]),
                    allowed_sessions: always_allowed,
                    required_security: SecurityLevel::Locked,
                    suppressible: true,
                },
                |_: &Request, _: Session, _: SecurityLevel, _: u32| HandlerOutcome::Positive(vec![]),
            )
            .unwrap();

        let req = Request::parse(&[0x3E, 0x80]).unwrap();
        let result = router.dispatch(&req, Session::Default, SecurityLevel::Locked, 0);
        assert_eq!(result, DispatchOutcome::Suppressed);
    }

    #[test]
    fn pending_is_framed_as_nrc_0x78() {
        let mut router = ServiceRouter::new();
        router
            .add_route(
                Route {
                    sid: 0x31,
                    length_ok: any_length,
                    allowed_sub_functions: None,
                    allowed_sessions: always_allowed,
                    required_security: SecurityLevel::Locked,
                    suppressible: false,
                },
                |_: &Request, _: Session, _: SecurityLevel, _: u32| HandlerOutcome::Pending,
            )
            .unwrap();

        let req = Request::parse(&[0x31, 0x01]).unwrap();
        let result = router.dispatch(&req, Session::Default, SecurityLevel::Locked, 0);
        assert_eq!(result, DispatchOutcome::Pending(vec![0x7F, 0x31, 0x78]));
    }

    #[test]
    fn locking_prevents_further_route_registration() {
        let mut router = ServiceRouter::new();
        router.lock();
        let result = router.add_route(
            Route {
                sid: 0x10,
                length_ok: any_length,
                allowed_sub_functions: None,
                allowed_sessions: always_allowed,
                required_security: SecurityLevel::Locked,
                suppressible: false,
            },
            |_: &Request, _: Session, _: SecurityLevel, _: u32| HandlerOutcome::Positive(vec![]),
        );
        assert_eq!(result, Err(RouterError::Locked));
    }
}
