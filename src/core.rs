//! Diagnostic core (C9)
//!
//! Owns subsystem lifecycle and the `process()` main loop, grounded on
//! spec.md §4.9 and §5. Construction order mirrors the firmware's manual
//! `*_Init` call sequence (C1, C8, C2/C3, C4, C5, C7, C6), now expressed as
//! one `DiagnosticCore::new` that cannot return a partially built core
//! (§7: init failures are fatal, never partial).
//!
//! Shared mutable state a router handler needs (the DTC store, the security
//! manager) is held behind `Rc<RefCell<_>>` rather than reintroduced as a
//! lock: this crate is single-threaded and cooperative (§5), so the cell is
//! only ever borrowed for the duration of one handler call inside `process`.

use std::cell::RefCell;
use std::rc::Rc;

use log::{error, warn};

use crate::channel::{FrameSink, FrameSource};
use crate::config::DiagnosticConfig;
use crate::dtc::{DtcStatus, DtcStore};
use crate::isotp::{IsoTpEngine, IsoTpEvent};
use crate::logs::{DiagnosticLogs, ErrorCategory};
use crate::router::{DispatchOutcome, HandlerOutcome, Route, ServiceRouter};
use crate::security::{KeyOutcome, SecurityLevel, SecurityManager, SeedOutcome};
use crate::session::{Session, SessionManager};
use crate::timer::{TimerId, TimerKind, TimerWheel};
use crate::uds::{self, NegativeResponseCode, Request, ServiceId};

/// Errors `DiagnosticCore::new` can fail with. All are fatal: construction
/// either fully succeeds or the caller gets nothing back.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The route table rejected one of the built-in service registrations.
    #[error("failed to register a built-in service route")]
    RouteRegistrationFailed,
}

/// Top-level owner of every subsystem (C9).
pub struct DiagnosticCore {
    timers: TimerWheel,
    logs: DiagnosticLogs,
    isotp: IsoTpEngine,
    session: SessionManager,
    security: Rc<RefCell<SecurityManager>>,
    dtc: Rc<RefCell<DtcStore>>,
    router: ServiceRouter,
    dtc_tick_timer: TimerId,
    rx_deadline_timer: TimerId,
    tx_deadline_timer: TimerId,
}

impl DiagnosticCore {
    /// Constructs every subsystem in dependency order and registers the
    /// required services (§4.6 table) against the supplied configuration.
    /// `now` seeds the session/timer clocks.
    pub fn new(mut config: DiagnosticConfig, now: u32) -> Result<Self, InitError> {
        let timers = TimerWheel::new(crate::timer::MIN_TIMER_CAPACITY, config.poll_interval_ms);
        let logs = DiagnosticLogs::default();
        let isotp = IsoTpEngine::new(config.isotp);

        let timing_table: Vec<(Session, crate::session::SessionTiming)> =
            config.session_timing.iter().map(|c| (c.session, c.timing)).collect();
        let session = SessionManager::new(move |s| {
            timing_table
                .iter()
                .find(|(sess, _)| *sess == s)
                .map(|(_, t)| *t)
                .unwrap_or_default()
        });

        let security = Rc::new(RefCell::new(SecurityManager::new(std::mem::take(&mut config.security_levels))));
        let dtc = Rc::new(RefCell::new(DtcStore::new(config.dtc.store)));

        let data_identifiers = Rc::new(RefCell::new(std::mem::take(&mut config.data_identifiers)));
        let routines = Rc::new(RefCell::new(std::mem::take(&mut config.routines)));
        let memory_regions = std::mem::take(&mut config.memory_regions);

        let mut router = ServiceRouter::new();
        register_builtin_routes(&mut router, security.clone(), dtc.clone(), data_identifiers, routines, memory_regions)
            .map_err(|_| InitError::RouteRegistrationFailed)?;
        router.lock();

        let mut core = Self {
            timers,
            logs,
            isotp,
            session,
            security,
            dtc,
            router,
            dtc_tick_timer: 0,
            rx_deadline_timer: 0,
            tx_deadline_timer: 0,
        };
        core.dtc_tick_timer = core.timers.start(TimerKind::DtcTick, config.dtc.broadcast_interval_ms.max(1000), now);
        Ok(core)
    }

    /// Drains queued frames through ISO-TP, dispatches any completed
    /// message through the router, drives the timer wheel (DTC aging,
    /// S3/rx/tx timeouts), and emits at most one DTC broadcast. Safe to call
    /// from a single thread only.
    pub fn process(
        &mut self,
        now: u32,
        source: &mut dyn FrameSource,
        sink: &mut dyn FrameSink,
    ) {
        while let Some(frame) = source.poll_frame() {
            match self.isotp.on_frame(&frame, now, sink) {
                IsoTpEvent::MessageReady(payload) => {
                    self.rearm_isotp_timers(now);
                    self.handle_message(&payload, now, sink);
                    break; // §5: at most one newly-completed request per process() call
                }
                IsoTpEvent::Dropped(err) => {
                    warn!("ISO-TP dropped a frame: {err}");
                    self.logs.record_error(now, ErrorCategory::Protocol, err.to_string());
                }
                IsoTpEvent::Pending => {
                    self.rearm_isotp_timers(now);
                }
            }
        }

        self.isotp.pump_tx(now, sink);

        let mut expired = Vec::new();
        self.timers.process(now, |id, kind| expired.push((id, kind)));
        for (id, kind) in expired {
            self.handle_timer_expiry(id, kind, now, sink);
        }
    }

    fn rearm_isotp_timers(&mut self, now: u32) {
        if let Some(d) = self.isotp.rx_deadline_ms() {
            if self.rx_deadline_timer == 0 || !self.timers.is_armed(self.rx_deadline_timer) {
                self.rx_deadline_timer = self.timers.start(TimerKind::IsoTpRx, d, now);
            } else {
                self.timers.restart(self.rx_deadline_timer, now, Some(d));
            }
        } else {
            self.timers.cancel(self.rx_deadline_timer);
            self.rx_deadline_timer = 0;
        }

        if let Some(d) = self.isotp.tx_deadline_ms() {
            if self.tx_deadline_timer == 0 || !self.timers.is_armed(self.tx_deadline_timer) {
                self.tx_deadline_timer = self.timers.start(TimerKind::IsoTpTx, d, now);
            } else {
                self.timers.restart(self.tx_deadline_timer, now, Some(d));
            }
        } else {
            self.timers.cancel(self.tx_deadline_timer);
            self.tx_deadline_timer = 0;
        }
    }

    fn handle_timer_expiry(&mut self, id: TimerId, kind: TimerKind, now: u32, sink: &mut dyn FrameSink) {
        match kind {
            TimerKind::SessionS3 => {
                let logs = &mut self.logs;
                let security = &self.security;
                self.session.on_s3_expiry(now, &mut self.timers, || {
                    security.borrow_mut().clear_granted();
                    logs.record_transition(now, "S3 expiry -> Default");
                });
            }
            TimerKind::IsoTpRx => {
                if self.isotp.on_rx_timeout() == IsoTpEvent::Dropped(crate::isotp::IsoTpError::Timeout) {
                    self.logs.record_error(now, ErrorCategory::Timing, "ISO-TP rx consecutive-frame timeout");
                }
                self.rx_deadline_timer = 0;
            }
            TimerKind::IsoTpTx => {
                if self.isotp.on_tx_timeout().is_some() {
                    self.logs.record_error(now, ErrorCategory::Timing, "ISO-TP flow-control timeout");
                }
                self.tx_deadline_timer = 0;
            }
            TimerKind::DtcTick => {
                self.dtc.borrow_mut().process_aging();
                let frame = {
                    let mut dtc = self.dtc.borrow_mut();
                    match dtc.broadcast() {
                        Some(records) if !records.is_empty() => Some(
                            records
                                .into_iter()
                                .flat_map(|r| [(r.spn >> 16) as u8, (r.spn >> 8) as u8, r.spn as u8, r.status.bits()])
                                .collect::<Vec<u8>>(),
                        ),
                        _ => None,
                    }
                };
                if let Some(data) = frame {
                    self.transmit(&data, now, sink);
                }
                self.dtc_tick_timer = id;
            }
            TimerKind::SecurityLockout | TimerKind::Application => {}
        }
    }

    fn handle_message(&mut self, payload: &[u8], now: u32, sink: &mut dyn FrameSink) {
        let Some(request) = Request::parse(payload) else {
            error!("empty UDS payload delivered by ISO-TP");
            return;
        };

        if request.sid == ServiceId::TesterPresent as u8 {
            self.session.tester_present(now, &mut self.timers);
        }

        let session = self.session.active();
        let security = self.security.borrow().current_level();
        let outcome = self.router.dispatch(&request, session, security, now);

        // DiagnosticSessionControl's gating (length/session/security) runs
        // through the ordinary route table like every other service, but the
        // actual session transition needs the timer wheel and session
        // manager directly, which a boxed route handler doesn't have access
        // to. Perform it here once the route has accepted the request.
        let outcome = if request.sid == ServiceId::DiagnosticSessionControl as u8 {
            match outcome {
                DispatchOutcome::Respond(bytes)
                    if bytes.first() == Some(&ServiceId::DiagnosticSessionControl.positive_response_sid()) =>
                {
                    let target = Session::from_u8(request.params[0] & 0x7F);
                    let security = &self.security;
                    let logs = &mut self.logs;
                    let _ = self.session.start(target, now, &mut self.timers, || {
                        security.borrow_mut().clear_granted();
                        logs.record_transition(now, "DiagnosticSessionControl -> Default");
                    });
                    let timing = self.session.active_timing();
                    let p2_star_10ms = timing.p2_star_ms / 10;
                    let mut data = vec![target.as_u8()];
                    data.extend_from_slice(&timing.p2_ms.to_be_bytes());
                    data.extend_from_slice(&p2_star_10ms.to_be_bytes());
                    DispatchOutcome::Respond(uds::positive_response(request.sid, &data))
                }
                other => other,
            }
        } else {
            outcome
        };

        match outcome {
            DispatchOutcome::Respond(bytes) => {
                self.transmit(&bytes, now, sink);
            }
            DispatchOutcome::Suppressed => {}
            DispatchOutcome::Pending(bytes) => {
                self.transmit(&bytes, now, sink);
                // A real long-running handler would re-poll via its own
                // captured state on a later process() tick; the router
                // already switched to P2* by virtue of the 0x78 having been sent.
            }
        }
    }

    fn transmit(&mut self, payload: &[u8], now: u32, sink: &mut dyn FrameSink) {
        if let Err(e) = self.isotp.send(payload, now, sink) {
            error!("failed to transmit response: {e}");
            self.logs.record_error(now, ErrorCategory::Protocol, e.to_string());
        }
    }

    /// Read-only access to the error/transition log rings (C8).
    pub fn logs(&self) -> &DiagnosticLogs {
        &self.logs
    }

    /// Read-only access to the active session.
    pub fn active_session(&self) -> Session {
        self.session.active()
    }

    /// Read-only access to the current security level.
    pub fn security_level(&self) -> SecurityLevel {
        self.security.borrow().current_level()
    }

    /// Writes (spn, fmi)'s status (§4.7), the entry point a host application
    /// uses to report a fault; a changed bit marks the DTC store dirty so
    /// the next `DtcTick` broadcasts it.
    pub fn set_dtc_status(
        &mut self,
        spn: u32,
        fmi: u8,
        status: DtcStatus,
        now: u32,
    ) -> Result<(), crate::dtc::DtcError> {
        let logs = &mut self.logs;
        self.dtc.borrow_mut().set_status(spn, fmi, status, |spn, fmi, old, new| {
            logs.record_transition(now, format!("DTC spn={spn:#x} fmi={fmi:#x} status {old:?} -> {new:?}"));
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn register_builtin_routes(
    router: &mut ServiceRouter,
    security: Rc<RefCell<SecurityManager>>,
    dtc: Rc<RefCell<DtcStore>>,
    data_identifiers: Rc<RefCell<Vec<crate::config::DataIdentifier>>>,
    routines: Rc<RefCell<Vec<crate::config::Routine>>>,
    memory_regions: Vec<crate::config::MemoryRegion>,
) -> Result<(), crate::router::RouterError> {
    fn any_session(_: Session) -> bool {
        true
    }
    fn non_default_session(s: Session) -> bool {
        !matches!(s, Session::Default)
    }

    // 0x10 DiagnosticSessionControl
    router.add_route(
        Route {
            sid: ServiceId::DiagnosticSessionControl as u8,
            length_ok: |m| m.len() == 2,
            allowed_sub_functions: None,
            allowed_sessions: any_session,
            required_security: SecurityLevel::Locked,
            suppressible: false,
        },
        move |req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| {
            if req.sub_function().is_none() {
                return HandlerOutcome::Negative(NegativeResponseCode::IncorrectMessageLengthOrInvalidFormat);
            }
            // The route table only validates; DiagnosticCore::handle_message
            // performs the actual transition and rebuilds this response with
            // the target session's real P2/P2* timing once this route accepts.
            HandlerOutcome::Positive(vec![req.params[0] & 0x7F])
        },
    )?;

    // 0x11 ECUReset. A hard reset (0x01) simulates a full power cycle, so it
    // also clears the security attempt counters/lockouts the way a real
    // power-on would; key-off/soft resets (0x02/0x03) leave them untouched,
    // matching the firmware's non-volatile-memory preservation semantics.
    {
        let security = security.clone();
        router.add_route(
            Route {
                sid: ServiceId::EcuReset as u8,
                length_ok: |m| m.len() == 2,
                allowed_sub_functions: Some(&[0x01, 0x02, 0x03]),
                allowed_sessions: any_session,
                required_security: SecurityLevel::Level(1),
                suppressible: false,
            },
            move |req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| {
                let sub = req.params[0];
                if sub == 0x01 {
                    let mut mgr = security.borrow_mut();
                    mgr.clear_granted();
                    mgr.reset_attempts();
                }
                HandlerOutcome::Positive(vec![sub])
            },
        )?;
    }

    // 0x14 ClearDiagnosticInformation
    {
        let dtc = dtc.clone();
        router.add_route(
            Route {
                sid: ServiceId::ClearDiagnosticInformation as u8,
                length_ok: |m| m.len() == 4,
                allowed_sub_functions: None,
                allowed_sessions: any_session,
                required_security: SecurityLevel::Locked,
                suppressible: false,
            },
            move |_req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| {
                dtc.borrow_mut().clear_all();
                HandlerOutcome::Positive(vec![])
            },
        )?;
    }

    // 0x19 ReadDTCInformation (0x02 reportByStatusMask, the spec's required minimum)
    {
        let dtc = dtc.clone();
        router.add_route(
            Route {
                sid: ServiceId::ReadDtcInformation as u8,
                length_ok: |m| m.len() == 3,
                allowed_sub_functions: Some(&[0x02]),
                allowed_sessions: any_session,
                required_security: SecurityLevel::Locked,
                suppressible: false,
            },
            move |req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| {
                let mask = req.params.get(1).copied().unwrap_or(0);
                let status_mask = DtcStatus::from_bits_truncate(mask);
                let mut out = vec![req.params[0], mask];
                for record in dtc.borrow().iterate_by_status_mask(status_mask) {
                    out.push((record.spn >> 16) as u8);
                    out.push((record.spn >> 8) as u8);
                    out.push(record.spn as u8);
                    out.push(record.status.bits());
                }
                HandlerOutcome::Positive(out)
            },
        )?;
    }

    // 0x22 ReadDataByIdentifier
    {
        let data_identifiers = data_identifiers.clone();
        router.add_route(
            Route {
                sid: ServiceId::ReadDataByIdentifier as u8,
                length_ok: |m| m.len() >= 3,
                allowed_sub_functions: None,
                allowed_sessions: any_session,
                required_security: SecurityLevel::Locked,
                suppressible: false,
            },
            move |req: &Request, _session: Session, sec: SecurityLevel, _now: u32| {
                let mut out = Vec::new();
                let mut offset = 0;
                while offset + 1 < req.params.len() {
                    let did = u16::from_be_bytes([req.params[offset], req.params[offset + 1]]);
                    offset += 2;
                    let mut table = data_identifiers.borrow_mut();
                    let Some(entry) = table.iter_mut().find(|d| d.did == did) else {
                        return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                    };
                    if sec < entry.read_level {
                        return HandlerOutcome::Negative(NegativeResponseCode::SecurityAccessDenied);
                    }
                    out.push((did >> 8) as u8);
                    out.push(did as u8);
                    out.extend((entry.read_fn)());
                }
                HandlerOutcome::Positive(out)
            },
        )?;
    }

    // 0x23 ReadMemoryByAddress
    {
        router.add_route(
            Route {
                sid: ServiceId::ReadMemoryByAddress as u8,
                length_ok: |m| m.len() >= 4,
                allowed_sub_functions: None,
                allowed_sessions: any_session,
                required_security: SecurityLevel::Level(1),
                suppressible: false,
            },
            move |req: &Request, _session: Session, sec: SecurityLevel, _now: u32| {
                let fmt = req.params.first().copied().unwrap_or(0);
                let addr_len = ((fmt >> 4) & 0x0F) as usize;
                let size_len = (fmt & 0x0F) as usize;
                if req.params.len() < 1 + addr_len + size_len {
                    return HandlerOutcome::Negative(NegativeResponseCode::IncorrectMessageLengthOrInvalidFormat);
                }
                let mut addr = 0u32;
                for &b in &req.params[1..1 + addr_len] {
                    addr = (addr << 8) | b as u32;
                }
                let mut size = 0u32;
                for &b in &req.params[1 + addr_len..1 + addr_len + size_len] {
                    size = (size << 8) | b as u32;
                }

                let Some(region) = memory_regions.iter().find(|r| {
                    addr >= r.base && addr.saturating_add(size) <= r.base.saturating_add(r.size)
                }) else {
                    return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                };
                if !region.read_allowed {
                    return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                }
                if sec < region.required_level {
                    return HandlerOutcome::Negative(NegativeResponseCode::SecurityAccessDenied);
                }
                HandlerOutcome::Positive(vec![0u8; size as usize])
            },
        )?;
    }

    // 0x27 SecurityAccess
    {
        let security = security.clone();
        router.add_route(
            Route {
                sid: ServiceId::SecurityAccess as u8,
                length_ok: |m| m.len() >= 2,
                allowed_sub_functions: None,
                allowed_sessions: any_session,
                required_security: SecurityLevel::Locked,
                suppressible: false,
            },
            move |req: &Request, _session: Session, _sec: SecurityLevel, now: u32| {
                let Some(sub) = req.sub_function() else {
                    return HandlerOutcome::Negative(NegativeResponseCode::SubFunctionNotSupported);
                };
                let level = SecurityLevel::from_request_level(sub.div_ceil(2));
                let mut mgr = security.borrow_mut();
                if sub % 2 == 1 {
                    match mgr.request_seed(level, now) {
                        SeedOutcome::Seed(seed) => {
                            let mut out = vec![sub];
                            out.extend(seed);
                            HandlerOutcome::Positive(out)
                        }
                        SeedOutcome::StillLockedOut => HandlerOutcome::Negative(NegativeResponseCode::RequiredTimeDelayNotExpired),
                        SeedOutcome::UnknownLevel => HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange),
                    }
                } else {
                    let key = &req.params[1..];
                    match mgr.send_key(level, key, now) {
                        KeyOutcome::Granted => HandlerOutcome::Positive(vec![sub]),
                        KeyOutcome::Invalid => HandlerOutcome::Negative(NegativeResponseCode::InvalidKey),
                        KeyOutcome::InvalidLockedOut => HandlerOutcome::Negative(NegativeResponseCode::ExceedNumberOfAttempts),
                        KeyOutcome::NoPendingSeed => HandlerOutcome::Negative(NegativeResponseCode::RequestSequenceError),
                        KeyOutcome::UnknownLevel => HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange),
                    }
                }
            },
        )?;
    }

    // 0x28 CommunicationControl
    router.add_route(
        Route {
            sid: ServiceId::CommunicationControl as u8,
            length_ok: |m| m.len() == 3,
            allowed_sub_functions: None,
            allowed_sessions: non_default_session,
            required_security: SecurityLevel::Level(1),
            suppressible: true,
        },
        |req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| HandlerOutcome::Positive(vec![req.params[0]]),
    )?;

    // 0x2E WriteDataByIdentifier
    {
        router.add_route(
            Route {
                sid: ServiceId::WriteDataByIdentifier as u8,
                length_ok: |m| m.len() >= 3,
                allowed_sub_functions: None,
                allowed_sessions: any_session,
                required_security: SecurityLevel::Level(1),
                suppressible: false,
            },
            move |req: &Request, _session: Session, sec: SecurityLevel, _now: u32| {
                if req.params.len() < 2 {
                    return HandlerOutcome::Negative(NegativeResponseCode::IncorrectMessageLengthOrInvalidFormat);
                }
                let did = u16::from_be_bytes([req.params[0], req.params[1]]);
                let mut table = data_identifiers.borrow_mut();
                let Some(entry) = table.iter_mut().find(|d| d.did == did) else {
                    return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                };
                let Some(required) = entry.write_level else {
                    return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                };
                if sec < required {
                    return HandlerOutcome::Negative(NegativeResponseCode::SecurityAccessDenied);
                }
                let Some(write_fn) = entry.write_fn.as_mut() else {
                    return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                };
                if !write_fn(&req.params[2..]) {
                    return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                }
                HandlerOutcome::Positive(vec![req.params[0], req.params[1]])
            },
        )?;
    }

    // 0x31 RoutineControl
    {
        router.add_route(
            Route {
                sid: ServiceId::RoutineControl as u8,
                length_ok: |m| m.len() >= 4,
                allowed_sub_functions: Some(&[0x01, 0x02, 0x03]),
                allowed_sessions: non_default_session,
                required_security: SecurityLevel::Level(1),
                suppressible: false,
            },
            move |req: &Request, _session: Session, sec: SecurityLevel, _now: u32| {
                let sub = req.params[0] & 0x7F;
                let rid = u16::from_be_bytes([req.params[1], req.params[2]]);
                let mut table = routines.borrow_mut();
                let Some(routine) = table.iter_mut().find(|r| r.rid == rid) else {
                    return HandlerOutcome::Negative(NegativeResponseCode::RequestOutOfRange);
                };
                if sec < routine.required_level {
                    return HandlerOutcome::Negative(NegativeResponseCode::SecurityAccessDenied);
                }
                let result = match sub {
                    0x01 => (routine.start_fn)(&req.params[3..]),
                    0x02 => match routine.stop_fn.as_mut() {
                        Some(f) => f(),
                        None => return HandlerOutcome::Negative(NegativeResponseCode::SubFunctionNotSupported),
                    },
                    0x03 => match routine.results_fn.as_mut() {
                        Some(f) => f(),
                        None => return HandlerOutcome::Negative(NegativeResponseCode::SubFunctionNotSupported),
                    },
                    _ => return HandlerOutcome::Negative(NegativeResponseCode::SubFunctionNotSupported),
                };
                let mut out = vec![sub, req.params[1], req.params[2]];
                out.extend(result);
                HandlerOutcome::Positive(out)
            },
        )?;
    }

    // 0x34 RequestDownload
    router.add_route(
        Route {
            sid: ServiceId::RequestDownload as u8,
            length_ok: |m| m.len() >= 3,
            allowed_sub_functions: None,
            allowed_sessions: non_default_session,
            required_security: SecurityLevel::Level(2),
            suppressible: false,
        },
        |_req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| HandlerOutcome::Positive(vec![0x10, 0x01, 0x00]),
    )?;

    // 0x36 TransferData. Block counter must increment by 1 mod 256, 0->1 on first block.
    {
        let expected_block = Rc::new(RefCell::new(0u8));
        router.add_route(
            Route {
                sid: ServiceId::TransferData as u8,
                length_ok: |m| m.len() >= 2,
                allowed_sub_functions: None,
                allowed_sessions: non_default_session,
                required_security: SecurityLevel::Level(2),
                suppressible: false,
            },
            move |req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| {
                let got = req.params[0];
                let mut expected = expected_block.borrow_mut();
                let want = expected.wrapping_add(1);
                if got != want {
                    return HandlerOutcome::Negative(NegativeResponseCode::WrongBlockSequenceCounter);
                }
                *expected = got;
                HandlerOutcome::Positive(vec![got])
            },
        )?;
    }

    // 0x37 RequestTransferExit
    router.add_route(
        Route {
            sid: ServiceId::RequestTransferExit as u8,
            length_ok: |m| m.len() == 1,
            allowed_sub_functions: None,
            allowed_sessions: non_default_session,
            required_security: SecurityLevel::Level(2),
            suppressible: false,
        },
        |_req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| HandlerOutcome::Positive(vec![]),
    )?;

    // 0x3E TesterPresent (sub-function 0x00 only)
    router.add_route(
        Route {
            sid: ServiceId::TesterPresent as u8,
            length_ok: |m| m.len() == 2,
            allowed_sub_functions: Some(&[0x00]),
            allowed_sessions: any_session,
            required_security: SecurityLevel::Locked,
            suppressible: true,
        },
        |_req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| HandlerOutcome::Positive(vec![0x00]),
    )?;

    // 0x85 ControlDTCSetting (on/off)
    {
        router.add_route(
            Route {
                sid: ServiceId::ControlDtcSetting as u8,
                length_ok: |m| m.len() >= 2,
                allowed_sub_functions: Some(&[0x01, 0x02]),
                allowed_sessions: any_session,
                required_security: SecurityLevel::Locked,
                suppressible: true,
            },
            move |req: &Request, _session: Session, _sec: SecurityLevel, _now: u32| {
                let sub = req.params[0] & 0x7F;
                dtc.borrow_mut().set_quiet(sub == 0x02);
                HandlerOutcome::Positive(vec![sub])
            },
        )?;
    }

    let _ = uds::positive_response; // re-exported for handler-adjacent helpers
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{ChannelError, IsoTpSettings, LinkFrame, SendOutcome};
    use crate::config::{DtcBroadcastConfig, SessionConfig};
    use crate::security::SecurityLevelConfig;
    use std::collections::VecDeque;

    struct LoopbackSink(VecDeque<LinkFrame>);
    impl FrameSink for LoopbackSink {
        fn send_frame(&mut self, frame: &LinkFrame) -> Result<SendOutcome, ChannelError> {
            self.0.push_back(frame.clone());
            Ok(SendOutcome::Ok)
        }
    }
    struct QueueSource(VecDeque<LinkFrame>);
    impl FrameSource for QueueSource {
        fn poll_frame(&mut self) -> Option<LinkFrame> {
            self.0.pop_front()
        }
    }

    fn minimal_config() -> DiagnosticConfig {
        DiagnosticConfig {
            session_timing: vec![
                SessionConfig { session: Session::Default, timing: crate::session::SessionTiming::default() },
                SessionConfig {
                    session: Session::Extended,
                    timing: crate::session::SessionTiming { p2_ms: 50, p2_star_ms: 5000, s3_ms: 5000, requires_security: false },
                },
            ],
            security_levels: vec![SecurityLevelConfig {
                level: SecurityLevel::Level(1),
                max_attempts: 3,
                lockout_delay_ms: 10_000,
                seed_fn: Box::new(|_| vec![0xAA, 0xBB, 0xCC, 0xDD]),
                key_fn: Box::new(|_, seed: &[u8]| seed.to_vec()),
            }],
            data_identifiers: vec![],
            routines: vec![],
            memory_regions: vec![],
            isotp: IsoTpSettings {
                rx_id: 0x7E0,
                tx_id: 0x7E8,
                block_size: 0,
                stmin: 0,
                rx_timeout_ms: 1000,
                tx_timeout_ms: 1000,
                link_mtu: 8,
                pad_frames: false,
            },
            dtc: DtcBroadcastConfig {
                store: crate::dtc::DtcStoreConfig::default(),
                broadcast_interval_ms: 1000,
            },
            poll_interval_ms: 10,
        }
    }

    #[test]
    fn session_control_round_trip() {
        let mut core = DiagnosticCore::new(minimal_config(), 0).unwrap();
        let mut sink = LoopbackSink(VecDeque::new());
        let mut source = QueueSource(VecDeque::from([LinkFrame::new(0x7E0, &[0x02, 0x10, 0x03])]));

        core.process(0, &mut source, &mut sink);

        let resp = sink.0.pop_front().unwrap();
        assert_eq!(resp.id, 0x7E8);
        // §8 scenario 1: < 06 50 03 00 32 01 F4
        assert_eq!(resp.data, vec![0x06, 0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]);
        assert_eq!(core.active_session(), Session::Extended);
    }

    #[test]
    fn unknown_service_gets_nrc_0x11() {
        let mut core = DiagnosticCore::new(minimal_config(), 0).unwrap();
        let mut sink = LoopbackSink(VecDeque::new());
        let mut source = QueueSource(VecDeque::from([LinkFrame::new(0x7E0, &[0x02, 0x55, 0x00])]));

        core.process(0, &mut source, &mut sink);
        let resp = sink.0.pop_front().unwrap();
        assert_eq!(resp.data, vec![0x03, 0x7F, 0x55, 0x11]);
    }

    #[test]
    fn tester_present_with_suppression_emits_nothing() {
        let mut core = DiagnosticCore::new(minimal_config(), 0).unwrap();
        let mut sink = LoopbackSink(VecDeque::new());
        let mut source = QueueSource(VecDeque::from([LinkFrame::new(0x7E0, &[0x02, 0x3E, 0x80])]));

        core.process(0, &mut source, &mut sink);
        assert!(sink.0.is_empty());
    }
}
