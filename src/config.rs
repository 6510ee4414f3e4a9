//! Configuration surface (§6)
//!
//! Grounded on the teacher's plain-struct `UdsServerOptions`/`IsoTPSettings`
//! pair: no builder macro, no file-format parser. `serde` derives are
//! gated behind the `serde` feature exactly as in the teacher's `Cargo.toml`.

use crate::channel::IsoTpSettings;
use crate::dtc::DtcStoreConfig;
use crate::security::SecurityLevelConfig;
use crate::session::{Session, SessionTiming};

/// A readable/writable data identifier (SID 0x22/0x2E).
pub struct DataIdentifier {
    /// The 16-bit DID value.
    pub did: u16,
    /// Expected record length in bytes.
    pub length: usize,
    /// Minimum security level required to read this DID.
    pub read_level: crate::security::SecurityLevel,
    /// Minimum security level required to write this DID. `None` if read-only.
    pub write_level: Option<crate::security::SecurityLevel>,
    /// Produces the current record bytes.
    pub read_fn: Box<dyn FnMut() -> Vec<u8>>,
    /// Accepts a new record; returns `false` if the bytes were rejected.
    pub write_fn: Option<Box<dyn FnMut(&[u8]) -> bool>>,
}

/// A RoutineControl routine (SID 0x31).
pub struct Routine {
    /// The 16-bit routine identifier.
    pub rid: u16,
    /// Minimum security level required.
    pub required_level: crate::security::SecurityLevel,
    /// Starts the routine; returns status bytes for the positive response.
    pub start_fn: Box<dyn FnMut(&[u8]) -> Vec<u8>>,
    /// Stops the routine, if supported.
    pub stop_fn: Option<Box<dyn FnMut() -> Vec<u8>>>,
    /// Returns the routine's current results, if supported.
    pub results_fn: Option<Box<dyn FnMut() -> Vec<u8>>>,
}

/// A readable/writable memory region (SID 0x23).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Start address of the region.
    pub base: u32,
    /// Size of the region in bytes.
    pub size: u32,
    /// Whether ReadMemoryByAddress may target this region.
    pub read_allowed: bool,
    /// Whether the region may be written (not exposed via a UDS service in
    /// this module set, kept for parity with the configuration surface).
    pub write_allowed: bool,
    /// Minimum security level required.
    pub required_level: crate::security::SecurityLevel,
}

/// Per-session timing and reachability configuration.
pub struct SessionConfig {
    /// The session this entry describes.
    pub session: Session,
    /// Timing parameters for the session.
    pub timing: SessionTiming,
}

/// DTC store broadcast cadence, layered on top of [DtcStoreConfig].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DtcBroadcastConfig {
    /// Base table/aging configuration.
    pub store: DtcStoreConfig,
    /// How often the DM1-style broadcast is attempted, in ms.
    pub broadcast_interval_ms: u32,
}

/// Everything `DiagnosticCore::new` needs to wire the subsystems together.
pub struct DiagnosticConfig {
    /// Per-session timing table.
    pub session_timing: Vec<SessionConfig>,
    /// Per-level security configuration.
    pub security_levels: Vec<SecurityLevelConfig>,
    /// Readable/writable data identifiers for 0x22/0x2E.
    pub data_identifiers: Vec<DataIdentifier>,
    /// Routines for 0x31.
    pub routines: Vec<Routine>,
    /// Memory regions for 0x23.
    pub memory_regions: Vec<MemoryRegion>,
    /// ISO-TP transport settings.
    pub isotp: IsoTpSettings,
    /// DTC store configuration.
    pub dtc: DtcBroadcastConfig,
    /// Polling cadence `process()` will be called at, in ms. Drives the
    /// timer wheel's minimum effective timer duration.
    pub poll_interval_ms: u32,
}

impl DiagnosticConfig {
    /// Looks up the timing record for `session`, falling back to the
    /// default timing if the session is not explicitly configured
    /// (manufacturer-defined sessions reached via `Other(_)` commonly share
    /// the default timing unless configured otherwise).
    pub fn timing_for(&self, session: Session) -> SessionTiming {
        self.session_timing
            .iter()
            .find(|c| c.session == session)
            .map(|c| c.timing)
            .unwrap_or_default()
    }
}
