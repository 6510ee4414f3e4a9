//! DTC store (C7)
//!
//! Grounded on `dtc_manager.c`'s `DtcStorage` (fixed-capacity record table,
//! `DTC_SetStatus`'s create-on-first-sight behavior, `DTC_ProcessAging`'s
//! aging/aged counters and auto-clear) and the teacher's minimal `dtc.rs`
//! (`DTCFormatType`/`DTC` shape), generalized from the firmware's raw
//! `status_mask: uint8_t` to a `bitflags` type and from its fixed
//! `uint32_t dtc_number` to the `{spn, fmi}` pair spec.md's data model names.

use bitflags::bitflags;
use log::debug;

bitflags! {
    /// DTC status byte (ISO 14229-1 Table D.1), named after the firmware's
    /// `DTC_STATUS_*` constants.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct DtcStatus: u8 {
        /// Test failed on the most recent execution.
        const TEST_FAILED = 0x01;
        /// Test failed during the current operation cycle.
        const TEST_FAILED_THIS_CYCLE = 0x02;
        /// Pending: failed in the current or previous cycle, not yet confirmed.
        const PENDING = 0x04;
        /// Confirmed: failed often enough to be a permanent fault.
        const CONFIRMED = 0x08;
        /// Test has not yet completed since the last clear.
        const TEST_NOT_COMPLETED_SINCE_CLEAR = 0x10;
        /// Test failed at least once since the last clear.
        const TEST_FAILED_SINCE_CLEAR = 0x20;
        /// Test has not completed in the current operation cycle.
        const TEST_NOT_COMPLETED_THIS_CYCLE = 0x40;
        /// Warning indicator (e.g. MIL) requested.
        const WARNING_INDICATOR_REQUESTED = 0x80;
    }
}

/// DTC severity, informational only (ISO 14229-1 Table D.3 uses a similar byte).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// No severity information available.
    None,
    /// Maintenance only, no immediate action required.
    Maintenance,
    /// Check at the next opportunity.
    CheckAtNextHalt,
    /// Check immediately.
    CheckImmediately,
}

/// Maximum freeze frames retained per DTC.
pub const MAX_FREEZE_FRAMES_PER_DTC: usize = 10;
/// Maximum bytes in a single freeze frame snapshot.
pub const MAX_FREEZE_FRAME_SIZE: usize = 100;

/// One stored DTC record (§3 DtcRecord).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DtcRecord {
    /// Suspect parameter number (18-bit SPN packed into the low 24 bits).
    pub spn: u32,
    /// Failure mode identifier.
    pub fmi: u8,
    /// Current status bitfield.
    pub status: DtcStatus,
    /// Times this DTC has been set since the record was created.
    pub occurrence_count: u32,
    /// Cycles since last increment toward `aged_counter`.
    pub aging_counter: u32,
    /// Aging increments accumulated so far.
    pub aged_counter: u32,
    /// Informational severity.
    pub severity: Severity,
    /// Freeze frame snapshots captured at the time of confirmation.
    pub freeze_frames: Vec<Vec<u8>>,
}

impl DtcRecord {
    fn new(spn: u32, fmi: u8, status: DtcStatus) -> Self {
        Self {
            spn,
            fmi,
            status,
            occurrence_count: 1,
            aging_counter: 0,
            aged_counter: 0,
            severity: Severity::None,
            freeze_frames: Vec::new(),
        }
    }
}

/// Aging/auto-clear configuration (§4.7).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DtcStoreConfig {
    /// Capacity of the record table.
    pub max_records: usize,
    /// Aging ticks required to accumulate one `aged_counter` increment.
    pub aging_threshold: u32,
    /// `aged_counter` value at which an auto-clear-eligible record is removed.
    pub aging_cycles: u32,
    /// Whether aged-out records are removed automatically.
    pub auto_clear: bool,
}

impl Default for DtcStoreConfig {
    fn default() -> Self {
        Self {
            max_records: 1000,
            aging_threshold: 40,
            aging_cycles: 1,
            auto_clear: false,
        }
    }
}

/// Fixed-capacity DTC table (C7).
pub struct DtcStore {
    config: DtcStoreConfig,
    records: Vec<DtcRecord>,
    quiet: bool,
    dirty_since_broadcast: bool,
}

impl DtcStore {
    /// Builds an empty store.
    pub fn new(config: DtcStoreConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            quiet: false,
            dirty_since_broadcast: false,
        }
    }

    /// Number of records currently stored.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sets (spn, fmi)'s status, creating the record on first sight. Fails
    /// if the table is full and this is a new (spn, fmi) pair. Invokes
    /// `on_status_change(spn, fmi, old, new)` whenever the bits actually change.
    pub fn set_status(
        &mut self,
        spn: u32,
        fmi: u8,
        status: DtcStatus,
        mut on_status_change: impl FnMut(u32, u8, DtcStatus, DtcStatus),
    ) -> Result<(), DtcError> {
        if let Some(record) = self
            .records
            .iter_mut()
            .find(|r| r.spn == spn && r.fmi == fmi)
        {
            let old = record.status;
            record.occurrence_count += 1;
            record.status = status;
            if old != status {
                self.dirty_since_broadcast = true;
                on_status_change(spn, fmi, old, status);
            }
            return Ok(());
        }

        if self.records.len() >= self.config.max_records {
            return Err(DtcError::TableFull);
        }
        self.records.push(DtcRecord::new(spn, fmi, status));
        self.dirty_since_broadcast = true;
        on_status_change(spn, fmi, DtcStatus::empty(), status);
        Ok(())
    }

    /// Reads (spn, fmi)'s current status, if recorded.
    pub fn get_status(&self, spn: u32, fmi: u8) -> Option<DtcStatus> {
        self.records
            .iter()
            .find(|r| r.spn == spn && r.fmi == fmi)
            .map(|r| r.status)
    }

    /// Appends a freeze frame snapshot to (spn, fmi), bounded to
    /// [`MAX_FREEZE_FRAMES_PER_DTC`] and [`MAX_FREEZE_FRAME_SIZE`].
    pub fn add_freeze_frame(&mut self, spn: u32, fmi: u8, data: &[u8]) -> Result<(), DtcError> {
        if data.is_empty() || data.len() > MAX_FREEZE_FRAME_SIZE {
            return Err(DtcError::InvalidFreezeFrame);
        }
        let record = self
            .records
            .iter_mut()
            .find(|r| r.spn == spn && r.fmi == fmi)
            .ok_or(DtcError::UnknownDtc)?;
        if record.freeze_frames.len() >= MAX_FREEZE_FRAMES_PER_DTC {
            return Err(DtcError::TableFull);
        }
        record.freeze_frames.push(data.to_vec());
        Ok(())
    }

    /// Returns the stored freeze frames for (spn, fmi), if any.
    pub fn get_freezeframes(&self, spn: u32, fmi: u8) -> Option<&[Vec<u8>]> {
        self.records
            .iter()
            .find(|r| r.spn == spn && r.fmi == fmi)
            .map(|r| r.freeze_frames.as_slice())
    }

    /// Removes every record.
    pub fn clear_all(&mut self) {
        self.records.clear();
        self.dirty_since_broadcast = true;
    }

    /// Removes (spn, fmi)'s record, if present.
    pub fn clear_one(&mut self, spn: u32, fmi: u8) {
        let before = self.records.len();
        self.records.retain(|r| !(r.spn == spn && r.fmi == fmi));
        if self.records.len() != before {
            self.dirty_since_broadcast = true;
        }
    }

    /// Iterates records whose status intersects `mask`.
    pub fn iterate_by_status_mask(&self, mask: DtcStatus) -> impl Iterator<Item = &DtcRecord> {
        self.records.iter().filter(move |r| r.status.intersects(mask))
    }

    /// Enables or disables the periodic DM1-style broadcast.
    pub fn set_quiet(&mut self, quiet: bool) {
        self.quiet = quiet;
    }

    /// Advances aging by one tick (driven once per second by C1). Confirmed
    /// records do not age; records past `aging_cycles` aged increments are
    /// removed when `auto_clear` is set.
    pub fn process_aging(&mut self) {
        let mut i = 0;
        while i < self.records.len() {
            let record = &mut self.records[i];
            if record.status.contains(DtcStatus::CONFIRMED) {
                i += 1;
                continue;
            }
            record.aging_counter += 1;
            if record.aging_counter >= self.config.aging_threshold {
                record.aged_counter += 1;
                record.aging_counter = 0;
                if self.config.auto_clear && record.aged_counter >= self.config.aging_cycles {
                    debug!("DTC spn={} fmi={} aged out", record.spn, record.fmi);
                    self.records.remove(i);
                    self.dirty_since_broadcast = true;
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Produces a DM1-style broadcast (records with `TEST_FAILED` set) if not
    /// quiet and something changed since the last broadcast. Returns `None`
    /// otherwise.
    pub fn broadcast(&mut self) -> Option<Vec<&DtcRecord>> {
        if self.quiet || !self.dirty_since_broadcast {
            return None;
        }
        self.dirty_since_broadcast = false;
        Some(
            self.records
                .iter()
                .filter(|r| r.status.contains(DtcStatus::TEST_FAILED))
                .collect(),
        )
    }
}

/// Failure kinds a [DtcStore] operation can report.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DtcError {
    /// The record table is at capacity.
    #[error("DTC table is full")]
    TableFull,
    /// No record exists for the given (spn, fmi).
    #[error("unknown DTC")]
    UnknownDtc,
    /// The freeze frame data was empty or too large.
    #[error("invalid freeze frame data")]
    InvalidFreezeFrame,
}
