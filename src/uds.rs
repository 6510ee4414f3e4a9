//! UDS (ISO 14229) service identifiers, negative response codes and message
//! framing.
//!
//! Grounded on the teacher's `uds/mod.rs` `UDSCommand`/`UDSError` enums
//! (tester-side), carried over with the same SID set named in the teacher's
//! `UDSCommand`, mapped instead onto ECU-side negative/positive response
//! framing (§6 wire format).

use strum_macros::{Display, EnumIter};

/// UDS service identifier (request SID). Matches the teacher's `UDSCommand`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter)]
#[repr(u8)]
pub enum ServiceId {
    /// Diagnostic session control (0x10).
    DiagnosticSessionControl = 0x10,
    /// ECU reset (0x11).
    EcuReset = 0x11,
    /// Clear diagnostic information (0x14).
    ClearDiagnosticInformation = 0x14,
    /// Read DTC information (0x19).
    ReadDtcInformation = 0x19,
    /// Read data by identifier (0x22).
    ReadDataByIdentifier = 0x22,
    /// Read memory by address (0x23).
    ReadMemoryByAddress = 0x23,
    /// Security access (0x27).
    SecurityAccess = 0x27,
    /// Communication control (0x28).
    CommunicationControl = 0x28,
    /// Write data by identifier (0x2E).
    WriteDataByIdentifier = 0x2E,
    /// Routine control (0x31).
    RoutineControl = 0x31,
    /// Request download (0x34).
    RequestDownload = 0x34,
    /// Transfer data (0x36).
    TransferData = 0x36,
    /// Request transfer exit (0x37).
    RequestTransferExit = 0x37,
    /// Tester present (0x3E).
    TesterPresent = 0x3E,
    /// Control DTC setting (0x85).
    ControlDtcSetting = 0x85,
}

impl ServiceId {
    /// Maps a request SID byte to a [ServiceId], if recognized.
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x10 => Self::DiagnosticSessionControl,
            0x11 => Self::EcuReset,
            0x14 => Self::ClearDiagnosticInformation,
            0x19 => Self::ReadDtcInformation,
            0x22 => Self::ReadDataByIdentifier,
            0x23 => Self::ReadMemoryByAddress,
            0x27 => Self::SecurityAccess,
            0x28 => Self::CommunicationControl,
            0x2E => Self::WriteDataByIdentifier,
            0x31 => Self::RoutineControl,
            0x34 => Self::RequestDownload,
            0x36 => Self::TransferData,
            0x37 => Self::RequestTransferExit,
            0x3E => Self::TesterPresent,
            0x85 => Self::ControlDtcSetting,
            _ => return None,
        })
    }

    /// The response SID (`request_sid + 0x40`) for a positive response.
    pub fn positive_response_sid(self) -> u8 {
        self as u8 + 0x40
    }
}

/// Negative response code, carried in byte 3 of a `{0x7F, sid, nrc}` reply.
///
/// Named and numbered exactly as the teacher's `UDSError`, generalized from a
/// tester-side decode-only enum (`From<u8>`) to one that also encodes back
/// (`From<NegativeResponseCode> for u8`) for building ECU responses.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum NegativeResponseCode {
    /// 0x10 ECU rejected the request with no more specific reason.
    GeneralReject,
    /// 0x11 Service is not supported by the ECU.
    ServiceNotSupported,
    /// 0x12 Sub-function is not supported by the ECU.
    SubFunctionNotSupported,
    /// 0x13 Request length or format was incorrect.
    IncorrectMessageLengthOrInvalidFormat,
    /// 0x14 Response would be too long for the transport.
    ResponseTooLong,
    /// 0x21 ECU is busy; client should repeat the request.
    BusyRepeatRequest,
    /// 0x22 Prerequisite conditions for the request are not met.
    ConditionsNotCorrect,
    /// 0x24 Request was sent in the wrong order (e.g. sendKey before requestSeed).
    RequestSequenceError,
    /// 0x31 Request parameter is out of range.
    RequestOutOfRange,
    /// 0x33 Security access has not been granted for this service.
    SecurityAccessDenied,
    /// 0x35 The key sent did not match the expected key.
    InvalidKey,
    /// 0x36 Too many incorrect key attempts; ECU is in lockout.
    ExceedNumberOfAttempts,
    /// 0x37 Seed requested again before the mandated delay elapsed.
    RequiredTimeDelayNotExpired,
    /// 0x70 Upload/download request rejected due to a fault condition.
    UploadDownloadNotAccepted,
    /// 0x71 Transfer halted due to a fault condition.
    TransferDataSuspended,
    /// 0x72 General failure during reprogramming.
    GeneralProgrammingFailure,
    /// 0x73 Block sequence counter in TransferData was incorrect.
    WrongBlockSequenceCounter,
    /// 0x78 Request accepted, response pending; client should wait up to P2*.
    RequestCorrectlyReceivedResponsePending,
    /// 0x7E Sub-function is not supported in the active session.
    SubFunctionNotSupportedInActiveSession,
    /// 0x7F Service is not supported in the active session.
    ServiceNotSupportedInActiveSession,
    /// Any other ISO/SAE reserved or manufacturer-specific value.
    IsoSaeReserved(u8),
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> u8 {
        use NegativeResponseCode::*;
        match nrc {
            GeneralReject => 0x10,
            ServiceNotSupported => 0x11,
            SubFunctionNotSupported => 0x12,
            IncorrectMessageLengthOrInvalidFormat => 0x13,
            ResponseTooLong => 0x14,
            BusyRepeatRequest => 0x21,
            ConditionsNotCorrect => 0x22,
            RequestSequenceError => 0x24,
            RequestOutOfRange => 0x31,
            SecurityAccessDenied => 0x33,
            InvalidKey => 0x35,
            ExceedNumberOfAttempts => 0x36,
            RequiredTimeDelayNotExpired => 0x37,
            UploadDownloadNotAccepted => 0x70,
            TransferDataSuspended => 0x71,
            GeneralProgrammingFailure => 0x72,
            WrongBlockSequenceCounter => 0x73,
            RequestCorrectlyReceivedResponsePending => 0x78,
            SubFunctionNotSupportedInActiveSession => 0x7E,
            ServiceNotSupportedInActiveSession => 0x7F,
            IsoSaeReserved(x) => x,
        }
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(v: u8) -> Self {
        use NegativeResponseCode::*;
        match v {
            0x10 => GeneralReject,
            0x11 => ServiceNotSupported,
            0x12 => SubFunctionNotSupported,
            0x13 => IncorrectMessageLengthOrInvalidFormat,
            0x14 => ResponseTooLong,
            0x21 => BusyRepeatRequest,
            0x22 => ConditionsNotCorrect,
            0x24 => RequestSequenceError,
            0x31 => RequestOutOfRange,
            0x33 => SecurityAccessDenied,
            0x35 => InvalidKey,
            0x36 => ExceedNumberOfAttempts,
            0x37 => RequiredTimeDelayNotExpired,
            0x70 => UploadDownloadNotAccepted,
            0x71 => TransferDataSuspended,
            0x72 => GeneralProgrammingFailure,
            0x73 => WrongBlockSequenceCounter,
            0x78 => RequestCorrectlyReceivedResponsePending,
            0x7E => SubFunctionNotSupportedInActiveSession,
            0x7F => ServiceNotSupportedInActiveSession,
            x => IsoSaeReserved(x),
        }
    }
}

/// A decoded UDS request: SID plus the remaining parameter bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Raw SID byte, kept even if unrecognized so the router can NRC it.
    pub sid: u8,
    /// Sub-function byte, if `data` is non-empty. Bit 7 is the suppress-positive-response flag.
    pub params: Vec<u8>,
}

impl Request {
    /// Parses a UDS request from a reassembled ISO-TP payload.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let (sid, rest) = payload.split_first()?;
        Some(Self {
            sid: *sid,
            params: rest.to_vec(),
        })
    }

    /// Sub-function byte with the suppress-positive-response bit (0x80) masked off.
    pub fn sub_function(&self) -> Option<u8> {
        self.params.first().map(|b| b & 0x7F)
    }

    /// True if the client set the suppress-positive-response bit (0x80) on the sub-function.
    pub fn suppress_positive_response(&self) -> bool {
        self.params.first().is_some_and(|b| b & 0x80 != 0)
    }
}

/// Builds a positive response frame: `{sid+0x40, ...data}`.
pub fn positive_response(sid: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(sid.wrapping_add(0x40));
    out.extend_from_slice(data);
    out
}

/// Builds a negative response frame: `{0x7F, sid, nrc}`.
pub fn negative_response(sid: u8, nrc: NegativeResponseCode) -> Vec<u8> {
    vec![0x7F, sid, nrc.into()]
}
