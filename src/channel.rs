//! Link-layer frame transport (C2)
//!
//! The core never speaks to a concrete CAN/CAN-FD/K-Line driver directly.
//! Instead it is wired against [FrameSink] and [FrameSource], a pair of
//! narrow traits a vendor HAL implements. The core never blocks inside
//! [`FrameSource::poll_frame`]: a real implementation enqueues frames from an
//! interrupt or runtime-task context and `poll_frame` simply drains that
//! queue (§5).

use thiserror::Error;

/// Maximum payload of a classic CAN frame.
pub const CLASSIC_FRAME_LEN: usize = 8;
/// Maximum payload of a CAN-FD frame.
pub const FD_FRAME_LEN: usize = 64;

/// A single link-layer frame, classic CAN or CAN-FD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFrame {
    /// 11-bit standard or 29-bit extended CAN identifier. Opaque to the core
    /// beyond matching against the configured acceptance set.
    pub id: u32,
    /// Frame payload.
    pub data: Vec<u8>,
}

impl LinkFrame {
    /// Builds a frame from an id and payload.
    pub fn new(id: u32, data: &[u8]) -> Self {
        Self {
            id,
            data: data.to_vec(),
        }
    }

    /// Declared length (DLC) of this frame.
    pub fn dlc(&self) -> usize {
        self.data.len()
    }
}

/// Result produced when handing a frame to the link layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame accepted by the transport.
    Ok,
    /// Transport is momentarily unable to accept more frames (e.g. Tx FIFO full).
    Busy,
}

/// Errors a [FrameSink] implementation may report.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The underlying link reported a hard failure transmitting a frame.
    #[error("transport failed to send frame")]
    SendFailed,
    /// The frame did not fit the link's MTU (8 bytes classic, up to 64 FD).
    #[error("frame payload of {0} bytes exceeds link MTU")]
    FrameTooLarge(usize),
}

/// Sink half of the frame transport: the core calls this to emit a link frame.
pub trait FrameSink {
    /// Attempts to transmit one frame. MUST NOT block.
    fn send_frame(&mut self, frame: &LinkFrame) -> Result<SendOutcome, ChannelError>;
}

/// Source half of the frame transport: the core polls this once per
/// [`crate::core::DiagnosticCore::process`] call to drain frames that
/// arrived since the last poll.
pub trait FrameSource {
    /// Returns the next queued frame accepted by this transport's filter, if any.
    fn poll_frame(&mut self) -> Option<LinkFrame>;
}

/// ISO-TP configuration for one physical-request pair (rx_id/tx_id).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IsoTpSettings {
    /// ID the ECU listens on for tester requests.
    pub rx_id: u32,
    /// ID the ECU transmits responses on.
    pub tx_id: u32,
    /// Block size advertised in this ECU's flow-control frames. 0 = unlimited.
    pub block_size: u8,
    /// STmin advertised in this ECU's flow-control frames (raw ISO 15765-2 encoding).
    pub stmin: u8,
    /// Timeout (ms) waiting for the next consecutive frame while assembling.
    pub rx_timeout_ms: u32,
    /// Timeout (ms) waiting for flow control while transmitting.
    pub tx_timeout_ms: u32,
    /// Link MTU in bytes: 8 for classic CAN, up to 64 for CAN-FD.
    pub link_mtu: usize,
    /// Pad frames shorter than `link_mtu` on transmit.
    pub pad_frames: bool,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            rx_id: 0,
            tx_id: 0,
            block_size: 8,
            stmin: 0,
            rx_timeout_ms: 1000,
            tx_timeout_ms: 1000,
            link_mtu: CLASSIC_FRAME_LEN,
            pad_frames: true,
        }
    }
}
