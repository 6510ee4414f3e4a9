#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

//! An ECU-side diagnostic server implementing Unified Diagnostic Services
//! (ISO 14229) over an ISO-TP (ISO 15765-2) segmentation layer.
//!
//! ## Protocol support
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 - UDS is the diagnostic protocol utilized by almost all vehicle
//! manufacturers from 2006 onwards. This crate implements the ECU side of
//! the protocol: routing incoming requests to registered service handlers,
//! enforcing session and security gating, and framing responses.
//!
//! ### ISO-TP (ISO15765-2)
//! Provides the segmentation/reassembly layer UDS rides on top of,
//! including flow control pacing and the CAN-FD single-frame escape
//! encoding for payloads between 8 and 62 bytes.
//!
//! ## Layout
//!
//! The crate is organized around the subsystems a running server is built
//! from: a monotonic [`timer`] wheel, a transport-agnostic [`channel`]
//! abstraction, the [`isotp`] segmentation engine, UDS [`session`] and
//! [`security`] state machines, a [`dtc`] fault memory store, a
//! [`router`] that dispatches requests to registered handlers, bounded
//! [`logs`] for post-mortem inspection, a [`config`] surface describing how
//! to wire it all together, and [`core`], which owns the lot and drives the
//! main loop.

pub mod channel;
pub mod config;
pub mod core;
pub mod dtc;
pub mod isotp;
pub mod logs;
pub mod router;
pub mod security;
pub mod session;
pub mod timer;
pub mod uds;

pub use crate::core::{DiagnosticCore, InitError};

/// Converts a single byte into a BCD string.
pub fn bcd_decode(input: u8) -> String {
    format!("{}{}", (input & 0xF0) >> 4, input & 0x0F)
}

/// Converts a slice to a BCD string, optionally separated.
pub fn bcd_decode_slice(input: &[u8], sep: Option<&str>) -> String {
    let mut res = String::new();
    for (pos, x) in input.iter().enumerate() {
        res.push_str(bcd_decode(*x).as_str());
        if let Some(separator) = sep
            && pos != input.len() - 1
        {
            res.push_str(separator)
        }
    }
    res
}
