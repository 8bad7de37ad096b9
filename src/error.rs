// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types.
//!
//! Expected per-request outcomes (NACK, checksum mismatch, timeout, ...)
//! are *not* errors here; they travel in-band as
//! [`ReturnCode`](crate::ReturnCode). This module covers the conditions
//! that make the link unusable or the bridge unable to continue.

use std::{io, time::Duration};

use thiserror::Error;

/// A failure of the underlying byte transport.
#[derive(Debug, Error)]
#[error("transport: {0}")]
pub struct TransportError(#[from] pub io::Error);

/// Link-fatal and lifecycle errors of the bridge.
#[derive(Debug, Error)]
pub enum Error {
    /// OS-level I/O failure on the serial handle.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol initialization handshake did not complete.
    #[error("{protocol} initialization timed out waiting for 0x{awaited:02X}")]
    InitTimeout {
        /// `"VS1/KW"` or `"VS2/300"`.
        protocol: &'static str,
        /// The control byte that never arrived.
        awaited: u8,
    },

    /// The handshake went through but the device never answered the
    /// confirmation read.
    #[error("{protocol} initialization failed: no response from device")]
    InitNoResponse {
        /// `"VS1/KW"` or `"VS2/300"`.
        protocol: &'static str,
    },

    /// An operation that the active protocol generation cannot express.
    #[error("{0} is not supported by the VS1/KW protocol")]
    Unsupported(&'static str),

    /// The passthrough device was never observed operational.
    #[error("passthrough device not detected operational within {0:?}")]
    DetectTimeout(Duration),

    /// The restart budget of the recovery supervisor is exhausted.
    #[error("giving up after {attempts} restart attempts")]
    RestartBudgetExhausted {
        /// Number of attempts performed.
        attempts: u32,
    },

    /// Shutdown was requested while establishing the link.
    #[error("shutdown requested")]
    Shutdown,
}
