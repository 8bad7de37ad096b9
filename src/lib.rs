// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A pure [Rust](https://www.rust-lang.org) protocol bridge for the
//! Viessmann Optolink serial interface, based on [tokio](https://tokio.rs).
//!
//! The bridge multiplexes independent consumers - a periodic datapoint
//! poller, two external command queues and a transparent passthrough
//! channel for a secondary master device - onto one half-duplex serial
//! line speaking either of the device's two binary protocols (VS1/KW
//! and VS2/300). Only one request is ever in flight; a round-robin
//! scheduler keeps the sources fair, and a recovery supervisor restarts
//! the link after sustained errors without operator intervention.
//!
//! External worlds (MQTT, TCP, CSV files, 1-Wire sensors) are attached
//! through the traits in [`sink`] and [`onewire`]; the core contains no
//! wire plumbing for them.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

mod frame;

pub use self::frame::*;

pub mod codec;
pub mod config;
pub(crate) mod energy;
mod error;
pub mod onewire;
pub mod poll;
pub mod prelude;
pub mod proto;
pub mod relay;
pub mod request;
pub mod scheduler;
pub mod sink;
pub mod supervisor;
pub mod transport;
pub mod value;
pub mod viessdata;

pub use self::error::{Error, TransportError};

/// Crate result type with the bridge's fatal error.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Bridge version, published with the session status.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared process-shutdown flag.
///
/// Checked by every bounded polling loop; a raised flag lets the
/// current operation finish within its own timeout and then tears the
/// bridge down cleanly.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests shutdown; idempotent.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Shared restart trigger of one link session.
///
/// Raised by the scheduler's error counter or a failing listener task;
/// observed by the main loop, which then returns control to the
/// supervisor.
#[derive(Debug, Clone, Default)]
pub struct RestartSignal(Arc<AtomicBool>);

impl RestartSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the restart trigger; idempotent.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
