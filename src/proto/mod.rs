// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol adapters.
//!
//! Both Optolink protocol generations expose the same operation set;
//! the generation is selected once at startup and dispatched through
//! the [`Protocol`] trait so no call site ever branches on it.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::warn;

use crate::{
    config::{BridgeConfig, ProtocolKind},
    error::{Error, TransportError},
    frame::{Address, ReturnCode, Telegram},
    transport::OptolinkPort,
    ShutdownFlag,
};

pub(crate) mod vs1;
pub(crate) mod vs2;

pub use self::{vs1::Vs1Protocol, vs2::Vs2Protocol};

/// Poll interval of every receive loop.
pub(crate) const RECV_POLL: Duration = Duration::from_millis(5);

/// Overall telegram receive timeout (600 x 5 ms).
pub(crate) const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval of the init handshakes.
pub(crate) const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

/// Number of handshake poll rounds (30 x 100 ms).
pub(crate) const HANDSHAKE_TRIES: u32 = 30;

/// The common operation set of both protocol generations.
///
/// Per-request outcomes travel in-band as [`Telegram`]s; the `Result`
/// channel is reserved for conditions that end the link session.
#[async_trait]
pub trait Protocol: Send {
    /// Which generation this adapter speaks.
    fn kind(&self) -> ProtocolKind;

    /// Establishes communication with the device. Failure means the
    /// link session cannot start; the supervisor decides what happens
    /// next.
    async fn init(&mut self) -> Result<(), Error>;

    /// Clears the input buffer and puts a pre-built frame on the line.
    async fn send_raw(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Reads `len` bytes at `addr`.
    async fn read_datapoint(&mut self, addr: Address, len: u8) -> Telegram;

    /// Writes payload bytes to `addr`.
    async fn write_datapoint(&mut self, addr: Address, data: &[u8]) -> Telegram;

    /// Arbitrary request by function code. Not expressible under VS1,
    /// which reports [`Error::Unsupported`] instead of guessing at a
    /// malformed frame.
    async fn rpc(
        &mut self,
        fct: u8,
        addr: Address,
        len: u8,
        data: &[u8],
        protocol_id: u8,
    ) -> Result<Telegram, Error>;

    /// Receives one telegram. With `raw`, every byte seen on the wire is
    /// returned whatever the parse outcome; with an `echo` port, each
    /// received chunk is forwarded as it arrives (passthrough mode).
    async fn receive_telegram(
        &mut self,
        expect_response: bool,
        raw: bool,
        echo: Option<&mut dyn OptolinkPort>,
    ) -> Telegram;

    /// Collects raw bytes until the line idles for `eot_idle` or the
    /// overall `timeout` elapses.
    async fn receive_fullraw(
        &mut self,
        eot_idle: Duration,
        timeout: Duration,
        echo: Option<&mut dyn OptolinkPort>,
    ) -> Telegram;

    /// Marks a completed exchange; VS1 uses this to hold off the resync
    /// handshake.
    fn touch_sync(&mut self) {}

    /// Whether a VS1 keep-alive read is overdue. Always `false` for VS2.
    fn keepalive_due(&self) -> bool {
        false
    }

    /// Last-breath protocol reset (EOT) during teardown; errors are
    /// pointless at this stage and ignored.
    async fn send_protocol_reset(&mut self);
}

/// Builds the adapter selected by the configuration.
pub fn make_protocol(
    port: Box<dyn OptolinkPort>,
    config: &BridgeConfig,
    shutdown: ShutdownFlag,
) -> Box<dyn Protocol> {
    match config.protocol {
        ProtocolKind::Vs2 => Box::new(Vs2Protocol::new(port, shutdown)),
        ProtocolKind::Vs1 => Box::new(Vs1Protocol::new(
            port,
            shutdown,
            config.fullraw_eot(),
            config.fullraw_timeout(),
        )),
    }
}

/// Waits up to [`HANDSHAKE_TRIES`] poll rounds for a single control
/// byte.
pub(crate) async fn await_control_byte<P: OptolinkPort + ?Sized>(
    port: &mut P,
    expected: u8,
    shutdown: &ShutdownFlag,
) -> Result<bool, TransportError> {
    let mut buf = BytesMut::new();
    for _ in 0..HANDSHAKE_TRIES {
        if shutdown.is_requested() {
            return Ok(false);
        }
        buf.clear();
        port.read_available(&mut buf, HANDSHAKE_POLL).await?;
        if buf.iter().any(|byte| *byte == expected) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Shared full-raw reception: both generations collect bytes until the
/// line idles.
pub(crate) async fn receive_fullraw_on<P: OptolinkPort + ?Sized>(
    port: &mut P,
    eot_idle: Duration,
    timeout: Duration,
    mut echo: Option<&mut dyn OptolinkPort>,
    shutdown: &ShutdownFlag,
) -> Telegram {
    let mut collected = BytesMut::new();
    let start = Instant::now();
    let mut last_receive = start;

    loop {
        if shutdown.is_requested() {
            return Telegram::new(ReturnCode::Timeout, 0, collected.freeze());
        }
        let before = collected.len();
        match port.read_available(&mut collected, RECV_POLL).await {
            Ok(0) => {
                if !collected.is_empty() && last_receive.elapsed() > eot_idle {
                    return Telegram::new(ReturnCode::Success, 0, collected.freeze());
                }
            }
            Ok(_) => {
                last_receive = Instant::now();
                if let Some(echo) = echo.as_deref_mut() {
                    let fresh = collected[before..].to_vec();
                    if let Err(err) = echo.write_all(&fresh).await {
                        warn!("fullraw echo failed: {err}");
                    }
                }
            }
            Err(err) => {
                warn!("fullraw receive failed: {err}");
                return Telegram::new(ReturnCode::HandleLost, 0, collected.freeze());
            }
        }
        if start.elapsed() > timeout {
            return Telegram::new(ReturnCode::Timeout, 0, collected.freeze());
        }
    }
}

/// Converts raw-mode accumulation and an outcome into the uniform result.
pub(crate) fn raw_telegram(retcode: ReturnCode, addr: Address, alldata: Vec<u8>) -> Telegram {
    Telegram::new(retcode, addr, Bytes::from(alldata))
}
