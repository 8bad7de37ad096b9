// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VS1/KW protocol adapter.
//!
//! The legacy generation has no response framing; the expected response
//! length is known from the request. The device drops out of sync after
//! roughly half a second of silence, so requests after an idle period
//! are preceded by an EOT/ENQ resync handshake and an STX prefix.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, error, trace};
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    codec::{
        pretty_bytes,
        vs1::{Vs1Codec, Vs1Frame},
        ENQ, EOT,
    },
    config::ProtocolKind,
    error::{Error, TransportError},
    frame::{Address, ReturnCode, Telegram},
    transport::OptolinkPort,
    ShutdownFlag,
};

use super::{await_control_byte, receive_fullraw_on, RECV_POLL};

/// Idle time after which the next request needs a resync handshake.
const SYNC_TIMEOUT: Duration = Duration::from_millis(600);

/// Idle time after which the scheduler should issue a keep-alive read.
const KEEPALIVE_IDLE: Duration = Duration::from_millis(500);

/// Fixed-length response window (400 x 5 ms).
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Diagnostic address read to confirm the device answers.
const PROBE_ADDR: Address = 0x00F8;

/// The VS1/KW adapter owning the Optolink port.
pub struct Vs1Protocol<P> {
    port: P,
    shutdown: ShutdownFlag,
    last_comm: Option<Instant>,
    fullraw_eot: Duration,
    fullraw_timeout: Duration,
}

impl<P: OptolinkPort> Vs1Protocol<P> {
    pub fn new(
        port: P,
        shutdown: ShutdownFlag,
        fullraw_eot: Duration,
        fullraw_timeout: Duration,
    ) -> Self {
        Self {
            port,
            shutdown,
            last_comm: None,
            fullraw_eot,
            fullraw_timeout,
        }
    }

    fn sync_elapsed(&self) -> bool {
        self.last_comm
            .map_or(true, |at| at.elapsed() > SYNC_TIMEOUT)
    }

    fn mark_comm(&mut self) {
        self.last_comm = Some(Instant::now());
    }

    /// EOT, then await the periodic ENQ.
    async fn resync(&mut self) -> Result<bool, TransportError> {
        self.port.reset_input_buffer().await?;
        self.port.write_all(&[EOT]).await?;
        let seen = await_control_byte(&mut self.port, ENQ, &self.shutdown).await?;
        debug!("VS1 resync, ENQ seen: {seen}");
        Ok(seen)
    }

    async fn transact(&mut self, mut frame: Vs1Frame, addr: Address) -> Telegram {
        if self.sync_elapsed() {
            frame.stx = true;
            match self.resync().await {
                Ok(true) => {}
                Ok(false) => return Telegram::new(ReturnCode::Timeout, addr, bytes::Bytes::new()),
                Err(err) => {
                    error!("VS1 resync failed: {err}");
                    return Telegram::handle_lost();
                }
            }
        }
        let response_len = frame.response_len();
        let mut buf = BytesMut::new();
        let mut codec = Vs1Codec::default();
        if codec.encode(frame, &mut buf).is_err() {
            return Telegram::empty(ReturnCode::LengthError);
        }
        trace!("VS1 tx {}", pretty_bytes(&buf));
        if let Err(err) = self.port.reset_input_buffer().await {
            error!("VS1 send failed: {err}");
            return Telegram::handle_lost();
        }
        if let Err(err) = self.port.write_all(&buf).await {
            error!("VS1 send failed: {err}");
            return Telegram::handle_lost();
        }
        self.receive_fixed(response_len, addr).await
    }

    /// Receives exactly `len` bytes; everything else is a timeout.
    async fn receive_fixed(&mut self, len: usize, addr: Address) -> Telegram {
        let mut buf = BytesMut::new();
        let mut codec = Vs1Codec::default();
        codec.expect(len);
        let deadline = Instant::now() + RECV_TIMEOUT;
        loop {
            if self.shutdown.is_requested() {
                return Telegram::new(ReturnCode::Timeout, addr, buf.freeze());
            }
            if let Err(err) = self.port.read_available(&mut buf, RECV_POLL).await {
                error!("VS1 receive failed: {err}");
                return Telegram::new(ReturnCode::HandleLost, addr, buf.freeze());
            }
            match codec.decode(&mut buf) {
                Ok(Some(data)) => {
                    trace!("VS1 rx {}", pretty_bytes(&data));
                    self.mark_comm();
                    return Telegram::new(ReturnCode::Success, addr, data);
                }
                Ok(None) => {}
                Err(_) => unreachable!("fixed-length decode cannot fail"),
            }
            if Instant::now() >= deadline {
                debug!("VS1 rx telegram timeout");
                return Telegram::new(ReturnCode::Timeout, addr, buf.freeze());
            }
        }
    }
}

#[async_trait]
impl<P: OptolinkPort> super::Protocol for Vs1Protocol<P> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Vs1
    }

    /// EOT/ENQ handshake, then one probe read of the diagnostic address
    /// to confirm the device answers at the expected length.
    async fn init(&mut self) -> Result<(), Error> {
        self.port.reset_input_buffer().await?;
        self.port.write_all(&[EOT]).await?;
        if !await_control_byte(&mut self.port, ENQ, &self.shutdown).await? {
            error!("VS1 init: timeout waiting for 0x05");
            return Err(Error::InitTimeout {
                protocol: "VS1/KW",
                awaited: ENQ,
            });
        }
        let mut probe = Vs1Frame::read(PROBE_ADDR, 4);
        probe.stx = true;
        let telegram = self.transact_probe(probe).await;
        if !telegram.retcode.is_success() {
            error!("VS1 init: probe read failed, {}", telegram.retcode);
            return Err(Error::InitNoResponse { protocol: "VS1/KW" });
        }
        Ok(())
    }

    async fn send_raw(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        trace!("VS1 tx raw {}", pretty_bytes(frame));
        self.port.reset_input_buffer().await?;
        self.port.write_all(frame).await
    }

    async fn read_datapoint(&mut self, addr: Address, len: u8) -> Telegram {
        self.transact(Vs1Frame::read(addr, len), addr).await
    }

    async fn write_datapoint(&mut self, addr: Address, data: &[u8]) -> Telegram {
        self.transact(Vs1Frame::write(addr, data), addr).await
    }

    async fn rpc(
        &mut self,
        _fct: u8,
        _addr: Address,
        _len: u8,
        _data: &[u8],
        _protocol_id: u8,
    ) -> Result<Telegram, Error> {
        Err(Error::Unsupported("request command"))
    }

    /// VS1 has no framed telegrams; anything arbitrary is collected the
    /// full-raw way.
    async fn receive_telegram(
        &mut self,
        _expect_response: bool,
        _raw: bool,
        echo: Option<&mut dyn OptolinkPort>,
    ) -> Telegram {
        let (eot, timeout) = (self.fullraw_eot, self.fullraw_timeout);
        receive_fullraw_on(&mut self.port, eot, timeout, echo, &self.shutdown).await
    }

    async fn receive_fullraw(
        &mut self,
        eot_idle: Duration,
        timeout: Duration,
        echo: Option<&mut dyn OptolinkPort>,
    ) -> Telegram {
        receive_fullraw_on(&mut self.port, eot_idle, timeout, echo, &self.shutdown).await
    }

    fn touch_sync(&mut self) {
        self.mark_comm();
    }

    fn keepalive_due(&self) -> bool {
        self.last_comm
            .map_or(true, |at| at.elapsed() > KEEPALIVE_IDLE)
    }

    async fn send_protocol_reset(&mut self) {
        if let Err(err) = self.port.write_all(&[EOT]).await {
            debug!("protocol reset not deliverable: {err}");
        }
    }
}

impl<P: OptolinkPort> Vs1Protocol<P> {
    /// Like [`Self::transact`] but without the resync heuristics; the
    /// init path controls the handshake itself.
    async fn transact_probe(&mut self, frame: Vs1Frame) -> Telegram {
        let response_len = frame.response_len();
        let mut buf = BytesMut::new();
        let mut codec = Vs1Codec::default();
        if codec.encode(frame, &mut buf).is_err() {
            return Telegram::empty(ReturnCode::LengthError);
        }
        if let Err(err) = self.port.reset_input_buffer().await {
            error!("VS1 probe failed: {err}");
            return Telegram::handle_lost();
        }
        if let Err(err) = self.port.write_all(&buf).await {
            error!("VS1 probe failed: {err}");
            return Telegram::handle_lost();
        }
        self.receive_fixed(response_len, PROBE_ADDR).await
    }
}
