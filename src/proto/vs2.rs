// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VS2/300 protocol adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, error, trace, warn};
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    codec::{
        pretty_bytes,
        vs2::{Vs2Codec, Vs2Event, Vs2Frame},
        ACK, EOT, ENQ, VS2_START,
    },
    config::ProtocolKind,
    error::{Error, TransportError},
    frame::{Address, ReturnCode, Telegram},
    transport::OptolinkPort,
    ShutdownFlag,
};

use super::{
    await_control_byte, raw_telegram, receive_fullraw_on, RECV_POLL, RECV_TIMEOUT,
};

/// The VS2/300 adapter owning the Optolink port.
pub struct Vs2Protocol<P> {
    port: P,
    shutdown: ShutdownFlag,
}

impl<P: OptolinkPort> Vs2Protocol<P> {
    pub fn new(port: P, shutdown: ShutdownFlag) -> Self {
        Self { port, shutdown }
    }

    async fn transact(&mut self, frame: Vs2Frame) -> Telegram {
        let mut buf = BytesMut::new();
        let mut codec = Vs2Codec::response();
        if let Err(err) = codec.encode(frame, &mut buf) {
            error!("VS2 encode failed: {err}");
            return Telegram::empty(ReturnCode::LengthError);
        }
        trace!("VS2 tx {}", pretty_bytes(&buf));
        if let Err(err) = send_frame(&mut self.port, &buf).await {
            error!("VS2 send failed: {err}");
            return Telegram::handle_lost();
        }
        receive_on(&mut self.port, true, false, None, &self.shutdown).await
    }
}

async fn send_frame<P: OptolinkPort + ?Sized>(
    port: &mut P,
    frame: &[u8],
) -> Result<(), TransportError> {
    port.reset_input_buffer().await?;
    port.write_all(frame).await
}

#[async_trait]
impl<P: OptolinkPort> super::Protocol for Vs2Protocol<P> {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Vs2
    }

    /// EOT, await ENQ, then open a VS2 session and await its ACK.
    async fn init(&mut self) -> Result<(), Error> {
        self.port.reset_input_buffer().await?;
        self.port.write_all(&[EOT]).await?;
        if !await_control_byte(&mut self.port, ENQ, &self.shutdown).await? {
            error!("VS2 init: timeout waiting for 0x05");
            return Err(Error::InitTimeout {
                protocol: "VS2/300",
                awaited: ENQ,
            });
        }

        self.port.reset_input_buffer().await?;
        self.port.write_all(&VS2_START).await?;
        if !await_control_byte(&mut self.port, ACK, &self.shutdown).await? {
            error!("VS2 init: timeout waiting for 0x06");
            return Err(Error::InitTimeout {
                protocol: "VS2/300",
                awaited: ACK,
            });
        }
        Ok(())
    }

    async fn send_raw(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        trace!("VS2 tx raw {}", pretty_bytes(frame));
        send_frame(&mut self.port, frame).await
    }

    async fn read_datapoint(&mut self, addr: Address, len: u8) -> Telegram {
        self.transact(Vs2Frame::read(addr, len)).await
    }

    async fn write_datapoint(&mut self, addr: Address, data: &[u8]) -> Telegram {
        self.transact(Vs2Frame::write(addr, data)).await
    }

    async fn rpc(
        &mut self,
        fct: u8,
        addr: Address,
        len: u8,
        data: &[u8],
        protocol_id: u8,
    ) -> Result<Telegram, Error> {
        Ok(self
            .transact(Vs2Frame::rpc(fct, addr, len, data, protocol_id))
            .await)
    }

    async fn receive_telegram(
        &mut self,
        expect_response: bool,
        raw: bool,
        echo: Option<&mut dyn OptolinkPort>,
    ) -> Telegram {
        receive_on(&mut self.port, expect_response, raw, echo, &self.shutdown).await
    }

    async fn receive_fullraw(
        &mut self,
        eot_idle: Duration,
        timeout: Duration,
        echo: Option<&mut dyn OptolinkPort>,
    ) -> Telegram {
        receive_fullraw_on(&mut self.port, eot_idle, timeout, echo, &self.shutdown).await
    }

    async fn send_protocol_reset(&mut self) {
        if let Err(err) = self.port.write_all(&[EOT]).await {
            debug!("protocol reset not deliverable: {err}");
        }
    }
}

/// The VS2 receive state machine.
///
/// `AwaitAck -> AwaitStx -> AwaitLen -> AwaitFullPayload -> checksum ->
/// message type`, each failing edge returning its own [`ReturnCode`]
/// immediately. A global timeout polled every 5 ms aborts to `Timeout`.
/// In raw mode every byte seen is accumulated and returned regardless of
/// the parse outcome; an echo port receives each chunk as it arrives.
pub(crate) async fn receive_on<P: OptolinkPort + ?Sized>(
    port: &mut P,
    expect_response: bool,
    raw: bool,
    mut echo: Option<&mut dyn OptolinkPort>,
    shutdown: &ShutdownFlag,
) -> Telegram {
    let mut codec = if expect_response {
        Vs2Codec::response()
    } else {
        Vs2Codec::listen()
    };
    let mut buf = BytesMut::with_capacity(300);
    let mut alldata: Vec<u8> = Vec::new();
    let deadline = Instant::now() + RECV_TIMEOUT;

    loop {
        if shutdown.is_requested() {
            return raw_telegram(ReturnCode::Timeout, 0, alldata);
        }

        let before = buf.len();
        match port.read_available(&mut buf, RECV_POLL).await {
            Ok(0) => {}
            Ok(_) => {
                let fresh = buf[before..].to_vec();
                if let Some(echo) = echo.as_deref_mut() {
                    if let Err(err) = echo.write_all(&fresh).await {
                        warn!("passthrough echo failed: {err}");
                    }
                }
                if raw {
                    alldata.extend_from_slice(&fresh);
                }
            }
            Err(err) => {
                error!("VS2 receive failed: {err}");
                return raw_telegram(ReturnCode::HandleLost, 0, alldata);
            }
        }

        match codec.decode(&mut buf) {
            Ok(Some(event)) => {
                let retcode = event.retcode();
                let addr = event.addr();
                match &event {
                    Vs2Event::Nack => error!("VS2 NACK error"),
                    Vs2Event::UnknownFirstByte(byte) => {
                        error!("VS2 unknown first byte error, {byte:02X}");
                    }
                    Vs2Event::FrameStart(byte) => error!("VS2 STX error, {byte:02X}"),
                    Vs2Event::LengthError(len) => error!("VS2 length error, {len}"),
                    Vs2Event::ChecksumMismatch {
                        expected, actual, ..
                    } => error!("VS2 CRC error, {actual:02X}/{expected:02X}"),
                    Vs2Event::ErrorMessage(t) => {
                        debug!("VS2 error message on 0x{:04X}", t.addr);
                    }
                    Vs2Event::Telegram(t) => {
                        trace!("VS2 rx 0x{:04X} {}", t.addr, pretty_bytes(&t.payload));
                    }
                }
                let data = if raw {
                    bytes::Bytes::from(alldata)
                } else {
                    event.payload()
                };
                return Telegram::new(retcode, addr, data);
            }
            Ok(None) => {}
            // The decoder classifies everything in-band.
            Err(err) => {
                error!("VS2 decode failed: {err}");
                return raw_telegram(ReturnCode::HandleLost, 0, alldata);
            }
        }

        if Instant::now() >= deadline {
            warn!("VS2 rx telegram timeout");
            return raw_telegram(ReturnCode::Timeout, 0, alldata);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        codec::vs2::{checksum, Vs2Frame},
        proto::Protocol as _,
        transport::mock::MockPort,
    };

    use super::*;

    fn read_response(addr: Address, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![
            0x41,
            5 + data.len() as u8,
            0x01,
            0x01,
            (addr >> 8) as u8,
            addr as u8,
            data.len() as u8,
        ];
        frame.extend_from_slice(data);
        frame.push(checksum(&frame));
        let mut full = vec![ACK];
        full.extend_from_slice(&frame);
        full
    }

    #[tokio::test]
    async fn read_datapoint_roundtrip() {
        let port = MockPort::respond_with(|frame| {
            assert_eq!(frame[3], 0x01); // Virtual_READ
            vec![read_response(0x0802, &[0x64, 0x00])]
        });
        let mut proto = Vs2Protocol::new(port, ShutdownFlag::default());
        let telegram = proto.read_datapoint(0x0802, 2).await;
        assert_eq!(telegram.retcode, ReturnCode::Success);
        assert_eq!(telegram.addr, 0x0802);
        assert_eq!(&telegram.data[..], &[0x64, 0x00]);
    }

    #[tokio::test]
    async fn response_split_across_reads() {
        let full = read_response(0x0800, &[0x12, 0x01]);
        let (head, tail) = full.split_at(3);
        let port = MockPort::with_incoming(&[head, tail]);
        let mut proto = Vs2Protocol::new(port, ShutdownFlag::default());
        let telegram = proto.receive_telegram(true, false, None).await;
        assert_eq!(telegram.retcode, ReturnCode::Success);
        assert_eq!(&telegram.data[..], &[0x12, 0x01]);
    }

    #[tokio::test]
    async fn nack_reported_in_band() {
        let port = MockPort::respond_with(|_| vec![vec![0x15]]);
        let mut proto = Vs2Protocol::new(port, ShutdownFlag::default());
        let telegram = proto.write_datapoint(0x6300, &[0x30]).await;
        assert_eq!(telegram.retcode, ReturnCode::Nack);
    }

    #[tokio::test]
    async fn transport_failure_is_handle_lost() {
        let port = MockPort {
            fail_io: true,
            ..MockPort::default()
        };
        let mut proto = Vs2Protocol::new(port, ShutdownFlag::default());
        let telegram = proto.read_datapoint(0x0800, 2).await;
        assert_eq!(telegram.retcode, ReturnCode::HandleLost);
    }

    #[tokio::test]
    async fn raw_mode_accumulates_every_byte() {
        let full = read_response(0x0800, &[0x01]);
        let port = MockPort::with_incoming(&[&full]);
        let mut proto = Vs2Protocol::new(port, ShutdownFlag::default());
        let telegram = proto.receive_telegram(true, true, None).await;
        assert_eq!(telegram.retcode, ReturnCode::Success);
        // Raw mode returns the ACK and frame bytes verbatim.
        assert_eq!(&telegram.data[..], &full[..]);
    }

    #[tokio::test]
    async fn init_handshake() {
        let port = MockPort::respond_with(|frame| match frame {
            [EOT] => vec![vec![ENQ]],
            f if *f == VS2_START => vec![vec![ACK]],
            other => panic!("unexpected init frame {other:?}"),
        });
        let mut proto = Vs2Protocol::new(port, ShutdownFlag::default());
        assert!(proto.init().await.is_ok());
    }

    #[tokio::test]
    async fn rpc_is_supported() {
        let port = MockPort::respond_with(|frame| {
            assert_eq!(frame[3], 0x07); // Remote_Procedure_Call
            vec![read_response(0xB800, &[0u8; 24])]
        });
        let mut proto = Vs2Protocol::new(port, ShutdownFlag::default());
        let telegram = proto
            .rpc(0x07, 0xB800, 2, &[0x02, 0x00], 0x00)
            .await
            .unwrap();
        assert_eq!(telegram.retcode, ReturnCode::Success);
    }

    #[test]
    fn request_frames_match_wire_format() {
        // Anchors the adapter to the documented frame layout.
        let mut buf = BytesMut::new();
        Vs2Codec::response()
            .encode(Vs2Frame::read(0x00F8, 8), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &[0x41, 0x05, 0x00, 0x01, 0x00, 0xF8, 0x08, 0x06]);
    }
}
