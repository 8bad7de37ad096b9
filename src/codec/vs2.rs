// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VS2/300 framing.
//!
//! Frame layout:
//! `[0x41 STX] [Len] [ProtocolId|MsgType] [Seq|FunctionCode] [AddrHi]
//! [AddrLo] [BlockLen] [...Data] [Checksum]`
//!
//! `Len` counts the payload from `ProtocolId` through the last data byte
//! (5 + data length). The checksum is the modulo-256 sum of everything
//! from the `Len` byte through the last data byte; the leading STX is
//! excluded. A response body is preceded by a single acknowledgement
//! byte (ACK `0x06` / NACK `0x15`).

use std::io;

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use smallvec::SmallVec;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Address, FunctionCode, MsgType, ReturnCode};

use super::{ACK, NACK, VS2_STX};

/// Smallest possible payload: protocol id, function code, address (2),
/// block length.
const MIN_PAYLOAD_LEN: u8 = 5;

/// Largest data block that still fits the one-byte `Len` field.
const MAX_DATA_LEN: usize = (u8::MAX - MIN_PAYLOAD_LEN) as usize;

/// Modulo-256 sum from the `Len` byte through the last data byte.
///
/// `frame` must start at the STX byte and contain at least the full
/// payload as announced by `frame[1]`.
pub(crate) fn checksum(frame: &[u8]) -> u8 {
    let payload_len = frame[1] as usize;
    frame[1..payload_len + 2]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// One outbound VS2 frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Vs2Frame {
    pub(crate) protocol_id: u8,
    pub(crate) fct: FunctionCode,
    pub(crate) addr: Address,
    pub(crate) block_len: u8,
    pub(crate) data: SmallVec<[u8; 16]>,
}

impl Vs2Frame {
    /// Virtual read request for `len` bytes at `addr`.
    pub(crate) fn read(addr: Address, len: u8) -> Self {
        Self {
            protocol_id: 0x00,
            fct: FunctionCode::VirtualRead,
            addr,
            block_len: len,
            data: SmallVec::new(),
        }
    }

    /// Virtual write request.
    pub(crate) fn write(addr: Address, data: &[u8]) -> Self {
        Self {
            protocol_id: 0x00,
            fct: FunctionCode::VirtualWrite,
            addr,
            block_len: data.len() as u8,
            data: SmallVec::from_slice(data),
        }
    }

    /// Arbitrary request by function code.
    pub(crate) fn rpc(fct: u8, addr: Address, len: u8, data: &[u8], protocol_id: u8) -> Self {
        Self {
            protocol_id,
            fct: FunctionCode::new(fct & 0x1F),
            addr,
            block_len: len,
            data: SmallVec::from_slice(data),
        }
    }
}

/// A fully parsed inbound VS2 telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Vs2Telegram {
    pub(crate) msg_type: MsgType,
    pub(crate) seq: u8,
    pub(crate) fct: FunctionCode,
    pub(crate) addr: Address,
    pub(crate) block_len: u8,
    pub(crate) payload: Bytes,
}

/// Everything the decoder can produce. Protocol-level failures are
/// ordinary items, not `Err` values: the receive loop converts them to
/// [`ReturnCode`]s and the stream stays usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Vs2Event {
    /// Device rejected the request.
    Nack,
    /// First response byte was neither ACK nor NACK.
    UnknownFirstByte(u8),
    /// Telegram did not start with STX.
    FrameStart(u8),
    /// Announced payload length below the fixed header size.
    LengthError(u8),
    /// Checksum mismatch; the suspect payload is kept for diagnostics.
    ChecksumMismatch {
        addr: Address,
        payload: Bytes,
        expected: u8,
        actual: u8,
    },
    /// Well-formed telegram flagged as an error message by the device.
    ErrorMessage(Vs2Telegram),
    /// Well-formed telegram.
    Telegram(Vs2Telegram),
}

impl Vs2Event {
    pub(crate) fn retcode(&self) -> ReturnCode {
        match self {
            Self::Nack => ReturnCode::Nack,
            Self::UnknownFirstByte(_) => ReturnCode::UnknownFirstByte,
            Self::FrameStart(_) => ReturnCode::FrameStartError,
            Self::LengthError(_) => ReturnCode::LengthError,
            Self::ChecksumMismatch { .. } => ReturnCode::ChecksumError,
            Self::ErrorMessage(_) => ReturnCode::ErrorMessage,
            Self::Telegram(_) => ReturnCode::Success,
        }
    }

    pub(crate) fn addr(&self) -> Address {
        match self {
            Self::ChecksumMismatch { addr, .. } => *addr,
            Self::ErrorMessage(t) | Self::Telegram(t) => t.addr,
            _ => 0,
        }
    }

    pub(crate) fn payload(&self) -> Bytes {
        match self {
            Self::ChecksumMismatch { payload, .. } => payload.clone(),
            Self::ErrorMessage(t) | Self::Telegram(t) => t.payload.clone(),
            _ => Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Ack,
    Stx,
    Header,
    Payload { total: usize },
}

/// Incremental VS2 frame codec.
///
/// One exchange per instance lifetime stage: call [`Vs2Codec::reset`]
/// before reusing it for the next telegram.
#[derive(Debug)]
pub(crate) struct Vs2Codec {
    expect_ack: bool,
    state: DecodeState,
}

impl Vs2Codec {
    /// Codec for response telegrams (acknowledgement byte first).
    pub(crate) fn response() -> Self {
        Self {
            expect_ack: true,
            state: DecodeState::Ack,
        }
    }

    /// Codec for master request telegrams (no acknowledgement byte),
    /// as seen when listening to the passthrough device.
    pub(crate) fn listen() -> Self {
        Self {
            expect_ack: false,
            state: DecodeState::Stx,
        }
    }

    /// Rearm for the next telegram.
    pub(crate) fn reset(&mut self) {
        self.state = if self.expect_ack {
            DecodeState::Ack
        } else {
            DecodeState::Stx
        };
    }
}

impl Decoder for Vs2Codec {
    type Item = Vs2Event;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Vs2Event>> {
        loop {
            match self.state {
                DecodeState::Ack => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let first = buf[0];
                    buf.advance(1);
                    match first {
                        ACK => self.state = DecodeState::Stx,
                        NACK => return Ok(Some(Vs2Event::Nack)),
                        other => return Ok(Some(Vs2Event::UnknownFirstByte(other))),
                    }
                }
                DecodeState::Stx => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    if buf[0] != VS2_STX {
                        let byte = buf[0];
                        buf.advance(1);
                        return Ok(Some(Vs2Event::FrameStart(byte)));
                    }
                    self.state = DecodeState::Header;
                }
                DecodeState::Header => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    let payload_len = buf[1];
                    if payload_len < MIN_PAYLOAD_LEN {
                        return Ok(Some(Vs2Event::LengthError(payload_len)));
                    }
                    self.state = DecodeState::Payload {
                        total: payload_len as usize + 3,
                    };
                }
                DecodeState::Payload { total } => {
                    if buf.len() < total {
                        return Ok(None);
                    }
                    let frame = buf.split_to(total).freeze();
                    return Ok(Some(parse_frame(&frame)));
                }
            }
        }
    }
}

fn parse_frame(frame: &Bytes) -> Vs2Event {
    let payload_len = frame[1] as usize;
    let addr = Address::from(frame[4]) << 8 | Address::from(frame[5]);
    let payload = frame.slice(7..payload_len + 2);

    let actual = frame[payload_len + 2];
    let expected = checksum(frame);
    if actual != expected {
        return Vs2Event::ChecksumMismatch {
            addr,
            payload,
            expected,
            actual,
        };
    }

    let telegram = Vs2Telegram {
        msg_type: MsgType::new(frame[2]),
        seq: (frame[3] & 0xE0) >> 5,
        fct: FunctionCode::new(frame[3] & 0x1F),
        addr,
        block_len: frame[6],
        payload,
    };
    if matches!(telegram.msg_type, MsgType::Error) {
        Vs2Event::ErrorMessage(telegram)
    } else {
        Vs2Event::Telegram(telegram)
    }
}

impl Encoder<Vs2Frame> for Vs2Codec {
    type Error = io::Error;

    fn encode(&mut self, frame: Vs2Frame, buf: &mut BytesMut) -> io::Result<()> {
        if frame.data.len() > MAX_DATA_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "data block exceeds VS2 frame capacity",
            ));
        }
        let payload_len = MIN_PAYLOAD_LEN + frame.data.len() as u8;
        buf.reserve(payload_len as usize + 3);
        let start = buf.len();
        buf.put_u8(VS2_STX);
        buf.put_u8(payload_len);
        buf.put_u8(frame.protocol_id);
        // The 3-bit sequence number is suppressed on outgoing requests.
        buf.put_u8(frame.fct.value() & 0x1F);
        buf.put_u16(frame.addr);
        buf.put_u8(frame.block_len);
        buf.put_slice(&frame.data);
        let crc = checksum(&buf[start..]);
        buf.put_u8(crc);
        Ok(())
    }
}
