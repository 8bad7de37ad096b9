// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! VS1/KW framing.
//!
//! The older protocol generation has no response framing at all: after a
//! request the device simply emits `N` raw bytes, where `N` is known a
//! priori from the request. Requests are `[0xF7][AddrHi][AddrLo][Len]`
//! for reads and `[0xF4][AddrHi][AddrLo][Len][...Data]` for writes,
//! optionally preceded by STX `0x01` when the line has to be resynced.

use std::io;

use bytes::{BufMut as _, Bytes, BytesMut};
use smallvec::SmallVec;
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::Address;

use super::VS1_STX;

/// VS1 virtual read request byte.
pub(crate) const VS1_READ: u8 = 0xF7;

/// VS1 virtual write request byte.
pub(crate) const VS1_WRITE: u8 = 0xF4;

/// One outbound VS1 request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Vs1Frame {
    op: u8,
    addr: Address,
    len: u8,
    data: SmallVec<[u8; 16]>,
    /// Prefix the request with STX; required for the first request after
    /// a resync handshake.
    pub(crate) stx: bool,
}

impl Vs1Frame {
    pub(crate) fn read(addr: Address, len: u8) -> Self {
        Self {
            op: VS1_READ,
            addr,
            len,
            data: SmallVec::new(),
            stx: false,
        }
    }

    pub(crate) fn write(addr: Address, data: &[u8]) -> Self {
        Self {
            op: VS1_WRITE,
            addr,
            len: data.len() as u8,
            data: SmallVec::from_slice(data),
            stx: false,
        }
    }

    /// Number of response bytes the device will answer with.
    pub(crate) fn response_len(&self) -> usize {
        self.len as usize
    }
}

/// Stateless VS1 codec; the expected response length is supplied per
/// telegram via [`Vs1Codec::expect`].
#[derive(Debug, Default)]
pub(crate) struct Vs1Codec {
    expected: usize,
}

impl Vs1Codec {
    /// Arm the decoder for a response of exactly `len` bytes.
    pub(crate) fn expect(&mut self, len: usize) {
        self.expected = len;
    }
}

impl Decoder for Vs1Codec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
        if buf.len() < self.expected {
            return Ok(None);
        }
        Ok(Some(buf.split_to(self.expected).freeze()))
    }
}

impl Encoder<Vs1Frame> for Vs1Codec {
    type Error = io::Error;

    fn encode(&mut self, frame: Vs1Frame, buf: &mut BytesMut) -> io::Result<()> {
        buf.reserve(frame.data.len() + 5);
        if frame.stx {
            buf.put_u8(VS1_STX);
        }
        buf.put_u8(frame.op);
        buf.put_u16(frame.addr);
        buf.put_u8(frame.len);
        buf.put_slice(&frame.data);
        Ok(())
    }
}
