// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt::{self, Display};

use bytes::Bytes;

/// A datapoint address of the heating control unit.
///
/// Both protocol generations address datapoints with 16 bit, transmitted
/// big-endian on the wire.
pub type Address = u16;

/// Outcome classification of one request/response exchange on the bus.
///
/// The discriminants are the values used by the device-facing report
/// channels, so a `ReturnCode` can be rendered into a response string
/// without any further mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnCode {
    /// 0x01 - the exchange completed and the payload is valid.
    Success = 0x01,

    /// 0x03 - the device answered with an error message telegram.
    ErrorMessage = 0x03,

    /// 0x15 - the device rejected the request (VS2 NACK byte).
    Nack = 0x15,

    /// 0x20 - the first response byte was neither ACK nor NACK.
    UnknownFirstByte = 0x20,

    /// 0x41 - the telegram did not start with the expected STX byte.
    FrameStartError = 0x41,

    /// 0xAA - the OS-level handle failed; the link is no longer usable.
    HandleLost = 0xAA,

    /// 0xAB - no poll item was due this cycle pass (not an error).
    CycleSkipped = 0xAB,

    /// 0xFD - the announced payload length is impossible.
    LengthError = 0xFD,

    /// 0xFE - checksum mismatch over the received telegram.
    ChecksumError = 0xFE,

    /// 0xFF - no complete telegram within the receive timeout.
    Timeout = 0xFF,
}

impl ReturnCode {
    /// Gets the wire/report value of the current [`ReturnCode`].
    #[must_use]
    pub const fn value(self) -> u8 {
        self as u8
    }

    /// `true` for [`ReturnCode::Success`].
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// A clean exchange: the bus transaction itself worked, even if the
    /// device reported an application-level error message.
    #[must_use]
    pub const fn is_clean(self) -> bool {
        matches!(self, Self::Success | Self::ErrorMessage)
    }

    /// A hard protocol or transport error that feeds the communication
    /// error counter. Timeouts and skipped cycles do not count: transient
    /// silence is expected behavior of a busy device.
    #[must_use]
    pub const fn is_hard_error(self) -> bool {
        matches!(
            self,
            Self::Nack
                | Self::UnknownFirstByte
                | Self::FrameStartError
                | Self::HandleLost
                | Self::LengthError
                | Self::ChecksumError
        )
    }

    pub(crate) fn description(&self) -> &'static str {
        match *self {
            Self::Success => "success",
            Self::ErrorMessage => "ErrMsg",
            Self::Nack => "NACK",
            Self::UnknownFirstByte => "UnknB0_Err",
            Self::FrameStartError => "STX_Err",
            Self::HandleLost => "HandleLost",
            Self::CycleSkipped => "CycleSkipped",
            Self::LengthError => "PlLen_Err",
            Self::ChecksumError => "CRC_Err",
            Self::Timeout => "TimeOut",
        }
    }
}

impl Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// A VS2 function code (low 5 bits of the fourth frame byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// 0 - unused/placeholder.
    Undefined,

    /// 1 - read a virtual datapoint.
    VirtualRead,

    /// 2 - write a virtual datapoint.
    VirtualWrite,

    /// 3 - read physical memory.
    PhysicalRead,

    /// 4 - write physical memory.
    PhysicalWrite,

    /// 5 - read EEPROM.
    EepromRead,

    /// 6 - write EEPROM.
    EepromWrite,

    /// 7 - remote procedure call.
    RemoteProcedureCall,

    /// Any other 5-bit code.
    Custom(u8),
}

impl FunctionCode {
    /// Create a new [`FunctionCode`] from its 5-bit `value`.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        match value {
            0x00 => Self::Undefined,
            0x01 => Self::VirtualRead,
            0x02 => Self::VirtualWrite,
            0x03 => Self::PhysicalRead,
            0x04 => Self::PhysicalWrite,
            0x05 => Self::EepromRead,
            0x06 => Self::EepromWrite,
            0x07 => Self::RemoteProcedureCall,
            code => Self::Custom(code),
        }
    }

    /// Gets the [`u8`] value of the current [`FunctionCode`].
    #[must_use]
    pub const fn value(self) -> u8 {
        match self {
            Self::Undefined => 0x00,
            Self::VirtualRead => 0x01,
            Self::VirtualWrite => 0x02,
            Self::PhysicalRead => 0x03,
            Self::PhysicalWrite => 0x04,
            Self::EepromRead => 0x05,
            Self::EepromWrite => 0x06,
            Self::RemoteProcedureCall => 0x07,
            Self::Custom(code) => code,
        }
    }
}

impl Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Undefined => "undefined",
            Self::VirtualRead => "Virtual_READ",
            Self::VirtualWrite => "Virtual_WRITE",
            Self::PhysicalRead => "Physical_READ",
            Self::PhysicalWrite => "Physical_WRITE",
            Self::EepromRead => "EEPROM_READ",
            Self::EepromWrite => "EEPROM_WRITE",
            Self::RemoteProcedureCall => "Remote_Procedure_Call",
            Self::Custom(code) => return write!(f, "{code}"),
        };
        f.write_str(name)
    }
}

/// VS2 message type identifier (low nibble of the third frame byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    /// 0 - request from the master.
    Request,
    /// 1 - response from the device.
    Response,
    /// 2 - unacknowledged message.
    Unacknowledged,
    /// 3 - error message from the device.
    Error,
    /// Anything else.
    Custom(u8),
}

impl MsgType {
    /// Create a new [`MsgType`] from the low nibble of `value`.
    #[must_use]
    pub const fn new(value: u8) -> Self {
        match value & 0x0F {
            0x00 => Self::Request,
            0x01 => Self::Response,
            0x02 => Self::Unacknowledged,
            0x03 => Self::Error,
            nibble => Self::Custom(nibble),
        }
    }
}

/// The uniform result of receiving one telegram (or failing to).
///
/// Per-request protocol failures travel in-band as the [`ReturnCode`];
/// only link-fatal conditions are reported through the error channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Outcome of the exchange.
    pub retcode: ReturnCode,
    /// Datapoint address announced by the telegram; 0 when unavailable.
    pub addr: Address,
    /// Payload bytes. In raw mode this is every byte seen on the wire,
    /// whatever the parse outcome.
    pub data: Bytes,
}

impl Telegram {
    pub(crate) fn new(retcode: ReturnCode, addr: Address, data: Bytes) -> Self {
        Self {
            retcode,
            addr,
            data,
        }
    }

    /// A telegram carrying only an outcome, no payload.
    #[must_use]
    pub fn empty(retcode: ReturnCode) -> Self {
        Self::new(retcode, 0, Bytes::new())
    }

    /// Shorthand for a lost-handle outcome.
    pub(crate) fn handle_lost() -> Self {
        Self::empty(ReturnCode::HandleLost)
    }
}

/// One bus request, produced by the command-string parser or directly from
/// a poll item. Transient: one value per request/response cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Send raw bytes, collect everything until the line idles.
    FullRaw(Vec<u8>),

    /// Send raw bytes, receive one telegram in raw mode.
    Raw(Vec<u8>),

    /// Read a datapoint and decode it with the given value description.
    Read {
        addr: Address,
        len: u8,
        value: Option<crate::value::ValueSpec>,
    },

    /// Write an integer value, packed little-endian at the given length.
    Write { addr: Address, len: u8, value: i64 },

    /// Write raw payload bytes to a datapoint.
    WriteRaw { addr: Address, data: Vec<u8> },

    /// Arbitrary VS2 request by function code (not available under VS1).
    Rpc {
        fct: u8,
        addr: Address,
        len: u8,
        data: Vec<u8>,
        protocol_id: u8,
    },
}
