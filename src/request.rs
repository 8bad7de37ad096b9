// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-string grammar and request execution.
//!
//! External command sources and the poller feed the same machinery: a
//! semicolon-delimited command becomes a [`Request`], the request runs
//! against the protocol adapter, and the outcome is rendered into a
//! `"<retcode>;<addr>;<value>"` response string.

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::{
    codec::{hex_bytes, hex_string},
    config::FormatOptions,
    error::Error,
    frame::{Address, Request, ReturnCode},
    onewire::OneWireBank,
    proto::Protocol,
    value::{self, parse_int, ByteBitFilter, Format, Value, ValueSpec},
};

/// Out-of-band control commands recognized regardless of origin.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    /// `reset` / `resetrecent` - clear the publish de-duplication cache.
    ResetRecent,
    /// `forcepoll` - restart the poll cycle from item 0 immediately.
    ForcePoll,
    /// `reloadpoll` - reload the datapoint list at the cycle boundary.
    ReloadPoll,
    /// `exit` / `resettcp` - close the current command session.
    CloseSession,
    /// `flushcsv` - write buffered poll rows now.
    FlushCsv,
    /// `reini` / `reloadini` - reload adjustable configuration.
    ReloadConfig,
    /// `setpollcycle;<group>;<divisor>`.
    SetPollCycle { group: u32, divisor: i32 },
    /// `setpollinterval;<seconds>`.
    SetPollInterval { secs: f64 },
    /// `forcerefresh;<name>;<addr>` - poll one item next pass even if
    /// its cycle group would skip it.
    ForceRefresh { name: String, addr: Address },
}

/// A parsed command string.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Goes out on the bus.
    Bus(Request),
    /// Handled by the scheduler itself.
    Control(ControlCommand),
}

/// Command strings that cannot be parsed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command received: {0}")]
    Unknown(String),

    #[error("malformed {command} command: {detail}")]
    Malformed {
        command: &'static str,
        detail: String,
    },
}

fn malformed(command: &'static str, detail: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        command,
        detail: detail.into(),
    }
}

fn parse_addr(text: &str) -> Option<Address> {
    let value = parse_int(text)?;
    Address::try_from(value).ok()
}

fn parse_len(text: &str) -> Option<u8> {
    let value = parse_int(text)?;
    u8::try_from(value).ok()
}

/// `true` only for the literal string `true`, any case.
fn parse_bool(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("true")
}

/// Parses one command string per the external grammar.
pub fn parse_command(text: &str) -> Result<Command, ParseError> {
    let cleaned = text.trim().trim_matches(|c| c == '"' || c == '\'');
    let parts: Vec<&str> = cleaned.split(';').map(str::trim).collect();

    if parts.len() == 1 {
        return match parts[0].to_ascii_lowercase().as_str() {
            "reset" | "resetrecent" => Ok(Command::Control(ControlCommand::ResetRecent)),
            "forcepoll" => Ok(Command::Control(ControlCommand::ForcePoll)),
            "reloadpoll" => Ok(Command::Control(ControlCommand::ReloadPoll)),
            "exit" | "resettcp" => Ok(Command::Control(ControlCommand::CloseSession)),
            "flushcsv" => Ok(Command::Control(ControlCommand::FlushCsv)),
            "reini" | "reloadini" => Ok(Command::Control(ControlCommand::ReloadConfig)),
            raw => hex_bytes(raw)
                .map(|bytes| Command::Bus(Request::FullRaw(bytes)))
                .ok_or_else(|| ParseError::Unknown(parts[0].to_owned())),
        };
    }

    match parts[0].to_ascii_lowercase().as_str() {
        "raw" => {
            let bytes = hex_bytes(parts[1]).ok_or_else(|| malformed("raw", parts[1]))?;
            Ok(Command::Bus(Request::Raw(bytes)))
        }
        "read" | "r" => parse_read(&parts),
        "write" | "w" => {
            if parts.len() < 4 {
                return Err(malformed("write", "expected write;<addr>;<len>;<value>"));
            }
            let addr = parse_addr(parts[1]).ok_or_else(|| malformed("write", parts[1]))?;
            let len = parse_len(parts[2]).ok_or_else(|| malformed("write", parts[2]))?;
            let value = parse_int(parts[3])
                .and_then(|v| i64::try_from(v).ok())
                .ok_or_else(|| malformed("write", parts[3]))?;
            Ok(Command::Bus(Request::Write { addr, len, value }))
        }
        "writeraw" | "wraw" => {
            if parts.len() < 3 {
                return Err(malformed("writeraw", "expected writeraw;<addr>;<hex>"));
            }
            let addr = parse_addr(parts[1]).ok_or_else(|| malformed("writeraw", parts[1]))?;
            let data = hex_bytes(parts[2]).ok_or_else(|| malformed("writeraw", parts[2]))?;
            Ok(Command::Bus(Request::WriteRaw { addr, data }))
        }
        "request" | "req" => {
            if parts.len() < 4 {
                return Err(malformed(
                    "request",
                    "expected request;<fct>;<addr>;<len>[;<hex>[;<protid>]]",
                ));
            }
            let fct = parse_len(parts[1]).ok_or_else(|| malformed("request", parts[1]))?;
            let addr = parse_addr(parts[2]).ok_or_else(|| malformed("request", parts[2]))?;
            let len = parse_len(parts[3]).ok_or_else(|| malformed("request", parts[3]))?;
            let data = match parts.get(4) {
                Some(hex) if !hex.is_empty() => {
                    hex_bytes(hex).ok_or_else(|| malformed("request", *hex))?
                }
                _ => Vec::new(),
            };
            let protocol_id = match parts.get(5) {
                Some(p) if !p.is_empty() => {
                    parse_len(p).ok_or_else(|| malformed("request", *p))?
                }
                _ => 0x00,
            };
            Ok(Command::Bus(Request::Rpc {
                fct,
                addr,
                len,
                data,
                protocol_id,
            }))
        }
        "setpollcycle" => {
            if parts.len() < 3 {
                return Err(malformed(
                    "setpollcycle",
                    "expected setpollcycle;<group>;<divisor>",
                ));
            }
            let group = parse_int(parts[1])
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| malformed("setpollcycle", parts[1]))?;
            let divisor = parse_int(parts[2])
                .and_then(|v| i32::try_from(v).ok())
                .ok_or_else(|| malformed("setpollcycle", parts[2]))?;
            Ok(Command::Control(ControlCommand::SetPollCycle {
                group,
                divisor,
            }))
        }
        "setpollinterval" => {
            let secs: f64 = parts[1]
                .parse()
                .map_err(|_| malformed("setpollinterval", parts[1]))?;
            Ok(Command::Control(ControlCommand::SetPollInterval { secs }))
        }
        "forcerefresh" => {
            if parts.len() < 3 {
                return Err(malformed(
                    "forcerefresh",
                    "expected forcerefresh;<name>;<addr>",
                ));
            }
            let addr = parse_addr(parts[2]).ok_or_else(|| malformed("forcerefresh", parts[2]))?;
            Ok(Command::Control(ControlCommand::ForceRefresh {
                name: parts[1].to_owned(),
                addr,
            }))
        }
        other => Err(ParseError::Unknown(other.to_owned())),
    }
}

fn parse_read(parts: &[&str]) -> Result<Command, ParseError> {
    if parts.len() < 3 {
        return Err(malformed(
            "read",
            "expected read;<addr>;<len>[;<format>[;<signed>]]",
        ));
    }
    let addr = parse_addr(parts[1]).ok_or_else(|| malformed("read", parts[1]))?;
    let len = parse_len(parts[2]).ok_or_else(|| malformed("read", parts[2]))?;
    let value = match parts.get(3) {
        None => None,
        Some(descriptor) if descriptor.to_ascii_lowercase().starts_with("b:") => {
            let filter =
                ByteBitFilter::parse(descriptor).map_err(|e| malformed("read", e.to_string()))?;
            let format = parts
                .get(4)
                .map_or(Format::RawHex, |f| Format::parse(f));
            let signed = parts.get(5).is_some_and(|s| parse_bool(s));
            Some(ValueSpec {
                filter: Some(filter),
                format,
                signed,
            })
        }
        Some(descriptor) => {
            let format = Format::parse(descriptor);
            let signed = parts.get(4).is_some_and(|s| parse_bool(s));
            Some(ValueSpec {
                filter: None,
                format,
                signed,
            })
        }
    };
    Ok(Command::Bus(Request::Read { addr, len, value }))
}

/// `"<retcode>;<addr>;<value>"` with configuration-controlled number
/// formatting; hex addresses carry a `0x` prefix, return codes never do.
#[must_use]
pub fn response_string(
    retcode: ReturnCode,
    addr: Address,
    value: &str,
    opts: &FormatOptions,
) -> String {
    format!(
        "{};{};{}",
        opts.retcode.render(u32::from(retcode.value()), false),
        opts.addr.render(u32::from(addr), true),
        value
    )
}

/// Outcome of executing one bus request.
#[derive(Debug)]
pub struct Executed {
    /// Bus outcome; `None` when the request never reached the bus
    /// (encode/validation error, unsupported operation).
    pub retcode: Option<ReturnCode>,
    /// Raw payload of the exchange.
    pub data: Bytes,
    /// Decoded value for publish sinks, when the request produced one.
    pub value: Option<Value>,
    /// Response line for the originating channel.
    pub response: String,
}

impl Executed {
    fn local_error(message: String) -> Self {
        Self {
            retcode: None,
            data: Bytes::new(),
            value: None,
            response: message,
        }
    }
}

/// Executes one request end-to-end: send, receive, decode, render.
///
/// Per-request failures come back in-band inside [`Executed`]; this
/// function never propagates them as errors.
pub async fn execute(
    request: &Request,
    proto: &mut dyn Protocol,
    opts: &FormatOptions,
    fullraw: (Duration, Duration),
    onewire: Option<&mut OneWireBank>,
) -> Executed {
    match request {
        Request::FullRaw(frame) => {
            if let Err(err) = proto.send_raw(frame).await {
                log::error!("fullraw send failed: {err}");
                return Executed {
                    retcode: Some(ReturnCode::HandleLost),
                    data: Bytes::new(),
                    value: None,
                    response: String::new(),
                };
            }
            let telegram = proto.receive_fullraw(fullraw.0, fullraw.1, None).await;
            let hex = hex_string(&telegram.data, opts.hex_uppercase);
            Executed {
                retcode: Some(telegram.retcode),
                data: telegram.data,
                value: Some(Value::Text(hex.clone())),
                // A full-raw response is the bare hex data.
                response: hex,
            }
        }
        Request::Raw(frame) => {
            if let Err(err) = proto.send_raw(frame).await {
                log::error!("raw send failed: {err}");
                return Executed {
                    retcode: Some(ReturnCode::HandleLost),
                    data: Bytes::new(),
                    value: None,
                    response: format!("{};", ReturnCode::HandleLost.value()),
                };
            }
            let telegram = proto.receive_telegram(true, true, None).await;
            let hex = hex_string(&telegram.data, opts.hex_uppercase);
            Executed {
                retcode: Some(telegram.retcode),
                response: format!("{};{hex}", telegram.retcode.value()),
                value: Some(Value::Text(hex)),
                data: telegram.data,
            }
        }
        Request::Read { addr, len, value } => {
            // A configured 1-Wire sensor shadows the bus address.
            if let Some(bank) = onewire {
                if let Some((retcode, sensor_value)) = bank.read(*addr) {
                    let rendered = sensor_value.to_string();
                    return Executed {
                        retcode: Some(retcode),
                        data: Bytes::new(),
                        value: Some(sensor_value),
                        response: response_string(retcode, *addr, &rendered, opts),
                    };
                }
            }
            let telegram = proto.read_datapoint(*addr, *len).await;
            let rendered;
            let mut decoded = None;
            if telegram.retcode.is_success() {
                let spec = value.clone().unwrap_or_else(ValueSpec::raw);
                let val = value::decode(&telegram.data, &spec, opts);
                rendered = val.to_string();
                decoded = Some(val);
            } else if !telegram.data.is_empty() {
                // Probably an error message payload.
                rendered = hex_string(&telegram.data, opts.hex_uppercase);
            } else {
                rendered = "?".to_owned();
            }
            Executed {
                retcode: Some(telegram.retcode),
                response: response_string(telegram.retcode, telegram.addr, &rendered, opts),
                data: telegram.data,
                value: decoded,
            }
        }
        Request::Write { addr, len, value } => {
            if *len == 0 || *len > 8 {
                return Executed::local_error(format!("Error: invalid write length {len}"));
            }
            let bits = u32::from(*len) * 8;
            let fits = if bits >= 64 {
                true
            } else if *value < 0 {
                *value >= -(1i64 << (bits - 1))
            } else {
                (*value as u64) < 1u64 << bits
            };
            if !fits {
                return Executed::local_error(format!(
                    "Error: value {value} does not fit a {len}-byte write"
                ));
            }
            let bytes = value.to_le_bytes()[..*len as usize].to_vec();
            let telegram = proto.write_datapoint(*addr, &bytes).await;
            let rendered = if telegram.retcode.is_success() {
                value.to_string()
            } else if !telegram.data.is_empty() {
                hex_string(&telegram.data, opts.hex_uppercase)
            } else {
                "?".to_owned()
            };
            Executed {
                retcode: Some(telegram.retcode),
                response: response_string(telegram.retcode, *addr, &rendered, opts),
                data: telegram.data,
                value: None,
            }
        }
        Request::WriteRaw { addr, data } => {
            let telegram = proto.write_datapoint(*addr, data).await;
            let rendered = if telegram.retcode.is_success() {
                hex_string(data, opts.hex_uppercase)
            } else if !telegram.data.is_empty() {
                hex_string(&telegram.data, opts.hex_uppercase)
            } else {
                "?".to_owned()
            };
            Executed {
                retcode: Some(telegram.retcode),
                response: response_string(telegram.retcode, *addr, &rendered, opts),
                data: telegram.data,
                value: None,
            }
        }
        Request::Rpc {
            fct,
            addr,
            len,
            data,
            protocol_id,
        } => match proto.rpc(*fct, *addr, *len, data, *protocol_id).await {
            Ok(telegram) => {
                let rendered = if telegram.data.is_empty() {
                    "none".to_owned()
                } else {
                    hex_string(&telegram.data, opts.hex_uppercase)
                };
                Executed {
                    retcode: Some(telegram.retcode),
                    response: response_string(telegram.retcode, telegram.addr, &rendered, opts),
                    data: telegram.data,
                    value: None,
                }
            }
            Err(Error::Unsupported(what)) => {
                Executed::local_error(format!("Error: {what} is not supported, use raw instead"))
            }
            Err(err) => Executed::local_error(format!("Error: {err}")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_raw() {
        let cmd = parse_command("4105000100F80806").unwrap();
        assert_eq!(
            cmd,
            Command::Bus(Request::FullRaw(vec![
                0x41, 0x05, 0x00, 0x01, 0x00, 0xF8, 0x08, 0x06
            ]))
        );
    }

    #[test]
    fn parses_read_variants() {
        assert_eq!(
            parse_command("read;0x0804;2;0.1;False").unwrap(),
            Command::Bus(Request::Read {
                addr: 0x0804,
                len: 2,
                value: Some(ValueSpec::scaled(0.1, false)),
            })
        );
        // Alias, decimal address, no format.
        assert_eq!(
            parse_command("r;2052;2").unwrap(),
            Command::Bus(Request::Read {
                addr: 2052,
                len: 2,
                value: None,
            })
        );
        // Bit filter with scale and signedness.
        let Command::Bus(Request::Read { value, .. }) =
            parse_command("r;0x2500;22;b:0:1;0.1;true").unwrap()
        else {
            panic!("expected read");
        };
        let spec = value.unwrap();
        assert!(spec.filter.is_some());
        assert_eq!(spec.format, Format::Scale(0.1));
        assert!(spec.signed);
    }

    #[test]
    fn parses_write_and_writeraw() {
        assert_eq!(
            parse_command("write;0x6300;1;48").unwrap(),
            Command::Bus(Request::Write {
                addr: 0x6300,
                len: 1,
                value: 48,
            })
        );
        assert_eq!(
            parse_command("wraw;0x27d4;2A").unwrap(),
            Command::Bus(Request::WriteRaw {
                addr: 0x27D4,
                data: vec![0x2A],
            })
        );
    }

    #[test]
    fn parses_rpc_request() {
        assert_eq!(
            parse_command("req;7;0xb800;2;02 00;0").unwrap(),
            Command::Bus(Request::Rpc {
                fct: 7,
                addr: 0xB800,
                len: 2,
                data: vec![0x02, 0x00],
                protocol_id: 0,
            })
        );
    }

    #[test]
    fn parses_control_commands() {
        assert_eq!(
            parse_command("forcepoll").unwrap(),
            Command::Control(ControlCommand::ForcePoll)
        );
        assert_eq!(
            parse_command("setpollcycle;3;12").unwrap(),
            Command::Control(ControlCommand::SetPollCycle {
                group: 3,
                divisor: 12,
            })
        );
        assert_eq!(
            parse_command("setpollinterval;15").unwrap(),
            Command::Control(ControlCommand::SetPollInterval { secs: 15.0 })
        );
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        assert!(matches!(
            parse_command("frobnicate"),
            Err(ParseError::Unknown(_))
        ));
        assert!(matches!(
            parse_command("read;zz;2"),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            parse_command("write;0x6300;1"),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn response_string_formatting() {
        let opts = FormatOptions::default();
        assert_eq!(
            response_string(ReturnCode::Success, 0x0104, "True", &opts),
            "1;0x0104;True"
        );
        // Decimal address format, hex return code.
        let opts = FormatOptions {
            retcode: crate::config::NumberFormat::Hex {
                uppercase: false,
                width: 2,
            },
            addr: crate::config::NumberFormat::Decimal,
            ..FormatOptions::default()
        };
        assert_eq!(
            response_string(ReturnCode::Timeout, 0x0104, "?", &opts),
            "ff;260;?"
        );
    }
}
