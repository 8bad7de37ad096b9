// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Datapoint value codec.
//!
//! Raw payload bytes become typed values through a per-datapoint format
//! descriptor: either a numeric scale factor or a symbolic tag, with an
//! optional byte/bit filter applied first to extract one logical value
//! out of a multi-value physical read.

use std::fmt::{self, Display};

use byteorder::{ByteOrder as _, LittleEndian};
use chrono::{Local, TimeZone as _};
use thiserror::Error;

use crate::{codec::hex_string, config::FormatOptions};

/// Weekday labels used by the device timestamp formats.
const WEEKDAYS: [&str; 7] = ["Mo", "Di", "Mi", "Do", "Fr", "Sa", "So"];

/// A decoded datapoint value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Unscaled integer (scale factor 1).
    Int(i64),
    /// Scaled number, rounded to the configured number of decimals.
    Float(f64),
    /// Everything rendered as text: booleans, timestamps, hex fallback.
    Text(String),
}

impl Value {
    /// The numeric interpretation, if any.
    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Text(_) => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            // A whole-number float still reads as a float ("10.0"), so
            // scaled and unscaled datapoints stay distinguishable.
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Failures of the write/encode path. These are rejected locally and
/// never reach the bus.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    /// Malformed byte/bit filter descriptor.
    #[error("invalid bit filter descriptor: {0}")]
    Filter(String),

    /// The value string cannot be parsed under the given format.
    #[error("cannot parse {value:?} as {expected}")]
    Parse {
        value: String,
        expected: &'static str,
    },

    /// The scaled value does not fit the declared byte length.
    #[error("value {0} out of range for {1}-byte field")]
    Range(i128, u8),

    /// The format has no write encoding.
    #[error("format {0:?} is not writable")]
    Unsupported(String),
}

/// Sub-field extraction rule: `b:startByte[:endByte[:hexMask[:endian]]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteBitFilter {
    start: usize,
    end: usize,
    mask: Option<Vec<u8>>,
    big_endian: bool,
}

impl ByteBitFilter {
    /// Byte count of the filtered slice.
    #[must_use]
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Parses a `b:...` descriptor.
    pub fn parse(descriptor: &str) -> Result<Self, ValueError> {
        let bad = || ValueError::Filter(descriptor.to_owned());
        let parts: Vec<&str> = descriptor.split(':').collect();
        if parts.len() < 2 || !parts[0].eq_ignore_ascii_case("b") {
            return Err(bad());
        }
        let start: usize = parts[1].trim().parse().map_err(|_| bad())?;
        let end = match parts.get(2).map(|s| s.trim()) {
            Some(s) if !s.is_empty() => s.parse().map_err(|_| bad())?,
            _ => start,
        };
        if end < start {
            return Err(bad());
        }
        let width = end - start + 1;
        let mask = match parts.get(3).map(|s| s.trim()) {
            Some(s) if !s.is_empty() => {
                let value = parse_int(s).ok_or_else(bad)?;
                if value < 0 {
                    return Err(bad());
                }
                // Mask bytes line up big-endian with the filtered slice.
                let be = (value as u128).to_be_bytes();
                if be[..16 - width.min(16)].iter().any(|b| *b != 0) {
                    return Err(bad());
                }
                Some(be[16 - width.min(16)..].to_vec())
            }
            _ => None,
        };
        let big_endian = matches!(parts.get(4), Some(s) if s.trim().eq_ignore_ascii_case("big"));
        Ok(Self {
            start,
            end,
            mask,
            big_endian,
        })
    }

    /// Slices, masks and byte-orders the raw read so the result is ready
    /// for the regular little-endian decode step.
    #[must_use]
    pub fn apply(&self, data: &[u8]) -> Vec<u8> {
        if self.start >= data.len() {
            return Vec::new();
        }
        let end = self.end.min(data.len() - 1);
        let mut out = data[self.start..=end].to_vec();
        if let Some(mask) = &self.mask {
            for (byte, m) in out.iter_mut().zip(mask) {
                *byte &= m;
            }
        }
        if self.big_endian {
            out.reverse();
        }
        out
    }
}

/// A parsed format descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Format {
    /// Numeric scale factor; 1 keeps the raw integer.
    Scale(f64),
    /// 8-byte device timestamp, weekday 1-indexed.
    VDateTime,
    /// 8-byte device timestamp, weekday 0-indexed (calendar events).
    VCalDateTime,
    /// POSIX timestamp; seconds up to 4 bytes, milliseconds above.
    UnixTime,
    Utf8,
    Utf16,
    Bool,
    BoolInv,
    OnOff,
    OffOn,
    /// Zero-padded binary string, 8 digits per byte.
    Bin,
    /// `f:<spec>` - apply a numeric format spec to the raw integer.
    Custom(String),
    /// Fallback: hex string of the raw bytes, never lossy.
    RawHex,
}

impl Format {
    /// Parses a format descriptor. Anything unrecognized falls back to
    /// [`Format::RawHex`], which is always a valid rendering.
    #[must_use]
    pub fn parse(descriptor: &str) -> Self {
        let trimmed = descriptor.trim();
        if let Some(scale) = parse_number(trimmed) {
            return Self::Scale(scale);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "vdatetime" => Self::VDateTime,
            "vcaldatetime" => Self::VCalDateTime,
            "unixtime" => Self::UnixTime,
            "utf8" => Self::Utf8,
            "utf16" => Self::Utf16,
            "bool" => Self::Bool,
            "boolinv" => Self::BoolInv,
            "onoff" => Self::OnOff,
            "offon" => Self::OffOn,
            "bin" => Self::Bin,
            _ => {
                if let Some(spec) = trimmed.strip_prefix("f:") {
                    Self::Custom(spec.to_owned())
                } else {
                    Self::RawHex
                }
            }
        }
    }
}

/// Complete value description of a datapoint read or write.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueSpec {
    /// Optional sub-field extraction, applied before decoding.
    pub filter: Option<ByteBitFilter>,
    pub format: Format,
    /// Signed interpretation of the raw integer.
    pub signed: bool,
}

impl ValueSpec {
    /// A plain scaled numeric spec.
    #[must_use]
    pub fn scaled(scale: f64, signed: bool) -> Self {
        Self {
            filter: None,
            format: Format::Scale(scale),
            signed,
        }
    }

    /// The hex fallback spec used when a command names no format.
    #[must_use]
    pub fn raw() -> Self {
        Self {
            filter: None,
            format: Format::RawHex,
            signed: false,
        }
    }
}

/// Decodes raw payload bytes into a [`Value`].
#[must_use]
pub fn decode(data: &[u8], spec: &ValueSpec, opts: &FormatOptions) -> Value {
    let filtered;
    let data = match &spec.filter {
        Some(filter) => {
            filtered = filter.apply(data);
            filtered.as_slice()
        }
        None => data,
    };
    match &spec.format {
        Format::Scale(scale) => {
            let raw = int_from_le(data, spec.signed);
            if *scale == 1.0 {
                Value::Int(raw as i64)
            } else {
                Value::Float(round_to(raw as f64 * scale, opts.max_decimals))
            }
        }
        Format::VDateTime => Value::Text(vdatetime_string(data, 1)),
        Format::VCalDateTime => Value::Text(vdatetime_string(data, 0)),
        Format::UnixTime => Value::Text(unixtime_string(data)),
        Format::Utf8 => Value::Text(String::from_utf8_lossy(data).replace('\0', "")),
        Format::Utf16 => {
            let units: Vec<u16> = data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            Value::Text(String::from_utf16_lossy(&units).replace('\0', ""))
        }
        Format::Bool => Value::Text(python_bool(int_from_le(data, false) != 0)),
        Format::BoolInv => Value::Text(python_bool(int_from_le(data, false) == 0)),
        Format::OnOff => Value::Text(on_off(int_from_le(data, false) != 0)),
        Format::OffOn => Value::Text(on_off(int_from_le(data, false) == 0)),
        Format::Bin => {
            let raw = int_from_le(data, false) as u128;
            Value::Text(format!("{raw:0width$b}", width = data.len() * 8))
        }
        Format::Custom(fspec) => Value::Text(custom_format(int_from_le(data, spec.signed), fspec)),
        Format::RawHex => Value::Text(hex_string(data, opts.hex_uppercase)),
    }
}

/// Encodes a value string for a write request.
///
/// Only boolean tags and numeric scales are writable; everything else is
/// rejected before it can reach the bus.
pub fn encode(value: &str, len: u8, spec: &ValueSpec) -> Result<Vec<u8>, ValueError> {
    let token = value.trim();
    match &spec.format {
        Format::Bool | Format::OnOff => {
            let on = parse_bool_token(token)?;
            pack_le(i128::from(on), len, false)
        }
        Format::BoolInv | Format::OffOn => {
            let on = parse_bool_token(token)?;
            pack_le(i128::from(1 - on), len, false)
        }
        Format::Scale(scale) => {
            let number = parse_number(token).ok_or_else(|| ValueError::Parse {
                value: token.to_owned(),
                expected: "number",
            })?;
            let raw = (number / scale).round();
            if !raw.is_finite() || raw.abs() >= 1e38 {
                return Err(ValueError::Parse {
                    value: token.to_owned(),
                    expected: "finite number",
                });
            }
            pack_le(raw as i128, len, spec.signed)
        }
        other => Err(ValueError::Unsupported(format!("{other:?}"))),
    }
}

/// Little-endian integer from raw payload bytes.
fn int_from_le(data: &[u8], signed: bool) -> i128 {
    if data.is_empty() {
        return 0;
    }
    let take = data.len().min(16);
    if signed {
        LittleEndian::read_int128(&data[..take], take)
    } else {
        i128::try_from(LittleEndian::read_uint128(&data[..take], take)).unwrap_or(i128::MAX)
    }
}

/// Packs an integer little-endian into exactly `len` bytes, range-checked.
fn pack_le(value: i128, len: u8, signed: bool) -> Result<Vec<u8>, ValueError> {
    if len == 0 || len > 16 {
        return Err(ValueError::Range(value, len));
    }
    let bits = u32::from(len) * 8;
    let in_range = if signed {
        bits >= 128 || (value >= -(1i128 << (bits - 1)) && value < 1i128 << (bits - 1))
    } else {
        value >= 0 && (bits >= 127 || value < 1i128 << bits)
    };
    if !in_range {
        return Err(ValueError::Range(value, len));
    }
    let mut out = vec![0u8; len as usize];
    if signed {
        LittleEndian::write_int128(&mut out, value, len as usize);
    } else {
        LittleEndian::write_uint128(&mut out, value as u128, len as usize);
    }
    Ok(out)
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn python_bool(value: bool) -> String {
    (if value { "True" } else { "False" }).to_owned()
}

fn on_off(on: bool) -> String {
    (if on { "ON" } else { "OFF" }).to_owned()
}

fn parse_bool_token(token: &str) -> Result<u8, ValueError> {
    match token.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(1),
        "0" | "false" | "off" | "no" => Ok(0),
        _ => Err(ValueError::Parse {
            value: token.to_owned(),
            expected: "boolean",
        }),
    }
}

/// Parses decimal or `0x`-prefixed integers.
pub(crate) fn parse_int(text: &str) -> Option<i128> {
    let t = text.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()
    } else {
        t.parse().ok()
    }
}

/// Parses a number the way the command grammar does: integer (decimal or
/// hex) first, float second.
pub(crate) fn parse_number(text: &str) -> Option<f64> {
    if let Some(int) = parse_int(text) {
        return Some(int as f64);
    }
    let t = text.trim();
    // Reject alphabetic tags that f64::from_str would accept ("inf", "nan").
    if t.chars()
        .any(|c| c.is_ascii_alphabetic() && !matches!(c, 'e' | 'E'))
    {
        return None;
    }
    t.parse().ok()
}

/// `Wd dd.mm.yyyy hh:mm:ss` from the BCD-coded 8-byte device timestamp.
fn vdatetime_string(data: &[u8], weekday_offset: usize) -> String {
    if data.len() < 8 {
        return "(conversion failed)".to_owned();
    }
    let index = (data[4] as usize).wrapping_sub(weekday_offset);
    let Some(weekday) = WEEKDAYS.get(index) else {
        return "(conversion failed)".to_owned();
    };
    format!(
        "{} {:02x}.{:02x}.{:02x}{:02x} {:02x}:{:02x}:{:02x}",
        weekday, data[3], data[2], data[0], data[1], data[5], data[6], data[7]
    )
}

fn unixtime_string(data: &[u8]) -> String {
    let raw = int_from_le(data, false);
    let (secs, millis) = if data.len() <= 4 {
        (raw as i64, None)
    } else {
        ((raw / 1000) as i64, Some((raw % 1000) as u32))
    };
    let stamp = match Local.timestamp_opt(secs, 0).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => return "(conversion failed)".to_owned(),
    };
    match millis {
        Some(ms) => format!("{stamp}.{ms}"),
        None => stamp,
    }
}

/// Minimal printf-style integer formatting: `[0][width][d|x|X|b|o]`.
fn custom_format(value: i128, spec: &str) -> String {
    let spec = spec.trim();
    let (body, kind) = match spec.chars().last() {
        Some(c @ ('d' | 'x' | 'X' | 'b' | 'o')) => (&spec[..spec.len() - 1], c),
        _ => (spec, 'd'),
    };
    let zero_pad = body.starts_with('0');
    let width: usize = body.trim_start_matches('0').parse().unwrap_or(0);
    let digits = match kind {
        'x' => format!("{value:x}"),
        'X' => format!("{value:X}"),
        'b' => format!("{value:b}"),
        'o' => format!("{value:o}"),
        _ => format!("{value}"),
    };
    if digits.len() >= width {
        digits
    } else if zero_pad {
        let pad = "0".repeat(width - digits.len());
        if let Some(rest) = digits.strip_prefix('-') {
            format!("-{pad}{rest}")
        } else {
            format!("{pad}{digits}")
        }
    } else {
        format!("{}{digits}", " ".repeat(width - digits.len()))
    }
}
