// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Adjustable bridge configuration.
//!
//! All knobs carry the defaults of the reference deployment; a TOML file
//! overrides individual fields. Serial line parameters (4800 8E2) are
//! *not* configurable - they are fixed properties of the device.

use std::{collections::BTreeMap, time::Duration};

use serde::Deserialize;

use crate::frame::Address;

/// Which protocol generation to speak on the Optolink line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// VS2/300 - framed telegrams with checksums (current devices).
    #[default]
    Vs2,
    /// VS1/KW - unframed fixed-length responses (legacy devices).
    Vs1,
}

/// Rendering rule for numbers in response strings, parsed from the
/// Python-style format specs the original configuration used
/// (`"d"`, `"x"`, `"04X"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberFormat {
    Decimal,
    Hex { uppercase: bool, width: usize },
}

impl NumberFormat {
    /// Parses a format spec; anything without an `x` is decimal.
    #[must_use]
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        if let Some(pos) = spec.find(['x', 'X']) {
            Self::Hex {
                uppercase: spec.contains('X'),
                width: spec[..pos].parse().unwrap_or(0),
            }
        } else {
            Self::Decimal
        }
    }

    /// Renders a value; hex gets a `0x` prefix only when `prefixed`.
    #[must_use]
    pub fn render(self, value: u32, prefixed: bool) -> String {
        match self {
            Self::Decimal => value.to_string(),
            Self::Hex { uppercase, width } => {
                let digits = if uppercase {
                    format!("{value:0width$X}")
                } else {
                    format!("{value:0width$x}")
                };
                if prefixed {
                    format!("0x{digits}")
                } else {
                    digits
                }
            }
        }
    }
}

/// The formatting knobs the value codec and response builder need.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Max decimal places of scaled values.
    pub max_decimals: u32,
    /// Uppercase hex in raw data renderings.
    pub hex_uppercase: bool,
    /// Return code rendering in response strings (never 0x-prefixed).
    pub retcode: NumberFormat,
    /// Address rendering in response strings (0x-prefixed when hex).
    pub addr: NumberFormat,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            max_decimals: 4,
            hex_uppercase: false,
            retcode: NumberFormat::Decimal,
            addr: NumberFormat::Hex {
                uppercase: false,
                width: 4,
            },
        }
    }
}

/// A locally attached 1-Wire sensor standing in for a bus address.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct W1SensorConfig {
    /// Datapoint address the sensor replaces.
    pub addr: Address,
    /// Sensor directory / serial number under the 1-Wire bus.
    pub device: String,
    /// Slave type, e.g. `"ds18b20"`.
    pub kind: String,
}

/// CSV row sink settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ViessdataConfig {
    /// Write a CSV row per completed poll cycle.
    pub enabled: bool,
    /// Output directory.
    pub path: String,
    /// Rows buffered before a write-out.
    pub buffer_rows: usize,
    /// Decimal separator in rendered numbers.
    pub decimal_separator: String,
}

impl Default for ViessdataConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: String::new(),
            buffer_rows: 60,
            decimal_separator: ",".to_owned(),
        }
    }
}

/// All adjustable settings of the bridge.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Protocol generation on the Optolink line.
    pub protocol: ProtocolKind,

    /// Serial device of the Optolink head (mandatory for real runs).
    pub port_optolink: Option<String>,
    /// Serial device of the Vitoconnect, if one is attached.
    pub port_vitoconnect: Option<String>,
    /// Seconds to wait for the Vitoconnect to show a valid handshake.
    pub vs2_timeout_secs: f64,

    /// Idle time that ends a full-raw reception.
    pub fullraw_eot_secs: f64,
    /// Overall full-raw timeout.
    pub fullraw_timeout_secs: f64,
    /// Pause after each bus transaction.
    pub olbreath_secs: f64,

    /// Seconds between poll cycles; 0 = continuous, negative = disabled.
    pub poll_interval_secs: f64,

    /// Max decimal places of scaled values.
    pub max_decimals: u32,
    /// Hex rendering of raw data (`"02x"` or `"02X"`).
    pub data_hex_format: String,
    /// Address rendering in responses (`"d"`, `"x"`, `"04x"`, ...).
    pub resp_addr_format: String,
    /// Return code rendering in responses.
    pub retcode_format: String,

    /// Restart budget of the recovery supervisor.
    pub max_restarts: u32,
    /// Delay between restart attempts.
    pub restart_delay_secs: f64,
    /// Passthrough-detect failures before running without the device.
    pub max_vicon_tries: u32,
    /// Communication error level that trips a restart.
    pub max_comm_errors: u32,
    /// Minutes of clean operation that reset the retry counters.
    pub retry_counters_reset_mins: u64,

    /// Read the energy statistics RPC every Nth cycle; 0 = disabled.
    pub energy_statistics_every: u32,

    /// Locally attached 1-Wire sensors, keyed by bus address.
    pub w1_sensors: Vec<W1SensorConfig>,

    /// CSV sink settings.
    pub viessdata: ViessdataConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolKind::Vs2,
            port_optolink: None,
            port_vitoconnect: None,
            vs2_timeout_secs: 120.0,
            fullraw_eot_secs: 0.05,
            fullraw_timeout_secs: 2.0,
            olbreath_secs: 0.05,
            poll_interval_secs: 30.0,
            max_decimals: 4,
            data_hex_format: "02x".to_owned(),
            resp_addr_format: "04x".to_owned(),
            retcode_format: "d".to_owned(),
            max_restarts: 5,
            restart_delay_secs: 10.0,
            max_vicon_tries: 3,
            max_comm_errors: 10,
            retry_counters_reset_mins: 30,
            energy_statistics_every: 0,
            w1_sensors: Vec::new(),
            viessdata: ViessdataConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Loads a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Pause applied after each bus transaction.
    #[must_use]
    pub fn olbreath(&self) -> Duration {
        Duration::from_secs_f64(self.olbreath_secs.max(0.0))
    }

    #[must_use]
    pub fn fullraw_eot(&self) -> Duration {
        Duration::from_secs_f64(self.fullraw_eot_secs.max(0.0))
    }

    #[must_use]
    pub fn fullraw_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.fullraw_timeout_secs.max(0.0))
    }

    #[must_use]
    pub fn vs2_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.vs2_timeout_secs.max(0.0))
    }

    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs_f64(self.restart_delay_secs.max(0.0))
    }

    #[must_use]
    pub fn retry_counters_reset(&self) -> Duration {
        Duration::from_secs(self.retry_counters_reset_mins * 60)
    }

    /// The polling regime derived from the configured interval.
    #[must_use]
    pub fn poll_mode(&self) -> PollMode {
        PollMode::from_secs(self.poll_interval_secs)
    }

    /// Formatting knobs derived from the format spec strings.
    #[must_use]
    pub fn format_options(&self) -> FormatOptions {
        FormatOptions {
            max_decimals: self.max_decimals,
            hex_uppercase: self.data_hex_format.contains('X'),
            retcode: NumberFormat::parse(&self.retcode_format),
            addr: NumberFormat::parse(&self.resp_addr_format),
        }
    }

    /// Sensor lookup by replaced bus address.
    #[must_use]
    pub fn w1_sensor(&self, addr: Address) -> Option<&W1SensorConfig> {
        self.w1_sensors.iter().find(|s| s.addr == addr)
    }

    /// Address → sensor map, for contexts that need the full table.
    #[must_use]
    pub fn w1_table(&self) -> BTreeMap<Address, &W1SensorConfig> {
        self.w1_sensors.iter().map(|s| (s.addr, s)).collect()
    }
}

/// The polling regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// No polling at all.
    Disabled,
    /// Back-to-back cycles without waiting for a timer.
    Continuous,
    /// A new cycle starts this long after the previous one began.
    Interval(Duration),
}

impl PollMode {
    /// Same convention as the configuration: 0 continuous, negative
    /// disabled.
    #[must_use]
    pub fn from_secs(secs: f64) -> Self {
        if secs < 0.0 {
            Self::Disabled
        } else if secs == 0.0 {
            Self::Continuous
        } else {
            Self::Interval(Duration::from_secs_f64(secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.max_restarts, 5);
        assert_eq!(cfg.max_comm_errors, 10);
        assert_eq!(cfg.olbreath(), Duration::from_millis(50));
        assert_eq!(
            cfg.poll_mode(),
            PollMode::Interval(Duration::from_secs(30))
        );
    }

    #[test]
    fn number_format_parsing() {
        assert_eq!(NumberFormat::parse("d"), NumberFormat::Decimal);
        assert_eq!(
            NumberFormat::parse("x"),
            NumberFormat::Hex {
                uppercase: false,
                width: 0
            }
        );
        assert_eq!(
            NumberFormat::parse("04X"),
            NumberFormat::Hex {
                uppercase: true,
                width: 4
            }
        );
    }

    #[test]
    fn number_format_rendering() {
        assert_eq!(NumberFormat::Decimal.render(1, false), "1");
        let hex = NumberFormat::Hex {
            uppercase: false,
            width: 4,
        };
        assert_eq!(hex.render(0x0104, true), "0x0104");
        assert_eq!(
            NumberFormat::Hex {
                uppercase: true,
                width: 2
            }
            .render(0xAB, false),
            "AB"
        );
    }

    #[test]
    fn toml_overrides() {
        let cfg = BridgeConfig::from_toml_str(
            r#"
            protocol = "vs1"
            port_optolink = "/dev/ttyUSB0"
            poll_interval_secs = 0.0
            max_restarts = 2

            [[w1_sensors]]
            addr = 0xF100
            device = "28-0301a2797e62"
            kind = "ds18b20"

            [viessdata]
            enabled = true
            buffer_rows = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.protocol, ProtocolKind::Vs1);
        assert_eq!(cfg.poll_mode(), PollMode::Continuous);
        assert_eq!(cfg.max_restarts, 2);
        assert!(cfg.w1_sensor(0xF100).is_some());
        assert!(cfg.viessdata.enabled);
        assert_eq!(cfg.viessdata.buffer_rows, 10);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.max_comm_errors, 10);
    }
}
