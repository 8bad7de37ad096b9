// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Locally attached 1-Wire sensors.
//!
//! A configured bus address can map to a local sensor instead of an
//! Optolink read; the scheduler routes such reads here transparently.
//! Scalar sensors get a plausibility filter that holds the previous
//! value against implausible jumps for a bounded number of readings.

use std::collections::HashMap;

use crate::{
    config::W1SensorConfig,
    frame::{Address, ReturnCode},
    value::Value,
};

/// Reads one sensor; synchronous by contract (a file read on the
/// 1-Wire bus).
pub trait OneWireSource: Send {
    /// Returns the outcome and the measured value.
    fn read(&mut self, device: &str, kind: &str) -> (ReturnCode, f64);
}

/// Plausibility filter for scalar sensor values.
///
/// A change larger than `max_change` is ignored up to `max_ignore`
/// consecutive times (the previous value is reported instead); after
/// that the new value is accepted as the new baseline.
#[derive(Debug, Clone)]
pub struct CheckedSensor {
    value: f64,
    max_change: f64,
    max_ignore: u32,
    ignored: u32,
    inited: bool,
}

impl CheckedSensor {
    /// `max_change <= 0` disables the check (non-scalar sensors).
    #[must_use]
    pub fn new(max_change: f64, max_ignore: u32) -> Self {
        Self {
            value: 0.0,
            max_change,
            max_ignore,
            ignored: 0,
            inited: false,
        }
    }

    /// Feeds a new reading and returns the accepted value.
    pub fn checked(&mut self, new_value: f64) -> f64 {
        if self.max_change <= 0.0 {
            return new_value;
        }
        if !self.inited {
            self.value = new_value;
            self.inited = true;
        } else if (self.value - new_value).abs() <= self.max_change {
            self.value = new_value;
            self.ignored = 0;
        } else if self.ignored <= self.max_ignore {
            // Keep and report the recent value.
            self.ignored += 1;
        } else {
            self.value = new_value;
        }
        self.value
    }
}

struct SensorSlot {
    device: String,
    kind: String,
    check: CheckedSensor,
}

/// The configured sensor set with per-sensor plausibility state.
pub struct OneWireBank {
    source: Box<dyn OneWireSource>,
    sensors: HashMap<Address, SensorSlot>,
}

impl OneWireBank {
    #[must_use]
    pub fn new(source: Box<dyn OneWireSource>, configs: &[W1SensorConfig]) -> Self {
        let sensors = configs
            .iter()
            .map(|cfg| {
                let check = if cfg.kind.eq_ignore_ascii_case("ds18b20") {
                    // Scalar temperature: bounded-change check.
                    CheckedSensor::new(10.0, 3)
                } else {
                    CheckedSensor::new(-1.0, 0)
                };
                (
                    cfg.addr,
                    SensorSlot {
                        device: cfg.device.clone(),
                        kind: cfg.kind.clone(),
                        check,
                    },
                )
            })
            .collect();
        Self { source, sensors }
    }

    /// Whether `addr` maps to a local sensor.
    #[must_use]
    pub fn contains(&self, addr: Address) -> bool {
        self.sensors.contains_key(&addr)
    }

    /// Reads and plausibility-checks the sensor behind `addr`.
    pub fn read(&mut self, addr: Address) -> Option<(ReturnCode, Value)> {
        let slot = self.sensors.get_mut(&addr)?;
        let (retcode, raw) = self.source.read(&slot.device, &slot.kind);
        let value = if retcode.is_success() {
            slot.check.checked(raw)
        } else {
            raw
        };
        Some((retcode, Value::Float(value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_sensor_holds_against_jumps() {
        let mut sensor = CheckedSensor::new(10.0, 3);
        assert_eq!(sensor.checked(20.0), 20.0);
        assert_eq!(sensor.checked(22.0), 22.0);
        // Implausible jump: previous value is held...
        assert_eq!(sensor.checked(85.0), 22.0);
        assert_eq!(sensor.checked(85.0), 22.0);
        assert_eq!(sensor.checked(85.0), 22.0);
        assert_eq!(sensor.checked(85.0), 22.0);
        // ...until the ignore budget runs out.
        assert_eq!(sensor.checked(85.0), 85.0);
    }

    #[test]
    fn unchecked_sensor_passes_everything() {
        let mut sensor = CheckedSensor::new(-1.0, 0);
        assert_eq!(sensor.checked(1.0), 1.0);
        assert_eq!(sensor.checked(500.0), 500.0);
    }

    struct FixedSource(f64);

    impl OneWireSource for FixedSource {
        fn read(&mut self, _device: &str, _kind: &str) -> (ReturnCode, f64) {
            (ReturnCode::Success, self.0)
        }
    }

    #[test]
    fn bank_routes_by_address() {
        let configs = vec![W1SensorConfig {
            addr: 0xF100,
            device: "28-0301a2797e62".to_owned(),
            kind: "ds18b20".to_owned(),
        }];
        let mut bank = OneWireBank::new(Box::new(FixedSource(21.5)), &configs);
        assert!(bank.contains(0xF100));
        assert!(!bank.contains(0x0800));
        let (retcode, value) = bank.read(0xF100).unwrap();
        assert_eq!(retcode, ReturnCode::Success);
        assert_eq!(value, Value::Float(21.5));
    }
}
