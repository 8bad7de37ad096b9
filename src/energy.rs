// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Daily energy statistics via remote procedure call.
//!
//! Some heat pump controls expose accumulated heating/water energy as an
//! RPC (function code 7, procedure 2) at `0xB800` instead of plain
//! datapoints. The response block carries four 16-bit counters at fixed
//! offsets, scaled by 0.1 kWh.

use chrono::{Datelike as _, Local};
use log::{debug, warn};

use crate::{
    config::FormatOptions,
    frame::ReturnCode,
    proto::Protocol,
    sink::PublishSink,
    value::{decode, ValueSpec},
};

const ENERGY_ADDR: u16 = 0xB800;
const ENERGY_PROCEDURE: u8 = 0x02;

/// Payload offsets of the four counters within the RPC response.
const FIELDS: [(&str, usize); 4] = [
    ("energy_heating_thermal", 4),
    ("energy_heating_electric", 6),
    ("energy_water_thermal", 8),
    ("energy_water_electric", 10),
];

/// Reads today's energy statistics and publishes the four counters.
pub(crate) async fn read_energy(
    proto: &mut dyn Protocol,
    publish: Option<&dyn PublishSink>,
    opts: &FormatOptions,
) -> ReturnCode {
    let weekday = Local::now().weekday().num_days_from_monday() as u8;
    let telegram = match proto
        .rpc(0x07, ENERGY_ADDR, 2, &[ENERGY_PROCEDURE, weekday], 0x00)
        .await
    {
        Ok(telegram) => telegram,
        Err(err) => {
            warn!("energy statistics request failed: {err}");
            return ReturnCode::Timeout;
        }
    };

    if telegram.retcode.is_success() && telegram.data.len() >= 12 {
        debug!("energy statistics day {weekday}");
        let spec = ValueSpec::scaled(0.1, false);
        for (name, offset) in FIELDS {
            let value = decode(&telegram.data[offset..offset + 2], &spec, opts);
            if let Some(publish) = publish {
                publish.publish(name, ENERGY_ADDR, &value);
            }
        }
    }
    telegram.retcode
}
