// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! CSV row sink for poll-cycle data ("Viessdata" format).
//!
//! One row per completed poll cycle, buffered and written out in
//! batches. Output files rotate on a weekly boundary and get a header
//! row of datapoint addresses when created.

use std::{fs, io::Write as _, path::PathBuf};

use chrono::{Datelike as _, Local, Timelike as _};
use log::error;

use crate::{config::ViessdataConfig, frame::Address, sink::CsvSink, value::Value};

const WEEKDAYS: [&str; 7] = ["Mo", "Di", "Mi", "Do", "Fr", "Sa", "So"];

/// Buffered CSV writer implementing the [`CsvSink`] contract.
pub struct CsvBuffer {
    config: ViessdataConfig,
    columns: Vec<Address>,
    rows: Vec<String>,
    minutes_old: i64,
    current_file: String,
}

impl CsvBuffer {
    #[must_use]
    pub fn new(config: ViessdataConfig) -> Self {
        Self {
            config,
            columns: Vec::new(),
            rows: Vec::new(),
            minutes_old: 0,
            current_file: filename_for_now(),
        }
    }

    fn header_line(&self) -> String {
        let now = Local::now();
        let date = format!("{:04}-{:02}-{:02}", now.year(), now.month(), now.day());
        let captions: Vec<String> = self
            .columns
            .iter()
            .map(|addr| format!("{addr:04X}"))
            .collect();
        format!(";{date};{};", captions.join(";"))
    }

    fn write_out(&mut self) {
        if self.rows.is_empty() {
            self.current_file = filename_for_now();
            return;
        }
        let path: PathBuf = [self.config.path.as_str(), self.current_file.as_str()]
            .iter()
            .collect();
        let needs_header = !path.exists();
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                if needs_header {
                    writeln!(file, "{}", self.header_line())?;
                }
                for row in &self.rows {
                    writeln!(file, "{row}")?;
                }
                file.flush()
            });
        match result {
            Ok(()) => {
                self.rows.clear();
                self.current_file = filename_for_now();
            }
            Err(err) => error!("write csv: {err}"),
        }
    }

    fn render_row(&self, values: &[Option<Value>], minutes: i64) -> String {
        let now = Local::now();
        let weekday = WEEKDAYS[now.weekday().num_days_from_monday() as usize];
        let mut line = format!(
            "{minutes};{weekday}-{:02}:{:02}:{:02};",
            now.hour(),
            now.minute(),
            now.second()
        );
        for value in values {
            let rendered = match value {
                Some(v) => {
                    let text = v.to_string();
                    if v.as_number().is_some() {
                        text.replace('.', &self.config.decimal_separator)
                    } else {
                        text
                    }
                }
                None => "0".to_owned(),
            };
            line.push_str(&rendered);
            line.push(';');
        }
        line
    }
}

impl CsvSink for CsvBuffer {
    fn set_columns(&mut self, addrs: &[Address]) {
        self.columns = addrs.to_vec();
    }

    fn buffer_row(&mut self, values: &[Option<Value>], force_flush: bool) {
        let minutes = minutes_since_monday();
        let new_week = minutes < self.minutes_old;
        self.minutes_old = minutes;

        let buffer_full = self.rows.len() >= self.config.buffer_rows;
        let mut pending = (!values.is_empty()).then(|| self.render_row(values, minutes));

        if force_flush && !new_week {
            // Include the current row in the write-out.
            if let Some(row) = pending.take() {
                self.rows.push(row);
            }
        }

        if force_flush || new_week || buffer_full {
            self.write_out();
        }

        if let Some(row) = pending {
            self.rows.push(row);
        }
    }
}

fn minutes_since_monday() -> i64 {
    let now = Local::now();
    i64::from(now.weekday().num_days_from_monday()) * 24 * 60
        + i64::from(now.hour()) * 60
        + i64::from(now.minute())
}

/// `YYYY_KWww_data.csv` per ISO calendar week.
fn filename_for_now() -> String {
    let week = Local::now().iso_week();
    format!("{:04}_KW{:02}_data.csv", week.year(), week.week())
}
