// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contracts of the external collaborators.
//!
//! The bridge core stays free of MQTT, socket and file mechanics; it
//! talks to those worlds exclusively through the traits below. All of
//! them are fire-and-forget from the scheduler's point of view.

use serde::Serialize;

use crate::{frame::Address, poll::PollDefinition, value::Value};

/// Receives decoded datapoint values (MQTT-style key/value publishing).
pub trait PublishSink: Send + Sync {
    /// Publishes one decoded value under its datapoint name.
    fn publish(&self, name: &str, addr: Address, value: &Value);

    /// Drops any duplicate-suppression cache so the next publications go
    /// out even if unchanged (`reset`/`resetrecent`).
    fn reset_cache(&self) {}

    /// Offers a passthrough traffic report for diagnostic topics.
    fn publish_traffic(&self, report: &TrafficReport) {
        let _ = report;
    }

    /// Free-form status line (version, session start, ...).
    fn publish_status(&self, status: &str) {
        let _ = status;
    }
}

/// Replies to the external channel a command string came from.
pub trait ResponseSink: Send + Sync {
    /// Sends one response line back to the requester.
    fn respond(&self, response: &str);

    /// Closes the current session of the channel (`exit`/`resettcp`).
    fn close_session(&self) {}
}

/// Buffers one row of decoded values per completed poll cycle.
pub trait CsvSink: Send {
    /// Announces the column layout (datapoint addresses) after a poll
    /// list (re)load; starts a fresh header on the next file.
    fn set_columns(&mut self, addrs: &[Address]);

    /// Buffers one row; with `force_flush` (or an empty row) pending
    /// rows are written out immediately.
    fn buffer_row(&mut self, values: &[Option<Value>], force_flush: bool);
}

/// Loads the datapoint list; re-invoked on `reloadpoll` and expected to
/// be idempotent.
pub trait DatapointSource: Send {
    fn load(&mut self) -> Result<PollDefinition, Box<dyn std::error::Error + Send + Sync>>;
}

/// One relayed passthrough exchange, serializable for diagnostic
/// publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficReport {
    /// `"Vicon"` for the forwarded request, `"Opto"` for the response.
    pub direction: &'static str,
    /// Datapoint address if the frame carried one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<Address>,
    /// Outcome name, e.g. `"success"`.
    pub retcode: String,
    /// Function code name if parseable.
    pub fctcode: String,
    /// Payload byte count.
    pub datalen: usize,
    /// Hex rendering of the frame, `"none"` when empty.
    pub data: String,
}

impl TrafficReport {
    /// JSON rendering for topic payloads.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
