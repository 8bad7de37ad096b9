// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared fixtures: an in-memory VS2 device emulator and recording
//! collaborator sinks.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use optolink_bridge::{
    sink::{PublishSink, ResponseSink, TrafficReport},
    transport::OptolinkPort,
    value::Value,
    Address, TransportError,
};

/// Opt-in test logging (`RUST_LOG=debug cargo test -- --nocapture`).
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Modulo-256 sum from the length byte through the last data byte.
pub fn vs2_checksum(frame: &[u8]) -> u8 {
    let payload_len = frame[1] as usize;
    frame[1..payload_len + 2]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// A VS2 read request frame as a master would send it.
pub fn vs2_read_frame(addr: Address, len: u8) -> Vec<u8> {
    let mut frame = vec![0x41, 0x05, 0x00, 0x01, (addr >> 8) as u8, addr as u8, len];
    frame.push(vs2_checksum(&frame));
    frame
}

/// ACK plus a response telegram for `addr` carrying `data`.
pub fn vs2_response(addr: Address, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![
        0x41,
        5 + data.len() as u8,
        0x01,
        0x01,
        (addr >> 8) as u8,
        addr as u8,
        data.len() as u8,
    ];
    frame.extend_from_slice(data);
    frame.push(vs2_checksum(&frame));
    let mut full = vec![0x06];
    full.extend_from_slice(&frame);
    full
}

/// Recorded port operations: `W` for a write, `R` for a non-empty read.
pub type OpLog = Arc<Mutex<Vec<char>>>;

/// In-memory emulation of a VS2/300 device behind a serial line.
///
/// Answers protocol init handshakes, virtual reads from a fixed
/// datapoint table and virtual writes; logs the operation sequence for
/// single-outstanding-request assertions.
pub struct Vs2Device {
    pub datapoints: HashMap<Address, Vec<u8>>,
    pub ops: OpLog,
    incoming: VecDeque<Vec<u8>>,
}

impl Vs2Device {
    pub fn new(datapoints: HashMap<Address, Vec<u8>>) -> Self {
        Self {
            datapoints,
            ops: Arc::new(Mutex::new(Vec::new())),
            incoming: VecDeque::new(),
        }
    }

    fn respond(&mut self, frame: &[u8]) {
        match frame {
            [0x04] => self.incoming.push_back(vec![0x05]),
            [0x16, 0x00, 0x00] => self.incoming.push_back(vec![0x06]),
            [0x41, ..] if frame.len() >= 8 => {
                let fct = frame[3] & 0x1F;
                let addr = Address::from(frame[4]) << 8 | Address::from(frame[5]);
                let block_len = frame[6] as usize;
                match fct {
                    0x01 => {
                        let data = self
                            .datapoints
                            .get(&addr)
                            .cloned()
                            .unwrap_or_else(|| vec![0u8; block_len]);
                        self.incoming.push_back(vs2_response(addr, &data));
                    }
                    0x02 => {
                        // Write acknowledgement carries no data block.
                        let mut ack = vec![
                            0x41,
                            0x05,
                            0x01,
                            0x02,
                            (addr >> 8) as u8,
                            addr as u8,
                            frame[6],
                        ];
                        ack.push(vs2_checksum(&ack));
                        let mut full = vec![0x06];
                        full.extend_from_slice(&ack);
                        self.incoming.push_back(full);
                    }
                    0x07 => {
                        let data = vec![0u8; block_len.max(16)];
                        self.incoming.push_back(vs2_response(addr, &data));
                    }
                    _ => self.incoming.push_back(vec![0x15]),
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl OptolinkPort for Vs2Device {
    async fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
        self.incoming.clear();
        Ok(())
    }

    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.ops.lock().unwrap().push('W');
        self.respond(frame);
        Ok(())
    }

    async fn read_available(
        &mut self,
        buf: &mut BytesMut,
        _wait: Duration,
    ) -> Result<usize, TransportError> {
        tokio::task::yield_now().await;
        match self.incoming.pop_front() {
            Some(chunk) => {
                self.ops.lock().unwrap().push('R');
                buf.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }
}

/// Serial port stub that records everything written to it.
#[derive(Default)]
pub struct RecordingPort {
    pub written: Arc<Mutex<Vec<u8>>>,
}

#[async_trait]
impl OptolinkPort for RecordingPort {
    async fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.written.lock().unwrap().extend_from_slice(frame);
        Ok(())
    }

    async fn read_available(
        &mut self,
        _buf: &mut BytesMut,
        _wait: Duration,
    ) -> Result<usize, TransportError> {
        tokio::task::yield_now().await;
        Ok(0)
    }
}

/// Publish sink recording every publication.
#[derive(Default)]
pub struct RecordingPublish {
    pub published: Mutex<Vec<(String, Address, String)>>,
    pub traffic: Mutex<Vec<TrafficReport>>,
}

impl PublishSink for RecordingPublish {
    fn publish(&self, name: &str, addr: Address, value: &Value) {
        self.published
            .lock()
            .unwrap()
            .push((name.to_owned(), addr, value.to_string()));
    }

    fn publish_traffic(&self, report: &TrafficReport) {
        self.traffic.lock().unwrap().push(report.clone());
    }
}

impl RecordingPublish {
    pub fn count_for(&self, name: &str) -> usize {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _, _)| n == name)
            .count()
    }
}

/// Response sink recording every reply line.
#[derive(Default)]
pub struct RecordingResponder {
    pub responses: Mutex<Vec<String>>,
}

impl ResponseSink for RecordingResponder {
    fn respond(&self, response: &str) {
        self.responses.lock().unwrap().push(response.to_owned());
    }
}

impl RecordingResponder {
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut self.responses.lock().unwrap())
    }
}
