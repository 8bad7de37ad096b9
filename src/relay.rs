// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passthrough relay for the secondary master device ("Vitoconnect").
//!
//! A background task listens for complete inbound frames and stages the
//! most recent one in a single-slot mailbox; the scheduler forwards it
//! over the shared link at the next tick, echoing the response bytes
//! back as they arrive so the device's own protocol timing is kept.

use std::{
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::{
    codec::{pretty_bytes, ACK, VS2_STX},
    error::TransportError,
    frame::ReturnCode,
    proto::{vs2::receive_on, RECV_POLL},
    transport::{OptolinkPort, SharedPort},
    RestartSignal, ShutdownFlag,
};

/// Single-slot, last-write-wins frame mailbox.
///
/// Only the most recent request of the passthrough device is meaningful;
/// if the scheduler has not consumed the previous one it is overwritten.
#[derive(Debug, Clone, Default)]
pub struct FrameMailbox(Arc<Mutex<Option<Vec<u8>>>>);

impl FrameMailbox {
    /// Stages a frame, replacing any unconsumed one.
    pub fn put(&self, frame: Vec<u8>) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(frame);
        }
    }

    /// Takes the staged frame, leaving the mailbox empty.
    #[must_use]
    pub fn take(&self) -> Option<Vec<u8>> {
        self.0.lock().ok().and_then(|mut slot| slot.take())
    }
}

/// Detect-operational gate: relays bytes between the secondary device
/// and the Optolink head until a valid VS2 handshake is observed, or the
/// timeout elapses.
///
/// Two patterns count as operational: the device's session start
/// (`16 00 00`) answered with ACK, or any ACK-framed VS2 response
/// telegram flowing back.
pub async fn detect_operational(
    vicon: &mut dyn OptolinkPort,
    opto: &mut dyn OptolinkPort,
    timeout: Duration,
    shutdown: &ShutdownFlag,
) -> Result<bool, TransportError> {
    let mut vicon_ring = [0xFFu8; 3];
    let mut opto_ring = [0xFFu8; 4];
    let mut vicon_buf = BytesMut::new();
    let mut opto_buf = BytesMut::new();
    let started = Instant::now();

    loop {
        if shutdown.is_requested() {
            return Ok(false);
        }

        vicon_buf.clear();
        vicon.read_available(&mut vicon_buf, Duration::from_millis(1)).await?;
        if !vicon_buf.is_empty() {
            opto.write_all(&vicon_buf).await?;
            debug!("vicon M {}", pretty_bytes(&vicon_buf));
            push_ring(&mut vicon_ring, &vicon_buf);
            // A new request invalidates the response pattern so far.
            opto_ring = [0xFF; 4];
        }

        opto_buf.clear();
        opto.read_available(&mut opto_buf, Duration::from_millis(1)).await?;
        if !opto_buf.is_empty() {
            vicon.write_all(&opto_buf).await?;
            debug!("vicon S {}", pretty_bytes(&opto_buf));
            push_ring(&mut opto_ring, &opto_buf);

            if vicon_ring == [0x16, 0x00, 0x00] && opto_buf.contains(&ACK) {
                // Session start answered positively.
                return Ok(true);
            }
            if opto_ring[0] == ACK && opto_ring[1] == VS2_STX && opto_ring[3] == 0x01 {
                // A VS2-framed response is flowing.
                return Ok(true);
            }
        }

        if started.elapsed() > timeout {
            return Ok(false);
        }
    }
}

fn push_ring<const N: usize>(ring: &mut [u8; N], bytes: &[u8]) {
    for byte in bytes {
        ring.rotate_left(1);
        ring[N - 1] = *byte;
    }
}

/// Spawns the listener task staging inbound frames into the mailbox.
///
/// The task ends on shutdown; an unusable port raises the restart
/// signal instead of killing the process.
pub fn spawn_listener(
    mut port: SharedPort,
    mailbox: FrameMailbox,
    shutdown: ShutdownFlag,
    restart: RestartSignal,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("running passthrough listener");
        while !shutdown.is_requested() && !restart.is_raised() {
            let telegram = receive_on(&mut port, false, true, None, &shutdown).await;
            match telegram.retcode {
                ReturnCode::Success => {
                    debug!("vicon request {}", pretty_bytes(&telegram.data));
                    mailbox.put(telegram.data.to_vec());
                }
                ReturnCode::Timeout => {
                    // Idle line; keep listening.
                }
                ReturnCode::HandleLost => {
                    error!("passthrough listener lost its port, requesting restart");
                    restart.raise();
                    return;
                }
                other => {
                    if !telegram.data.is_empty() {
                        debug!(
                            "vicon X {} ({other})",
                            pretty_bytes(&telegram.data)
                        );
                    }
                }
            }
            // Pace the loop; receive_on already polls at 5 ms while a
            // telegram is in flight.
            tokio::time::sleep(RECV_POLL).await;
        }
    })
}
