// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-level I/O over the Optolink serial line.
//!
//! The port trait is deliberately tiny: the receive state machines in
//! [`proto`](crate::proto) implement their own timeouts by polling
//! [`OptolinkPort::read_available`] in bounded loops, so the transport
//! never blocks longer than one poll interval.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::sync::Mutex;

use crate::error::TransportError;

/// Fixed line parameters of the Optolink interface: 4800 baud, 8 data
/// bits, even parity, two stop bits. These match the physical device and
/// are not user-configurable.
pub const BAUD_RATE: u32 = 4800;

/// Exclusive owner-side view of one serial connection.
#[async_trait]
pub trait OptolinkPort: Send {
    /// Discards any stale bytes buffered by the OS so a new exchange
    /// cannot pick up leftovers of an unrelated one.
    async fn reset_input_buffer(&mut self) -> Result<(), TransportError>;

    /// Writes the full frame.
    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Appends whatever bytes arrive within `wait` to `buf` and returns
    /// how many were added; `0` means the line stayed silent.
    async fn read_available(
        &mut self,
        buf: &mut BytesMut,
        wait: Duration,
    ) -> Result<usize, TransportError>;
}

#[async_trait]
impl OptolinkPort for Box<dyn OptolinkPort> {
    async fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
        self.as_mut().reset_input_buffer().await
    }

    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.as_mut().write_all(frame).await
    }

    async fn read_available(
        &mut self,
        buf: &mut BytesMut,
        wait: Duration,
    ) -> Result<usize, TransportError> {
        self.as_mut().read_available(buf, wait).await
    }
}

/// A cloneable port handle for the one place where two tasks touch the
/// same line: the passthrough listener reads from the secondary device
/// while the scheduler echoes response bytes back to it. Every call
/// takes the lock for at most one poll interval.
#[derive(Clone)]
pub struct SharedPort(Arc<Mutex<Box<dyn OptolinkPort>>>);

impl SharedPort {
    #[must_use]
    pub fn new(port: Box<dyn OptolinkPort>) -> Self {
        Self(Arc::new(Mutex::new(port)))
    }
}

#[async_trait]
impl OptolinkPort for SharedPort {
    async fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
        self.0.lock().await.reset_input_buffer().await
    }

    async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        self.0.lock().await.write_all(frame).await
    }

    async fn read_available(
        &mut self,
        buf: &mut BytesMut,
        wait: Duration,
    ) -> Result<usize, TransportError> {
        self.0.lock().await.read_available(buf, wait).await
    }
}

#[cfg(feature = "serial")]
pub use self::serial::SerialLink;

#[cfg(feature = "serial")]
mod serial {
    use std::io;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio_serial::{
        ClearBuffer, DataBits, Parity, SerialPort as _, SerialPortBuilderExt as _, SerialStream,
        StopBits,
    };

    use super::*;

    /// The physical serial connection to an Optolink head (or to the
    /// secondary master device, which speaks the same line parameters).
    pub struct SerialLink {
        stream: SerialStream,
    }

    impl SerialLink {
        /// Opens `path` with the fixed Optolink line parameters and
        /// exclusive access.
        pub fn open(path: &str) -> Result<Self, TransportError> {
            let mut stream = tokio_serial::new(path, BAUD_RATE)
                .data_bits(DataBits::Eight)
                .parity(Parity::Even)
                .stop_bits(StopBits::Two)
                .open_native_async()
                .map_err(io::Error::from)?;
            #[cfg(unix)]
            stream.set_exclusive(true).map_err(io::Error::from)?;
            Ok(Self { stream })
        }
    }

    #[async_trait]
    impl OptolinkPort for SerialLink {
        async fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
            self.stream
                .clear(ClearBuffer::Input)
                .map_err(io::Error::from)?;
            Ok(())
        }

        async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            self.stream.write_all(frame).await?;
            self.stream.flush().await?;
            Ok(())
        }

        async fn read_available(
            &mut self,
            buf: &mut BytesMut,
            wait: Duration,
        ) -> Result<usize, TransportError> {
            buf.reserve(256);
            match tokio::time::timeout(wait, self.stream.read_buf(buf)).await {
                Ok(Ok(0)) => Err(TransportError(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "serial stream closed",
                ))),
                Ok(Ok(n)) => Ok(n),
                Ok(Err(err)) => Err(err.into()),
                Err(_elapsed) => Ok(0),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::{collections::VecDeque, io};

    use super::*;

    type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

    /// Scripted in-memory port for unit tests.
    ///
    /// Reads pop pre-queued chunks; an optional responder turns each
    /// written frame into further queued chunks, emulating the device.
    #[derive(Default)]
    pub(crate) struct MockPort {
        pub(crate) incoming: VecDeque<Vec<u8>>,
        pub(crate) written: Vec<Vec<u8>>,
        pub(crate) resets: usize,
        pub(crate) fail_io: bool,
        pub(crate) responder: Option<Responder>,
    }

    impl MockPort {
        pub(crate) fn with_incoming(chunks: &[&[u8]]) -> Self {
            Self {
                incoming: chunks.iter().map(|c| c.to_vec()).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn respond_with(
            responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
        ) -> Self {
            Self {
                responder: Some(Box::new(responder)),
                ..Self::default()
            }
        }

        fn io_error() -> TransportError {
            TransportError(io::Error::new(io::ErrorKind::BrokenPipe, "mock failure"))
        }
    }

    #[async_trait]
    impl OptolinkPort for MockPort {
        async fn reset_input_buffer(&mut self) -> Result<(), TransportError> {
            if self.fail_io {
                return Err(Self::io_error());
            }
            self.resets += 1;
            Ok(())
        }

        async fn write_all(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            if self.fail_io {
                return Err(Self::io_error());
            }
            self.written.push(frame.to_vec());
            if let Some(responder) = &mut self.responder {
                for chunk in responder(frame) {
                    self.incoming.push_back(chunk);
                }
            }
            Ok(())
        }

        async fn read_available(
            &mut self,
            buf: &mut BytesMut,
            _wait: Duration,
        ) -> Result<usize, TransportError> {
            if self.fail_io {
                return Err(Self::io_error());
            }
            // Yield so surrounding polling loops cannot spin-starve the
            // runtime when the script is empty.
            tokio::task::yield_now().await;
            match self.incoming.pop_front() {
                Some(chunk) => {
                    buf.extend_from_slice(&chunk);
                    Ok(chunk.len())
                }
                None => Ok(0),
            }
        }
    }
}
