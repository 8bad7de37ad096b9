// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Common types and traits

///////////////////////////////////////////////////////////////////
/// Types
///////////////////////////////////////////////////////////////////
pub use crate::{Address, Request, ReturnCode, Telegram};
pub use crate::{RestartSignal, ShutdownFlag};

pub use crate::config::{BridgeConfig, FormatOptions, PollMode, ProtocolKind};
pub use crate::poll::{CycleGroups, DatapointSpec, PollCycle, PollDefinition};
pub use crate::value::{ByteBitFilter, Format, Value, ValueSpec};

///////////////////////////////////////////////////////////////////
/// Traits
///////////////////////////////////////////////////////////////////
pub use crate::onewire::OneWireSource;
pub use crate::proto::Protocol;
pub use crate::sink::{CsvSink, DatapointSource, PublishSink, ResponseSink};
pub use crate::transport::OptolinkPort;

///////////////////////////////////////////////////////////////////
/// Entry points
///////////////////////////////////////////////////////////////////
pub use crate::scheduler::{Collaborators, CommandSource, Scheduler};
pub use crate::supervisor::Supervisor;
