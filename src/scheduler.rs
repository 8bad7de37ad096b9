// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The round-robin request scheduler.
//!
//! Sole owner of the Optolink link: exactly one request is in flight at
//! any time. Every tick services the passthrough relay first (highest
//! priority), then rotates through {poll, command queue A, command
//! queue B}, servicing at most one ready source and advancing the
//! rotation pointer past it so no source starves.

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Local;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;

use crate::{
    codec::{hex_string, pretty_bytes},
    config::{BridgeConfig, FormatOptions, PollMode, ProtocolKind},
    energy,
    frame::{Address, FunctionCode, Request, ReturnCode, Telegram},
    onewire::OneWireBank,
    poll::PollCycle,
    proto::Protocol,
    relay::FrameMailbox,
    request::{self, parse_command, Command, ControlCommand},
    sink::{CsvSink, DatapointSource, PublishSink, ResponseSink, TrafficReport},
    transport::SharedPort,
    RestartSignal, ShutdownFlag, VERSION,
};

/// Idle sleep when no source has work.
const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Rotation slots: poll, queue A, queue B.
const ROTATION_SLOTS: usize = 3;

/// Keep-alive datapoint under VS1.
const KEEPALIVE_ADDR: Address = 0x00F8;

/// One external command source: a FIFO of command strings plus the
/// channel to answer on.
pub struct CommandSource {
    /// Shown in logs (`"MQTT"`, `"TCP"`).
    pub label: &'static str,
    pub queue: mpsc::UnboundedReceiver<String>,
    pub responder: Option<Arc<dyn ResponseSink>>,
}

impl CommandSource {
    #[must_use]
    pub fn new(label: &'static str, queue: mpsc::UnboundedReceiver<String>) -> Self {
        Self {
            label,
            queue,
            responder: None,
        }
    }

    #[must_use]
    pub fn with_responder(mut self, responder: Arc<dyn ResponseSink>) -> Self {
        self.responder = Some(responder);
        self
    }
}

/// Scheduler-side handle of the passthrough relay.
pub struct ViconLink {
    pub mailbox: FrameMailbox,
    /// Writes response bytes back to the secondary device as they
    /// arrive.
    pub echo: SharedPort,
}

/// Everything the scheduler borrows from the outside world. Moved into
/// each link session and returned on teardown, so state like the poll
/// cursor survives restarts.
#[derive(Default)]
pub struct Collaborators {
    pub poll: PollCycle,
    /// Index 0 is queue A (MQTT-origin), index 1 queue B (TCP-origin).
    pub sources: Vec<CommandSource>,
    pub publish: Option<Arc<dyn PublishSink>>,
    pub csv: Option<Box<dyn CsvSink>>,
    pub datapoints: Option<Box<dyn DatapointSource>>,
    pub onewire: Option<OneWireBank>,
    /// `reini` support: yields a fresh configuration on demand.
    pub config_reload: Option<ConfigReloadFn>,
}

/// Re-reads the adjustable configuration; `None` keeps the current one.
pub type ConfigReloadFn = Box<dyn Fn() -> Option<BridgeConfig> + Send>;

/// Why the main loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// Process shutdown was requested.
    Shutdown,
    /// A restart trigger fired; the supervisor decides what happens.
    Restart,
}

/// The single consumer of the serial link.
pub struct Scheduler {
    proto: Box<dyn Protocol>,
    vicon: Option<ViconLink>,
    parts: Collaborators,
    config: BridgeConfig,
    opts: FormatOptions,
    poll_mode: PollMode,
    rotation: usize,
    comm_errors: u32,
    force_poll: bool,
    reload_poll: bool,
    force_refresh: HashSet<(String, Address)>,
    cycle_started: Instant,
    energy_disabled: bool,
    shutdown: ShutdownFlag,
    restart: RestartSignal,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        proto: Box<dyn Protocol>,
        parts: Collaborators,
        config: BridgeConfig,
        vicon: Option<ViconLink>,
        shutdown: ShutdownFlag,
        restart: RestartSignal,
    ) -> Self {
        let opts = config.format_options();
        let poll_mode = config.poll_mode();
        Self {
            proto,
            vicon,
            parts,
            config,
            opts,
            poll_mode,
            rotation: 0,
            comm_errors: 0,
            force_poll: false,
            reload_poll: false,
            force_refresh: HashSet::new(),
            cycle_started: Instant::now(),
            energy_disabled: false,
            shutdown,
            restart,
        }
    }

    /// Runs until a restart trigger or process shutdown.
    pub async fn run(&mut self) -> SchedulerExit {
        info!("enter main loop");
        self.publish_status();
        loop {
            if self.shutdown.is_requested() {
                return SchedulerExit::Shutdown;
            }
            if self.restart.is_raised() {
                return SchedulerExit::Restart;
            }
            if !self.tick().await {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
        }
    }

    /// Hands the link and collaborators back for teardown.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn Protocol>, Collaborators) {
        (self.proto, self.parts)
    }

    /// One scheduler iteration; returns whether any request was
    /// serviced.
    pub async fn tick(&mut self) -> bool {
        let mut serviced = self.service_passthrough().await;

        let mut slot = self.rotation;
        for i in 0..ROTATION_SLOTS {
            slot = (self.rotation + i) % ROTATION_SLOTS;
            let outcome = match slot {
                0 => self.service_poll().await,
                n => self.service_source(n - 1).await,
            };
            if let Some(retcode) = outcome {
                if let Some(rc) = retcode {
                    self.olbreath(rc).await;
                    self.apply_comm(rc);
                }
                serviced = true;
                break;
            }
        }
        // Start from the slot after the one just checked, so whichever
        // source was served cannot monopolize the link.
        self.rotation = (slot + 1) % ROTATION_SLOTS;

        if self.proto.kind() == ProtocolKind::Vs1 && self.proto.keepalive_due() {
            let telegram = self.proto.read_datapoint(KEEPALIVE_ADDR, 2).await;
            let rc = telegram.retcode;
            self.olbreath(rc).await;
            self.apply_comm(rc);
            serviced = true;
        }

        serviced
    }

    /// Tier 1: forward a pending passthrough frame.
    async fn service_passthrough(&mut self) -> bool {
        let Some((frame, mut echo)) = self.vicon.as_ref().and_then(|vicon| {
            let frame = vicon.mailbox.take()?;
            Some((frame, vicon.echo.clone()))
        }) else {
            return false;
        };

        debug!("vicon M {}", pretty_bytes(&frame));
        if let Err(err) = self.proto.send_raw(&frame).await {
            error!("passthrough forward failed: {err}");
            self.apply_comm(ReturnCode::HandleLost);
            return true;
        }
        let telegram = self
            .proto
            .receive_telegram(true, true, Some(&mut echo))
            .await;
        debug!(
            "vicon S {:02x} {}",
            telegram.retcode.value(),
            pretty_bytes(&telegram.data)
        );
        self.publish_traffic(&frame, &telegram);
        let rc = telegram.retcode;
        self.olbreath(rc).await;
        self.apply_comm(rc);
        true
    }

    /// Tier 2, slot 0: at most one poll item end-to-end.
    async fn service_poll(&mut self) -> Option<Option<ReturnCode>> {
        if self.poll_mode == PollMode::Disabled {
            return None;
        }

        // Things that must not happen mid-cycle.
        let pointer = self.parts.poll.pointer();
        if pointer == 0 || pointer >= self.parts.poll.len() {
            if self.force_poll {
                self.parts.poll.restart_cycle();
                self.force_poll = false;
            }
            if self.reload_poll {
                self.reload_poll_list();
                self.reload_poll = false;
            }
        }
        if self.parts.poll.is_empty() {
            return None;
        }

        // Parked between cycles: only the interval timer restarts us.
        if self.parts.poll.pointer() > self.parts.poll.len()
            || (self.parts.poll.pointer() == self.parts.poll.len() && !self.parts.poll.is_empty())
        {
            match self.poll_mode {
                PollMode::Interval(interval) if self.cycle_started.elapsed() >= interval => {
                    self.parts.poll.reset_pointer();
                }
                PollMode::Continuous => self.parts.poll.reset_pointer(),
                _ => return None,
            }
        }

        if self.parts.poll.pointer() == 0 {
            self.cycle_started = Instant::now();
        }
        let rc = self.do_poll_item().await;
        self.parts.poll.advance();
        if self.parts.poll.pointer() >= self.parts.poll.len() {
            self.end_of_cycle(rc).await;
        }
        Some(Some(rc))
    }

    /// Advances over not-due items, then reads the first due one and
    /// greedily consumes adjacent bit-filter siblings of the same
    /// physical read.
    async fn do_poll_item(&mut self) -> ReturnCode {
        loop {
            let idx = self.parts.poll.pointer();
            let item = &self.parts.poll.items()[idx];
            let forced = self
                .force_refresh
                .remove(&(item.name.clone(), item.addr));
            if forced || self.parts.poll.is_due(idx) {
                break;
            }
            // Not due: leave its buffered value unchanged.
            self.parts.poll.advance();
            if self.parts.poll.pointer() == self.parts.poll.len() {
                return ReturnCode::CycleSkipped;
            }
        }

        let idx = self.parts.poll.pointer();
        let item = self.parts.poll.items()[idx].clone();
        let req = Request::Read {
            addr: item.addr,
            len: item.len,
            value: Some(item.value.clone()),
        };
        let out = request::execute(
            &req,
            self.proto.as_mut(),
            &self.opts,
            (self.config.fullraw_eot(), self.config.fullraw_timeout()),
            self.parts.onewire.as_mut(),
        )
        .await;
        let rc = out.retcode.unwrap_or(ReturnCode::Timeout);

        if rc.is_success() {
            if let Some(value) = &out.value {
                self.parts.poll.store(idx, value.clone());
                if let Some(publish) = &self.parts.publish {
                    publish.publish(&item.name, item.addr, value);
                }
            }
            if item.has_filter() {
                // More logical fields packed into the same raw read.
                loop {
                    let next = self.parts.poll.pointer() + 1;
                    if next >= self.parts.poll.len() {
                        break;
                    }
                    let sibling = self.parts.poll.items()[next].clone();
                    if sibling.addr != item.addr
                        || sibling.len != item.len
                        || !sibling.has_filter()
                    {
                        break;
                    }
                    let value = crate::value::decode(&out.data, &sibling.value, &self.opts);
                    self.parts.poll.store(next, value.clone());
                    if let Some(publish) = &self.parts.publish {
                        publish.publish(&sibling.name, sibling.addr, &value);
                    }
                    self.parts.poll.advance();
                }
            }
        } else {
            error!(
                "poll item {idx} failed, addr {:04X}, retcode {rc}",
                item.addr
            );
        }
        rc
    }

    /// Exactly-once end-of-cycle bookkeeping.
    async fn end_of_cycle(&mut self, last: ReturnCode) {
        if self.config.viessdata.enabled {
            let row = self.parts.poll.csv_row();
            if let Some(csv) = &mut self.parts.csv {
                csv.buffer_row(&row, false);
            }
        }

        let every = self.config.energy_statistics_every;
        if every > 0 && !self.energy_disabled && self.parts.poll.cycle() % every == 0 {
            if self.proto.kind() == ProtocolKind::Vs2 {
                self.olbreath(last).await;
                let rc = energy::read_energy(
                    self.proto.as_mut(),
                    self.parts.publish.as_deref(),
                    &self.opts,
                )
                .await;
                self.apply_comm(rc);
            } else {
                warn!("energy statistics not supported with VS1/KW protocol");
                self.energy_disabled = true;
            }
        }

        self.parts.poll.finish_cycle();
        if self.poll_mode == PollMode::Continuous {
            self.parts.poll.reset_pointer();
        }
    }

    /// Tier 2, slots 1/2: one queued command string end-to-end.
    async fn service_source(&mut self, index: usize) -> Option<Option<ReturnCode>> {
        let source = self.parts.sources.get_mut(index)?;
        let message = source.queue.try_recv().ok()?;
        let label = source.label;
        debug!("{label} request: {message}");

        match parse_command(&message) {
            Ok(Command::Control(cmd)) => {
                self.handle_control(cmd, index);
                Some(None)
            }
            Ok(Command::Bus(req)) => {
                let out = request::execute(
                    &req,
                    self.proto.as_mut(),
                    &self.opts,
                    (self.config.fullraw_eot(), self.config.fullraw_timeout()),
                    self.parts.onewire.as_mut(),
                )
                .await;
                self.respond(index, &out.response);
                Some(out.retcode)
            }
            Err(err) => {
                warn!("{label}: {err}");
                self.respond(index, &err.to_string());
                Some(None)
            }
        }
    }

    fn handle_control(&mut self, cmd: ControlCommand, origin: usize) {
        let ack: String = match cmd {
            ControlCommand::ResetRecent => {
                if let Some(publish) = &self.parts.publish {
                    publish.reset_cache();
                }
                "reset triggered".to_owned()
            }
            ControlCommand::ForcePoll => {
                self.force_poll = true;
                "forcepoll triggered".to_owned()
            }
            ControlCommand::ReloadPoll => {
                self.reload_poll = true;
                "reloadpoll triggered".to_owned()
            }
            ControlCommand::CloseSession => {
                if let Some(responder) = self
                    .parts
                    .sources
                    .get(origin)
                    .and_then(|s| s.responder.as_ref())
                {
                    responder.close_session();
                }
                "session close triggered".to_owned()
            }
            ControlCommand::FlushCsv => {
                if let Some(csv) = &mut self.parts.csv {
                    csv.buffer_row(&[], true);
                    "flushcsv triggered".to_owned()
                } else {
                    "flushcsv failed".to_owned()
                }
            }
            ControlCommand::ReloadConfig => {
                if let Some(reload) = &self.parts.config_reload {
                    if let Some(config) = reload() {
                        self.apply_config(config);
                    }
                }
                "ini settings reloaded".to_owned()
            }
            ControlCommand::SetPollCycle { group, divisor } => {
                self.parts.poll.set_divisor(group, divisor);
                format!("setpollcycle {group} -> {divisor}")
            }
            ControlCommand::SetPollInterval { secs } => {
                self.poll_mode = PollMode::from_secs(secs);
                format!("setpollinterval {secs}")
            }
            ControlCommand::ForceRefresh { name, addr } => {
                self.force_refresh.insert((name, addr));
                "forcerefresh noted".to_owned()
            }
        };
        self.respond(origin, &ack);
    }

    fn apply_config(&mut self, config: BridgeConfig) {
        self.opts = config.format_options();
        self.poll_mode = config.poll_mode();
        self.config = config;
        info!("adjustable settings reloaded");
    }

    fn reload_poll_list(&mut self) {
        let Some(source) = &mut self.parts.datapoints else {
            return;
        };
        match source.load() {
            Ok(def) => {
                if let Some(secs) = def.interval_override {
                    self.poll_mode = PollMode::from_secs(secs);
                }
                self.parts.poll.install(def);
                let columns = self.parts.poll.csv_columns();
                if let Some(csv) = &mut self.parts.csv {
                    csv.set_columns(&columns);
                }
                info!("poll list loaded, {} items", self.parts.poll.len());
                self.publish_status();
            }
            Err(err) => error!("poll list reload failed: {err}"),
        }
    }

    fn respond(&self, index: usize, text: &str) {
        if text.is_empty() {
            return;
        }
        if let Some(responder) = self
            .parts
            .sources
            .get(index)
            .and_then(|s| s.responder.as_ref())
        {
            responder.respond(text);
        }
    }

    /// Mandatory inter-request pause sized by outcome; gives the device
    /// time to settle between bus transactions.
    async fn olbreath(&mut self, rc: ReturnCode) {
        match rc {
            ReturnCode::Timeout | ReturnCode::HandleLost | ReturnCode::CycleSkipped => {}
            ReturnCode::Success | ReturnCode::ErrorMessage => {
                self.proto.touch_sync();
                tokio::time::sleep(self.config.olbreath()).await;
            }
            _ => {
                self.proto.touch_sync();
                tokio::time::sleep(self.config.olbreath() * 2).await;
            }
        }
    }

    /// Decaying communication error counter: +2 per hard error, -1 per
    /// clean exchange. Sustained error rates trip a restart; isolated
    /// ones heal.
    fn apply_comm(&mut self, rc: ReturnCode) {
        if rc.is_hard_error() {
            self.comm_errors += 2;
            if self.comm_errors >= self.config.max_comm_errors {
                error!(
                    "communication error level {} reached threshold, requesting restart",
                    self.comm_errors
                );
                self.restart.raise();
            }
        } else if rc.is_clean() {
            self.comm_errors = self.comm_errors.saturating_sub(1);
        }
    }

    fn publish_traffic(&self, request_frame: &[u8], response: &Telegram) {
        let Some(publish) = &self.parts.publish else {
            return;
        };
        let fctcode = if request_frame.len() > 3 {
            FunctionCode::new(request_frame[3] & 0x1F).to_string()
        } else {
            FunctionCode::Undefined.to_string()
        };
        let addr = (request_frame.len() >= 6).then(|| {
            Address::from(request_frame[4]) << 8 | Address::from(request_frame[5])
        });
        publish.publish_traffic(&TrafficReport {
            direction: "Vicon",
            addr,
            retcode: "request".to_owned(),
            fctcode: fctcode.clone(),
            datalen: request_frame.len(),
            data: hex_string(request_frame, self.opts.hex_uppercase),
        });
        publish.publish_traffic(&TrafficReport {
            direction: "Opto",
            addr,
            retcode: response.retcode.to_string(),
            fctcode,
            datalen: response.data.len(),
            data: if response.data.is_empty() {
                "none".to_owned()
            } else {
                hex_string(&response.data, self.opts.hex_uppercase)
            },
        });
    }

    fn publish_status(&self) {
        if let Some(publish) = &self.parts.publish {
            let status = serde_json::json!({
                "version": VERSION,
                "started": Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
                "poll_items": self.parts.poll.len(),
            });
            publish.publish_status(&status.to_string());
        }
    }
}
