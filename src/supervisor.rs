// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The recovery supervisor.
//!
//! Wraps the whole link lifecycle in a bounded restart loop:
//! `OpenLinks -> EstablishProtocol -> MainLoop -> Teardown`, retried
//! after a fixed delay until the restart budget is exhausted. A session
//! that ran cleanly for long enough resets the budget, so the bridge
//! survives the occasional bad day without ever restarting unboundedly.

use std::time::Instant;

use log::{error, info, warn};

use crate::{
    config::{BridgeConfig, ProtocolKind},
    error::{Error, TransportError},
    proto::make_protocol,
    relay::{self, FrameMailbox},
    scheduler::{Collaborators, Scheduler, SchedulerExit, ViconLink},
    transport::{OptolinkPort, SharedPort},
    RestartSignal, ShutdownFlag,
};

/// Opens a port; invoked once per restart attempt so every session gets
/// a fresh handle.
pub type PortFactory = Box<dyn Fn() -> Result<Box<dyn OptolinkPort>, TransportError> + Send>;

enum SessionEnd {
    Shutdown,
    Restart,
}

/// Owns the link lifecycle and the restart budget.
pub struct Supervisor {
    config: BridgeConfig,
    opto_factory: PortFactory,
    vicon_factory: Option<PortFactory>,
    collaborators: Option<Collaborators>,
    shutdown: ShutdownFlag,
    vicon_tries: u32,
    vicon_disabled: bool,
}

impl Supervisor {
    #[must_use]
    pub fn new(
        config: BridgeConfig,
        opto_factory: PortFactory,
        collaborators: Collaborators,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            config,
            opto_factory,
            vicon_factory: None,
            collaborators: Some(collaborators),
            shutdown,
            vicon_tries: 0,
            vicon_disabled: false,
        }
    }

    /// Attaches the passthrough device's port.
    #[must_use]
    pub fn with_vicon_factory(mut self, factory: PortFactory) -> Self {
        self.vicon_factory = Some(factory);
        self
    }

    /// Builds a supervisor opening the configured serial devices.
    #[cfg(feature = "serial")]
    pub fn with_serial_ports(
        config: BridgeConfig,
        collaborators: Collaborators,
        shutdown: ShutdownFlag,
    ) -> Result<Self, Error> {
        use crate::transport::SerialLink;

        let Some(opto_path) = config.port_optolink.clone() else {
            return Err(Error::Transport(TransportError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "the Optolink device is mandatory",
            ))));
        };
        let opto_factory: PortFactory = Box::new(move || {
            SerialLink::open(&opto_path).map(|link| Box::new(link) as Box<dyn OptolinkPort>)
        });
        let mut supervisor = Self::new(config.clone(), opto_factory, collaborators, shutdown);
        if let Some(vicon_path) = config.port_vitoconnect {
            supervisor = supervisor.with_vicon_factory(Box::new(move || {
                SerialLink::open(&vicon_path).map(|link| Box::new(link) as Box<dyn OptolinkPort>)
            }));
        }
        Ok(supervisor)
    }

    /// Runs sessions until shutdown or permanent failure.
    ///
    /// Exactly `max_restarts` attempts are made against a link that
    /// never comes up; a clean-operation window of
    /// `retry_counters_reset_mins` resets the budget.
    pub async fn run(mut self) -> Result<(), Error> {
        let max_restarts = self.config.max_restarts.max(1);
        let mut restarts = 0u32;

        loop {
            if self.shutdown.is_requested() {
                return Ok(());
            }

            let started = Instant::now();
            let outcome = self.run_session().await;

            if started.elapsed() >= self.config.retry_counters_reset() {
                // A long clean run forgives earlier trouble.
                restarts = 0;
                self.vicon_tries = 0;
            }

            match outcome {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Restart) => {
                    info!("link session ended, restart pending");
                }
                Err(err) => {
                    error!("link session failed: {err}");
                }
            }

            restarts += 1;
            if restarts >= max_restarts {
                error!("restart budget exhausted after {restarts} attempts");
                return Err(Error::RestartBudgetExhausted { attempts: restarts });
            }
            if self.shutdown.is_requested() {
                return Ok(());
            }
            tokio::time::sleep(self.config.restart_delay()).await;
        }
    }

    /// One complete link session: open, establish, main loop, teardown.
    async fn run_session(&mut self) -> Result<SessionEnd, Error> {
        let mut opto = (self.opto_factory)()?;
        info!("Optolink port opened");

        // Establish-protocol gate: with a passthrough device attached,
        // it must be observed operational before the main loop starts.
        let mut vicon_port = None;
        if self.vicon_factory.is_some() && !self.vicon_disabled {
            match self.establish_vicon(opto.as_mut()).await {
                Some(port) => {
                    self.vicon_tries = 0;
                    vicon_port = Some(port);
                }
                None => {
                    self.vicon_tries += 1;
                    if self.vicon_tries >= self.config.max_vicon_tries.max(1) {
                        warn!(
                            "passthrough device not detected {} times, continuing without it",
                            self.vicon_tries
                        );
                        self.vicon_disabled = true;
                    }
                    return Err(Error::DetectTimeout(self.config.vs2_timeout()));
                }
            }
        }

        let restart = RestartSignal::default();
        let mut proto = make_protocol(opto, &self.config, self.shutdown.clone());

        let mut vicon_link = None;
        let mut listener = None;
        match vicon_port {
            Some(port) => {
                let shared = SharedPort::new(port);
                let mailbox = FrameMailbox::default();
                listener = Some(relay::spawn_listener(
                    shared.clone(),
                    mailbox.clone(),
                    self.shutdown.clone(),
                    restart.clone(),
                ));
                vicon_link = Some(ViconLink {
                    mailbox,
                    echo: shared,
                });
            }
            None => {
                // No passthrough master: initialize the protocol
                // ourselves.
                proto.init().await?;
                let name = match self.config.protocol {
                    ProtocolKind::Vs2 => "VS2/300",
                    ProtocolKind::Vs1 => "VS1/KW",
                };
                info!("{name} protocol initialized");
            }
        }

        let collaborators = self.collaborators.take().unwrap_or_default();
        let mut scheduler = Scheduler::new(
            proto,
            collaborators,
            self.config.clone(),
            vicon_link,
            self.shutdown.clone(),
            restart.clone(),
        );
        let exit = scheduler.run().await;
        let (mut proto, collaborators) = scheduler.into_parts();
        self.collaborators = Some(collaborators);

        // Teardown: stop the listener, reset the device protocol if the
        // line is still writable, drop the handles.
        info!("closing link session");
        restart.raise();
        if let Some(listener) = listener {
            listener.abort();
        }
        proto.send_protocol_reset().await;
        drop(proto);

        Ok(match exit {
            SchedulerExit::Shutdown => SessionEnd::Shutdown,
            SchedulerExit::Restart => SessionEnd::Restart,
        })
    }

    /// Opens the passthrough port and waits for its detect-operational
    /// gate.
    async fn establish_vicon(
        &self,
        opto: &mut dyn OptolinkPort,
    ) -> Option<Box<dyn OptolinkPort>> {
        let factory = self.vicon_factory.as_ref()?;
        let mut vicon = match factory() {
            Ok(port) => port,
            Err(err) => {
                error!("passthrough port failed to open: {err}");
                return None;
            }
        };
        info!("awaiting passthrough device being operational...");
        match relay::detect_operational(
            vicon.as_mut(),
            opto,
            self.config.vs2_timeout(),
            &self.shutdown,
        )
        .await
        {
            Ok(true) => {
                info!("passthrough device detected operational");
                Some(vicon)
            }
            Ok(false) => {
                warn!("passthrough device not detected operational within timeout");
                None
            }
            Err(err) => {
                error!("passthrough detection failed: {err}");
                None
            }
        }
    }
}
