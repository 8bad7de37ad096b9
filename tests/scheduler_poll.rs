// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end poll and command scenarios against an in-memory device.

mod support;

use std::{collections::HashMap, sync::Arc};

use optolink_bridge::{
    config::BridgeConfig,
    poll::{CycleGroups, DatapointSpec, PollCycle, PollDefinition, EVERY_CYCLE},
    proto::{Protocol, Vs2Protocol},
    scheduler::{Collaborators, CommandSource, Scheduler},
    sink::{DatapointSource, PublishSink, ResponseSink},
    RestartSignal, ShutdownFlag,
};
use tokio::sync::mpsc;

use support::{RecordingPublish, RecordingResponder, Vs2Device};

/// Poll list source handing out a fixed definition, or failing.
struct StubListSource {
    definition: Option<PollDefinition>,
}

impl DatapointSource for StubListSource {
    fn load(&mut self) -> Result<PollDefinition, Box<dyn std::error::Error + Send + Sync>> {
        match &self.definition {
            Some(def) => Ok(def.clone()),
            None => Err(anyhow::anyhow!("poll list unavailable").into()),
        }
    }
}

fn continuous_config() -> BridgeConfig {
    BridgeConfig {
        poll_interval_secs: 0.0,
        olbreath_secs: 0.0,
        ..BridgeConfig::default()
    }
}

fn scheduler_with(
    datapoints: HashMap<u16, Vec<u8>>,
    def: PollDefinition,
    config: BridgeConfig,
) -> (
    Scheduler,
    Arc<RecordingPublish>,
    Arc<RecordingResponder>,
    mpsc::UnboundedSender<String>,
) {
    let device = Vs2Device::new(datapoints);
    let shutdown = ShutdownFlag::default();
    let proto: Box<dyn Protocol> = Box::new(Vs2Protocol::new(device, shutdown.clone()));
    let publish = Arc::new(RecordingPublish::default());
    let responder = Arc::new(RecordingResponder::default());
    let (tx, rx) = mpsc::unbounded_channel();

    let parts = Collaborators {
        poll: PollCycle::new(def),
        sources: vec![
            CommandSource::new("MQTT", rx).with_responder(responder.clone() as Arc<dyn ResponseSink>),
        ],
        publish: Some(publish.clone() as Arc<dyn PublishSink>),
        ..Collaborators::default()
    };
    let scheduler = Scheduler::new(
        proto,
        parts,
        config,
        None,
        shutdown,
        RestartSignal::default(),
    );
    (scheduler, publish, responder, tx)
}

#[tokio::test]
async fn poll_item_decodes_and_publishes_once_per_cycle() {
    // 100 little-endian at scale 0.1 -> 10.0
    let (mut scheduler, publish, _, _tx) = scheduler_with(
        HashMap::from([(0x0800, vec![0x64, 0x00])]),
        PollDefinition {
            items: vec![DatapointSpec::new("T1", 0x0800, 2, "0.1", true)],
            groups: CycleGroups::default(),
            interval_override: None,
        },
        continuous_config(),
    );

    for _ in 0..3 {
        scheduler.tick().await;
    }

    let published = publish.published.lock().unwrap().clone();
    assert_eq!(published.len(), 3);
    for (name, addr, value) in published {
        assert_eq!(name, "T1");
        assert_eq!(addr, 0x0800);
        assert_eq!(value, "10.0");
    }
}

#[tokio::test]
async fn cycle_divisor_skips_without_losing_the_buffer() {
    let mut groups = CycleGroups::default();
    groups.set(3, 3);
    let (mut scheduler, publish, _, _tx) = scheduler_with(
        HashMap::from([(0x5525, vec![0x2A]), (0x0802, vec![0x64, 0x00])]),
        PollDefinition {
            items: vec![
                DatapointSpec::new("Slow", 0x5525, 1, "1", false).with_cycle_group(3),
                DatapointSpec::new("Fast", 0x0802, 2, "0.1", false)
                    .with_cycle_group(EVERY_CYCLE),
            ],
            groups,
            interval_override: None,
        },
        continuous_config(),
    );

    // Run until nine full cycles have completed.
    for _ in 0..100 {
        scheduler.tick().await;
        if publish.count_for("Fast") >= 9 {
            break;
        }
    }

    assert_eq!(publish.count_for("Fast"), 9);
    // Divisor 3: read on cycles 0, 3 and 6 only.
    assert_eq!(publish.count_for("Slow"), 3);
}

#[tokio::test]
async fn bitfilter_siblings_share_one_physical_read() {
    let (mut scheduler, publish, _, _tx) = scheduler_with(
        HashMap::from([(0x2500, vec![0x12, 0x34, 0x56])]),
        PollDefinition {
            items: vec![
                DatapointSpec::new("Lo", 0x2500, 3, "b:0", false).with_scale("1", false),
                DatapointSpec::new("Mid", 0x2500, 3, "b:1", false).with_scale("1", false),
                DatapointSpec::new("Hi", 0x2500, 3, "b:2", false).with_scale("1", false),
            ],
            groups: CycleGroups::default(),
            interval_override: None,
        },
        continuous_config(),
    );

    // One tick completes the whole cycle: one read, three publications.
    scheduler.tick().await;

    let published = publish.published.lock().unwrap().clone();
    assert_eq!(
        published,
        vec![
            ("Lo".to_owned(), 0x2500, "18".to_owned()),
            ("Mid".to_owned(), 0x2500, "52".to_owned()),
            ("Hi".to_owned(), 0x2500, "86".to_owned()),
        ]
    );
}

#[tokio::test]
async fn read_command_renders_the_documented_response() {
    let (mut scheduler, _, responder, tx) = scheduler_with(
        HashMap::from([(0x0104, vec![0x01])]),
        PollDefinition::default(),
        continuous_config(),
    );
    tx.send("read;0x0104;1;bool".to_owned()).unwrap();

    scheduler.tick().await;

    assert_eq!(responder.take(), vec!["1;0x0104;True".to_owned()]);
}

#[tokio::test]
async fn write_command_echoes_the_written_value() {
    let (mut scheduler, _, responder, tx) = scheduler_with(
        HashMap::new(),
        PollDefinition::default(),
        continuous_config(),
    );
    tx.send("write;0x6300;1;48".to_owned()).unwrap();

    scheduler.tick().await;

    assert_eq!(responder.take(), vec!["1;0x6300;48".to_owned()]);
}

#[tokio::test]
async fn malformed_write_is_rejected_locally() {
    let (mut scheduler, _, responder, tx) = scheduler_with(
        HashMap::new(),
        PollDefinition::default(),
        continuous_config(),
    );
    // 300 does not fit one byte; the bus must never see this request.
    tx.send("write;0x6300;1;300".to_owned()).unwrap();

    scheduler.tick().await;

    let responses = responder.take();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].starts_with("Error:"), "got {:?}", responses[0]);
}

#[tokio::test]
async fn unknown_command_gets_an_error_response() {
    let (mut scheduler, _, responder, tx) = scheduler_with(
        HashMap::new(),
        PollDefinition::default(),
        continuous_config(),
    );
    tx.send("frobnicate".to_owned()).unwrap();

    scheduler.tick().await;

    let responses = responder.take();
    assert_eq!(responses.len(), 1);
    assert!(responses[0].contains("unknown command"));
}

#[tokio::test]
async fn reloadpoll_swaps_the_list_at_a_cycle_boundary() {
    support::init_logging();
    let device = Vs2Device::new(HashMap::from([(0x0808, vec![0x10, 0x01])]));
    let shutdown = ShutdownFlag::default();
    let proto: Box<dyn Protocol> = Box::new(Vs2Protocol::new(device, shutdown.clone()));
    let publish = Arc::new(RecordingPublish::default());
    let (tx, rx) = mpsc::unbounded_channel();

    let reloaded = PollDefinition {
        items: vec![DatapointSpec::new("Exhaust", 0x0808, 2, "0.1", false)],
        groups: CycleGroups::default(),
        interval_override: None,
    };
    let parts = Collaborators {
        poll: PollCycle::default(),
        sources: vec![CommandSource::new("MQTT", rx)],
        publish: Some(publish.clone() as Arc<dyn PublishSink>),
        datapoints: Some(Box::new(StubListSource {
            definition: Some(reloaded),
        })),
        ..Collaborators::default()
    };
    let mut scheduler = Scheduler::new(
        proto,
        parts,
        continuous_config(),
        None,
        shutdown,
        RestartSignal::default(),
    );

    // Nothing to poll yet.
    tx.send("reloadpoll".to_owned()).unwrap();
    for _ in 0..4 {
        scheduler.tick().await;
    }

    assert!(publish.count_for("Exhaust") >= 1);
}

#[tokio::test]
async fn failing_reload_keeps_the_old_list() {
    let device = Vs2Device::new(HashMap::from([(0x0800, vec![0x64, 0x00])]));
    let shutdown = ShutdownFlag::default();
    let proto: Box<dyn Protocol> = Box::new(Vs2Protocol::new(device, shutdown.clone()));
    let publish = Arc::new(RecordingPublish::default());
    let (tx, rx) = mpsc::unbounded_channel();

    let parts = Collaborators {
        poll: PollCycle::new(PollDefinition {
            items: vec![DatapointSpec::new("T1", 0x0800, 2, "0.1", true)],
            groups: CycleGroups::default(),
            interval_override: None,
        }),
        sources: vec![CommandSource::new("MQTT", rx)],
        publish: Some(publish.clone() as Arc<dyn PublishSink>),
        datapoints: Some(Box::new(StubListSource { definition: None })),
        ..Collaborators::default()
    };
    let mut scheduler = Scheduler::new(
        proto,
        parts,
        continuous_config(),
        None,
        shutdown,
        RestartSignal::default(),
    );

    tx.send("reloadpoll".to_owned()).unwrap();
    for _ in 0..4 {
        scheduler.tick().await;
    }

    // The broken source never replaced the working list.
    assert!(publish.count_for("T1") >= 1);
}

#[tokio::test]
async fn setpollcycle_changes_divisors_at_runtime() {
    let mut groups = CycleGroups::default();
    groups.set(7, 1);
    let (mut scheduler, publish, responder, tx) = scheduler_with(
        HashMap::from([(0x5525, vec![0x2A])]),
        PollDefinition {
            items: vec![DatapointSpec::new("Item", 0x5525, 1, "1", false).with_cycle_group(7)],
            groups,
            interval_override: None,
        },
        continuous_config(),
    );

    // First cycle reads the item.
    scheduler.tick().await;
    assert_eq!(publish.count_for("Item"), 1);

    // Park the item's group, then run further cycles: no more reads.
    tx.send("setpollcycle;7;-1".to_owned()).unwrap();
    for _ in 0..6 {
        scheduler.tick().await;
    }
    assert_eq!(publish.count_for("Item"), 1);
    assert!(!responder.take().is_empty());
}
