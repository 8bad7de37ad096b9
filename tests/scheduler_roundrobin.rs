// SPDX-FileCopyrightText: Copyright (c) 2024-2026 optolink-bridge contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Round-robin scheduler invariants against an in-memory VS2 device.

mod support;

use std::{collections::HashMap, sync::Arc};

use optolink_bridge::{
    config::BridgeConfig,
    poll::{CycleGroups, DatapointSpec, PollCycle, PollDefinition},
    proto::{Protocol, Vs2Protocol},
    relay::FrameMailbox,
    scheduler::{Collaborators, CommandSource, Scheduler, ViconLink},
    sink::{PublishSink, ResponseSink},
    transport::SharedPort,
    RestartSignal, ShutdownFlag,
};
use tokio::sync::mpsc;

use support::{vs2_read_frame, vs2_response, RecordingPort, RecordingPublish, RecordingResponder, Vs2Device};

fn test_config() -> BridgeConfig {
    BridgeConfig {
        poll_interval_secs: 0.0, // continuous
        olbreath_secs: 0.0,
        ..BridgeConfig::default()
    }
}

fn poll_list(items: Vec<DatapointSpec>) -> PollCycle {
    PollCycle::new(PollDefinition {
        items,
        groups: CycleGroups::default(),
        interval_override: None,
    })
}

struct Fixture {
    scheduler: Scheduler,
    publish: Arc<RecordingPublish>,
    responder_a: Arc<RecordingResponder>,
    responder_b: Arc<RecordingResponder>,
    queue_a: mpsc::UnboundedSender<String>,
    queue_b: mpsc::UnboundedSender<String>,
    ops: support::OpLog,
}

fn fixture(
    datapoints: HashMap<u16, Vec<u8>>,
    poll: PollCycle,
    config: BridgeConfig,
    vicon: Option<ViconLink>,
) -> Fixture {
    let device = Vs2Device::new(datapoints);
    let ops = device.ops.clone();
    let shutdown = ShutdownFlag::default();
    let proto: Box<dyn Protocol> = Box::new(Vs2Protocol::new(device, shutdown.clone()));

    let publish = Arc::new(RecordingPublish::default());
    let responder_a = Arc::new(RecordingResponder::default());
    let responder_b = Arc::new(RecordingResponder::default());
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();

    let parts = Collaborators {
        poll,
        sources: vec![
            CommandSource::new("MQTT", rx_a)
                .with_responder(responder_a.clone() as Arc<dyn ResponseSink>),
            CommandSource::new("TCP", rx_b)
                .with_responder(responder_b.clone() as Arc<dyn ResponseSink>),
        ],
        publish: Some(publish.clone() as Arc<dyn PublishSink>),
        ..Collaborators::default()
    };

    let scheduler = Scheduler::new(
        proto,
        parts,
        config,
        vicon,
        shutdown,
        RestartSignal::default(),
    );
    Fixture {
        scheduler,
        publish,
        responder_a,
        responder_b,
        queue_a: tx_a,
        queue_b: tx_b,
        ops,
    }
}

#[tokio::test]
async fn single_outstanding_request() {
    let mut fx = fixture(
        HashMap::from([(0x0800, vec![0x64, 0x00]), (0x0104, vec![0x01])]),
        poll_list(vec![DatapointSpec::new("T1", 0x0800, 2, "0.1", true)]),
        test_config(),
        None,
    );
    fx.queue_a.send("read;0x0104;1;bool".to_owned()).unwrap();
    fx.queue_b.send("read;0x0104;1".to_owned()).unwrap();

    for _ in 0..6 {
        fx.scheduler.tick().await;
    }

    // Between any two writes there is at least one read: the link never
    // carries two outstanding requests.
    let ops = fx.ops.lock().unwrap().clone();
    assert!(ops.contains(&'W'));
    for pair in ops.windows(2) {
        assert_ne!(pair, ['W', 'W'], "two writes without an intervening read");
    }
}

#[tokio::test]
async fn rotation_is_fair_under_saturation() {
    let mut fx = fixture(
        HashMap::from([(0x0800, vec![0x64, 0x00]), (0x0104, vec![0x01])]),
        poll_list(vec![DatapointSpec::new("T1", 0x0800, 2, "0.1", true)]),
        test_config(),
        None,
    );
    for _ in 0..3 {
        fx.queue_a.send("read;0x0104;1".to_owned()).unwrap();
        fx.queue_b.send("read;0x0104;1".to_owned()).unwrap();
    }

    // Nine ticks with all three sources saturated: each gets exactly
    // three turns, no source is served twice before the others.
    for _ in 0..9 {
        fx.scheduler.tick().await;
    }

    assert_eq!(fx.publish.count_for("T1"), 3);
    assert_eq!(fx.responder_a.take().len(), 3);
    assert_eq!(fx.responder_b.take().len(), 3);
}

#[tokio::test]
async fn empty_sources_do_not_stall_the_rest() {
    let mut fx = fixture(
        HashMap::from([(0x0104, vec![0x01])]),
        poll_list(Vec::new()),
        test_config(),
        None,
    );
    fx.queue_b.send("read;0x0104;1".to_owned()).unwrap();

    // Poll list empty, queue A empty: queue B is still served on the
    // first tick.
    assert!(fx.scheduler.tick().await);
    assert_eq!(fx.responder_b.take().len(), 1);
}

#[tokio::test]
async fn passthrough_outranks_the_rotation_and_echoes() {
    let mailbox = FrameMailbox::default();
    let echo_port = RecordingPort::default();
    let echoed = echo_port.written.clone();
    let vicon = ViconLink {
        mailbox: mailbox.clone(),
        echo: SharedPort::new(Box::new(echo_port)),
    };

    let mut fx = fixture(
        HashMap::from([(0x0802, vec![0x64, 0x00]), (0x0104, vec![0x01])]),
        poll_list(Vec::new()),
        test_config(),
        Some(vicon),
    );
    fx.queue_a.send("read;0x0104;1".to_owned()).unwrap();
    mailbox.put(vs2_read_frame(0x0802, 2));

    // One tick: the staged passthrough frame is forwarded first, then
    // one rotation source is serviced.
    assert!(fx.scheduler.tick().await);

    // Every response byte was echoed back to the secondary device.
    assert_eq!(*echoed.lock().unwrap(), vs2_response(0x0802, &[0x64, 0x00]));
    // The command queue was still serviced in the same tick.
    assert_eq!(fx.responder_a.take().len(), 1);
    // Both directions were reported.
    assert_eq!(fx.publish.traffic.lock().unwrap().len(), 2);
    // The mailbox is consumed.
    assert!(mailbox.take().is_none());
}
