// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use codec::{QoS, SubscribePacket};
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver};

use super::Dispatcher;
use crate::acl::AclStore;
use crate::commands::{
    BridgeToDispatcherCmd, DispatcherToBridgeCmd, DispatcherToListenerCmd, DispatcherToMetricsCmd,
    ListenerToDispatcherCmd,
};
use crate::config;
use crate::listener::CachedSession;
use crate::types::{Priority, Publication, SessionGid};

struct Harness {
    dispatcher: Dispatcher,
    listener_rx: Vec<Receiver<DispatcherToListenerCmd>>,
    bridge_rx: Receiver<DispatcherToBridgeCmd>,
    _metrics_rx: Receiver<DispatcherToMetricsCmd>,
}

fn harness(n_listeners: u32) -> Harness {
    let acl = Arc::new(AclStore::load(None).unwrap());
    let general = config::General::default();
    let storage = config::Storage::default();

    let mut listener_senders = Vec::new();
    let mut listener_rx = Vec::new();
    for listener_id in 0..n_listeners {
        let (tx, rx) = mpsc::channel(64);
        listener_senders.push((listener_id, tx));
        listener_rx.push(rx);
    }
    let (_listener_tx, listener_cmd_rx) = mpsc::channel(1);
    let (bridge_tx, bridge_rx) = mpsc::channel(64);
    let (_bridge_cmd_tx, bridge_cmd_rx) = mpsc::channel(1);
    let (metrics_tx, metrics_rx) = mpsc::channel(1024);
    let (_metrics_cmd_tx, metrics_cmd_rx) = mpsc::channel(1);
    let (_server_tx, server_rx) = mpsc::channel(1);

    let dispatcher = Dispatcher::new(
        acl,
        general,
        storage,
        listener_senders,
        listener_cmd_rx,
        bridge_tx,
        bridge_cmd_rx,
        metrics_tx,
        metrics_cmd_rx,
        server_rx,
    );
    Harness {
        dispatcher,
        listener_rx,
        bridge_rx,
        _metrics_rx: metrics_rx,
    }
}

async fn connect(harness: &mut Harness, gid: SessionGid, client_id: &str, clean: bool) {
    harness
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::SessionConnected(
            gid,
            client_id.to_string(),
            clean,
            None,
        ))
        .await
        .unwrap();
}

async fn subscribe(harness: &mut Harness, gid: SessionGid, client_id: &str, filter: &str, qos: QoS) {
    let packet = SubscribePacket::new(filter, qos, 1).unwrap();
    harness
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::Subscribe(
            gid,
            client_id.to_string(),
            false,
            packet,
        ))
        .await
        .unwrap();
}

async fn publish(harness: &mut Harness, publisher: &str, publication: Arc<Publication>) {
    harness
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::Publish(
            publisher.to_string(),
            publication,
        ))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_qos0_delivery() {
    let mut harness = harness(1);
    let gid = SessionGid::new(0, 1);

    connect(&mut harness, gid, "b", true).await;
    let ready = harness.listener_rx[0].recv().await.unwrap();
    assert!(matches!(
        ready,
        DispatcherToListenerCmd::SessionReady(1, _, false, None)
    ));

    subscribe(&mut harness, gid, "b", "topic/x", QoS::AtMostOnce).await;
    let ack = harness.listener_rx[0].recv().await.unwrap();
    assert!(matches!(ack, DispatcherToListenerCmd::SubscribeAck(1, _)));

    let publication = Publication::new(
        "topic/x",
        QoS::AtMostOnce,
        false,
        Bytes::from_static(b"hi"),
    );
    publish(&mut harness, "a", publication).await;

    let delivered = harness.listener_rx[0].recv().await.unwrap();
    let DispatcherToListenerCmd::Publish(1, delivery) = delivered else {
        panic!("expected publish, got {delivered:?}");
    };
    assert_eq!(delivery.qos, QoS::AtMostOnce);
    assert!(!delivery.retain);
    assert_eq!(delivery.publication.payload.as_ref(), b"hi");
}

#[tokio::test]
async fn test_effective_qos_is_min() {
    let mut harness = harness(1);
    let gid = SessionGid::new(0, 1);
    connect(&mut harness, gid, "b", true).await;
    subscribe(&mut harness, gid, "b", "topic/x", QoS::AtLeastOnce).await;
    // Drop SessionReady and SubscribeAck.
    let _ready = harness.listener_rx[0].recv().await.unwrap();
    let _ack = harness.listener_rx[0].recv().await.unwrap();

    let publication = Publication::new("topic/x", QoS::ExactOnce, false, Bytes::from_static(b"p"));
    publish(&mut harness, "a", publication).await;

    let DispatcherToListenerCmd::Publish(_, delivery) =
        harness.listener_rx[0].recv().await.unwrap()
    else {
        panic!("expected publish");
    };
    assert_eq!(delivery.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_retained_lifecycle() {
    let mut harness = harness(1);
    let gid = SessionGid::new(0, 1);

    // Retained publish with no subscribers yet.
    let publication = Publication::new("cfg/k", QoS::AtLeastOnce, true, Bytes::from_static(b"v"));
    publish(&mut harness, "a", publication).await;

    // A later subscriber replays it, retain flag set.
    connect(&mut harness, gid, "b", true).await;
    let _ready = harness.listener_rx[0].recv().await.unwrap();
    subscribe(&mut harness, gid, "b", "cfg/#", QoS::AtLeastOnce).await;
    let _ack = harness.listener_rx[0].recv().await.unwrap();
    let DispatcherToListenerCmd::Publish(_, delivery) =
        harness.listener_rx[0].recv().await.unwrap()
    else {
        panic!("expected retained replay");
    };
    assert!(delivery.retain);
    assert_eq!(delivery.publication.topic, "cfg/k");
    assert_eq!(delivery.publication.payload.as_ref(), b"v");

    // Zero length payload deletes the entry; a fresh subscriber gets
    // nothing.
    let deletion = Publication::new("cfg/k", QoS::AtLeastOnce, true, Bytes::new());
    publish(&mut harness, "a", deletion).await;
    // The live subscriber still receives the deleting publish itself.
    let _live = harness.listener_rx[0].recv().await.unwrap();

    let gid2 = SessionGid::new(0, 2);
    connect(&mut harness, gid2, "c", true).await;
    let _ready = harness.listener_rx[0].recv().await.unwrap();
    subscribe(&mut harness, gid2, "c", "cfg/#", QoS::AtLeastOnce).await;
    let _ack = harness.listener_rx[0].recv().await.unwrap();
    assert!(harness.listener_rx[0].try_recv().is_err());
}

#[tokio::test]
async fn test_persistent_session_queues_offline() {
    let mut harness = harness(1);
    let gid = SessionGid::new(0, 1);

    connect(&mut harness, gid, "b", false).await;
    let _ready = harness.listener_rx[0].recv().await.unwrap();
    subscribe(&mut harness, gid, "b", "foo", QoS::AtLeastOnce).await;
    let _ack = harness.listener_rx[0].recv().await.unwrap();

    // The session goes away; its state is parked.
    harness
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::SessionStored(
            gid,
            "b".to_string(),
            CachedSession::new(),
        ))
        .await
        .unwrap();

    // A publish while offline is queued, nothing reaches the listener.
    let publication = Publication::new("foo", QoS::AtLeastOnce, false, Bytes::from_static(b"1"));
    publish(&mut harness, "a", publication).await;
    assert!(harness.listener_rx[0].try_recv().is_err());

    // On reconnect the queued message comes back with the session state.
    let gid2 = SessionGid::new(0, 7);
    connect(&mut harness, gid2, "b", false).await;
    let DispatcherToListenerCmd::SessionReady(7, _, session_present, cached) =
        harness.listener_rx[0].recv().await.unwrap()
    else {
        panic!("expected session ready");
    };
    assert!(session_present);
    let cached = cached.expect("parked session state");
    assert_eq!(cached.queued_total(), 1);
}

#[tokio::test]
async fn test_clean_reconnect_discards_state() {
    let mut harness = harness(1);
    let gid = SessionGid::new(0, 1);

    connect(&mut harness, gid, "b", false).await;
    let _ready = harness.listener_rx[0].recv().await.unwrap();
    subscribe(&mut harness, gid, "b", "foo", QoS::AtLeastOnce).await;
    let _ack = harness.listener_rx[0].recv().await.unwrap();
    harness
        .dispatcher
        .handle_listener_cmd(ListenerToDispatcherCmd::SessionStored(
            gid,
            "b".to_string(),
            CachedSession::new(),
        ))
        .await
        .unwrap();

    // Clean reconnect: no session present, no cached state, and the old
    // subscription is gone.
    let gid2 = SessionGid::new(0, 2);
    connect(&mut harness, gid2, "b", true).await;
    let DispatcherToListenerCmd::SessionReady(2, _, session_present, cached) =
        harness.listener_rx[0].recv().await.unwrap()
    else {
        panic!("expected session ready");
    };
    assert!(!session_present);
    assert!(cached.is_none());

    let publication = Publication::new("foo", QoS::AtLeastOnce, false, Bytes::from_static(b"1"));
    publish(&mut harness, "a", publication).await;
    assert!(harness.listener_rx[0].try_recv().is_err());
}

#[tokio::test]
async fn test_bridge_no_local() {
    let mut harness = harness(1);

    harness
        .dispatcher
        .handle_bridge_cmd(BridgeToDispatcherCmd::Subscribe(
            "veles.edge".to_string(),
            "t/#".to_string(),
            QoS::AtMostOnce,
            Priority::Normal,
        ))
        .await
        .unwrap();

    // A publication injected by the bridge itself must not bounce back.
    let publication = Publication::new("t/x", QoS::AtMostOnce, false, Bytes::from_static(b"p"));
    harness
        .dispatcher
        .handle_bridge_cmd(BridgeToDispatcherCmd::Publish(
            "veles.edge".to_string(),
            publication,
        ))
        .await
        .unwrap();
    assert!(harness.bridge_rx.try_recv().is_err());

    // A local publication is forwarded to the bridge.
    let publication = Publication::new("t/x", QoS::AtMostOnce, false, Bytes::from_static(b"p"));
    publish(&mut harness, "someone", publication).await;
    let DispatcherToBridgeCmd::Publish(client_id, delivery) =
        harness.bridge_rx.recv().await.unwrap();
    assert_eq!(client_id, "veles.edge");
    assert_eq!(delivery.publication.topic, "t/x");
}

#[tokio::test]
async fn test_cross_listener_takeover() {
    let mut harness = harness(2);
    let gid_old = SessionGid::new(0, 1);
    let gid_new = SessionGid::new(1, 5);

    connect(&mut harness, gid_old, "c", true).await;
    let _ready = harness.listener_rx[0].recv().await.unwrap();

    connect(&mut harness, gid_new, "c", true).await;
    // The old listener is told to kick its session silently.
    let takeover = harness.listener_rx[0].recv().await.unwrap();
    assert!(matches!(takeover, DispatcherToListenerCmd::Takeover(1)));
    let ready = harness.listener_rx[1].recv().await.unwrap();
    assert!(matches!(
        ready,
        DispatcherToListenerCmd::SessionReady(5, _, false, None)
    ));
}

#[tokio::test]
async fn test_publication_refcount() {
    let mut harness = harness(1);
    for (session_id, client_id) in [(1, "b"), (2, "c")] {
        let gid = SessionGid::new(0, session_id);
        connect(&mut harness, gid, client_id, true).await;
        let _ready = harness.listener_rx[0].recv().await.unwrap();
        subscribe(&mut harness, gid, client_id, "t", QoS::AtMostOnce).await;
        let _ack = harness.listener_rx[0].recv().await.unwrap();
    }

    let publication = Publication::new("t", QoS::AtMostOnce, false, Bytes::from_static(b"p"));
    publish(&mut harness, "a", publication.clone()).await;

    let mut deliveries = Vec::new();
    for _ in 0..2 {
        let DispatcherToListenerCmd::Publish(_, delivery) =
            harness.listener_rx[0].recv().await.unwrap()
        else {
            panic!("expected publish");
        };
        deliveries.push(delivery);
    }

    // One owner here plus one clone per undelivered recipient.
    assert_eq!(Arc::strong_count(&publication), 1 + deliveries.len());
    deliveries.clear();
    assert_eq!(Arc::strong_count(&publication), 1);
}
