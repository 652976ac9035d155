// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-client protocol state: message id allocation, inflight tables for the
//! QoS 1/2 handshakes, and the priority queue bands feeding the inflight
//! window.

use codec::{PacketId, PublishPacket, PublishReleasePacket, QoS};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::{Delivery, Publication, WillMessage, PRIORITY_MAX};

/// Largest valid packet id.
pub const MAX_MSG_ID: PacketId = 65535;

/// Outbound QoS handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// PUBLISH sent, waiting for PUBACK (QoS 1) or PUBREC (QoS 2).
    PubSent,

    /// PUBREC arrived; PUBREL goes out next.
    PubRecReceived,

    /// PUBREL sent, waiting for PUBCOMP.
    PubRelSent,
}

/// One message in the outbound inflight window.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub packet_id: PacketId,
    pub qos: QoS,
    pub retain: bool,
    pub state: OutboundState,
    pub last_touch: Instant,
    pub publication: Arc<Publication>,
}

impl OutboundMessage {
    fn to_packet(&self, dup: bool) -> PublishPacket {
        let mut packet = PublishPacket::with_message(
            &self.publication.topic,
            self.qos,
            self.publication.payload.clone(),
        );
        packet.set_retain(self.retain).set_packet_id(self.packet_id);
        if dup {
            // Only fails for QoS 0, which never enters the window.
            let _ret = packet.set_dup(true);
        }
        packet
    }
}

/// Inbound QoS 2 exactly-once tracking. The publication is stored on
/// PUBLISH and routed only when the matching PUBREL arrives.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub packet_id: PacketId,
    pub publication: Arc<Publication>,
}

/// Result of handing a delivery to a client.
#[derive(Debug)]
pub enum DeliverAction {
    /// Send this packet now.
    Publish(PublishPacket),

    /// Parked in a queue band until the window frees up.
    Queued,

    /// Dropped by the queue limit policy.
    Dropped,
}

/// Session state that survives a disconnect of a persistent session, parked
/// in the dispatcher while the client is offline.
#[derive(Debug, Default)]
pub struct CachedSession {
    pub next_msg_id: PacketId,
    pub outbound_inflight: Vec<OutboundMessage>,
    pub inbound_inflight: Vec<InboundMessage>,
    pub queued: Vec<VecDeque<Delivery>>,
    pub discarded_msgs: u64,
}

impl CachedSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_msg_id: 1,
            outbound_inflight: Vec::new(),
            inbound_inflight: Vec::new(),
            queued: new_bands(),
            discarded_msgs: 0,
        }
    }

    /// Queue a delivery for an offline session, applying the overflow
    /// policy.
    pub fn queue_delivery(&mut self, delivery: Delivery, max_queued: usize) -> bool {
        queue_with_policy(
            &mut self.queued,
            max_queued,
            delivery,
            &mut self.discarded_msgs,
        )
    }

    #[must_use]
    pub fn queued_total(&self) -> usize {
        self.queued.iter().map(VecDeque::len).sum()
    }
}

fn new_bands() -> Vec<VecDeque<Delivery>> {
    (0..PRIORITY_MAX).map(|_| VecDeque::new()).collect()
}

/// Push `delivery` into its priority band, bounded by `max_queued` over all
/// bands. On overflow a QoS 0 message evicts the oldest queued QoS 0 message
/// (counted as discarded); a QoS 1/2 message is refused, so the sender sees
/// backpressure through the missing ack.
fn queue_with_policy(
    queued: &mut [VecDeque<Delivery>],
    max_queued: usize,
    delivery: Delivery,
    discarded: &mut u64,
) -> bool {
    let total: usize = queued.iter().map(VecDeque::len).sum();
    if max_queued > 0 && total >= max_queued {
        if delivery.qos == QoS::AtMostOnce {
            let evicted = queued.iter_mut().find_map(|band| {
                let index = band.iter().position(|d| d.qos == QoS::AtMostOnce)?;
                band.remove(index)
            });
            *discarded += 1;
            if evicted.is_none() {
                // Nothing to evict, the new message is the loser.
                return false;
            }
        } else {
            *discarded += 1;
            return false;
        }
    }
    let band = delivery.priority.band();
    queued[band].push_back(delivery);
    true
}

/// Full protocol state of one client session.
#[derive(Debug)]
pub struct ClientState {
    client_id: String,
    username: Option<String>,
    clean_session: bool,
    will: Option<WillMessage>,
    connected: bool,

    next_msg_id: PacketId,
    outbound_inflight: Vec<OutboundMessage>,
    inbound_inflight: Vec<InboundMessage>,
    queued: Vec<VecDeque<Delivery>>,
    discarded_msgs: u64,

    max_inflight: usize,
    max_queued: usize,
}

impl ClientState {
    #[must_use]
    pub fn new(
        client_id: &str,
        clean_session: bool,
        username: Option<String>,
        will: Option<WillMessage>,
        max_inflight: usize,
        max_queued: usize,
    ) -> Self {
        Self {
            client_id: client_id.to_string(),
            username,
            clean_session,
            will,
            connected: true,
            next_msg_id: 1,
            outbound_inflight: Vec::new(),
            inbound_inflight: Vec::new(),
            queued: new_bands(),
            discarded_msgs: 0,
            max_inflight,
            max_queued,
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    /// Flip the connection flag; while disconnected every delivery queues.
    /// Used by the bridge, which keeps one state across reconnects.
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Take the will for publishing on an unclean close.
    pub fn take_will(&mut self) -> Option<WillMessage> {
        self.will.take()
    }

    /// Drop the will without firing it, on DISCONNECT [MQTT-3.14.4-3] and
    /// on takeover.
    pub fn clear_will(&mut self) {
        self.will = None;
    }

    #[must_use]
    pub const fn discarded_msgs(&self) -> u64 {
        self.discarded_msgs
    }

    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.outbound_inflight.len()
    }

    #[must_use]
    pub fn queued_total(&self) -> usize {
        self.queued.iter().map(VecDeque::len).sum()
    }

    /// Adopt state parked while the session was offline.
    pub fn attach(&mut self, cached: CachedSession) {
        self.next_msg_id = cached.next_msg_id.max(1);
        self.outbound_inflight = cached.outbound_inflight;
        self.inbound_inflight = cached.inbound_inflight;
        self.queued = cached.queued;
        self.discarded_msgs += cached.discarded_msgs;
    }

    /// Merge late-arriving cached state into a running session.
    pub fn adopt(&mut self, mut cached: CachedSession) {
        self.outbound_inflight.append(&mut cached.outbound_inflight);
        self.inbound_inflight.append(&mut cached.inbound_inflight);
        for (band, mut extra) in self.queued.iter_mut().zip(cached.queued.into_iter()) {
            band.append(&mut extra);
        }
        self.discarded_msgs += cached.discarded_msgs;
    }

    /// Detach the persistent part of this session for parking. The will
    /// belongs to the connection and is not carried over.
    pub fn detach(&mut self) -> CachedSession {
        self.connected = false;
        self.will = None;
        CachedSession {
            next_msg_id: self.next_msg_id,
            outbound_inflight: std::mem::take(&mut self.outbound_inflight),
            inbound_inflight: std::mem::take(&mut self.inbound_inflight),
            queued: std::mem::replace(&mut self.queued, new_bands()),
            discarded_msgs: self.discarded_msgs,
        }
    }

    /// Allocate a packet id: linear probe from `next_msg_id` over
    /// 1..=65535, skipping ids present in either inflight table, wrapping
    /// on overflow. Returns None when the pool is exhausted; the caller
    /// queues the message then.
    pub(crate) fn assign_packet_id(&mut self) -> Option<PacketId> {
        let in_use = |id: PacketId, state: &Self| {
            state.outbound_inflight.iter().any(|m| m.packet_id == id)
                || state.inbound_inflight.iter().any(|m| m.packet_id == id)
        };
        let start = self.next_msg_id;
        loop {
            let candidate = self.next_msg_id;
            self.next_msg_id = if self.next_msg_id == MAX_MSG_ID {
                1
            } else {
                self.next_msg_id + 1
            };
            if !in_use(candidate, self) {
                return Some(candidate);
            }
            if self.next_msg_id == start {
                return None;
            }
        }
    }

    /// Hand a delivery to this client: send now if the window allows,
    /// queue or drop otherwise.
    pub fn deliver(&mut self, delivery: Delivery, now: Instant) -> DeliverAction {
        if !self.connected {
            return if queue_with_policy(
                &mut self.queued,
                self.max_queued,
                delivery,
                &mut self.discarded_msgs,
            ) {
                DeliverAction::Queued
            } else {
                DeliverAction::Dropped
            };
        }

        if delivery.qos == QoS::AtMostOnce {
            let mut packet = PublishPacket::with_message(
                &delivery.publication.topic,
                QoS::AtMostOnce,
                delivery.publication.payload.clone(),
            );
            packet.set_retain(delivery.retain);
            return DeliverAction::Publish(packet);
        }

        if self.outbound_inflight.len() >= self.max_inflight {
            return self.queue_action(delivery);
        }
        let Some(packet_id) = self.assign_packet_id() else {
            return self.queue_action(delivery);
        };

        let message = OutboundMessage {
            packet_id,
            qos: delivery.qos,
            retain: delivery.retain,
            state: OutboundState::PubSent,
            last_touch: now,
            publication: delivery.publication,
        };
        let packet = message.to_packet(false);
        self.outbound_inflight.push(message);
        DeliverAction::Publish(packet)
    }

    fn queue_action(&mut self, delivery: Delivery) -> DeliverAction {
        if queue_with_policy(
            &mut self.queued,
            self.max_queued,
            delivery,
            &mut self.discarded_msgs,
        ) {
            DeliverAction::Queued
        } else {
            DeliverAction::Dropped
        }
    }

    /// Promote queued messages into the freed window, highest priority band
    /// first, in FIFO order within a band.
    pub fn process_queued(&mut self, now: Instant) -> Vec<PublishPacket> {
        let mut packets = Vec::new();
        for band in (0..PRIORITY_MAX).rev() {
            while let Some(delivery) = self.queued[band].front() {
                if delivery.qos != QoS::AtMostOnce
                    && self.outbound_inflight.len() >= self.max_inflight
                {
                    return packets;
                }
                let delivery = self.queued[band].pop_front().expect("non-empty band");
                match self.deliver(delivery, now) {
                    DeliverAction::Publish(packet) => packets.push(packet),
                    // The window was free a moment ago; only id exhaustion
                    // can push it back, and then it stays queued.
                    DeliverAction::Queued | DeliverAction::Dropped => return packets,
                }
            }
        }
        packets
    }

    /// PUBACK received: finish the QoS 1 handshake.
    pub fn on_publish_ack(&mut self, packet_id: PacketId) -> bool {
        let before = self.outbound_inflight.len();
        self.outbound_inflight
            .retain(|m| !(m.packet_id == packet_id && m.qos == QoS::AtLeastOnce));
        before != self.outbound_inflight.len()
    }

    /// PUBREC received: move to `PubRelSent` and produce the PUBREL reply.
    pub fn on_publish_received(
        &mut self,
        packet_id: PacketId,
        now: Instant,
    ) -> Option<PublishReleasePacket> {
        let message = self
            .outbound_inflight
            .iter_mut()
            .find(|m| m.packet_id == packet_id && m.qos == QoS::ExactOnce)?;
        message.state = OutboundState::PubRecReceived;
        message.state = OutboundState::PubRelSent;
        message.last_touch = now;
        Some(PublishReleasePacket::new(packet_id))
    }

    /// PUBCOMP received: release the message.
    pub fn on_publish_complete(&mut self, packet_id: PacketId) -> bool {
        let before = self.outbound_inflight.len();
        self.outbound_inflight
            .retain(|m| !(m.packet_id == packet_id && m.state == OutboundState::PubRelSent));
        before != self.outbound_inflight.len()
    }

    /// Inbound QoS 2 PUBLISH. Stores the publication until PUBREL and
    /// returns whether this id is new; a duplicate only triggers another
    /// PUBREC, without routing twice.
    pub fn inbound_publish(&mut self, packet_id: PacketId, publication: Arc<Publication>) -> bool {
        if self
            .inbound_inflight
            .iter()
            .any(|m| m.packet_id == packet_id)
        {
            return false;
        }
        self.inbound_inflight.push(InboundMessage {
            packet_id,
            publication,
        });
        true
    }

    /// Inbound PUBREL: hand back the stored publication for routing and
    /// drop the entry. The caller replies with PUBCOMP.
    pub fn inbound_release(&mut self, packet_id: PacketId) -> Option<Arc<Publication>> {
        let index = self
            .inbound_inflight
            .iter()
            .position(|m| m.packet_id == packet_id)?;
        Some(self.inbound_inflight.remove(index).publication)
    }

    /// Retry sweep: resend whatever has been inflight longer than
    /// `retry_interval`, PUBLISH with DUP for `PubSent`, PUBREL for
    /// `PubRelSent`.
    pub fn retries(&mut self, now: Instant, retry_interval: Duration) -> Vec<RetryPacket> {
        let mut packets = Vec::new();
        for message in &mut self.outbound_inflight {
            if now.duration_since(message.last_touch) < retry_interval {
                continue;
            }
            message.last_touch = now;
            match message.state {
                OutboundState::PubSent => {
                    packets.push(RetryPacket::Publish(message.to_packet(true)));
                }
                OutboundState::PubRecReceived | OutboundState::PubRelSent => {
                    packets.push(RetryPacket::Release(PublishReleasePacket::new(
                        message.packet_id,
                    )));
                }
            }
        }
        packets
    }
}

/// A packet produced by the retry sweep.
#[derive(Debug)]
pub enum RetryPacket {
    Publish(PublishPacket),
    Release(PublishReleasePacket),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;
    use bytes::Bytes;

    fn delivery(topic: &str, qos: QoS, priority: Priority) -> Delivery {
        Delivery {
            publication: Publication::new(topic, qos, false, Bytes::from_static(b"p")),
            qos,
            retain: false,
            priority,
        }
    }

    fn state(max_inflight: usize, max_queued: usize) -> ClientState {
        ClientState::new("c", true, None, None, max_inflight, max_queued)
    }

    #[test]
    fn test_qos0_sends_directly() {
        let mut client = state(1, 10);
        let action = client.deliver(delivery("t", QoS::AtMostOnce, Priority::Normal), Instant::now());
        let DeliverAction::Publish(packet) = action else {
            panic!("qos0 must send directly");
        };
        assert_eq!(packet.qos(), QoS::AtMostOnce);
        assert_eq!(client.inflight_len(), 0);
    }

    #[test]
    fn test_inflight_window_bound() {
        let mut client = state(2, 10);
        let now = Instant::now();
        for _ in 0..2 {
            let action = client.deliver(delivery("t", QoS::AtLeastOnce, Priority::Normal), now);
            assert!(matches!(action, DeliverAction::Publish(_)));
        }
        assert_eq!(client.inflight_len(), 2);

        // Window full, the third waits in the queue.
        let action = client.deliver(delivery("t", QoS::AtLeastOnce, Priority::Normal), now);
        assert!(matches!(action, DeliverAction::Queued));
        assert_eq!(client.inflight_len(), 2);
        assert_eq!(client.queued_total(), 1);

        // Ack frees a slot; the queued message is promoted.
        assert!(client.on_publish_ack(1));
        let promoted = client.process_queued(now);
        assert_eq!(promoted.len(), 1);
        assert_eq!(client.inflight_len(), 2);
        assert_eq!(client.queued_total(), 0);
    }

    #[test]
    fn test_packet_id_skips_inflight() {
        let mut client = state(10, 10);
        let now = Instant::now();
        let DeliverAction::Publish(first) =
            client.deliver(delivery("t", QoS::AtLeastOnce, Priority::Normal), now)
        else {
            panic!();
        };
        assert_eq!(first.packet_id(), 1);

        // Occupy id 2 on the inbound side; the allocator must skip it.
        let publication = Publication::new("t", QoS::ExactOnce, false, Bytes::new());
        assert!(client.inbound_publish(2, publication));
        let DeliverAction::Publish(second) =
            client.deliver(delivery("t", QoS::AtLeastOnce, Priority::Normal), now)
        else {
            panic!();
        };
        assert_eq!(second.packet_id(), 3);
    }

    #[test]
    fn test_packet_id_wraps() {
        let mut client = state(10, 10);
        client.next_msg_id = MAX_MSG_ID;
        let now = Instant::now();
        let DeliverAction::Publish(packet) =
            client.deliver(delivery("t", QoS::AtLeastOnce, Priority::Normal), now)
        else {
            panic!();
        };
        assert_eq!(packet.packet_id(), MAX_MSG_ID);
        let DeliverAction::Publish(packet) =
            client.deliver(delivery("t", QoS::AtLeastOnce, Priority::Normal), now)
        else {
            panic!();
        };
        assert_eq!(packet.packet_id(), 1);
    }

    #[test]
    fn test_qos2_outbound_handshake() {
        let mut client = state(10, 10);
        let now = Instant::now();
        let DeliverAction::Publish(packet) =
            client.deliver(delivery("t", QoS::ExactOnce, Priority::Normal), now)
        else {
            panic!();
        };
        let id = packet.packet_id();

        let release = client.on_publish_received(id, now).expect("pubrel");
        assert_eq!(release.packet_id(), id);
        // Still inflight until PUBCOMP.
        assert_eq!(client.inflight_len(), 1);

        assert!(client.on_publish_complete(id));
        assert_eq!(client.inflight_len(), 0);
    }

    #[test]
    fn test_qos2_inbound_dedup() {
        let mut client = state(10, 10);
        let publication = Publication::new("t", QoS::ExactOnce, false, Bytes::from_static(b"p"));

        assert!(client.inbound_publish(1, publication.clone()));
        // Retransmission with DUP: acked again, not routed again.
        assert!(!client.inbound_publish(1, publication));

        let released = client.inbound_release(1).expect("stored publication");
        assert_eq!(released.topic, "t");
        // Released entries are gone.
        assert!(client.inbound_release(1).is_none());
    }

    #[test]
    fn test_queue_overflow_qos0_drops_oldest() {
        let mut client = state(1, 2);
        let now = Instant::now();
        // Fill the window, then the queue.
        client.deliver(delivery("w", QoS::AtLeastOnce, Priority::Normal), now);
        client.deliver(delivery("q0", QoS::AtMostOnce, Priority::Normal), now);
        // qos0 queues only when the client is offline; simulate.
        client.connected = false;
        client.deliver(delivery("old", QoS::AtMostOnce, Priority::Normal), now);
        client.deliver(delivery("new1", QoS::AtMostOnce, Priority::Normal), now);
        assert_eq!(client.queued_total(), 2);

        // Queue full: the oldest qos0 makes room for the newest.
        let action = client.deliver(delivery("new2", QoS::AtMostOnce, Priority::Normal), now);
        assert!(matches!(action, DeliverAction::Queued));
        assert_eq!(client.queued_total(), 2);
        assert_eq!(client.discarded_msgs(), 1);
    }

    #[test]
    fn test_queue_overflow_qos1_refused() {
        let mut client = state(1, 1);
        let now = Instant::now();
        client.deliver(delivery("w", QoS::AtLeastOnce, Priority::Normal), now);
        client.deliver(delivery("q", QoS::AtLeastOnce, Priority::Normal), now);
        assert_eq!(client.queued_total(), 1);

        let action = client.deliver(delivery("late", QoS::AtLeastOnce, Priority::Normal), now);
        assert!(matches!(action, DeliverAction::Dropped));
        assert_eq!(client.queued_total(), 1);
        assert_eq!(client.discarded_msgs(), 1);
    }

    #[test]
    fn test_priority_overtakes() {
        let mut client = state(1, 10);
        let now = Instant::now();
        client.deliver(delivery("w", QoS::AtLeastOnce, Priority::Normal), now);
        client.deliver(delivery("low", QoS::AtLeastOnce, Priority::Low), now);
        client.deliver(delivery("high", QoS::AtLeastOnce, Priority::High), now);

        client.on_publish_ack(1);
        let promoted = client.process_queued(now);
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].topic(), "high");
    }

    #[test]
    fn test_retry_sweep() {
        let mut client = state(10, 10);
        let start = Instant::now();
        client.deliver(delivery("t1", QoS::AtLeastOnce, Priority::Normal), start);
        let DeliverAction::Publish(packet) =
            client.deliver(delivery("t2", QoS::ExactOnce, Priority::Normal), start)
        else {
            panic!();
        };
        client.on_publish_received(packet.packet_id(), start);

        // Nothing is due yet.
        assert!(client
            .retries(start, Duration::from_secs(20))
            .is_empty());

        let later = start + Duration::from_secs(21);
        let retries = client.retries(later, Duration::from_secs(20));
        assert_eq!(retries.len(), 2);
        match &retries[0] {
            RetryPacket::Publish(packet) => {
                assert!(packet.dup());
                assert_eq!(packet.topic(), "t1");
            }
            RetryPacket::Release(_) => panic!("expected dup publish"),
        }
        assert!(matches!(retries[1], RetryPacket::Release(_)));

        // Re-stamped, so an immediate second sweep is empty.
        assert!(client
            .retries(later, Duration::from_secs(20))
            .is_empty());
    }

    #[test]
    fn test_detach_attach_round_trip() {
        let mut client = state(1, 10);
        let now = Instant::now();
        client.deliver(delivery("inflight", QoS::AtLeastOnce, Priority::Normal), now);
        client.deliver(delivery("queued", QoS::AtLeastOnce, Priority::Normal), now);

        let cached = client.detach();
        assert_eq!(cached.outbound_inflight.len(), 1);
        assert_eq!(cached.queued_total(), 1);

        let mut resumed = ClientState::new("c", false, None, None, 1, 10);
        resumed.attach(cached);
        assert_eq!(resumed.inflight_len(), 1);
        assert_eq!(resumed.queued_total(), 1);
    }
}
