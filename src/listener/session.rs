// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Session cmd handlers: per-packet protocol dispatch against the client
//! state.

use bytes::Bytes;
use codec::utils::random_client_id;
use codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, QoS, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket,
};
use std::time::Instant;

use super::{Listener, PendingConnect};
use crate::acl::Access;
use crate::commands::{
    ListenerToAuthCmd, ListenerToDispatcherCmd, ListenerToSessionCmd, SessionToListenerCmd,
};
use crate::error::Error;
use crate::types::{Publication, SessionGid, SessionId, WillMessage};

impl Listener {
    pub(super) async fn handle_session_cmd(
        &mut self,
        cmd: SessionToListenerCmd,
    ) -> Result<(), Error> {
        match cmd {
            SessionToListenerCmd::Connect(session_id, packet) => {
                self.on_session_connect(session_id, packet).await
            }
            SessionToListenerCmd::Publish(session_id, packet) => {
                self.on_session_publish(session_id, packet).await
            }
            SessionToListenerCmd::PublishAck(session_id, packet) => {
                self.on_session_publish_ack(session_id, packet.packet_id())
                    .await
            }
            SessionToListenerCmd::PublishReceived(session_id, packet) => {
                self.on_session_publish_received(session_id, packet.packet_id())
                    .await
            }
            SessionToListenerCmd::PublishRelease(session_id, packet) => {
                self.on_session_publish_release(session_id, packet.packet_id())
                    .await
            }
            SessionToListenerCmd::PublishComplete(session_id, packet) => {
                self.on_session_publish_complete(session_id, packet.packet_id())
                    .await
            }
            SessionToListenerCmd::Subscribe(session_id, packet) => {
                self.on_session_subscribe(session_id, packet).await
            }
            SessionToListenerCmd::Unsubscribe(session_id, packet) => {
                self.on_session_unsubscribe(session_id, packet).await
            }
            SessionToListenerCmd::Disconnect(session_id) => {
                self.close_session(session_id, true).await
            }
            SessionToListenerCmd::ConnectionClosed(session_id) => {
                self.close_session(session_id, false).await
            }
        }
    }

    pub(super) async fn send_to_session(
        &mut self,
        session_id: SessionId,
        cmd: ListenerToSessionCmd,
    ) -> Result<(), Error> {
        if let Some(session_sender) = self.session_senders.get(&session_id) {
            session_sender.send(cmd).await.map_err(Into::into)
        } else {
            Err(Error::session_error(session_id))
        }
    }

    pub(super) const fn session_gid(&self, session_id: SessionId) -> SessionGid {
        SessionGid::new(self.id, session_id)
    }

    async fn on_session_connect(
        &mut self,
        session_id: SessionId,
        packet: ConnectPacket,
    ) -> Result<(), Error> {
        let clean_session = packet.connect_flags().clean_session;

        // A zero byte client id is allowed for a clean session and gets a
        // generated one [MQTT-3.1.3-6]; with clean session 0 it is rejected
        // with return code 0x02 [MQTT-3.1.3-8].
        let client_id = if packet.client_id().is_empty() {
            if !clean_session || !self.general.allow_empty_client_id {
                return self
                    .send_to_session(
                        session_id,
                        ListenerToSessionCmd::ConnectAck(ConnectAckPacket::new(
                            false,
                            ConnectReturnCode::IdentifierRejected,
                        )),
                    )
                    .await;
            }
            random_client_id()
        } else {
            packet.client_id().to_string()
        };

        if !self.general.clientid_prefixes.is_empty()
            && !self
                .general
                .clientid_prefixes
                .iter()
                .any(|prefix| client_id.starts_with(prefix.as_str()))
        {
            log::info!("listener: Client id {client_id} does not match allowed prefixes");
            return self
                .send_to_session(
                    session_id,
                    ListenerToSessionCmd::ConnectAck(ConnectAckPacket::new(
                        false,
                        ConnectReturnCode::IdentifierRejected,
                    )),
                )
                .await;
        }

        let will = packet.will_topic().map(|topic| WillMessage {
            topic: topic.as_ref().to_string(),
            payload: Bytes::copy_from_slice(packet.will_message()),
            qos: packet.connect_flags().will_qos,
            retain: packet.connect_flags().will_retain,
        });
        let username = if packet.username().is_empty() {
            None
        } else {
            Some(packet.username().to_string())
        };

        self.pending.insert(
            session_id,
            PendingConnect {
                client_id,
                clean_session,
                username,
                will,
                announced: false,
            },
        );

        // The auth app answers with a connect return code.
        self.auth_sender
            .send(ListenerToAuthCmd::RequestAuth(
                self.session_gid(session_id),
                packet.username().to_string(),
                packet.password().to_vec(),
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_publish(
        &mut self,
        session_id: SessionId,
        packet: PublishPacket,
    ) -> Result<(), Error> {
        let Some(client) = self.clients.get_mut(&session_id) else {
            // PUBLISH before CONNACK completes is a protocol violation.
            return self
                .send_to_session(session_id, ListenerToSessionCmd::Disconnect)
                .await;
        };
        let client_id = client.client_id().to_string();

        // A denied publish drops the connection; there is no negative
        // acknowledgement in the protocol.
        if !self
            .acl
            .allow(client.username(), &client_id, packet.topic(), Access::Write)
        {
            log::warn!(
                "listener: Publish to {} denied for client {client_id}",
                packet.topic()
            );
            return self
                .send_to_session(session_id, ListenerToSessionCmd::Disconnect)
                .await;
        }

        let publication = Publication::new(
            packet.topic(),
            packet.qos(),
            packet.retain(),
            packet.message().clone(),
        );

        match packet.qos() {
            QoS::AtMostOnce => {
                self.dispatcher_sender
                    .send(ListenerToDispatcherCmd::Publish(client_id, publication))
                    .await?;
            }
            QoS::AtLeastOnce => {
                self.dispatcher_sender
                    .send(ListenerToDispatcherCmd::Publish(client_id, publication))
                    .await?;
                let ack_packet = PublishAckPacket::new(packet.packet_id());
                self.send_to_session(session_id, ListenerToSessionCmd::PublishAck(ack_packet))
                    .await?;
            }
            QoS::ExactOnce => {
                // Store until PUBREL; a duplicate id is acknowledged again
                // without routing twice.
                let client = self.clients.get_mut(&session_id).expect("checked above");
                let _is_new = client.inbound_publish(packet.packet_id(), publication);
                let ack_packet = PublishReceivedPacket::new(packet.packet_id());
                self.send_to_session(
                    session_id,
                    ListenerToSessionCmd::PublishReceived(ack_packet),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn on_session_publish_release(
        &mut self,
        session_id: SessionId,
        packet_id: codec::PacketId,
    ) -> Result<(), Error> {
        if let Some(client) = self.clients.get_mut(&session_id) {
            let client_id = client.client_id().to_string();
            if let Some(publication) = client.inbound_release(packet_id) {
                self.dispatcher_sender
                    .send(ListenerToDispatcherCmd::Publish(client_id, publication))
                    .await?;
            } else {
                log::warn!("listener: PUBREL for unknown packet id {packet_id}");
            }
            // PUBCOMP is the response to PUBREL regardless, so a retried
            // PUBREL converges.
            let ack_packet = PublishCompletePacket::new(packet_id);
            return self
                .send_to_session(
                    session_id,
                    ListenerToSessionCmd::PublishComplete(ack_packet),
                )
                .await;
        }
        Err(Error::session_error(session_id))
    }

    async fn on_session_publish_ack(
        &mut self,
        session_id: SessionId,
        packet_id: codec::PacketId,
    ) -> Result<(), Error> {
        if let Some(client) = self.clients.get_mut(&session_id) {
            if !client.on_publish_ack(packet_id) {
                log::warn!("listener: PUBACK for unknown packet id {packet_id}");
            }
            return self.promote_queued(session_id).await;
        }
        Err(Error::session_error(session_id))
    }

    async fn on_session_publish_received(
        &mut self,
        session_id: SessionId,
        packet_id: codec::PacketId,
    ) -> Result<(), Error> {
        if let Some(client) = self.clients.get_mut(&session_id) {
            if let Some(release) = client.on_publish_received(packet_id, Instant::now()) {
                return self
                    .send_to_session(session_id, ListenerToSessionCmd::PublishRelease(release))
                    .await;
            }
            log::warn!("listener: PUBREC for unknown packet id {packet_id}");
            return Ok(());
        }
        Err(Error::session_error(session_id))
    }

    async fn on_session_publish_complete(
        &mut self,
        session_id: SessionId,
        packet_id: codec::PacketId,
    ) -> Result<(), Error> {
        if let Some(client) = self.clients.get_mut(&session_id) {
            if !client.on_publish_complete(packet_id) {
                log::warn!("listener: PUBCOMP for unknown packet id {packet_id}");
            }
            return self.promote_queued(session_id).await;
        }
        Err(Error::session_error(session_id))
    }

    /// Move queued messages into the freed inflight window and send them.
    pub(super) async fn promote_queued(&mut self, session_id: SessionId) -> Result<(), Error> {
        let Some(client) = self.clients.get_mut(&session_id) else {
            return Ok(());
        };
        let packets = client.process_queued(Instant::now());
        for packet in packets {
            self.send_to_session(session_id, ListenerToSessionCmd::Publish(packet))
                .await?;
        }
        Ok(())
    }

    async fn on_session_subscribe(
        &mut self,
        session_id: SessionId,
        packet: SubscribePacket,
    ) -> Result<(), Error> {
        let Some(client) = self.clients.get(&session_id) else {
            return self
                .send_to_session(session_id, ListenerToSessionCmd::Disconnect)
                .await;
        };
        let client_id = client.client_id().to_string();
        let durable = !client.clean_session();

        // Any denied filter drops the connection; no partial SUBACK is
        // sent.
        for topic in packet.topics() {
            if !self.acl.allow(
                client.username(),
                &client_id,
                topic.filter().filter(),
                Access::Read,
            ) {
                log::warn!(
                    "listener: Subscribe to {} denied for client {client_id}",
                    topic.filter().filter()
                );
                return self
                    .send_to_session(session_id, ListenerToSessionCmd::Disconnect)
                    .await;
            }
        }

        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::Subscribe(
                self.session_gid(session_id),
                client_id,
                durable,
                packet,
            ))
            .await
            .map_err(Into::into)
    }

    async fn on_session_unsubscribe(
        &mut self,
        session_id: SessionId,
        packet: UnsubscribePacket,
    ) -> Result<(), Error> {
        let Some(client) = self.clients.get(&session_id) else {
            return self
                .send_to_session(session_id, ListenerToSessionCmd::Disconnect)
                .await;
        };
        let client_id = client.client_id().to_string();
        let packet_id = packet.packet_id();

        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::Unsubscribe(
                self.session_gid(session_id),
                client_id,
                packet,
            ))
            .await?;

        let ack_packet = UnsubscribeAckPacket::new(packet_id);
        self.send_to_session(session_id, ListenerToSessionCmd::UnsubscribeAck(ack_packet))
            .await
    }

    /// Tear down a session. `clean_close` is true when a DISCONNECT packet
    /// arrived, so the will is discarded [MQTT-3.14.4-3]; otherwise the
    /// will, if any, is published.
    pub(super) async fn close_session(
        &mut self,
        session_id: SessionId,
        clean_close: bool,
    ) -> Result<(), Error> {
        self.session_senders.remove(&session_id);

        if let Some(mut client) = self.clients.remove(&session_id) {
            let client_id = client.client_id().to_string();
            // A takeover may have rebound the client id to a newer session.
            if self.client_ids.get(&client_id) == Some(&session_id) {
                self.client_ids.remove(&client_id);
            }

            if !clean_close {
                if let Some(will) = client.take_will() {
                    log::info!(
                        "listener: Publishing will of {client_id} to {}",
                        will.topic
                    );
                    let publication =
                        Publication::new(&will.topic, will.qos, will.retain, will.payload);
                    self.dispatcher_sender
                        .send(ListenerToDispatcherCmd::Publish(
                            client_id.clone(),
                            publication,
                        ))
                        .await?;
                }
            }

            if client.clean_session() {
                self.dispatcher_sender
                    .send(ListenerToDispatcherCmd::SessionClosed(
                        self.session_gid(session_id),
                        client_id,
                    ))
                    .await?;
            } else {
                self.dispatcher_sender
                    .send(ListenerToDispatcherCmd::SessionStored(
                        self.session_gid(session_id),
                        client_id,
                        client.detach(),
                    ))
                    .await?;
            }
            return Ok(());
        }

        if let Some(pending) = self.pending.remove(&session_id) {
            if pending.announced {
                // The dispatcher may already hold a route for this session.
                self.dispatcher_sender
                    .send(ListenerToDispatcherCmd::SessionClosed(
                        self.session_gid(session_id),
                        pending.client_id,
                    ))
                    .await?;
            }
        }
        Ok(())
    }

    /// Silently kick a session that lost its client id to a newer
    /// connection: no will, state parked for the dispatcher to hand over.
    pub(super) async fn takeover_session(&mut self, session_id: SessionId) -> Result<(), Error> {
        if let Some(mut client) = self.clients.remove(&session_id) {
            let client_id = client.client_id().to_string();
            if self.client_ids.get(&client_id) == Some(&session_id) {
                self.client_ids.remove(&client_id);
            }
            client.clear_will();
            self.dispatcher_sender
                .send(ListenerToDispatcherCmd::SessionStored(
                    self.session_gid(session_id),
                    client_id,
                    client.detach(),
                ))
                .await?;
        }
        // Close the socket without a will.
        if self.session_senders.contains_key(&session_id) {
            self.send_to_session(session_id, ListenerToSessionCmd::Disconnect)
                .await?;
        }
        Ok(())
    }
}
