// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Listener cmd handlers.

use codec::{SubscribeAck, SubscribeAckPacket, SubscribePacket, UnsubscribePacket};
use std::sync::Arc;

use super::{Dispatcher, OfflineSession, Route, RouteTarget};
use crate::acl::Access;
use crate::commands::{DispatcherToListenerCmd, DispatcherToMetricsCmd, ListenerToDispatcherCmd};
use crate::error::Error;
use crate::listener::CachedSession;
use crate::types::{Delivery, Priority, Publication, SessionGid};

impl Dispatcher {
    pub(super) async fn handle_listener_cmd(
        &mut self,
        cmd: ListenerToDispatcherCmd,
    ) -> Result<(), Error> {
        match cmd {
            ListenerToDispatcherCmd::Publish(publisher_id, publication) => {
                self.metrics_send(DispatcherToMetricsCmd::PublishPacketReceived(
                    1,
                    publication.payload.len(),
                ))
                .await;
                self.route_publish(&publisher_id, publication).await
            }
            ListenerToDispatcherCmd::Subscribe(session_gid, client_id, durable, packet) => {
                self.on_listener_subscribe(session_gid, &client_id, durable, &packet)
                    .await
            }
            ListenerToDispatcherCmd::Unsubscribe(session_gid, client_id, packet) => {
                self.on_listener_unsubscribe(session_gid, &client_id, &packet)
                    .await
            }
            ListenerToDispatcherCmd::SessionConnected(session_gid, client_id, clean, username) => {
                self.on_session_connected(session_gid, client_id, clean, username)
                    .await
            }
            ListenerToDispatcherCmd::SessionStored(session_gid, client_id, cached) => {
                self.on_session_stored(session_gid, client_id, cached).await
            }
            ListenerToDispatcherCmd::SessionClosed(session_gid, client_id) => {
                self.on_session_closed(session_gid, &client_id).await
            }
        }
    }

    async fn on_listener_subscribe(
        &mut self,
        session_gid: SessionGid,
        client_id: &str,
        durable: bool,
        packet: &SubscribePacket,
    ) -> Result<(), Error> {
        let mut ack_vec = Vec::new();
        let mut added = 0;
        for topic in packet.topics() {
            match self.engine.subscribe(
                client_id,
                topic.filter().filter(),
                topic.qos(),
                false,
                durable,
                Priority::Normal,
            ) {
                Ok(is_new) => {
                    if is_new {
                        added += 1;
                    }
                    ack_vec.push(SubscribeAck::QoS(topic.qos()));
                }
                Err(err) => {
                    log::error!(
                        "dispatcher: Invalid subscribe filter {}: {err:?}",
                        topic.filter().filter()
                    );
                    ack_vec.push(SubscribeAck::Failed);
                }
            }
        }
        if added > 0 {
            self.metrics_send(DispatcherToMetricsCmd::SubscriptionsAdded(added))
                .await;
        }

        // SUBACK goes out before the retained replay on the same channel,
        // and the replay before any later publish [MQTT-3.8.4-1].
        let ack_packet = SubscribeAckPacket::with_vec(packet.packet_id(), ack_vec);
        self.send_to_listener(
            session_gid.listener_id(),
            DispatcherToListenerCmd::SubscribeAck(session_gid.session_id(), ack_packet),
        )
        .await?;

        let username = self
            .routes
            .get(client_id)
            .and_then(|route| route.username.clone());
        for topic in packet.topics() {
            for retained in self.engine.get_retained(topic.filter()) {
                if !self
                    .acl
                    .allow(username.as_deref(), client_id, &retained.topic, Access::Read)
                {
                    continue;
                }
                let publication = Arc::new(Publication {
                    topic: retained.topic.clone(),
                    qos: retained.qos,
                    retain: true,
                    payload: retained.payload.clone(),
                });
                let delivery = Delivery {
                    qos: retained.qos.min(topic.qos()),
                    retain: true,
                    priority: Priority::Normal,
                    publication,
                };
                self.send_to_listener(
                    session_gid.listener_id(),
                    DispatcherToListenerCmd::Publish(session_gid.session_id(), delivery),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn on_listener_unsubscribe(
        &mut self,
        _session_gid: SessionGid,
        client_id: &str,
        packet: &UnsubscribePacket,
    ) -> Result<(), Error> {
        let mut removed = 0;
        for filter in packet.topics() {
            if self.engine.unsubscribe(client_id, filter) {
                removed += 1;
            }
        }
        if removed > 0 {
            self.metrics_send(DispatcherToMetricsCmd::SubscriptionsRemoved(removed))
                .await;
        }
        Ok(())
    }

    async fn on_session_connected(
        &mut self,
        session_gid: SessionGid,
        client_id: String,
        clean_session: bool,
        username: Option<String>,
    ) -> Result<(), Error> {
        // A second connection with a live client id disconnects the first
        // one [MQTT-3.1.4-2]. The same-listener case was already kicked
        // before the announce.
        if let Some(route) = self.routes.get(&client_id) {
            if let RouteTarget::Listener(old_gid) = route.target {
                if old_gid != session_gid {
                    self.send_to_listener(
                        old_gid.listener_id(),
                        DispatcherToListenerCmd::Takeover(old_gid.session_id()),
                    )
                    .await?;
                }
            }
        }

        let cached = if clean_session {
            // A clean session wipes everything the broker held for this
            // client id.
            let removed = self.engine.unsubscribe_all(&client_id);
            if removed > 0 {
                self.metrics_send(DispatcherToMetricsCmd::SubscriptionsRemoved(removed))
                    .await;
            }
            self.offline_sessions.remove(&client_id);
            None
        } else {
            self.offline_sessions
                .remove(&client_id)
                .map(|offline| offline.cached)
        };
        let session_present = cached.is_some();

        self.routes.insert(
            client_id.clone(),
            Route {
                target: RouteTarget::Listener(session_gid),
                clean_session,
                username,
            },
        );

        self.send_to_listener(
            session_gid.listener_id(),
            DispatcherToListenerCmd::SessionReady(
                session_gid.session_id(),
                client_id,
                session_present,
                cached,
            ),
        )
        .await?;

        self.metrics_send(DispatcherToMetricsCmd::SessionAdded(
            session_gid.listener_id(),
        ))
        .await;
        self.metrics_clients_total().await;
        Ok(())
    }

    async fn on_session_stored(
        &mut self,
        session_gid: SessionGid,
        client_id: String,
        cached: CachedSession,
    ) -> Result<(), Error> {
        let current = self
            .routes
            .get(&client_id)
            .map(|route| (route.target, route.clean_session));
        match current {
            Some((target, _)) if target == RouteTarget::Listener(session_gid) => {
                // Normal park of a disconnecting persistent session.
                let username = self
                    .routes
                    .remove(&client_id)
                    .and_then(|route| route.username);
                self.offline_sessions
                    .insert(client_id, OfflineSession { cached, username });
                self.metrics_send(DispatcherToMetricsCmd::SessionRemoved(
                    session_gid.listener_id(),
                ))
                .await;
                self.metrics_clients_total().await;
            }
            Some((target, clean_session)) => {
                // The client id reconnected before the old state arrived.
                if clean_session {
                    log::info!(
                        "dispatcher: Dropping stale state of {client_id}, reconnected clean"
                    );
                } else if let RouteTarget::Listener(new_gid) = target {
                    self.send_to_listener(
                        new_gid.listener_id(),
                        DispatcherToListenerCmd::AdoptSession(new_gid.session_id(), cached),
                    )
                    .await?;
                }
            }
            None => {
                self.offline_sessions.insert(
                    client_id,
                    OfflineSession {
                        cached,
                        username: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn on_session_closed(
        &mut self,
        session_gid: SessionGid,
        client_id: &str,
    ) -> Result<(), Error> {
        let Some(route) = self.routes.get(client_id) else {
            return Ok(());
        };
        if route.target != RouteTarget::Listener(session_gid) {
            // A newer session owns this client id now.
            return Ok(());
        }
        let route = self.routes.remove(client_id).expect("checked above");
        if route.clean_session {
            let removed = self.engine.unsubscribe_all(client_id);
            if removed > 0 {
                self.metrics_send(DispatcherToMetricsCmd::SubscriptionsRemoved(removed))
                    .await;
            }
            self.offline_sessions.remove(client_id);
        }
        self.metrics_send(DispatcherToMetricsCmd::SessionRemoved(
            session_gid.listener_id(),
        ))
        .await;
        self.metrics_clients_total().await;
        Ok(())
    }
}
