// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Dispatcher cmd handlers.

use codec::{ConnectAckPacket, ConnectReturnCode, SubscribeAckPacket};
use std::time::{Duration, Instant};

use super::Listener;
use crate::commands::{DispatcherToListenerCmd, ListenerToDispatcherCmd, ListenerToSessionCmd};
use crate::error::Error;
use crate::listener::client::{CachedSession, ClientState, DeliverAction, RetryPacket};
use crate::types::{Delivery, SessionId};

impl Listener {
    pub(super) async fn handle_dispatcher_cmd(
        &mut self,
        cmd: DispatcherToListenerCmd,
    ) -> Result<(), Error> {
        match cmd {
            DispatcherToListenerCmd::SessionReady(session_id, client_id, present, cached) => {
                self.on_session_ready(session_id, client_id, present, cached)
                    .await
            }
            DispatcherToListenerCmd::AdoptSession(session_id, cached) => {
                self.on_adopt_session(session_id, cached).await
            }
            DispatcherToListenerCmd::Publish(session_id, delivery) => {
                self.on_dispatcher_publish(session_id, delivery).await
            }
            DispatcherToListenerCmd::SubscribeAck(session_id, packet) => {
                self.on_subscribe_ack(session_id, packet).await
            }
            DispatcherToListenerCmd::Takeover(session_id) => {
                self.takeover_session(session_id).await
            }
        }
    }

    async fn on_session_ready(
        &mut self,
        session_id: SessionId,
        client_id: String,
        session_present: bool,
        cached: Option<CachedSession>,
    ) -> Result<(), Error> {
        let Some(pending) = self.pending.remove(&session_id) else {
            // The socket died during the handshake; hand the state back.
            if let Some(cached) = cached {
                self.dispatcher_sender
                    .send(ListenerToDispatcherCmd::SessionStored(
                        self.session_gid(session_id),
                        client_id,
                        cached,
                    ))
                    .await?;
            }
            return Ok(());
        };

        let mut client = ClientState::new(
            &pending.client_id,
            pending.clean_session,
            pending.username,
            pending.will,
            self.general.max_inflight_messages,
            self.general.max_queued_messages,
        );
        if let Some(cached) = cached {
            client.attach(cached);
        }
        self.client_ids.insert(pending.client_id.clone(), session_id);
        self.clients.insert(session_id, client);

        self.send_to_session(
            session_id,
            ListenerToSessionCmd::ConnectAck(ConnectAckPacket::new(
                session_present,
                ConnectReturnCode::Accepted,
            )),
        )
        .await?;

        // Resume the adopted handshakes first, then drain the queue into
        // the window.
        self.resend_inflight(session_id).await?;
        self.promote_queued(session_id).await
    }

    async fn on_adopt_session(
        &mut self,
        session_id: SessionId,
        cached: CachedSession,
    ) -> Result<(), Error> {
        if let Some(client) = self.clients.get_mut(&session_id) {
            client.adopt(cached);
            self.resend_inflight(session_id).await?;
            return self.promote_queued(session_id).await;
        }
        log::warn!("listener: AdoptSession for unknown session {session_id}");
        Ok(())
    }

    /// Retransmit all inflight messages, used right after a persistent
    /// session resumed [MQTT-4.4.0-1].
    async fn resend_inflight(&mut self, session_id: SessionId) -> Result<(), Error> {
        let Some(client) = self.clients.get_mut(&session_id) else {
            return Ok(());
        };
        let retries = client.retries(Instant::now(), Duration::ZERO);
        for retry in retries {
            let cmd = match retry {
                RetryPacket::Publish(packet) => ListenerToSessionCmd::Publish(packet),
                RetryPacket::Release(packet) => ListenerToSessionCmd::PublishRelease(packet),
            };
            self.send_to_session(session_id, cmd).await?;
        }
        Ok(())
    }

    async fn on_dispatcher_publish(
        &mut self,
        session_id: SessionId,
        delivery: Delivery,
    ) -> Result<(), Error> {
        let Some(client) = self.clients.get_mut(&session_id) else {
            log::info!("listener: Dropping delivery for finished session {session_id}");
            return Ok(());
        };
        match client.deliver(delivery, Instant::now()) {
            DeliverAction::Publish(packet) => {
                self.send_to_session(session_id, ListenerToSessionCmd::Publish(packet))
                    .await
            }
            DeliverAction::Queued | DeliverAction::Dropped => Ok(()),
        }
    }

    async fn on_subscribe_ack(
        &mut self,
        session_id: SessionId,
        packet: SubscribeAckPacket,
    ) -> Result<(), Error> {
        self.send_to_session(session_id, ListenerToSessionCmd::SubscribeAck(packet))
            .await
    }
}
