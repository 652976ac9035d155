// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Auth cmd handlers.

use codec::{ConnectAckPacket, ConnectReturnCode};

use super::Listener;
use crate::commands::{AuthToListenerCmd, ListenerToDispatcherCmd, ListenerToSessionCmd};
use crate::error::Error;
use crate::types::SessionId;

impl Listener {
    pub(super) async fn handle_auth_cmd(&mut self, cmd: AuthToListenerCmd) -> Result<(), Error> {
        match cmd {
            AuthToListenerCmd::ResponseAuth(session_id, return_code) => {
                self.on_auth_response(session_id, return_code).await
            }
        }
    }

    async fn on_auth_response(
        &mut self,
        session_id: SessionId,
        return_code: ConnectReturnCode,
    ) -> Result<(), Error> {
        let Some(pending) = self.pending.get_mut(&session_id) else {
            // Session went away while the auth verdict was in flight.
            log::info!("listener: Auth response for finished session {session_id}");
            return Ok(());
        };

        if return_code != ConnectReturnCode::Accepted {
            self.pending.remove(&session_id);
            // Session present MUST be 0 with a non-zero return code
            // [MQTT-3.2.2-4]; the session closes after sending it.
            return self
                .send_to_session(
                    session_id,
                    ListenerToSessionCmd::ConnectAck(ConnectAckPacket::new(false, return_code)),
                )
                .await;
        }

        pending.announced = true;
        let client_id = pending.client_id.clone();
        let clean_session = pending.clean_session;
        let username = pending.username.clone();

        // If the client id is already connected on this listener, disconnect
        // the existing session first [MQTT-3.1.4-2]. Its state is parked
        // ahead of the announce below, so the dispatcher hands it straight
        // back when the new session is persistent.
        if let Some(old_session_id) = self.client_ids.get(&client_id).copied() {
            if old_session_id != session_id {
                log::info!("listener: Client id {client_id} taken over, kicking {old_session_id}");
                self.takeover_session(old_session_id).await?;
            }
        }

        self.dispatcher_sender
            .send(ListenerToDispatcherCmd::SessionConnected(
                self.session_gid(session_id),
                client_id,
                clean_session,
                username,
            ))
            .await
            .map_err(Into::into)
    }
}
