// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Initialize Listener.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::Listener;
use super::CHANNEL_CAPACITY;
use crate::acl::AclStore;
use crate::commands::{
    AuthToListenerCmd, DispatcherToListenerCmd, ListenerToAuthCmd, ListenerToDispatcherCmd,
};
use crate::config;
use crate::error::{Error, ErrorKind};
use crate::types::ListenerId;

impl Listener {
    /// Bind to the configured socket address.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        id: ListenerId,
        listener_config: config::Listener,
        general: config::General,
        acl: Arc<AclStore>,
        // dispatcher module
        dispatcher_sender: Sender<ListenerToDispatcherCmd>,
        dispatcher_receiver: Receiver<DispatcherToListenerCmd>,
        // auth module
        auth_sender: Sender<ListenerToAuthCmd>,
        auth_receiver: Receiver<AuthToListenerCmd>,
    ) -> Result<Self, Error> {
        let socket = TcpListener::bind(listener_config.address())
            .await
            .map_err(|err| {
                Error::from_string(
                    ErrorKind::SocketError,
                    format!(
                        "Failed to bind listener to {}, got: {err}",
                        listener_config.address()
                    ),
                )
            })?;
        log::info!("Listening at {}", listener_config.address());

        let (session_sender, session_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Ok(Self {
            id,
            config: listener_config,
            general,
            socket,
            acl,

            current_session_id: 0,
            session_senders: HashMap::new(),
            client_ids: BTreeMap::new(),
            clients: HashMap::new(),
            pending: HashMap::new(),

            session_sender,
            session_receiver: Some(session_receiver),

            dispatcher_sender,
            dispatcher_receiver: Some(dispatcher_receiver),

            auth_sender,
            auth_receiver: Some(auth_receiver),
        })
    }

    /// The address this listener actually bound, for tests using port 0.
    ///
    /// # Errors
    ///
    /// Returns error if the socket has no local address.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, Error> {
        self.socket.local_addr().map_err(Into::into)
    }
}
