// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Bridge app: one outbound broker-to-broker session per configured
//! bridge, driven by the same client state machine as inbound sessions.
//!
//! For every `out`/`both` topic mapping the app installs a `no_local`
//! subscription on the local engine under the bridge's client id, so
//! matching local publications are handed here and forwarded to the remote
//! with the topic prefix rewritten. `in`/`both` mappings are subscribed on
//! the remote broker once its CONNACK arrives, and inbound publishes are
//! injected locally with the reverse rewrite.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::commands::{
    BridgeToDispatcherCmd, DispatcherToBridgeCmd, ServerContextToBridgeCmd,
};
use crate::config;
use crate::error::Error;
use crate::types::{Delivery, Publication};

mod connection;

use connection::BridgeConnection;

const CHANNEL_CAPACITY: usize = 16;

/// App to connection-task commands.
#[derive(Debug)]
pub(crate) enum BridgeToConnCmd {
    /// A local publication matching one of the bridge's out mappings.
    Publish(Delivery),

    Shutdown,
}

/// Connection-task to app commands.
#[derive(Debug)]
pub(crate) enum ConnToBridgeCmd {
    /// A remote publish, already rewritten into the local topic space:
    /// bridge client id and publication.
    Publish(String, Arc<Publication>),
}

#[derive(Debug)]
pub struct BridgeApp {
    bridges: Vec<config::Bridge>,
    general: config::General,

    conn_senders: HashMap<String, Sender<BridgeToConnCmd>>,
    conn_sender: Sender<ConnToBridgeCmd>,
    conn_receiver: Receiver<ConnToBridgeCmd>,

    dispatcher_sender: Sender<BridgeToDispatcherCmd>,
    dispatcher_receiver: Receiver<DispatcherToBridgeCmd>,

    server_ctx_receiver: Receiver<ServerContextToBridgeCmd>,
}

impl BridgeApp {
    #[must_use]
    pub fn new(
        bridges: Vec<config::Bridge>,
        general: &config::General,
        dispatcher_sender: Sender<BridgeToDispatcherCmd>,
        dispatcher_receiver: Receiver<DispatcherToBridgeCmd>,
        server_ctx_receiver: Receiver<ServerContextToBridgeCmd>,
    ) -> Self {
        let (conn_sender, conn_receiver) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            bridges,
            general: general.clone(),
            conn_senders: HashMap::new(),
            conn_sender,
            conn_receiver,
            dispatcher_sender,
            dispatcher_receiver,
            server_ctx_receiver,
        }
    }

    pub async fn run_loop(&mut self) -> ! {
        if let Err(err) = self.start_bridges().await {
            log::error!("bridge: Failed to start bridges: {err}");
        }

        loop {
            tokio::select! {
                Some(cmd) = self.dispatcher_receiver.recv() => {
                    if let Err(err) = self.handle_dispatcher_cmd(cmd).await {
                        log::error!("bridge: handle dispatcher cmd failed: {err}");
                    }
                }
                Some(cmd) = self.conn_receiver.recv() => {
                    if let Err(err) = self.handle_conn_cmd(cmd).await {
                        log::error!("bridge: handle connection cmd failed: {err}");
                    }
                }
                Some(cmd) = self.server_ctx_receiver.recv() => {
                    self.handle_server_ctx_cmd(&cmd).await;
                }
            }
        }
    }

    /// Spawn one connection task per bridge and install the local
    /// subscriptions of its out mappings.
    async fn start_bridges(&mut self) -> Result<(), Error> {
        for bridge in self.bridges.clone() {
            let client_id = bridge.effective_client_id();
            let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
            self.conn_senders.insert(client_id.clone(), sender);

            for topic in &bridge.topics {
                if matches!(
                    topic.direction,
                    config::BridgeDirection::Out | config::BridgeDirection::Both
                ) {
                    self.dispatcher_sender
                        .send(BridgeToDispatcherCmd::Subscribe(
                            client_id.clone(),
                            topic.local_filter(),
                            topic.qos,
                            topic.priority,
                        ))
                        .await?;
                }
            }

            let connection = BridgeConnection::new(
                bridge,
                &self.general,
                self.conn_sender.clone(),
                receiver,
            );
            tokio::spawn(connection.run_loop());
        }
        Ok(())
    }

    async fn handle_dispatcher_cmd(&mut self, cmd: DispatcherToBridgeCmd) -> Result<(), Error> {
        match cmd {
            DispatcherToBridgeCmd::Publish(client_id, delivery) => {
                if let Some(sender) = self.conn_senders.get(&client_id) {
                    if let Err(err) = sender.send(BridgeToConnCmd::Publish(delivery)).await {
                        log::error!("bridge: Connection {client_id} is gone: {err}");
                    }
                } else {
                    log::error!("bridge: Publish for unknown bridge {client_id}");
                }
                Ok(())
            }
        }
    }

    async fn handle_conn_cmd(&mut self, cmd: ConnToBridgeCmd) -> Result<(), Error> {
        match cmd {
            ConnToBridgeCmd::Publish(client_id, publication) => self
                .dispatcher_sender
                .send(BridgeToDispatcherCmd::Publish(client_id, publication))
                .await
                .map_err(Into::into),
        }
    }

    async fn handle_server_ctx_cmd(&mut self, cmd: &ServerContextToBridgeCmd) {
        match cmd {
            ServerContextToBridgeCmd::Shutdown => {
                for (client_id, sender) in &self.conn_senders {
                    if let Err(err) = sender.send(BridgeToConnCmd::Shutdown).await {
                        log::warn!("bridge: Failed to stop {client_id}: {err}");
                    }
                }
            }
        }
    }
}
