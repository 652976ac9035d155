// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Dispatcher: the routing core. Owns the subscription engine, the
//! cross-listener route table and the parked state of offline persistent
//! sessions, and drives the persistence snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::acl::AclStore;
use crate::commands::{
    BridgeToDispatcherCmd, DispatcherToBridgeCmd, DispatcherToListenerCmd, DispatcherToMetricsCmd,
    ListenerToDispatcherCmd, MetricsToDispatcherCmd, ServerContextToDispatcherCmd,
};
use crate::config;
use crate::engine::SubscriptionEngine;
use crate::error::Error;
use crate::listener::CachedSession;
use crate::storage::Snapshot;
use crate::types::{ListenerId, SessionGid};

mod bridge;
mod listener;
mod publish;
#[cfg(test)]
mod tests;

/// Where a live client id is reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    Listener(SessionGid),
    Bridge,
}

/// One live client id.
#[derive(Debug)]
struct Route {
    target: RouteTarget,
    clean_session: bool,
    username: Option<String>,
}

/// Parked state of an offline persistent session.
#[derive(Debug)]
struct OfflineSession {
    cached: CachedSession,
    username: Option<String>,
}

#[derive(Debug)]
pub struct Dispatcher {
    engine: SubscriptionEngine,
    routes: HashMap<String, Route>,
    offline_sessions: HashMap<String, OfflineSession>,

    acl: Arc<AclStore>,
    general: config::General,
    storage_config: config::Storage,
    last_autosave: Instant,
    saved_changes: u64,

    listener_senders: HashMap<ListenerId, Sender<DispatcherToListenerCmd>>,
    listener_receiver: Receiver<ListenerToDispatcherCmd>,

    bridge_sender: Sender<DispatcherToBridgeCmd>,
    bridge_receiver: Receiver<BridgeToDispatcherCmd>,

    metrics_sender: Sender<DispatcherToMetricsCmd>,
    metrics_receiver: Receiver<MetricsToDispatcherCmd>,

    server_ctx_receiver: Receiver<ServerContextToDispatcherCmd>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        acl: Arc<AclStore>,
        general: config::General,
        storage_config: config::Storage,
        // listeners module
        listener_senders: Vec<(ListenerId, Sender<DispatcherToListenerCmd>)>,
        listener_receiver: Receiver<ListenerToDispatcherCmd>,
        // bridge module
        bridge_sender: Sender<DispatcherToBridgeCmd>,
        bridge_receiver: Receiver<BridgeToDispatcherCmd>,
        // metrics module
        metrics_sender: Sender<DispatcherToMetricsCmd>,
        metrics_receiver: Receiver<MetricsToDispatcherCmd>,
        // server ctx module
        server_ctx_receiver: Receiver<ServerContextToDispatcherCmd>,
    ) -> Self {
        Self {
            engine: SubscriptionEngine::new(),
            routes: HashMap::new(),
            offline_sessions: HashMap::new(),

            acl,
            general,
            storage_config,
            last_autosave: Instant::now(),
            saved_changes: 0,

            listener_senders: listener_senders.into_iter().collect(),
            listener_receiver,

            bridge_sender,
            bridge_receiver,

            metrics_sender,
            metrics_receiver,

            server_ctx_receiver,
        }
    }

    /// Load the persistence snapshot on startup, restoring retained
    /// messages and durable subscriptions.
    ///
    /// # Errors
    ///
    /// Returns error if the snapshot exists but cannot be read.
    pub fn restore(&mut self) -> Result<(), Error> {
        if !self.storage_config.persistence() {
            return Ok(());
        }
        let Some(snapshot) = Snapshot::load(self.storage_config.persistence_location())? else {
            return Ok(());
        };
        let durable_clients = snapshot.apply(&mut self.engine)?;
        // Durable subscribers are reachable again after a restart; park an
        // empty session for each so their messages queue up.
        for client_id in durable_clients {
            self.offline_sessions.entry(client_id).or_insert_with(|| OfflineSession {
                cached: CachedSession::new(),
                username: None,
            });
        }
        self.engine.reset_retained_changes();
        log::info!(
            "dispatcher: Restored {} retained messages, {} parked sessions",
            self.engine.retained_count(),
            self.offline_sessions.len()
        );
        Ok(())
    }

    pub async fn run_loop(&mut self) -> ! {
        let mut autosave_timer = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                Some(cmd) = self.listener_receiver.recv() => {
                    if let Err(err) = self.handle_listener_cmd(cmd).await {
                        log::error!("dispatcher: handle listener cmd failed: {err}");
                    }
                },
                Some(cmd) = self.bridge_receiver.recv() => {
                    if let Err(err) = self.handle_bridge_cmd(cmd).await {
                        log::error!("dispatcher: handle bridge cmd failed: {err}");
                    }
                },
                Some(cmd) = self.metrics_receiver.recv() => {
                    if let Err(err) = self.handle_metrics_cmd(cmd).await {
                        log::error!("dispatcher: handle metrics cmd failed: {err}");
                    }
                },
                Some(cmd) = self.server_ctx_receiver.recv() => {
                    self.handle_server_ctx_cmd(cmd);
                },
                _ = autosave_timer.tick() => {
                    self.autosave_tick();
                },
            }
        }
    }

    async fn handle_metrics_cmd(&mut self, cmd: MetricsToDispatcherCmd) -> Result<(), Error> {
        match cmd {
            MetricsToDispatcherCmd::Publish(publication) => {
                self.route_publish(crate::types::INTERNAL_CLIENT_ID, publication)
                    .await
            }
        }
    }

    fn handle_server_ctx_cmd(&mut self, cmd: ServerContextToDispatcherCmd) {
        match cmd {
            ServerContextToDispatcherCmd::Reload => {
                if let Err(err) = self.acl.reload() {
                    log::error!("dispatcher: Failed to reload acl file: {err}");
                } else {
                    log::info!("dispatcher: Reloaded acl rules");
                }
            }
            ServerContextToDispatcherCmd::Shutdown(ack) => {
                self.save_snapshot(true);
                if ack.send(()).is_err() {
                    log::error!("dispatcher: Failed to ack shutdown");
                }
            }
        }
    }

    /// Snapshot retained messages and durable subscriptions when enough
    /// time passed or enough changes accumulated.
    fn autosave_tick(&mut self) {
        if !self.storage_config.persistence() || self.engine.retained_changes() == 0 {
            return;
        }
        let interval_elapsed =
            self.last_autosave.elapsed() >= Duration::from_secs(self.storage_config.autosave_interval());
        let changes_reached = self.storage_config.autosave_on_changes()
            && self.engine.retained_changes() >= self.storage_config.autosave_change_threshold();
        if interval_elapsed || changes_reached {
            self.save_snapshot(false);
        }
    }

    fn save_snapshot(&mut self, force: bool) {
        if !self.storage_config.persistence() {
            return;
        }
        if !force && self.engine.retained_changes() == 0 {
            return;
        }
        let snapshot = Snapshot::from_engine(&self.engine);
        match snapshot.save(self.storage_config.persistence_location()) {
            Ok(()) => {
                self.saved_changes += self.engine.retained_changes();
                self.engine.reset_retained_changes();
                self.last_autosave = Instant::now();
                log::info!(
                    "dispatcher: State snapshot written, {} changes total",
                    self.saved_changes
                );
            }
            Err(err) => {
                log::error!("dispatcher: Failed to write snapshot: {err}");
            }
        }
    }

    async fn send_to_listener(
        &self,
        listener_id: ListenerId,
        cmd: DispatcherToListenerCmd,
    ) -> Result<(), Error> {
        if let Some(sender) = self.listener_senders.get(&listener_id) {
            sender.send(cmd).await.map_err(Into::into)
        } else {
            log::error!("dispatcher: Unknown listener id: {listener_id}");
            Ok(())
        }
    }

    async fn metrics_send(&self, cmd: DispatcherToMetricsCmd) {
        if let Err(err) = self.metrics_sender.send(cmd).await {
            log::error!("dispatcher: Failed to send metrics cmd: {err}");
        }
    }

    async fn metrics_clients_total(&self) {
        let total = self.routes.len() + self.offline_sessions.len();
        self.metrics_send(DispatcherToMetricsCmd::ClientsTotal(total))
            .await;
    }
}
