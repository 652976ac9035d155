// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Init server context internal modules and apps.

use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use super::{ServerContext, CHANNEL_CAPACITY};
use crate::acl::AclStore;
use crate::auth::AuthApp;
use crate::bridge::BridgeApp;
use crate::dispatcher::Dispatcher;
use crate::error::{Error, ErrorKind};
use crate::listener::Listener;
use crate::metrics::Metrics;

impl ServerContext {
    pub(super) async fn init_modules(&mut self, runtime: &Runtime) -> Result<(), Error> {
        log::info!("ServerContext::init_modules()");

        let acl = Arc::new(AclStore::load(self.config.security().acl_file())?);

        let (listeners_to_dispatcher_sender, listeners_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut dispatcher_to_listener_senders = Vec::new();
        let (listeners_to_auth_sender, listeners_to_auth_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let mut auth_to_listener_senders = Vec::new();

        // Listeners module.
        let mut listener_objs = Vec::new();
        for (listener_id, listener_config) in (0_u32..).zip(self.config.listeners().iter()) {
            let (dispatcher_to_listener_sender, dispatcher_to_listener_receiver) =
                mpsc::channel(CHANNEL_CAPACITY);
            dispatcher_to_listener_senders.push((listener_id, dispatcher_to_listener_sender));

            let (auth_to_listener_sender, auth_to_listener_receiver) =
                mpsc::channel(CHANNEL_CAPACITY);
            auth_to_listener_senders.push((listener_id, auth_to_listener_sender));

            let listener = Listener::bind(
                listener_id,
                listener_config.clone(),
                self.config.general().clone(),
                Arc::clone(&acl),
                // dispatcher module
                listeners_to_dispatcher_sender.clone(),
                dispatcher_to_listener_receiver,
                // auth module
                listeners_to_auth_sender.clone(),
                auth_to_listener_receiver,
            )
            .await
            .map_err(|err| {
                Error::from_string(
                    ErrorKind::Fatal,
                    format!(
                        "Failed to listen at {}, got: {err}",
                        listener_config.address()
                    ),
                )
            })?;
            listener_objs.push(listener);
        }

        for mut listener in listener_objs {
            runtime.spawn(async move {
                listener.run_loop().await;
            });
        }

        // Auth module.
        let (server_ctx_to_auth_sender, server_ctx_to_auth_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        self.auth_sender = Some(server_ctx_to_auth_sender);
        let mut auth_app = AuthApp::new(
            self.config.security(),
            auth_to_listener_senders,
            listeners_to_auth_receiver,
            server_ctx_to_auth_receiver,
        )?;
        runtime.spawn(async move {
            auth_app.run_loop().await;
        });

        // Metrics module.
        let (metrics_to_dispatcher_sender, metrics_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let (dispatcher_to_metrics_sender, dispatcher_to_metrics_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let sys_interval = self.config.general().sys_interval;
        let mut metrics = Metrics::new(
            sys_interval,
            metrics_to_dispatcher_sender,
            dispatcher_to_metrics_receiver,
        );
        runtime.spawn(async move {
            metrics.run_loop(sys_interval > 0).await;
        });

        // Bridge module.
        let (bridge_to_dispatcher_sender, bridge_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let (dispatcher_to_bridge_sender, dispatcher_to_bridge_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        let (server_ctx_to_bridge_sender, server_ctx_to_bridge_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        self.bridge_sender = Some(server_ctx_to_bridge_sender);
        let mut bridge_app = BridgeApp::new(
            self.config.bridges().to_vec(),
            self.config.general(),
            bridge_to_dispatcher_sender,
            dispatcher_to_bridge_receiver,
            server_ctx_to_bridge_receiver,
        );
        runtime.spawn(async move {
            bridge_app.run_loop().await;
        });

        // Dispatcher module.
        let (server_ctx_to_dispatcher_sender, server_ctx_to_dispatcher_receiver) =
            mpsc::channel(CHANNEL_CAPACITY);
        self.dispatcher_sender = Some(server_ctx_to_dispatcher_sender);
        let mut dispatcher = Dispatcher::new(
            acl,
            self.config.general().clone(),
            self.config.storage().clone(),
            // listeners module
            dispatcher_to_listener_senders,
            listeners_to_dispatcher_receiver,
            // bridge module
            dispatcher_to_bridge_sender,
            bridge_to_dispatcher_receiver,
            // metrics module
            dispatcher_to_metrics_sender,
            metrics_to_dispatcher_receiver,
            // server ctx module
            server_ctx_to_dispatcher_receiver,
        );
        dispatcher.restore()?;
        runtime.spawn(async move {
            dispatcher.run_loop().await;
        });

        Ok(())
    }
}
