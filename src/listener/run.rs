// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Handles commands, new connections and the retry sweep.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{Listener, CHANNEL_CAPACITY};
use crate::commands::ListenerToSessionCmd;
use crate::listener::client::RetryPacket;
use crate::session::{Session, SessionConfig};
use crate::stream::Stream;
use crate::types::SessionId;

impl Listener {
    pub async fn run_loop(&mut self) -> ! {
        // Take ownership of mpsc receivers or else tokio select will raise
        // an error.
        let mut session_receiver = self
            .session_receiver
            .take()
            .expect("Invalid session receiver");
        let mut dispatcher_receiver = self
            .dispatcher_receiver
            .take()
            .expect("Invalid dispatcher receiver");
        let mut auth_receiver = self.auth_receiver.take().expect("Invalid auth receiver");

        let mut retry_timer = tokio::time::interval(Duration::from_secs(1));

        loop {
            tokio::select! {
                Ok((socket, address)) = self.socket.accept() => {
                    self.new_connection(socket, address).await;
                },

                Some(cmd) = session_receiver.recv() => {
                    if let Err(err) = self.handle_session_cmd(cmd).await {
                        log::error!("listener: handle session cmd failed: {err}");
                    }
                },

                Some(cmd) = dispatcher_receiver.recv() => {
                    if let Err(err) = self.handle_dispatcher_cmd(cmd).await {
                        log::error!("listener: handle dispatcher cmd failed: {err}");
                    }
                }

                Some(cmd) = auth_receiver.recv() => {
                    if let Err(err) = self.handle_auth_cmd(cmd).await {
                        log::error!("listener: handle auth cmd failed: {err}");
                    }
                }

                _ = retry_timer.tick() => {
                    self.retry_sweep().await;
                }
            }
        }
    }

    async fn new_connection(&mut self, socket: TcpStream, address: std::net::SocketAddr) {
        if self.config.max_connections() > 0
            && self.session_senders.len() >= self.config.max_connections()
        {
            log::warn!(
                "listener: Max connections ({}) reached, rejecting {address}",
                self.config.max_connections()
            );
            drop(socket);
            return;
        }

        log::info!("listener: New connection from {address}");
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let session_id = self.next_session_id();
        self.session_senders.insert(session_id, sender);
        let session_config = SessionConfig::new(
            self.config.keep_alive(),
            self.general.connect_timeout,
            self.general.message_size_limit,
        );
        let session = Session::new(
            session_id,
            session_config,
            Stream::new(socket),
            self.session_sender.clone(),
            receiver,
        );
        tokio::spawn(session.run_loop());
    }

    pub(super) fn next_session_id(&mut self) -> SessionId {
        self.current_session_id += 1;
        self.current_session_id
    }

    /// Resend inflight messages whose retry interval elapsed.
    async fn retry_sweep(&mut self) {
        let now = Instant::now();
        let retry_interval = Duration::from_secs(self.general.retry_interval);
        let mut to_send = Vec::new();
        for (session_id, client) in &mut self.clients {
            for retry in client.retries(now, retry_interval) {
                to_send.push((*session_id, retry));
            }
        }
        for (session_id, retry) in to_send {
            let cmd = match retry {
                RetryPacket::Publish(packet) => ListenerToSessionCmd::Publish(packet),
                RetryPacket::Release(packet) => ListenerToSessionCmd::PublishRelease(packet),
            };
            if let Err(err) = self.send_to_session(session_id, cmd).await {
                log::error!("listener: Failed to resend to session {session_id}: {err}");
            }
        }
    }
}
