// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Metrics app: collects broker statistics and publishes them retained
//! under `$SYS/broker/...` on a fixed interval.

use bytes::Bytes;
use codec::QoS;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::interval;

use crate::commands::{DispatcherToMetricsCmd, MetricsToDispatcherCmd};
use crate::error::Error;
use crate::types::{ListenerId, Publication, Uptime};

pub const SYS_UPTIME: &str = "$SYS/broker/uptime";
pub const SYS_VERSION: &str = "$SYS/broker/version";
pub const SYS_BYTES_SENT: &str = "$SYS/broker/bytes/sent";
pub const SYS_BYTES_RECEIVED: &str = "$SYS/broker/bytes/received";
pub const SYS_MSGS_SENT: &str = "$SYS/broker/messages/sent";
pub const SYS_MSGS_RECEIVED: &str = "$SYS/broker/messages/received";
pub const SYS_MSGS_DROPPED: &str = "$SYS/broker/messages/dropped";
pub const SYS_CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
pub const SYS_CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
pub const SYS_RETAINED_COUNT: &str = "$SYS/broker/retained messages/count";
pub const SYS_SUBSCRIPTIONS_COUNT: &str = "$SYS/broker/subscriptions/count";

#[derive(Debug, Default, Clone)]
struct SystemMetrics {
    clients_connected: u64,
    clients_total: u64,
    subscriptions: u64,
    retained_messages: u64,
    retained_bytes: u64,
    publish_messages_sent: u64,
    publish_messages_received: u64,
    publish_messages_dropped: u64,
    publish_bytes_sent: u64,
    publish_bytes_received: u64,
}

/// Statistics collector and `$SYS` publisher.
#[derive(Debug)]
pub struct Metrics {
    sys_interval: Duration,
    startup: SystemTime,
    uptime: Uptime,

    system: SystemMetrics,
    listener_sessions: HashMap<ListenerId, u64>,

    dispatcher_sender: Sender<MetricsToDispatcherCmd>,
    dispatcher_receiver: Receiver<DispatcherToMetricsCmd>,
}

impl Metrics {
    #[must_use]
    pub fn new(
        sys_interval: u64,
        dispatcher_sender: Sender<MetricsToDispatcherCmd>,
        dispatcher_receiver: Receiver<DispatcherToMetricsCmd>,
    ) -> Self {
        Self {
            sys_interval: Duration::from_secs(sys_interval.max(1)),
            startup: SystemTime::now(),
            uptime: 0,
            system: SystemMetrics::default(),
            listener_sessions: HashMap::new(),
            dispatcher_sender,
            dispatcher_receiver,
        }
    }

    pub async fn run_loop(&mut self, sys_enabled: bool) -> ! {
        let mut uptime_timer = interval(Duration::from_secs(1));
        let mut sys_timer = interval(self.sys_interval);

        loop {
            tokio::select! {
                Some(cmd) = self.dispatcher_receiver.recv() => {
                    self.handle_dispatcher_cmd(&cmd);
                }
                _ = uptime_timer.tick() => {
                    self.update_uptime();
                }
                _ = sys_timer.tick() => {
                    if sys_enabled {
                        if let Err(err) = self.publish_sys_tree().await {
                            log::error!("metrics: Failed to publish $SYS tree: {err}");
                        }
                    }
                }
            }
        }
    }

    fn handle_dispatcher_cmd(&mut self, cmd: &DispatcherToMetricsCmd) {
        match cmd {
            DispatcherToMetricsCmd::SessionAdded(listener_id) => {
                *self.listener_sessions.entry(*listener_id).or_default() += 1;
                self.system.clients_connected += 1;
            }
            DispatcherToMetricsCmd::SessionRemoved(listener_id) => {
                match self.listener_sessions.get_mut(listener_id) {
                    Some(count) if *count > 0 => *count -= 1,
                    _ => log::error!("metrics: Unbalanced SessionRemoved for #{listener_id}"),
                }
                self.system.clients_connected = self.system.clients_connected.saturating_sub(1);
            }
            DispatcherToMetricsCmd::ClientsTotal(total) => {
                self.system.clients_total = *total as u64;
            }
            DispatcherToMetricsCmd::SubscriptionsAdded(count) => {
                self.system.subscriptions += *count as u64;
            }
            DispatcherToMetricsCmd::SubscriptionsRemoved(count) => {
                self.system.subscriptions = self.system.subscriptions.saturating_sub(*count as u64);
            }
            DispatcherToMetricsCmd::RetainedMessageAdded(count, bytes) => {
                self.system.retained_messages += *count as u64;
                self.system.retained_bytes += *bytes as u64;
            }
            DispatcherToMetricsCmd::RetainedMessageRemoved(count, bytes) => {
                self.system.retained_messages =
                    self.system.retained_messages.saturating_sub(*count as u64);
                self.system.retained_bytes =
                    self.system.retained_bytes.saturating_sub(*bytes as u64);
            }
            DispatcherToMetricsCmd::PublishPacketSent(count, bytes) => {
                self.system.publish_messages_sent += *count as u64;
                self.system.publish_bytes_sent += *bytes as u64;
            }
            DispatcherToMetricsCmd::PublishPacketReceived(count, bytes) => {
                self.system.publish_messages_received += *count as u64;
                self.system.publish_bytes_received += *bytes as u64;
            }
            DispatcherToMetricsCmd::PublishPacketDropped(count) => {
                self.system.publish_messages_dropped += *count as u64;
            }
        }
    }

    fn update_uptime(&mut self) {
        match SystemTime::now().duration_since(self.startup) {
            Ok(duration) => self.uptime = duration.as_secs(),
            Err(err) => log::error!("metrics: Failed to update uptime: {err}"),
        }
    }

    async fn publish_sys_tree(&mut self) -> Result<(), Error> {
        let values = [
            (SYS_UPTIME, format!("{} seconds", self.uptime)),
            (SYS_VERSION, env!("CARGO_PKG_VERSION").to_string()),
            (SYS_BYTES_SENT, self.system.publish_bytes_sent.to_string()),
            (
                SYS_BYTES_RECEIVED,
                self.system.publish_bytes_received.to_string(),
            ),
            (SYS_MSGS_SENT, self.system.publish_messages_sent.to_string()),
            (
                SYS_MSGS_RECEIVED,
                self.system.publish_messages_received.to_string(),
            ),
            (
                SYS_MSGS_DROPPED,
                self.system.publish_messages_dropped.to_string(),
            ),
            (
                SYS_CLIENTS_CONNECTED,
                self.system.clients_connected.to_string(),
            ),
            (SYS_CLIENTS_TOTAL, self.system.clients_total.to_string()),
            (
                SYS_RETAINED_COUNT,
                self.system.retained_messages.to_string(),
            ),
            (
                SYS_SUBSCRIPTIONS_COUNT,
                self.system.subscriptions.to_string(),
            ),
        ];
        for (topic, value) in values {
            // Retained, so a fresh subscriber sees the current value at
            // once instead of waiting out the interval.
            let publication =
                Publication::new(topic, QoS::AtMostOnce, true, Bytes::from(value.into_bytes()));
            self.dispatcher_sender
                .send(MetricsToDispatcherCmd::Publish(publication))
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_counters() {
        let (tx, _rx) = mpsc::channel(1);
        let (_tx2, rx2) = mpsc::channel(1);
        let mut metrics = Metrics::new(10, tx, rx2);

        metrics.handle_dispatcher_cmd(&DispatcherToMetricsCmd::SessionAdded(0));
        metrics.handle_dispatcher_cmd(&DispatcherToMetricsCmd::SessionAdded(0));
        metrics.handle_dispatcher_cmd(&DispatcherToMetricsCmd::SessionRemoved(0));
        assert_eq!(metrics.system.clients_connected, 1);

        metrics.handle_dispatcher_cmd(&DispatcherToMetricsCmd::PublishPacketSent(3, 30));
        assert_eq!(metrics.system.publish_messages_sent, 3);
        assert_eq!(metrics.system.publish_bytes_sent, 30);

        // Removal below zero clamps instead of wrapping.
        metrics.handle_dispatcher_cmd(&DispatcherToMetricsCmd::SubscriptionsRemoved(5));
        assert_eq!(metrics.system.subscriptions, 0);
    }
}
