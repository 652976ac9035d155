// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! The publish routing path.

use std::sync::Arc;

use super::{Dispatcher, RouteTarget};
use crate::acl::Access;
use crate::commands::{DispatcherToBridgeCmd, DispatcherToListenerCmd, DispatcherToMetricsCmd};
use crate::error::Error;
use crate::types::{Delivery, Publication};

impl Dispatcher {
    /// Deliver a publication to every matching subscriber.
    ///
    /// Recipients are resolved through the engine, ordered by priority,
    /// read-checked against the acl and handed to the listener, bridge or
    /// offline queue owning them.
    pub(super) async fn route_publish(
        &mut self,
        publisher_id: &str,
        publication: Arc<Publication>,
    ) -> Result<(), Error> {
        if publication.retain {
            let removed = publication.payload.is_empty();
            let previous = self.engine.set_retained(
                &publication.topic,
                publication.qos,
                publication.payload.clone(),
            );
            match (removed, previous) {
                (false, None) => {
                    self.metrics_send(DispatcherToMetricsCmd::RetainedMessageAdded(
                        1,
                        publication.payload.len(),
                    ))
                    .await;
                }
                (true, Some(old)) => {
                    self.metrics_send(DispatcherToMetricsCmd::RetainedMessageRemoved(
                        1,
                        old.payload.len(),
                    ))
                    .await;
                }
                _ => (),
            }
        }

        let mut subscribers = self
            .engine
            .get_subscribers(&publication.topic, publisher_id);
        // Stable, so publisher order is kept within a band.
        subscribers.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut sent = 0;
        let mut dropped = 0;
        for subscriber in subscribers {
            let delivery = Delivery {
                publication: publication.clone(),
                qos: publication.qos.min(subscriber.qos),
                retain: false,
                priority: subscriber.priority,
            };

            if let Some(route) = self.routes.get(&subscriber.client_id) {
                if !self.acl.allow(
                    route.username.as_deref(),
                    &subscriber.client_id,
                    &publication.topic,
                    Access::Read,
                ) {
                    continue;
                }
                match route.target {
                    RouteTarget::Listener(gid) => {
                        self.send_to_listener(
                            gid.listener_id(),
                            DispatcherToListenerCmd::Publish(gid.session_id(), delivery),
                        )
                        .await?;
                    }
                    RouteTarget::Bridge => {
                        self.bridge_sender
                            .send(DispatcherToBridgeCmd::Publish(
                                subscriber.client_id.clone(),
                                delivery,
                            ))
                            .await?;
                    }
                }
                sent += 1;
            } else if let Some(offline) = self.offline_sessions.get_mut(&subscriber.client_id) {
                if !self.acl.allow(
                    offline.username.as_deref(),
                    &subscriber.client_id,
                    &publication.topic,
                    Access::Read,
                ) {
                    continue;
                }
                if offline
                    .cached
                    .queue_delivery(delivery, self.general.max_queued_messages)
                {
                    sent += 1;
                } else {
                    dropped += 1;
                }
            } else {
                log::warn!(
                    "dispatcher: Subscriber {} has no route and no parked session",
                    subscriber.client_id
                );
            }
        }

        if sent > 0 {
            self.metrics_send(DispatcherToMetricsCmd::PublishPacketSent(
                sent,
                sent * publication.payload.len(),
            ))
            .await;
        }
        if dropped > 0 {
            self.metrics_send(DispatcherToMetricsCmd::PublishPacketDropped(dropped))
                .await;
        }
        Ok(())
    }
}
