// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Subscription engine: maps topic names to subscribers and to retained
//! messages.
//!
//! Non-wildcard subscriptions live in a map keyed by the exact filter string,
//! wildcard subscriptions in a linear list. Topics starting with `$` have
//! their own mirror stores, so wildcard subscriptions on ordinary roots never
//! capture system state.

use bytes::Bytes;
use codec::topic::most_specific;
use codec::{QoS, SubscribePattern, TopicError, TopicFilter};
use std::collections::BTreeMap;
use std::collections::HashMap;

use crate::types::Priority;

/// One client's interest in a topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub client_id: String,
    pub pattern: SubscribePattern,

    /// Skip delivery back to the publisher itself; used by bridge
    /// subscriptions to prevent loops.
    pub no_local: bool,

    /// Saved in snapshots. Implies the owning client has a persistent
    /// session.
    pub durable: bool,

    pub priority: Priority,
}

/// Retained message, keyed by its concrete topic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub qos: QoS,
    pub payload: Bytes,
}

/// One entry of a `get_subscribers` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberMatch {
    pub client_id: String,
    pub qos: QoS,
    pub priority: Priority,
}

/// Subscription engine main state.
#[derive(Debug, Default)]
pub struct SubscriptionEngine {
    /// Non-wildcard subscriptions, keyed by exact filter string.
    subs: HashMap<String, Vec<Subscription>>,

    /// Wildcard subscriptions, matched by linear scan.
    wildcard_subs: Vec<Subscription>,

    retained: BTreeMap<String, RetainedMessage>,

    /// Changes since the last snapshot.
    retained_changes: u64,

    /// System topic space, `$`-rooted.
    system_subs: Vec<Subscription>,
    system_retained: BTreeMap<String, RetainedMessage>,
}

fn is_system(name: &str) -> bool {
    name.starts_with('$')
}

impl SubscriptionEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription.
    ///
    /// An existing subscription with the same `(client_id, filter)` pair is
    /// replaced, so a re-subscribe updates qos and flags in place
    /// [MQTT-3.8.4-3]. Returns true if a new subscription was added.
    ///
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn subscribe(
        &mut self,
        client_id: &str,
        filter: &str,
        qos: QoS,
        no_local: bool,
        durable: bool,
        priority: Priority,
    ) -> Result<bool, TopicError> {
        let pattern = SubscribePattern::parse(filter, qos)?;
        let existed = self.remove_subscription(client_id, filter);
        let subscription = Subscription {
            client_id: client_id.to_string(),
            pattern,
            no_local,
            durable,
            priority,
        };
        if is_system(filter) {
            self.system_subs.push(subscription);
        } else if subscription.pattern.filter().has_wildcards() {
            self.wildcard_subs.push(subscription);
        } else {
            self.subs
                .entry(filter.to_string())
                .or_default()
                .push(subscription);
        }
        Ok(!existed)
    }

    /// Remove one subscription. Missing entries are not an error.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &str) -> bool {
        self.remove_subscription(client_id, filter)
    }

    /// Remove every subscription of `client_id`, for session cleanup.
    pub fn unsubscribe_all(&mut self, client_id: &str) -> usize {
        let mut removed = 0;
        for list in self.subs.values_mut() {
            let before = list.len();
            list.retain(|s| s.client_id != client_id);
            removed += before - list.len();
        }
        self.subs.retain(|_, list| !list.is_empty());

        let before = self.wildcard_subs.len();
        self.wildcard_subs.retain(|s| s.client_id != client_id);
        removed += before - self.wildcard_subs.len();

        let before = self.system_subs.len();
        self.system_subs.retain(|s| s.client_id != client_id);
        removed += before - self.system_subs.len();
        removed
    }

    fn remove_subscription(&mut self, client_id: &str, filter: &str) -> bool {
        let matches =
            |s: &Subscription| s.client_id == client_id && s.pattern.filter().filter() == filter;
        if is_system(filter) {
            let before = self.system_subs.len();
            self.system_subs.retain(|s| !matches(s));
            return before != self.system_subs.len();
        }
        if let Some(list) = self.subs.get_mut(filter) {
            let before = list.len();
            list.retain(|s| !matches(s));
            let removed = before != list.len();
            if list.is_empty() {
                self.subs.remove(filter);
            }
            if removed {
                return true;
            }
        }
        let before = self.wildcard_subs.len();
        self.wildcard_subs.retain(|s| !matches(s));
        before != self.wildcard_subs.len()
    }

    /// Resolve the recipients of a publish to `topic`.
    ///
    /// A client holding several matching subscriptions gets one entry, at
    /// the qos and priority of the most specific filter. Subscriptions with
    /// `no_local` never match their own publisher.
    #[must_use]
    pub fn get_subscribers(&self, topic: &str, publisher_id: &str) -> Vec<SubscriberMatch> {
        let mut matched: Vec<&Subscription> = Vec::new();
        if is_system(topic) {
            matched.extend(
                self.system_subs
                    .iter()
                    .filter(|s| s.pattern.filter().is_match(topic)),
            );
        } else {
            if let Some(list) = self.subs.get(topic) {
                matched.extend(list.iter());
            }
            matched.extend(
                self.wildcard_subs
                    .iter()
                    .filter(|s| s.pattern.filter().is_match(topic)),
            );
        }

        let mut chosen: HashMap<&str, &Subscription> = HashMap::new();
        let mut order: Vec<&str> = Vec::new();
        for s in matched {
            if s.no_local && s.client_id == publisher_id {
                continue;
            }
            match chosen.get(s.client_id.as_str()) {
                Some(current) => {
                    let winner = most_specific(s.pattern.filter(), current.pattern.filter());
                    if std::ptr::eq(winner, s.pattern.filter()) {
                        chosen.insert(s.client_id.as_str(), s);
                    }
                }
                None => {
                    chosen.insert(s.client_id.as_str(), s);
                    order.push(s.client_id.as_str());
                }
            }
        }

        order
            .into_iter()
            .map(|client_id| {
                let s = chosen[client_id];
                SubscriberMatch {
                    client_id: s.client_id.clone(),
                    qos: s.pattern.qos(),
                    priority: s.priority,
                }
            })
            .collect()
    }

    /// Store or delete a retained message. A zero-length payload deletes
    /// the entry. Returns the previous entry, if any.
    ///
    /// Only ordinary-space changes count towards the snapshot dirty
    /// counter; `$SYS` state is rebuilt at runtime and never persisted.
    pub fn set_retained(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Option<RetainedMessage> {
        let store = if is_system(topic) {
            &mut self.system_retained
        } else {
            self.retained_changes += 1;
            &mut self.retained
        };
        if payload.is_empty() {
            store.remove(topic)
        } else {
            store.insert(
                topic.to_string(),
                RetainedMessage {
                    topic: topic.to_string(),
                    qos,
                    payload,
                },
            )
        }
    }

    /// All retained messages whose topic matches `filter`, for replay on
    /// subscribe.
    #[must_use]
    pub fn get_retained(&self, filter: &TopicFilter) -> Vec<RetainedMessage> {
        let store = if is_system(filter.filter()) {
            &self.system_retained
        } else {
            &self.retained
        };
        store
            .values()
            .filter(|r| filter.is_match(&r.topic))
            .cloned()
            .collect()
    }

    /// Delete one retained entry.
    pub fn clear_retained(&mut self, topic: &str) {
        let store = if is_system(topic) {
            &mut self.system_retained
        } else {
            &mut self.retained
        };
        if store.remove(topic).is_some() {
            self.retained_changes += 1;
        }
    }

    #[must_use]
    pub const fn retained_changes(&self) -> u64 {
        self.retained_changes
    }

    pub fn reset_retained_changes(&mut self) {
        self.retained_changes = 0;
    }

    /// Retained messages of the ordinary topic space, for snapshots.
    pub fn retained_iter(&self) -> impl Iterator<Item = &RetainedMessage> {
        self.retained.values()
    }

    /// Durable subscriptions, for snapshots.
    pub fn durable_subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subs
            .values()
            .flatten()
            .chain(self.wildcard_subs.iter())
            .filter(|s| s.durable)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.values().map(Vec::len).sum::<usize>()
            + self.wildcard_subs.len()
            + self.system_subs.len()
    }

    #[must_use]
    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Reinstall a retained message from a snapshot, without marking the
    /// store dirty.
    pub fn restore_retained(&mut self, retained: RetainedMessage) {
        let store = if is_system(&retained.topic) {
            &mut self.system_retained
        } else {
            &mut self.retained
        };
        store.insert(retained.topic.clone(), retained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe(engine: &mut SubscriptionEngine, client_id: &str, filter: &str, qos: QoS) -> bool {
        engine
            .subscribe(client_id, filter, qos, false, false, Priority::Normal)
            .unwrap()
    }

    #[test]
    fn test_resubscribe_updates_qos() {
        let mut engine = SubscriptionEngine::new();
        assert!(subscribe(&mut engine, "c", "topic/x", QoS::AtMostOnce));
        // Same pair again only replaces qos.
        assert!(!subscribe(&mut engine, "c", "topic/x", QoS::ExactOnce));

        let subscribers = engine.get_subscribers("topic/x", "p");
        assert_eq!(subscribers.len(), 1);
        assert_eq!(subscribers[0].client_id, "c");
        assert_eq!(subscribers[0].qos, QoS::ExactOnce);
        assert_eq!(engine.subscription_count(), 1);
    }

    #[test]
    fn test_unsubscribe_all() {
        let mut engine = SubscriptionEngine::new();
        subscribe(&mut engine, "c", "topic/x", QoS::AtMostOnce);
        subscribe(&mut engine, "c", "topic/#", QoS::AtLeastOnce);
        subscribe(&mut engine, "c", "$SYS/#", QoS::AtMostOnce);
        subscribe(&mut engine, "other", "topic/x", QoS::AtMostOnce);

        assert_eq!(engine.unsubscribe_all("c"), 3);
        for topic in ["topic/x", "topic/y", "$SYS/broker/uptime"] {
            assert!(engine
                .get_subscribers(topic, "p")
                .iter()
                .all(|s| s.client_id != "c"));
        }
        assert_eq!(engine.subscription_count(), 1);
    }

    #[test]
    fn test_most_specific_match_wins() {
        let mut engine = SubscriptionEngine::new();
        subscribe(&mut engine, "c", "a/#", QoS::ExactOnce);
        subscribe(&mut engine, "c", "a/b/c", QoS::AtLeastOnce);

        let subscribers = engine.get_subscribers("a/b/c", "p");
        assert_eq!(subscribers.len(), 1);
        // The concrete filter is more specific, so its qos is granted.
        assert_eq!(subscribers[0].qos, QoS::AtLeastOnce);
    }

    #[test]
    fn test_no_local_excludes_publisher() {
        let mut engine = SubscriptionEngine::new();
        engine
            .subscribe("bridge", "a/#", QoS::AtMostOnce, true, false, Priority::Normal)
            .unwrap();

        assert!(engine.get_subscribers("a/b", "bridge").is_empty());
        assert_eq!(engine.get_subscribers("a/b", "other").len(), 1);
    }

    #[test]
    fn test_system_space_is_isolated() {
        let mut engine = SubscriptionEngine::new();
        subscribe(&mut engine, "c", "#", QoS::AtMostOnce);
        assert!(engine.get_subscribers("$SYS/broker/uptime", "p").is_empty());

        subscribe(&mut engine, "c", "$SYS/#", QoS::AtMostOnce);
        assert_eq!(engine.get_subscribers("$SYS/broker/uptime", "p").len(), 1);
    }

    #[test]
    fn test_retained_lifecycle() {
        let mut engine = SubscriptionEngine::new();
        engine.set_retained("cfg/k", QoS::AtLeastOnce, Bytes::from_static(b"v"));
        assert_eq!(engine.retained_count(), 1);

        let filter = TopicFilter::parse("cfg/#").unwrap();
        let retained = engine.get_retained(&filter);
        assert_eq!(retained.len(), 1);
        assert_eq!(retained[0].topic, "cfg/k");
        assert_eq!(retained[0].payload.as_ref(), b"v");

        // Zero-length payload deletes the entry.
        engine.set_retained("cfg/k", QoS::AtLeastOnce, Bytes::new());
        assert!(engine.get_retained(&filter).is_empty());
        assert_eq!(engine.retained_count(), 0);
    }

    #[test]
    fn test_retained_changes_counter() {
        let mut engine = SubscriptionEngine::new();
        assert_eq!(engine.retained_changes(), 0);
        engine.set_retained("a", QoS::AtMostOnce, Bytes::from_static(b"1"));
        engine.set_retained("b", QoS::AtMostOnce, Bytes::from_static(b"2"));
        engine.clear_retained("a");
        assert_eq!(engine.retained_changes(), 3);
        engine.reset_retained_changes();
        assert_eq!(engine.retained_changes(), 0);
    }

    #[test]
    fn test_durable_subscriptions() {
        let mut engine = SubscriptionEngine::new();
        engine
            .subscribe("c", "a/b", QoS::AtLeastOnce, false, true, Priority::Normal)
            .unwrap();
        engine
            .subscribe("c", "b/#", QoS::AtMostOnce, false, false, Priority::Normal)
            .unwrap();

        let durable: Vec<_> = engine.durable_subscriptions().collect();
        assert_eq!(durable.len(), 1);
        assert_eq!(durable[0].pattern.filter().filter(), "a/b");
    }
}
