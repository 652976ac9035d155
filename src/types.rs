// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::Bytes;
use codec::QoS;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type ListenerId = u32;
pub type SessionId = u64;
pub type Uptime = u64;

/// Client id used for broker-internal publishes like `$SYS` statistics.
pub const INTERNAL_CLIENT_ID: &str = "$SYS/INTERNAL/CLIENT";

/// Globally unique session id, combining listener id and its local session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionGid {
    listener_id: ListenerId,
    session_id: SessionId,
}

impl SessionGid {
    #[must_use]
    pub const fn new(listener_id: ListenerId, session_id: SessionId) -> Self {
        Self {
            listener_id,
            session_id,
        }
    }

    #[must_use]
    pub const fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }
}

/// Delivery priority band of a subscription.
///
/// Higher priority messages may overtake queued lower priority ones; within
/// one band publisher order is kept.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[derive(Deserialize, Serialize)]
pub enum Priority {
    #[serde(alias = "low")]
    Low = 0,

    #[default]
    #[serde(alias = "normal")]
    Normal = 1,

    #[serde(alias = "high")]
    High = 2,
}

pub const PRIORITY_MAX: usize = 3;

impl Priority {
    #[must_use]
    pub const fn band(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn from_band(band: usize) -> Self {
        match band {
            0 => Self::Low,
            2 => Self::High,
            _ => Self::Normal,
        }
    }
}

/// An accepted application message, interned so every recipient shares one
/// copy. The `Arc` strong count is the reference count; dropping the last
/// clone frees the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

impl Publication {
    #[must_use]
    pub fn new(topic: &str, qos: QoS, retain: bool, payload: Bytes) -> Arc<Self> {
        Arc::new(Self {
            topic: topic.to_string(),
            qos,
            retain,
            payload,
        })
    }
}

/// One pending delivery of a publication to one recipient.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub publication: Arc<Publication>,

    /// Effective QoS, `min(publication.qos, granted qos)`.
    pub qos: QoS,

    /// Set on retained replay after a subscribe.
    pub retain: bool,

    pub priority: Priority,
}

/// Will message captured from CONNECT flags, published when the owning
/// connection ends uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Connection progress of an outbound bridge session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    #[default]
    Disconnected,

    /// TCP connect issued, not yet established.
    TcpConnecting,

    /// TCP established, CONNECT packet sent, waiting for CONNACK.
    TcpDoneMqttPending,

    MqttConnected,
}
