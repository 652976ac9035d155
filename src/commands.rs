// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Command enums passed between the apps over mpsc channels.

use codec::{
    ConnectAckPacket, ConnectPacket, ConnectReturnCode, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS, SubscribeAckPacket,
    SubscribePacket, UnsubscribeAckPacket, UnsubscribePacket,
};
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::listener::CachedSession;
use crate::types::{Delivery, ListenerId, Priority, Publication, SessionGid, SessionId};

#[derive(Debug)]
pub enum SessionToListenerCmd {
    Connect(SessionId, ConnectPacket),
    Publish(SessionId, PublishPacket),
    PublishAck(SessionId, PublishAckPacket),
    PublishReceived(SessionId, PublishReceivedPacket),
    PublishRelease(SessionId, PublishReleasePacket),
    PublishComplete(SessionId, PublishCompletePacket),
    Subscribe(SessionId, SubscribePacket),
    Unsubscribe(SessionId, UnsubscribePacket),

    /// DISCONNECT packet received, the will is discarded.
    Disconnect(SessionId),

    /// Socket closed or errored without a DISCONNECT packet.
    ConnectionClosed(SessionId),
}

#[derive(Debug)]
pub enum ListenerToSessionCmd {
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    SubscribeAck(SubscribeAckPacket),
    UnsubscribeAck(UnsubscribeAckPacket),

    /// Close the client connection.
    Disconnect,
}

#[derive(Debug)]
pub enum ListenerToDispatcherCmd {
    /// An accepted publish: publisher client id and interned publication.
    Publish(String, Arc<Publication>),

    /// session-gid, client-id, durable, packet.
    Subscribe(SessionGid, String, bool, SubscribePacket),

    /// session-gid, client-id, packet.
    Unsubscribe(SessionGid, String, UnsubscribePacket),

    /// A session passed CONNECT validation: gid, client-id, clean-session,
    /// username.
    SessionConnected(SessionGid, String, bool, Option<String>),

    /// A persistent session lost its socket; park its state: the gid it
    /// ran under, client id and the detached state.
    SessionStored(SessionGid, String, CachedSession),

    /// A clean session ended; drop route and subscriptions.
    SessionClosed(SessionGid, String),
}

#[derive(Debug)]
pub enum DispatcherToListenerCmd {
    /// Connect handshake may finish: session id, client id, session-present
    /// flag and state to adopt for persistent sessions.
    SessionReady(SessionId, String, bool, Option<CachedSession>),

    /// Cached state that arrived after the session was already ready.
    AdoptSession(SessionId, CachedSession),

    Publish(SessionId, Delivery),

    SubscribeAck(SessionId, SubscribeAckPacket),

    /// Another connection took over this client id; close the socket
    /// silently, without firing the will.
    Takeover(SessionId),
}

#[derive(Debug, Clone)]
pub enum ListenerToAuthCmd {
    /// listener-id, session-id, username, password.
    RequestAuth(SessionGid, String, Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum AuthToListenerCmd {
    /// session-id, connect return code.
    ResponseAuth(SessionId, ConnectReturnCode),
}

#[derive(Debug)]
pub enum BridgeToDispatcherCmd {
    /// Remote publish injected into the local engine, already rewritten to
    /// the local topic space: bridge client id and publication.
    Publish(String, Arc<Publication>),

    /// Install a local subscription for a bridge: client-id, filter, qos,
    /// priority. Always `no_local`.
    Subscribe(String, String, QoS, Priority),
}

#[derive(Debug)]
pub enum DispatcherToBridgeCmd {
    /// Local publication matching a bridge subscription: bridge client id
    /// and delivery.
    Publish(String, Delivery),
}

#[derive(Debug, Clone)]
pub enum DispatcherToMetricsCmd {
    /// listener id.
    SessionAdded(ListenerId),
    /// listener id.
    SessionRemoved(ListenerId),

    /// Total live client records, connected plus parked.
    ClientsTotal(usize),

    /// count.
    SubscriptionsAdded(usize),
    /// count.
    SubscriptionsRemoved(usize),

    /// count, bytes.
    RetainedMessageAdded(usize, usize),
    /// count, bytes.
    RetainedMessageRemoved(usize, usize),

    /// count, bytes.
    PublishPacketSent(usize, usize),
    /// count, bytes.
    PublishPacketReceived(usize, usize),
    /// count.
    PublishPacketDropped(usize),
}

#[derive(Debug)]
pub enum MetricsToDispatcherCmd {
    Publish(Arc<Publication>),
}

#[derive(Debug)]
pub enum ServerContextToDispatcherCmd {
    /// SIGHUP: reload what can be reloaded.
    Reload,

    /// Persist state and acknowledge so the process can exit.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub enum ServerContextToAuthCmd {
    /// SIGHUP: reload the password file.
    Reload,
}

#[derive(Debug)]
pub enum ServerContextToBridgeCmd {
    /// Stop all bridge connections.
    Shutdown,
}
