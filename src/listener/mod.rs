// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::acl::AclStore;
use crate::commands::{
    AuthToListenerCmd, DispatcherToListenerCmd, ListenerToAuthCmd, ListenerToDispatcherCmd,
    ListenerToSessionCmd, SessionToListenerCmd,
};
use crate::config;
use crate::types::{ListenerId, SessionId, WillMessage};

mod auth;
pub mod client;
mod dispatcher;
mod init;
mod run;
mod session;

pub use client::CachedSession;
use client::ClientState;

const CHANNEL_CAPACITY: usize = 16;

/// A CONNECT that passed validation and waits for the auth verdict and the
/// dispatcher's session state.
#[derive(Debug)]
struct PendingConnect {
    client_id: String,
    clean_session: bool,
    username: Option<String>,
    will: Option<WillMessage>,

    /// Whether `SessionConnected` went out to the dispatcher already.
    announced: bool,
}

/// One accept loop plus the protocol state of every client it owns.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    config: config::Listener,
    general: config::General,
    socket: TcpListener,
    acl: Arc<AclStore>,

    current_session_id: SessionId,
    session_senders: HashMap<SessionId, Sender<ListenerToSessionCmd>>,

    /// Connected client id to its session, the socket-handle index.
    client_ids: BTreeMap<String, SessionId>,

    /// Protocol state per connected session.
    clients: HashMap<SessionId, ClientState>,

    pending: HashMap<SessionId, PendingConnect>,

    session_sender: Sender<SessionToListenerCmd>,
    session_receiver: Option<Receiver<SessionToListenerCmd>>,

    dispatcher_sender: Sender<ListenerToDispatcherCmd>,
    dispatcher_receiver: Option<Receiver<DispatcherToListenerCmd>>,

    auth_sender: Sender<ListenerToAuthCmd>,
    auth_receiver: Option<Receiver<AuthToListenerCmd>>,
}
