// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;
use tokio::sync::mpsc;

use crate::commands::{
    AuthToListenerCmd, BridgeToDispatcherCmd, DispatcherToBridgeCmd, DispatcherToListenerCmd,
    DispatcherToMetricsCmd, ListenerToAuthCmd, ListenerToDispatcherCmd, ListenerToSessionCmd,
    MetricsToDispatcherCmd, SessionToListenerCmd,
};
use crate::types::SessionId;

/// Represent the types of errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error occurred while performing I/O.
    IoError,

    /// Packet encode error.
    EncodeError,

    /// Packet decode error.
    DecodeError,

    /// Send packet error.
    SendError,

    /// Socket stream error.
    SocketError,

    /// Peer violated the protocol state machine.
    ProtocolError,

    /// Credentials rejected or access denied.
    AuthError,

    /// Msg-id pool exhausted or a queue is full.
    ResourceExhausted,

    /// Session with id not found.
    SessionNotFound,

    /// mpsc channel error.
    ChannelError,

    /// Invalid config file.
    ConfigError,

    LoggerError,

    /// Invalid pid file.
    PidError,

    /// Command line parameter error.
    ParameterError,

    /// File format error.
    FormatError,

    /// Persistence read or write failed.
    StorageError,

    /// Unrecoverable error; the broker records FFDC and exits.
    Fatal,
}

#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn session_error(session_id: SessionId) -> Self {
        Self::from_string(
            ErrorKind::SessionNotFound,
            format!("Session with id {session_id} not found"),
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::from_string(ErrorKind::IoError, format!("IoError {err}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::from_string(ErrorKind::ConfigError, format!("{err:?}"))
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Self::from_string(ErrorKind::StorageError, format!("{err:?}"))
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Self::from_string(ErrorKind::FormatError, format!("{err:?}"))
    }
}

// Internal error convertions.
impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("{err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("{err:?}"))
    }
}

impl From<codec::TopicError> for Error {
    fn from(err: codec::TopicError) -> Self {
        Self::from_string(ErrorKind::FormatError, format!("{err:?}"))
    }
}

macro_rules! convert_send_error {
    ($cmd_type: ident) => {
        impl From<mpsc::error::SendError<$cmd_type>> for Error {
            fn from(err: mpsc::error::SendError<$cmd_type>) -> Self {
                Self::from_string(
                    ErrorKind::ChannelError,
                    format!("{} channel error: {}", stringify!($cmd_type), err),
                )
            }
        }
    };
}

convert_send_error!(AuthToListenerCmd);
convert_send_error!(BridgeToDispatcherCmd);
convert_send_error!(DispatcherToBridgeCmd);
convert_send_error!(DispatcherToListenerCmd);
convert_send_error!(DispatcherToMetricsCmd);
convert_send_error!(ListenerToAuthCmd);
convert_send_error!(ListenerToDispatcherCmd);
convert_send_error!(ListenerToSessionCmd);
convert_send_error!(MetricsToDispatcherCmd);
convert_send_error!(SessionToListenerCmd);
