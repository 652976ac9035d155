// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use bytes::BytesMut;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

/// A client byte stream. Plain TCP only; TLS and websocket transports are
/// out of the broker's surface.
#[derive(Debug)]
pub struct Stream {
    socket: TcpStream,
}

impl Stream {
    #[must_use]
    pub const fn new(socket: TcpStream) -> Self {
        Self { socket }
    }

    /// Read bytes into `buf`, appending at the end.
    ///
    /// # Errors
    ///
    /// Returns error if socket read fails. A return of 0 means the peer
    /// closed the connection.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize, Error> {
        self.socket.read_buf(buf).await.map_err(Into::into)
    }

    /// Write the whole buffer to the socket.
    ///
    /// # Errors
    ///
    /// Returns error if socket write fails.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.socket.write_all(buf).await.map_err(Into::into)
    }

    /// # Errors
    ///
    /// Returns error if the socket is no longer connected.
    pub fn peer_addr(&self) -> Result<SocketAddr, Error> {
        self.socket.peer_addr().map_err(Into::into)
    }
}
