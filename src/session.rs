// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Session task: pumps bytes of one client socket, frames and decodes
//! packets, and forwards them to the owning listener. All protocol state
//! beyond framing and keepalive lives in the listener's `ClientState`.

use bytes::BytesMut;
use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodeError, DecodePacket,
    EncodePacket, FixedHeader, PacketType, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribePacket, UnsubscribePacket,
};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{Receiver, Sender};

use crate::commands::{ListenerToSessionCmd, SessionToListenerCmd};
use crate::error::{Error, ErrorKind};
use crate::stream::Stream;
use crate::types::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Invalid,
    Connecting,
    Connected,
    Disconnected,
}

/// Limits a session inherits from listener and general config.
#[derive(Debug, Default, Clone)]
pub struct SessionConfig {
    keep_alive: u64,
    connect_timeout: u64,
    message_size_limit: usize,
}

impl SessionConfig {
    #[must_use]
    pub const fn new(keep_alive: u64, connect_timeout: u64, message_size_limit: usize) -> Self {
        Self {
            keep_alive,
            connect_timeout,
            message_size_limit,
        }
    }

    const fn keep_alive(&self) -> u64 {
        self.keep_alive
    }

    fn set_keep_alive(&mut self, keep_alive: u64) {
        self.keep_alive = keep_alive;
    }
}

/// One client connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    config: SessionConfig,
    stream: Stream,

    status: Status,
    client_id: String,
    instant: Instant,

    /// Set when a DISCONNECT packet was processed, so the close is clean
    /// and the will must not fire.
    clean_disconnect: bool,

    sender: Sender<SessionToListenerCmd>,
    receiver: Receiver<ListenerToSessionCmd>,
}

impl Session {
    #[must_use]
    pub fn new(
        id: SessionId,
        config: SessionConfig,
        stream: Stream,
        sender: Sender<SessionToListenerCmd>,
        receiver: Receiver<ListenerToSessionCmd>,
    ) -> Self {
        Self {
            id,
            config,
            stream,
            status: Status::Invalid,
            client_id: String::new(),
            instant: Instant::now(),
            clean_disconnect: false,
            sender,
            receiver,
        }
    }

    pub async fn run_loop(mut self) {
        let mut buf = BytesMut::with_capacity(4096);
        let connect_instant = Instant::now();
        let mut timeout_timer = tokio::time::interval(Duration::from_secs(1));

        loop {
            if self.status == Status::Disconnected {
                break;
            }

            tokio::select! {
                ret = self.stream.read_buf(&mut buf) => {
                    match ret {
                        Ok(0) => {
                            log::info!("session: Connection closed by peer, {}", self.id);
                            break;
                        }
                        Ok(_n_recv) => {
                            if let Err(err) = self.handle_incoming(&mut buf).await {
                                log::error!("session: {}: {}", self.id, err);
                                break;
                            }
                        }
                        Err(err) => {
                            log::info!("session: Socket read failed, {}: {}", self.id, err);
                            break;
                        }
                    }
                }
                Some(cmd) = self.receiver.recv() => {
                    match self.handle_listener_cmd(cmd).await {
                        Ok(true) => (),
                        Ok(false) => break,
                        Err(err) => {
                            log::error!("session: Failed to handle listener cmd: {}", err);
                            break;
                        }
                    }
                },
                _ = timeout_timer.tick() => {
                    // If the broker does not receive a CONNECT packet within
                    // a reasonable amount of time after the network
                    // connection is established, it should close the
                    // connection.
                    if self.status == Status::Invalid
                        && self.config.connect_timeout > 0
                        && connect_instant.elapsed().as_secs() > self.config.connect_timeout
                    {
                        log::info!("session: Connect timeout, {}", self.id);
                        break;
                    }

                    // If the keep alive value is non-zero and the broker
                    // does not receive a control packet from the client
                    // within one and a half times the keep alive period, it
                    // MUST disconnect the network connection as if the
                    // network had failed [MQTT-3.1.2-24].
                    if self.config.keep_alive() > 0
                        && self.instant.elapsed().as_secs() > self.config.keep_alive()
                    {
                        log::warn!(
                            "session: keep_alive timeout, disconnect client {}",
                            self.client_id
                        );
                        break;
                    }
                }
            }
        }

        // The listener fires the will unless a DISCONNECT packet made this
        // close clean.
        if !self.clean_disconnect {
            if let Err(err) = self
                .sender
                .send(SessionToListenerCmd::ConnectionClosed(self.id))
                .await
            {
                log::error!(
                    "session: Failed to send close cmd, id: {}, err: {}",
                    self.id,
                    err
                );
            }
        }
    }

    /// Reset instant when a packet is sent to or received from the client.
    fn reset_instant(&mut self) {
        self.instant = Instant::now();
    }

    async fn send<P: EncodePacket>(&mut self, packet: P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.stream.write(&buf).await?;
        self.reset_instant();
        Ok(())
    }

    /// Split complete frames off the read buffer and dispatch them.
    async fn handle_incoming(&mut self, buf: &mut BytesMut) -> Result<(), Error> {
        loop {
            let Some(frame_len) = codec::utils::frame_length(buf)? else {
                return Ok(());
            };
            if self.config.message_size_limit > 0 && frame_len > self.config.message_size_limit {
                return Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!("session: Packet of {frame_len} bytes exceeds size limit"),
                ));
            }
            if buf.len() < frame_len {
                buf.reserve(frame_len - buf.len());
                return Ok(());
            }
            let frame = buf.split_to(frame_len).freeze();
            self.reset_instant();
            self.handle_client_packet(&frame).await?;
        }
    }

    async fn handle_client_packet(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let fixed_header = FixedHeader::decode(&mut ba)?;

        match fixed_header.packet_type() {
            PacketType::Connect => self.on_client_connect(frame).await,
            PacketType::PingRequest => self.on_client_ping(frame).await,
            PacketType::Publish { .. } => self.on_client_publish(frame).await,
            PacketType::PublishAck => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishAckPacket::decode(&mut ba)?;
                self.post(SessionToListenerCmd::PublishAck(self.id, packet))
                    .await
            }
            PacketType::PublishReceived => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishReceivedPacket::decode(&mut ba)?;
                self.post(SessionToListenerCmd::PublishReceived(self.id, packet))
                    .await
            }
            PacketType::PublishRelease => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishReleasePacket::decode(&mut ba)?;
                self.post(SessionToListenerCmd::PublishRelease(self.id, packet))
                    .await
            }
            PacketType::PublishComplete => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishCompletePacket::decode(&mut ba)?;
                self.post(SessionToListenerCmd::PublishComplete(self.id, packet))
                    .await
            }
            PacketType::Subscribe => self.on_client_subscribe(frame).await,
            PacketType::Unsubscribe => self.on_client_unsubscribe(frame).await,
            PacketType::Disconnect => self.on_client_disconnect().await,
            packet_type => {
                // CONNACK, SUBACK and the like are only valid on outbound
                // bridge sessions.
                Err(Error::from_string(
                    ErrorKind::ProtocolError,
                    format!("session: Unexpected packet from client: {packet_type:?}"),
                ))
            }
        }
    }

    async fn post(&mut self, cmd: SessionToListenerCmd) -> Result<(), Error> {
        self.sender.send(cmd).await.map_err(Into::into)
    }

    async fn on_client_connect(&mut self, frame: &[u8]) -> Result<(), Error> {
        // The broker MUST process a second CONNECT packet sent from a
        // client as a protocol violation and disconnect [MQTT-3.1.0-2].
        if self.status != Status::Invalid {
            return Err(Error::new(
                ErrorKind::ProtocolError,
                "session: Got a second CONNECT packet",
            ));
        }

        let mut ba = ByteArray::new(frame);
        let packet = match ConnectPacket::decode(&mut ba) {
            Ok(packet) => packet,
            Err(err @ (DecodeError::InvalidProtocolName | DecodeError::InvalidProtocolLevel)) => {
                // The broker MUST respond with CONNACK return code 0x01 and
                // then disconnect the client if the protocol level is not
                // supported [MQTT-3.1.2-2]. Session present MUST be 0 with a
                // non-zero return code [MQTT-3.2.2-4].
                let ack_packet =
                    ConnectAckPacket::new(false, ConnectReturnCode::UnacceptedProtocol);
                self.send(ack_packet).await?;
                return Err(err.into());
            }
            Err(err) => {
                // The broker MUST validate the CONNECT packet and close the
                // connection without a CONNACK if it does not conform
                // [MQTT-3.1.4-1].
                return Err(err.into());
            }
        };

        self.client_id = packet.client_id().to_string();

        // The announced keep alive replaces the listener default, enforced
        // at one and a half times the period [MQTT-3.1.2-24].
        if packet.keep_alive() > 0 {
            self.config
                .set_keep_alive(u64::from(packet.keep_alive()) * 3 / 2);
        } else {
            self.config.set_keep_alive(0);
        }

        self.status = Status::Connecting;
        self.post(SessionToListenerCmd::Connect(self.id, packet)).await
    }

    async fn on_client_ping(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let _packet = PingRequestPacket::decode(&mut ba)?;
        let ping_resp_packet = PingResponsePacket::new();
        self.send(ping_resp_packet).await
    }

    async fn on_client_publish(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = PublishPacket::decode(&mut ba)?;
        self.post(SessionToListenerCmd::Publish(self.id, packet)).await
    }

    async fn on_client_subscribe(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        // Malformed filters, reserved QoS bits and an empty payload are all
        // protocol violations which close the connection [MQTT-4.8.0-1].
        let packet = SubscribePacket::decode(&mut ba)?;
        self.post(SessionToListenerCmd::Subscribe(self.id, packet))
            .await
    }

    async fn on_client_unsubscribe(&mut self, frame: &[u8]) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let packet = UnsubscribePacket::decode(&mut ba)?;
        self.post(SessionToListenerCmd::Unsubscribe(self.id, packet))
            .await
    }

    async fn on_client_disconnect(&mut self) -> Result<(), Error> {
        self.clean_disconnect = true;
        self.status = Status::Disconnected;
        self.post(SessionToListenerCmd::Disconnect(self.id)).await
    }

    /// Returns Ok(false) when the session should close.
    async fn handle_listener_cmd(&mut self, cmd: ListenerToSessionCmd) -> Result<bool, Error> {
        match cmd {
            ListenerToSessionCmd::ConnectAck(packet) => {
                let accepted = packet.return_code() == ConnectReturnCode::Accepted;
                self.status = if accepted {
                    Status::Connected
                } else {
                    Status::Disconnected
                };
                self.send(packet).await?;
                // A non-zero return code is followed by closing the network
                // connection [MQTT-3.2.2-5].
                Ok(accepted)
            }
            ListenerToSessionCmd::Publish(packet) => self.send(packet).await.map(|()| true),
            ListenerToSessionCmd::PublishAck(packet) => self.send(packet).await.map(|()| true),
            ListenerToSessionCmd::PublishReceived(packet) => {
                self.send(packet).await.map(|()| true)
            }
            ListenerToSessionCmd::PublishRelease(packet) => {
                self.send(packet).await.map(|()| true)
            }
            ListenerToSessionCmd::PublishComplete(packet) => {
                self.send(packet).await.map(|()| true)
            }
            ListenerToSessionCmd::SubscribeAck(packet) => self.send(packet).await.map(|()| true),
            ListenerToSessionCmd::UnsubscribeAck(packet) => {
                self.send(packet).await.map(|()| true)
            }
            ListenerToSessionCmd::Disconnect => {
                self.status = Status::Disconnected;
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use codec::utils::frame_length;
    use codec::{EncodePacket, PublishPacket, QoS};

    #[test]
    fn test_frame_length() {
        // Incomplete header.
        assert!(frame_length(&[0x30]).unwrap().is_none());

        let mut buf = Vec::new();
        PublishPacket::new("topic/x", QoS::AtMostOnce, b"hi")
            .unwrap()
            .encode(&mut buf)
            .unwrap();
        assert_eq!(frame_length(&buf).unwrap(), Some(buf.len()));

        // Partial length field of a large packet.
        assert!(frame_length(&[0x30, 0xff]).unwrap().is_none());

        // Garbage packet type.
        assert!(frame_length(&[0x00, 0x00]).is_err());
    }
}
