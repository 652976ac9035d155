// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! One outbound bridge connection: TCP connect with failover and backoff,
//! the bridge CONNECT handshake, topic prefix rewriting in both directions
//! and the shared QoS state machine.

use bytes::BytesMut;
use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, EncodePacket,
    FixedHeader, PacketType, PingRequestPacket, ProtocolLevel, PublishAckPacket,
    PublishCompletePacket, PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS,
    SubscribeAckPacket, SubscribePacket, SubscribeTopic, TopicFilter,
};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{interval, timeout};

use super::{BridgeToConnCmd, ConnToBridgeCmd};
use crate::config;
use crate::error::{Error, ErrorKind};
use crate::listener::client::{ClientState, DeliverAction, RetryPacket};
use crate::stream::Stream;
use crate::types::{ConnectState, Delivery, Publication};

/// Seconds to wait for the remote CONNACK.
const CONNACK_TIMEOUT: u64 = 30;

/// One topic mapping with its filters parsed up front.
#[derive(Debug)]
struct Mapping {
    topic: config::BridgeTopic,
    local_filter: TopicFilter,
    remote_filter: TopicFilter,
}

#[derive(Debug)]
pub(crate) struct BridgeConnection {
    config: config::Bridge,
    client_id: String,
    mappings: Vec<Mapping>,
    retry_interval: u64,
    connection_messages: bool,

    state: ConnectState,
    client: ClientState,
    addr_index: usize,
    attempts: u32,

    /// Current handshake preference; cleared for good when the remote
    /// rejects the bridge protocol variant.
    try_private: bool,

    /// Return code of the last CONNACK; None while none was received.
    connack: Option<ConnectReturnCode>,

    last_contact: Instant,
    ping_sent_at: Option<Instant>,
    shutdown: bool,

    app_sender: Sender<ConnToBridgeCmd>,
    app_receiver: Receiver<BridgeToConnCmd>,
}

impl BridgeConnection {
    pub(crate) fn new(
        bridge: config::Bridge,
        general: &config::General,
        app_sender: Sender<ConnToBridgeCmd>,
        app_receiver: Receiver<BridgeToConnCmd>,
    ) -> Self {
        let retry_interval = general.retry_interval;
        let connection_messages = general.connection_messages;
        let client_id = bridge.effective_client_id();
        let mappings = bridge
            .topics
            .iter()
            .filter_map(|topic| {
                let local_filter = TopicFilter::parse(&topic.local_filter());
                let remote_filter = TopicFilter::parse(&topic.remote_filter());
                match (local_filter, remote_filter) {
                    (Ok(local_filter), Ok(remote_filter)) => Some(Mapping {
                        topic: topic.clone(),
                        local_filter,
                        remote_filter,
                    }),
                    _ => {
                        log::error!("bridge: Invalid topic pattern {}", topic.pattern);
                        None
                    }
                }
            })
            .collect();
        // The bridge session is persistent across reconnects, queueing
        // while the link is down.
        let mut client = ClientState::new(
            &client_id,
            bridge.clean_session,
            None,
            None,
            general.max_inflight_messages,
            general.max_queued_messages,
        );
        client.set_connected(false);
        let try_private = bridge.try_private;
        Self {
            config: bridge,
            client_id,
            mappings,
            retry_interval,
            connection_messages,
            state: ConnectState::Disconnected,
            client,
            addr_index: 0,
            attempts: 0,
            try_private,
            connack: None,
            last_contact: Instant::now(),
            ping_sent_at: None,
            shutdown: false,
            app_sender,
            app_receiver,
        }
    }

    /// Reconnect delay: the configured base doubled per failed attempt, up
    /// to the configured maximum, with a little jitter.
    fn backoff_delay(&self) -> Duration {
        if self.attempts == 0 {
            return Duration::ZERO;
        }
        let base = self.config.restart_timeout.max(1);
        let exp = self.attempts.saturating_sub(1).min(8);
        let secs = base
            .saturating_mul(1 << exp)
            .min(self.config.restart_timeout_max);
        let jitter = rand::thread_rng().gen_range(0..1000);
        Duration::from_secs(secs) + Duration::from_millis(jitter)
    }

    pub(crate) async fn run_loop(mut self) {
        loop {
            self.wait_backoff().await;
            if self.shutdown {
                break;
            }

            let address = self.config.addresses[self.addr_index].clone();
            match self.connect_once(&address).await {
                Ok(stream) => {
                    self.attempts = 0;
                    if self.connection_messages {
                        log::info!("bridge: {} connected to {address}", self.config.name);
                    }
                    if let Err(err) = self.run_connected(stream).await {
                        log::warn!("bridge: {} lost {address}: {err}", self.config.name);
                    }
                }
                Err(err) => {
                    if self.connection_messages {
                        log::warn!(
                            "bridge: {} failed to connect {address}: {err}",
                            self.config.name
                        );
                    }
                    self.attempts += 1;
                    // Try the next address in the failover list.
                    self.addr_index = (self.addr_index + 1) % self.config.addresses.len();
                }
            }
            self.state = ConnectState::Disconnected;
            self.client.set_connected(false);
            if self.shutdown {
                break;
            }
        }
        log::info!("bridge: {} stopped", self.config.name);
    }

    /// Sleep out the backoff while still accepting deliveries, which queue
    /// in the client state until the link is back.
    async fn wait_backoff(&mut self) {
        let delay = self.backoff_delay();
        if delay.is_zero() {
            return;
        }
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return,
                Some(cmd) = self.app_receiver.recv() => {
                    self.handle_app_cmd_offline(cmd);
                    if self.shutdown {
                        return;
                    }
                }
            }
        }
    }

    fn handle_app_cmd_offline(&mut self, cmd: BridgeToConnCmd) {
        match cmd {
            BridgeToConnCmd::Publish(delivery) => {
                if let Some(delivery) = self.remap_outbound(&delivery) {
                    let _action = self.client.deliver(delivery, Instant::now());
                }
            }
            BridgeToConnCmd::Shutdown => {
                self.shutdown = true;
            }
        }
    }

    async fn connect_once(&mut self, address: &str) -> Result<Stream, Error> {
        self.state = ConnectState::TcpConnecting;
        self.connack = None;
        let socket = TcpStream::connect(address).await?;
        let mut stream = Stream::new(socket);

        let mut packet = ConnectPacket::new(&self.client_id);
        packet
            .set_clean_session(self.config.clean_session)
            .set_keep_alive(self.config.keep_alive);
        if self.try_private {
            // Nonstandard bridge handshake; a remote that knows it marks
            // this session no-local to keep messages from looping back.
            packet.set_protocol_level(ProtocolLevel::V31Bridge);
        }
        if let Some(username) = &self.config.username {
            packet.set_username(username);
        }
        if let Some(password) = &self.config.password {
            packet.set_password(password.as_bytes());
        }
        self.write_packet(&mut stream, &packet).await?;
        self.state = ConnectState::TcpDoneMqttPending;

        let ack = timeout(
            Duration::from_secs(CONNACK_TIMEOUT),
            read_connack(&mut stream),
        )
        .await
        .map_err(|_elapsed| {
            Error::new(ErrorKind::SocketError, "bridge: Timed out waiting for CONNACK")
        })??;

        self.on_connack(ack.return_code())?;
        Ok(stream)
    }

    /// Apply a CONNACK return code to the connect state machine.
    fn on_connack(&mut self, return_code: ConnectReturnCode) -> Result<(), Error> {
        self.connack = Some(return_code);
        match return_code {
            ConnectReturnCode::Accepted => {
                self.state = ConnectState::MqttConnected;
                Ok(())
            }
            ConnectReturnCode::UnacceptedProtocol if self.try_private => {
                // Fall back to a standard CONNECT and remember.
                self.try_private = false;
                Err(Error::new(
                    ErrorKind::ProtocolError,
                    "bridge: Private handshake rejected, falling back",
                ))
            }
            code => Err(Error::from_string(
                ErrorKind::AuthError,
                format!("bridge: Remote refused connection: {code:?}"),
            )),
        }
    }

    async fn run_connected(&mut self, mut stream: Stream) -> Result<(), Error> {
        self.client.set_connected(true);
        self.last_contact = Instant::now();
        self.ping_sent_at = None;

        self.send_remote_subscribes(&mut stream).await?;

        // Resume inflight handshakes, then drain what queued while the
        // link was down.
        let retries = self.client.retries(Instant::now(), Duration::ZERO);
        for retry in retries {
            self.write_retry(&mut stream, retry).await?;
        }
        let packets = self.client.process_queued(Instant::now());
        for packet in packets {
            self.write_packet(&mut stream, &packet).await?;
        }

        let mut buf = BytesMut::with_capacity(4096);
        let mut housekeeping_timer = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                ret = stream.read_buf(&mut buf) => {
                    match ret {
                        Ok(0) => {
                            return Err(Error::new(
                                ErrorKind::SocketError,
                                "bridge: Connection closed by remote",
                            ));
                        }
                        Ok(_n_recv) => {
                            self.last_contact = Instant::now();
                            self.drain_frames(&mut buf, &mut stream).await?;
                        }
                        Err(err) => return Err(err),
                    }
                }
                Some(cmd) = self.app_receiver.recv() => {
                    match cmd {
                        BridgeToConnCmd::Publish(delivery) => {
                            self.forward_out(delivery, &mut stream).await?;
                        }
                        BridgeToConnCmd::Shutdown => {
                            self.shutdown = true;
                            return Ok(());
                        }
                    }
                }
                _ = housekeeping_timer.tick() => {
                    self.housekeeping(&mut stream).await?;
                }
            }
        }
    }

    /// Subscribe the `in`/`both` mappings on the remote broker.
    async fn send_remote_subscribes(&mut self, stream: &mut Stream) -> Result<(), Error> {
        let mut topics = Vec::new();
        for mapping in &self.mappings {
            if matches!(
                mapping.topic.direction,
                config::BridgeDirection::In | config::BridgeDirection::Both
            ) {
                match SubscribeTopic::new(&mapping.topic.remote_filter(), mapping.topic.qos) {
                    Ok(topic) => topics.push(topic),
                    Err(err) => log::error!(
                        "bridge: Invalid remote filter {}: {err:?}",
                        mapping.topic.remote_filter()
                    ),
                }
            }
        }
        if topics.is_empty() {
            return Ok(());
        }
        let packet_id = self.client.assign_packet_id().ok_or_else(|| {
            Error::new(ErrorKind::ResourceExhausted, "bridge: No free packet id")
        })?;
        let packet = SubscribePacket::with_topics(packet_id, topics);
        self.write_packet(stream, &packet).await
    }

    async fn drain_frames(&mut self, buf: &mut BytesMut, stream: &mut Stream) -> Result<(), Error> {
        loop {
            let Some(frame_len) = codec::utils::frame_length(buf)? else {
                return Ok(());
            };
            if buf.len() < frame_len {
                return Ok(());
            }
            let frame = buf.split_to(frame_len).freeze();
            self.handle_remote_packet(&frame, stream).await?;
        }
    }

    async fn handle_remote_packet(
        &mut self,
        frame: &[u8],
        stream: &mut Stream,
    ) -> Result<(), Error> {
        let mut ba = ByteArray::new(frame);
        let fixed_header = FixedHeader::decode(&mut ba)?;
        match fixed_header.packet_type() {
            PacketType::Publish { .. } => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishPacket::decode(&mut ba)?;
                self.on_remote_publish(packet, stream).await
            }
            PacketType::PublishAck => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishAckPacket::decode(&mut ba)?;
                self.client.on_publish_ack(packet.packet_id());
                self.flush_queued(stream).await
            }
            PacketType::PublishReceived => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishReceivedPacket::decode(&mut ba)?;
                if let Some(release) = self
                    .client
                    .on_publish_received(packet.packet_id(), Instant::now())
                {
                    self.write_packet(stream, &release).await?;
                }
                Ok(())
            }
            PacketType::PublishRelease => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishReleasePacket::decode(&mut ba)?;
                if let Some(publication) = self.client.inbound_release(packet.packet_id()) {
                    self.inject(publication).await?;
                }
                let ack = PublishCompletePacket::new(packet.packet_id());
                self.write_packet(stream, &ack).await
            }
            PacketType::PublishComplete => {
                let mut ba = ByteArray::new(frame);
                let packet = PublishCompletePacket::decode(&mut ba)?;
                self.client.on_publish_complete(packet.packet_id());
                self.flush_queued(stream).await
            }
            PacketType::PingResponse => {
                self.ping_sent_at = None;
                Ok(())
            }
            PacketType::SubscribeAck => {
                let mut ba = ByteArray::new(frame);
                let packet = SubscribeAckPacket::decode(&mut ba)?;
                log::info!(
                    "bridge: {} remote granted {:?}",
                    self.config.name,
                    packet.acks()
                );
                Ok(())
            }
            packet_type => {
                log::warn!("bridge: Unexpected packet from remote: {packet_type:?}");
                Ok(())
            }
        }
    }

    /// An inbound remote publish: rewrite into the local topic space and
    /// run the inbound QoS handshake.
    async fn on_remote_publish(
        &mut self,
        packet: PublishPacket,
        stream: &mut Stream,
    ) -> Result<(), Error> {
        let publication = self.remap_inbound(&packet);
        match packet.qos() {
            QoS::AtMostOnce => {
                if let Some(publication) = publication {
                    self.inject(publication).await?;
                }
                Ok(())
            }
            QoS::AtLeastOnce => {
                if let Some(publication) = publication {
                    self.inject(publication).await?;
                }
                let ack = PublishAckPacket::new(packet.packet_id());
                self.write_packet(stream, &ack).await
            }
            QoS::ExactOnce => {
                if let Some(publication) = publication {
                    // Stored and injected on PUBREL; a duplicate is only
                    // acknowledged again.
                    let _is_new = self.client.inbound_publish(packet.packet_id(), publication);
                }
                let ack = PublishReceivedPacket::new(packet.packet_id());
                self.write_packet(stream, &ack).await
            }
        }
    }

    async fn inject(&mut self, publication: Arc<Publication>) -> Result<(), Error> {
        self.app_sender
            .send(ConnToBridgeCmd::Publish(self.client_id.clone(), publication))
            .await
            .map_err(|err| Error::from_string(ErrorKind::ChannelError, format!("{err}")))
    }

    /// Rewrite a remote publish into the local topic space, keyed by the
    /// first matching `in`/`both` mapping.
    fn remap_inbound(&self, packet: &PublishPacket) -> Option<Arc<Publication>> {
        for mapping in &self.mappings {
            if !matches!(
                mapping.topic.direction,
                config::BridgeDirection::In | config::BridgeDirection::Both
            ) {
                continue;
            }
            if !mapping.remote_filter.is_match(packet.topic()) {
                continue;
            }
            let suffix = packet.topic().strip_prefix(&mapping.topic.remote_prefix)?;
            let local_topic = format!("{}{}", mapping.topic.local_prefix, suffix);
            return Some(Arc::new(Publication {
                topic: local_topic,
                qos: packet.qos(),
                retain: packet.retain(),
                payload: packet.message().clone(),
            }));
        }
        None
    }

    /// Rewrite a local delivery into the remote topic space.
    fn remap_outbound(&self, delivery: &Delivery) -> Option<Delivery> {
        let topic = &delivery.publication.topic;
        for mapping in &self.mappings {
            if !matches!(
                mapping.topic.direction,
                config::BridgeDirection::Out | config::BridgeDirection::Both
            ) {
                continue;
            }
            if !mapping.local_filter.is_match(topic) {
                continue;
            }
            let suffix = topic.strip_prefix(&mapping.topic.local_prefix)?;
            let remote_topic = format!("{}{}", mapping.topic.remote_prefix, suffix);
            return Some(Delivery {
                publication: Arc::new(Publication {
                    topic: remote_topic,
                    qos: delivery.publication.qos,
                    retain: delivery.publication.retain,
                    payload: delivery.publication.payload.clone(),
                }),
                qos: delivery.qos,
                retain: delivery.retain,
                priority: delivery.priority,
            });
        }
        None
    }

    async fn forward_out(&mut self, delivery: Delivery, stream: &mut Stream) -> Result<(), Error> {
        let Some(delivery) = self.remap_outbound(&delivery) else {
            return Ok(());
        };
        match self.client.deliver(delivery, Instant::now()) {
            DeliverAction::Publish(packet) => self.write_packet(stream, &packet).await,
            DeliverAction::Queued | DeliverAction::Dropped => Ok(()),
        }
    }

    async fn flush_queued(&mut self, stream: &mut Stream) -> Result<(), Error> {
        let packets = self.client.process_queued(Instant::now());
        for packet in packets {
            self.write_packet(stream, &packet).await?;
        }
        Ok(())
    }

    /// Periodic work on a live link: retry sweep and the keepalive probe.
    async fn housekeeping(&mut self, stream: &mut Stream) -> Result<(), Error> {
        let retries = self
            .client
            .retries(Instant::now(), Duration::from_secs(self.retry_interval));
        for retry in retries {
            self.write_retry(stream, retry).await?;
        }

        let keep_alive = u64::from(self.config.keep_alive);
        if keep_alive == 0 {
            return Ok(());
        }
        if let Some(ping_sent_at) = self.ping_sent_at {
            if ping_sent_at.elapsed().as_secs() > keep_alive {
                return Err(Error::new(
                    ErrorKind::SocketError,
                    "bridge: Ping response timed out",
                ));
            }
        } else if self.last_contact.elapsed().as_secs() > keep_alive * 3 / 2 {
            self.write_packet(stream, &PingRequestPacket::new()).await?;
            self.ping_sent_at = Some(Instant::now());
        }
        Ok(())
    }

    async fn write_retry(&mut self, stream: &mut Stream, retry: RetryPacket) -> Result<(), Error> {
        match retry {
            RetryPacket::Publish(packet) => self.write_packet(stream, &packet).await,
            RetryPacket::Release(packet) => self.write_packet(stream, &packet).await,
        }
    }

    async fn write_packet<P: EncodePacket>(
        &mut self,
        stream: &mut Stream,
        packet: &P,
    ) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        stream.write(&buf).await
    }
}

/// Read the CONNACK that must open the remote's side of the stream.
async fn read_connack(stream: &mut Stream) -> Result<ConnectAckPacket, Error> {
    let mut buf = BytesMut::with_capacity(64);
    loop {
        let n_recv = stream.read_buf(&mut buf).await?;
        if n_recv == 0 {
            return Err(Error::new(
                ErrorKind::SocketError,
                "bridge: Remote closed before CONNACK",
            ));
        }
        if let Some(frame_len) = codec::utils::frame_length(&buf)? {
            if buf.len() >= frame_len {
                let frame = buf.split_to(frame_len);
                let mut ba = ByteArray::new(&frame);
                return ConnectAckPacket::decode(&mut ba).map_err(Into::into);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use crate::types::Priority;

    fn bridge_config() -> config::Bridge {
        let content = r#"
name = "edge"
addresses = ["remote.example.com:1883"]
restart_timeout = 2
restart_timeout_max = 60

[[topics]]
pattern = "sensors/#"
direction = "both"
local_prefix = "local/"
remote_prefix = "remote/"
qos = "AtLeastOnce"
"#;
        toml::from_str(content).unwrap()
    }

    fn connection() -> BridgeConnection {
        let (app_sender, _app_receiver_keep) = mpsc::channel(4);
        let (_conn_sender_keep, app_receiver) = mpsc::channel(4);
        let general = config::General::default();
        BridgeConnection::new(bridge_config(), &general, app_sender, app_receiver)
    }

    #[test]
    fn test_remap_outbound() {
        let conn = connection();
        let delivery = Delivery {
            publication: Publication::new(
                "local/sensors/temp",
                QoS::AtLeastOnce,
                false,
                Bytes::from_static(b"21"),
            ),
            qos: QoS::AtLeastOnce,
            retain: false,
            priority: Priority::Normal,
        };
        let remapped = conn.remap_outbound(&delivery).expect("mapping matches");
        assert_eq!(remapped.publication.topic, "remote/sensors/temp");
        assert_eq!(remapped.publication.payload.as_ref(), b"21");

        let other = Delivery {
            publication: Publication::new("other/x", QoS::AtMostOnce, false, Bytes::new()),
            qos: QoS::AtMostOnce,
            retain: false,
            priority: Priority::Normal,
        };
        assert!(conn.remap_outbound(&other).is_none());
    }

    #[test]
    fn test_remap_inbound() {
        let conn = connection();
        let mut packet =
            PublishPacket::new("remote/sensors/hum", QoS::ExactOnce, b"55").unwrap();
        packet.set_packet_id(4);
        let publication = conn.remap_inbound(&packet).expect("mapping matches");
        assert_eq!(publication.topic, "local/sensors/hum");
        assert_eq!(publication.qos, QoS::ExactOnce);

        let packet = PublishPacket::new("elsewhere/x", QoS::AtMostOnce, b"").unwrap();
        assert!(conn.remap_inbound(&packet).is_none());
    }

    #[test]
    fn test_try_private_fallback() {
        let mut conn = connection();
        assert!(conn.try_private);

        // The remote rejects the bridge variant once; the preference flips
        // for every following attempt.
        assert!(conn
            .on_connack(ConnectReturnCode::UnacceptedProtocol)
            .is_err());
        assert!(!conn.try_private);
        assert_eq!(conn.connack, Some(ConnectReturnCode::UnacceptedProtocol));

        // A plain rejection without try_private is an auth-style error.
        assert!(conn.on_connack(ConnectReturnCode::NotAuthorized).is_err());

        assert!(conn.on_connack(ConnectReturnCode::Accepted).is_ok());
        assert_eq!(conn.state, ConnectState::MqttConnected);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut conn = connection();
        assert_eq!(conn.backoff_delay(), Duration::ZERO);

        conn.attempts = 1;
        let first = conn.backoff_delay();
        assert!(first >= Duration::from_secs(2));

        conn.attempts = 3;
        let third = conn.backoff_delay();
        assert!(third >= Duration::from_secs(8));

        conn.attempts = 20;
        let capped = conn.backoff_delay();
        assert!(capped < Duration::from_secs(62));
    }
}
