// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! End-to-end broker test over a real socket: connect, QoS 1 publish with
//! acknowledgement, retained replay and the will on an unclean disconnect.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread::sleep;
use std::time::{Duration, Instant};

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, DisconnectPacket,
    EncodePacket, PublishAckPacket, PublishPacket, QoS, SubscribeAck, SubscribeAckPacket,
    SubscribePacket,
};
use veles::error::Error;

mod common;
use common::{Server, ServerConfig};

const CONFIG: &str = r#"
[general]
pid_file = "/tmp/veles-tests/mqtt-18930.pid"

[[listeners]]
address = "127.0.0.1:18930"

[log]
log_file = "/tmp/veles-tests/veles-18930.log"
"#;

const ADDRESS: &str = "127.0.0.1:18930";

struct TestClient {
    socket: TcpStream,
    buf: Vec<u8>,
}

impl TestClient {
    /// Connect to the broker, retrying while it is still starting up.
    fn open() -> Self {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match TcpStream::connect(ADDRESS) {
                Ok(socket) => {
                    socket
                        .set_read_timeout(Some(Duration::from_secs(5)))
                        .unwrap();
                    return Self {
                        socket,
                        buf: Vec::new(),
                    };
                }
                Err(err) => {
                    assert!(Instant::now() < deadline, "broker did not come up: {err}");
                    sleep(Duration::from_millis(100));
                }
            }
        }
    }

    fn send<P: EncodePacket>(&mut self, packet: &P) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        self.socket.write_all(&buf).unwrap();
    }

    /// Read exactly one packet off the stream.
    fn read_frame(&mut self) -> Vec<u8> {
        loop {
            if let Some(frame_len) = codec::utils::frame_length(&self.buf).unwrap() {
                if self.buf.len() >= frame_len {
                    let rest = self.buf.split_off(frame_len);
                    return std::mem::replace(&mut self.buf, rest);
                }
            }
            let mut chunk = [0_u8; 1024];
            let n_recv = self.socket.read(&mut chunk).expect("read timed out");
            assert!(n_recv > 0, "broker closed the connection");
            self.buf.extend_from_slice(&chunk[..n_recv]);
        }
    }

    fn connect(&mut self, client_id: &str) -> ConnectAckPacket {
        let packet = ConnectPacket::new(client_id);
        self.send(&packet);
        let frame = self.read_frame();
        let mut ba = ByteArray::new(&frame);
        ConnectAckPacket::decode(&mut ba).unwrap()
    }
}

#[test]
fn test_pubsub_retained_will() -> Result<(), Error> {
    let config = ServerConfig::new("/tmp/veles-tests/02-pubsub.toml", CONFIG)?;
    let server = Server::start(config.filename())?;

    // Subscriber.
    let mut sub = TestClient::open();
    let ack = sub.connect("pubsub-b");
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
    assert!(!ack.session_present());

    sub.send(&SubscribePacket::new("grid/#", QoS::AtLeastOnce, 2).unwrap());
    let frame = sub.read_frame();
    let mut ba = ByteArray::new(&frame);
    let suback = SubscribeAckPacket::decode(&mut ba).unwrap();
    assert_eq!(suback.packet_id(), 2);
    assert_eq!(suback.acks(), &[SubscribeAck::QoS(QoS::AtLeastOnce)]);

    // Publisher with a will on grid/offline.
    let mut publisher = TestClient::open();
    let mut connect_packet = ConnectPacket::new("pubsub-a");
    connect_packet
        .set_will("grid/offline", b"down", QoS::AtLeastOnce, false)
        .unwrap();
    publisher.send(&connect_packet);
    let frame = publisher.read_frame();
    let mut ba = ByteArray::new(&frame);
    let ack = ConnectAckPacket::decode(&mut ba).unwrap();
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);

    // QoS 1 retained publish; the publisher gets its PUBACK first.
    let mut publish = PublishPacket::new("grid/k", QoS::AtLeastOnce, b"v").unwrap();
    publish.set_packet_id(3);
    publish.set_retain(true);
    publisher.send(&publish);
    let frame = publisher.read_frame();
    let mut ba = ByteArray::new(&frame);
    let puback = PublishAckPacket::decode(&mut ba).unwrap();
    assert_eq!(puback.packet_id(), 3);

    // The subscriber receives it live, with the retain flag clear.
    let frame = sub.read_frame();
    let mut ba = ByteArray::new(&frame);
    let delivered = PublishPacket::decode(&mut ba).unwrap();
    assert_eq!(delivered.topic(), "grid/k");
    assert_eq!(delivered.qos(), QoS::AtLeastOnce);
    assert_eq!(delivered.message().as_ref(), b"v");
    assert!(!delivered.retain());
    assert!(!delivered.dup());
    sub.send(&PublishAckPacket::new(delivered.packet_id()));

    // Kill the publisher's TCP without DISCONNECT: the will fires.
    drop(publisher);
    let frame = sub.read_frame();
    let mut ba = ByteArray::new(&frame);
    let will = PublishPacket::decode(&mut ba).unwrap();
    assert_eq!(will.topic(), "grid/offline");
    assert_eq!(will.message().as_ref(), b"down");
    sub.send(&PublishAckPacket::new(will.packet_id()));

    // A fresh subscriber gets the retained message replayed.
    let mut late = TestClient::open();
    let ack = late.connect("pubsub-c");
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);
    late.send(&SubscribePacket::new("grid/k", QoS::AtLeastOnce, 9).unwrap());
    let frame = late.read_frame();
    let mut ba = ByteArray::new(&frame);
    let suback = SubscribeAckPacket::decode(&mut ba).unwrap();
    assert_eq!(suback.packet_id(), 9);
    let frame = late.read_frame();
    let mut ba = ByteArray::new(&frame);
    let replayed = PublishPacket::decode(&mut ba).unwrap();
    assert_eq!(replayed.topic(), "grid/k");
    assert_eq!(replayed.message().as_ref(), b"v");
    assert!(replayed.retain());
    late.send(&PublishAckPacket::new(replayed.packet_id()));

    // Clean disconnects.
    sub.send(&DisconnectPacket::new());
    late.send(&DisconnectPacket::new());
    sleep(Duration::from_millis(200));

    server.terminate();
    Ok(())
}
