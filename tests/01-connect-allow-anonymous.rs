// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Anonymous and password-file authentication over a real socket.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread::sleep;
use std::time::{Duration, Instant};

use codec::{
    ByteArray, ConnectAckPacket, ConnectPacket, ConnectReturnCode, DecodePacket, EncodePacket,
};
use veles::error::Error;

mod common;
use common::{Server, ServerConfig};

const ALLOW_CONFIG: &str = r#"
[general]
pid_file = "/tmp/veles-tests/mqtt-18931.pid"

[[listeners]]
address = "127.0.0.1:18931"

[security]
allow_anonymous = true

[log]
log_file = "/tmp/veles-tests/veles-18931.log"
"#;

const DENY_CONFIG: &str = r#"
[general]
pid_file = "/tmp/veles-tests/mqtt-18932.pid"

[[listeners]]
address = "127.0.0.1:18932"

[security]
allow_anonymous = false
password_file = "/tmp/veles-tests/passwd-18932"

[log]
log_file = "/tmp/veles-tests/veles-18932.log"
"#;

fn connect_and_ack(address: &str, packet: &ConnectPacket) -> ConnectAckPacket {
    let deadline = Instant::now() + Duration::from_secs(10);
    let socket = loop {
        match TcpStream::connect(address) {
            Ok(socket) => break socket,
            Err(err) => {
                assert!(Instant::now() < deadline, "broker did not come up: {err}");
                sleep(Duration::from_millis(100));
            }
        }
    };
    let mut socket = socket;
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let mut buf = Vec::new();
    packet.encode(&mut buf).unwrap();
    socket.write_all(&buf).unwrap();

    let mut response = [0_u8; 4];
    socket.read_exact(&mut response).unwrap();
    let mut ba = ByteArray::new(&response);
    ConnectAckPacket::decode(&mut ba).unwrap()
}

#[test]
fn test_conn_allow_anonymous() -> Result<(), Error> {
    let config = ServerConfig::new("/tmp/veles-tests/01-allow-anonymous.toml", ALLOW_CONFIG)?;
    let server = Server::start(config.filename())?;

    let ack = connect_and_ack("127.0.0.1:18931", &ConnectPacket::new("anon-1"));
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);

    server.terminate();
    Ok(())
}

#[test]
fn test_conn_deny_anonymous() -> Result<(), Error> {
    let _passwd = ServerConfig::new("/tmp/veles-tests/passwd-18932", "admin:secret\n")?;
    let config = ServerConfig::new("/tmp/veles-tests/01-deny-anonymous.toml", DENY_CONFIG)?;
    let server = Server::start(config.filename())?;

    let ack = connect_and_ack("127.0.0.1:18932", &ConnectPacket::new("anon-2"));
    assert_eq!(ack.return_code(), ConnectReturnCode::NotAuthorized);

    let mut packet = ConnectPacket::new("user-1");
    packet.set_username("admin").set_password(b"secret");
    let ack = connect_and_ack("127.0.0.1:18932", &packet);
    assert_eq!(ack.return_code(), ConnectReturnCode::Accepted);

    let mut packet = ConnectPacket::new("user-2");
    packet.set_username("admin").set_password(b"wrong");
    let ack = connect_and_ack("127.0.0.1:18932", &packet);
    assert_eq!(ack.return_code(), ConnectReturnCode::BadUserNameOrPassword);

    server.terminate();
    Ok(())
}
