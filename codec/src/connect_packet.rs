// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::convert::TryFrom;
use std::io::Write;

use crate::base::{PROTOCOL_NAME_V31, PROTOCOL_NAME_V311};
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketType,
    ProtocolLevel, PubTopic, QoS,
};

/// Connect flags byte in the variable header of a CONNECT packet.
///
/// ```txt
///  7        6        5        4  3     2      1        0
/// +--------+--------+--------+------+------+--------+----------+
/// | uname  | passwd | w.ret  | w.qos| will | clean  | reserved |
/// +--------+--------+--------+------+------+--------+----------+
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    pub username: bool,
    pub password: bool,
    pub will_retain: bool,
    pub will_qos: QoS,
    pub will: bool,
    pub clean_session: bool,
}

impl ConnectFlags {
    fn to_byte(self) -> u8 {
        let mut byte = 0;
        if self.username {
            byte |= 0b1000_0000;
        }
        if self.password {
            byte |= 0b0100_0000;
        }
        if self.will_retain {
            byte |= 0b0010_0000;
        }
        byte |= (self.will_qos as u8) << 3;
        if self.will {
            byte |= 0b0000_0100;
        }
        if self.clean_session {
            byte |= 0b0000_0010;
        }
        byte
    }

    fn from_byte(byte: u8) -> Result<Self, DecodeError> {
        // The Server MUST validate that the reserved flag is set to zero and
        // disconnect the Client if it is not zero [MQTT-3.1.2-3].
        if byte & 0b0000_0001 != 0 {
            return Err(DecodeError::InvalidConnectFlags);
        }
        let will = byte & 0b0000_0100 != 0;
        let will_qos = QoS::try_from((byte & 0b0001_1000) >> 3)
            .map_err(|_| DecodeError::InvalidConnectFlags)?;
        let will_retain = byte & 0b0010_0000 != 0;
        // If the Will Flag is set to 0, then Will QoS and Will Retain MUST be
        // set to zero [MQTT-3.1.2-13/15].
        if !will && (will_retain || will_qos != QoS::AtMostOnce) {
            return Err(DecodeError::InvalidConnectFlags);
        }
        Ok(Self {
            username: byte & 0b1000_0000 != 0,
            password: byte & 0b0100_0000 != 0,
            will_retain,
            will_qos,
            will,
            clean_session: byte & 0b0000_0010 != 0,
        })
    }
}

/// The first packet sent from a client to the broker after the network
/// connection is established [MQTT-3.1.0-1].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    protocol_level: ProtocolLevel,
    connect_flags: ConnectFlags,
    keep_alive: u16,

    client_id: String,
    will_topic: Option<PubTopic>,
    will_message: Vec<u8>,
    username: String,
    password: Vec<u8>,
}

impl ConnectPacket {
    #[must_use]
    pub fn new(client_id: &str) -> Self {
        Self {
            protocol_level: ProtocolLevel::V311,
            connect_flags: ConnectFlags {
                clean_session: true,
                ..ConnectFlags::default()
            },
            keep_alive: 60,
            client_id: client_id.to_string(),
            ..Self::default()
        }
    }

    pub fn set_protocol_level(&mut self, level: ProtocolLevel) -> &mut Self {
        self.protocol_level = level;
        self
    }

    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    #[must_use]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    pub fn set_clean_session(&mut self, clean_session: bool) -> &mut Self {
        self.connect_flags.clean_session = clean_session;
        self
    }

    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn set_client_id(&mut self, client_id: &str) -> &mut Self {
        self.client_id = client_id.to_string();
        self
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Attach a will message.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn set_will(
        &mut self,
        topic: &str,
        message: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic)?);
        self.will_message = message.to_vec();
        self.connect_flags.will = true;
        self.connect_flags.will_qos = qos;
        self.connect_flags.will_retain = retain;
        Ok(self)
    }

    #[must_use]
    pub fn will_topic(&self) -> Option<&PubTopic> {
        self.will_topic.as_ref()
    }

    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        &self.will_message
    }

    pub fn set_username(&mut self, username: &str) -> &mut Self {
        self.username = username.to_string();
        self.connect_flags.username = !username.is_empty();
        self
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn set_password(&mut self, password: &[u8]) -> &mut Self {
        self.password = password.to_vec();
        self.connect_flags.password = !password.is_empty();
        self
    }

    #[must_use]
    pub fn password(&self) -> &[u8] {
        &self.password
    }

    fn remaining_length(&self) -> usize {
        let protocol_name = self.protocol_level.protocol_name();
        let mut len = 2 + protocol_name.len() // protocol name
            + 1 // protocol level
            + 1 // connect flags
            + 2 // keep alive
            + 2 + self.client_id.len();
        if let Some(will_topic) = &self.will_topic {
            len += will_topic.bytes();
            len += 2 + self.will_message.len();
        }
        if self.connect_flags.username {
            len += 2 + self.username.len();
        }
        if self.connect_flags.password {
            len += 2 + self.password.len();
        }
        len
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name_len = ba.read_u16()? as usize;
        let protocol_name = ba.read_string(protocol_name_len)?;
        if protocol_name != PROTOCOL_NAME_V31 && protocol_name != PROTOCOL_NAME_V311 {
            return Err(DecodeError::InvalidProtocolName);
        }

        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;
        if protocol_name != protocol_level.protocol_name() {
            return Err(DecodeError::InvalidProtocolLevel);
        }

        let connect_flags = ConnectFlags::from_byte(ba.read_byte()?)?;
        let keep_alive = ba.read_u16()?;

        let client_id_len = ba.read_u16()? as usize;
        let client_id = ba.read_string(client_id_len)?;

        let (will_topic, will_message) = if connect_flags.will {
            let topic = PubTopic::decode(ba)?;
            let msg_len = ba.read_u16()? as usize;
            let msg = ba.read_bytes(msg_len)?.to_vec();
            (Some(topic), msg)
        } else {
            (None, Vec::new())
        };

        let username = if connect_flags.username {
            let len = ba.read_u16()? as usize;
            ba.read_string(len)?
        } else {
            String::new()
        };

        let password = if connect_flags.password {
            let len = ba.read_u16()? as usize;
            ba.read_bytes(len)?.to_vec()
        } else {
            Vec::new()
        };

        Ok(Self {
            protocol_level,
            connect_flags,
            keep_alive,
            client_id,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let fixed_header = FixedHeader::new(PacketType::Connect, self.remaining_length())?;
        fixed_header.encode(buf)?;

        let protocol_name = self.protocol_level.protocol_name();
        buf.write_u16::<BigEndian>(protocol_name.len() as u16)?;
        buf.write_all(protocol_name.as_bytes())?;
        buf.push(self.protocol_level as u8);
        buf.push(self.connect_flags.to_byte());
        buf.write_u16::<BigEndian>(self.keep_alive)?;

        buf.write_u16::<BigEndian>(self.client_id.len() as u16)?;
        buf.write_all(self.client_id.as_bytes())?;

        if let Some(will_topic) = &self.will_topic {
            will_topic.encode(buf)?;
            buf.write_u16::<BigEndian>(self.will_message.len() as u16)?;
            buf.write_all(&self.will_message)?;
        }
        if self.connect_flags.username {
            buf.write_u16::<BigEndian>(self.username.len() as u16)?;
            buf.write_all(self.username.as_bytes())?;
        }
        if self.connect_flags.password {
            buf.write_u16::<BigEndian>(self.password.len() as u16)?;
            buf.write_all(&self.password)?;
        }

        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut packet = ConnectPacket::new("bridge-01");
        packet.set_clean_session(false).set_keep_alive(30);
        packet
            .set_will("status/bridge-01", b"down", QoS::AtLeastOnce, true)
            .unwrap();
        packet.set_username("admin").set_password(b"secret");

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();

        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_decode_reserved_flag() {
        let mut packet_bytes = Vec::new();
        ConnectPacket::new("c").encode(&mut packet_bytes).unwrap();
        // Flip the reserved connect flag bit; byte 9 holds connect flags
        // for a v3.1.1 packet.
        packet_bytes[9] |= 0b0000_0001;
        let mut ba = ByteArray::new(&packet_bytes);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidConnectFlags)
        );
    }
}
