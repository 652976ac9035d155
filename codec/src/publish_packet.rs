// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use std::io::Write;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, PubTopic, QoS,
};

/// Transports an application message from client to broker or broker to
/// client.
///
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// +-----------------------+
/// | Topic name length     |
/// +-----------------------+
/// | Topic name ...        |
/// +-----------------------+
/// | Packet identifier     |
/// +-----------------------+
/// | Payload ...           |
/// +-----------------------+
/// ```
///
/// The packet identifier is only present when QoS is 1 or 2. The payload is
/// held in a [`Bytes`] handle, so cloning the packet for several recipients
/// shares one copy of the message body.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishPacket {
    dup: bool,
    qos: QoS,
    retain: bool,
    topic: PubTopic,
    packet_id: PacketId,
    msg: Bytes,
}

impl PublishPacket {
    /// Create a new publish packet.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn new(topic: &str, qos: QoS, msg: &[u8]) -> Result<Self, EncodeError> {
        let topic = PubTopic::new(topic)?;
        Ok(Self {
            dup: false,
            qos,
            retain: false,
            topic,
            packet_id: 0,
            msg: Bytes::copy_from_slice(msg),
        })
    }

    /// Create a publish packet around an existing payload handle, without
    /// copying the body.
    ///
    /// # Panics
    ///
    /// `topic` must already be a validated topic name.
    #[must_use]
    pub fn with_message(topic: &str, qos: QoS, msg: Bytes) -> Self {
        let topic = PubTopic::new(topic).expect("validated topic name");
        Self {
            dup: false,
            qos,
            retain: false,
            topic,
            packet_id: 0,
            msg,
        }
    }

    pub fn set_retain(&mut self, retain: bool) -> &mut Self {
        self.retain = retain;
        self
    }

    #[must_use]
    pub const fn retain(&self) -> bool {
        self.retain
    }

    /// Update the `dup` flag.
    ///
    /// # Errors
    ///
    /// The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
    pub fn set_dup(&mut self, dup: bool) -> Result<&mut Self, EncodeError> {
        if dup && self.qos == QoS::AtMostOnce {
            return Err(EncodeError::InvalidData);
        }
        self.dup = dup;
        Ok(self)
    }

    #[must_use]
    pub const fn dup(&self) -> bool {
        self.dup
    }

    pub fn set_qos(&mut self, qos: QoS) -> &mut Self {
        if qos == QoS::AtMostOnce {
            self.packet_id = 0;
        }
        self.qos = qos;
        self
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    /// Only meaningful when QoS is 1 or 2.
    pub fn set_packet_id(&mut self, packet_id: PacketId) -> &mut Self {
        self.packet_id = packet_id;
        self
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    /// Rewrite the topic, used by the bridge prefix mapping.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is not a valid topic name.
    pub fn set_topic(&mut self, topic: &str) -> Result<&mut Self, EncodeError> {
        self.topic = PubTopic::new(topic)?;
        Ok(self)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        self.topic.as_ref()
    }

    #[must_use]
    pub fn message(&self) -> &Bytes {
        &self.msg
    }

    fn remaining_length(&self) -> usize {
        let mut len = self.topic.bytes() + self.msg.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }
}

impl DecodePacket for PublishPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        let PacketType::Publish { dup, qos, retain } = fixed_header.packet_type() else {
            return Err(DecodeError::InvalidPacketType);
        };

        // The DUP flag MUST be set to 0 for all QoS 0 messages [MQTT-3.3.1-2].
        if dup && qos == QoS::AtMostOnce {
            return Err(DecodeError::InvalidPacketFlags);
        }

        let topic = PubTopic::decode(ba)?;

        let packet_id = if qos == QoS::AtMostOnce {
            0
        } else {
            let packet_id = ba.read_u16()?;
            if packet_id == 0 {
                return Err(DecodeError::InvalidPacketId);
            }
            packet_id
        };

        // It is valid for a PUBLISH packet to contain a zero length payload.
        let id_bytes = if qos == QoS::AtMostOnce { 0 } else { 2 };
        let consumed = topic.bytes() + id_bytes;
        if fixed_header.remaining_length() < consumed {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let msg_len = fixed_header.remaining_length() - consumed;
        let msg = Bytes::copy_from_slice(ba.read_bytes(msg_len)?);

        Ok(Self {
            dup,
            qos,
            retain,
            topic,
            packet_id,
            msg,
        })
    }
}

impl EncodePacket for PublishPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let packet_type = PacketType::Publish {
            dup: self.dup,
            qos: self.qos,
            retain: self.retain,
        };
        let fixed_header = FixedHeader::new(packet_type, self.remaining_length())?;
        fixed_header.encode(buf)?;

        self.topic.encode(buf)?;
        if self.qos != QoS::AtMostOnce {
            buf.write_u16::<BigEndian>(self.packet_id)?;
        }
        buf.write_all(&self.msg)?;
        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_qos0() {
        let packet = PublishPacket::new("topic/x", QoS::AtMostOnce, b"hi").unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(
            &buf,
            &[0x30, 0x0b, 0x00, 0x07, b't', b'o', b'p', b'i', b'c', b'/', b'x', b'h', b'i']
        );
        let mut ba = ByteArray::new(&buf);
        assert_eq!(PublishPacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn test_round_trip_qos2() {
        let mut packet = PublishPacket::new("a/b", QoS::ExactOnce, b"payload").unwrap();
        packet.set_packet_id(0x1234);
        packet.set_retain(true);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded.packet_id(), 0x1234);
        assert!(decoded.retain());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_decode_zero_packet_id() {
        // QoS 1 publish with packet id 0 is malformed [MQTT-2.3.1-1].
        let buf = [0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            PublishPacket::decode(&mut ba),
            Err(DecodeError::InvalidPacketId)
        );
    }

    #[test]
    fn test_empty_payload() {
        let packet = PublishPacket::new("cfg/k", QoS::AtLeastOnce, b"").unwrap();
        let mut buf = Vec::new();
        let mut packet = packet;
        packet.set_packet_id(9);
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = PublishPacket::decode(&mut ba).unwrap();
        assert!(decoded.message().is_empty());
    }
}
