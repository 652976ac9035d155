// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, QoS,
};

/// Result for one topic filter in a SUBACK payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeAck {
    /// Subscription accepted at the granted maximum QoS.
    QoS(QoS),

    /// Subscription refused, return code 0x80.
    Failed,
}

impl SubscribeAck {
    fn to_byte(self) -> u8 {
        match self {
            Self::QoS(qos) => qos as u8,
            Self::Failed => 0x80,
        }
    }
}

impl TryFrom<u8> for SubscribeAck {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        if v == 0x80 {
            Ok(Self::Failed)
        } else {
            Ok(Self::QoS(QoS::try_from(v)?))
        }
    }
}

/// Broker reply to a SUBSCRIBE packet, one return code per requested filter,
/// in the same order [MQTT-3.9.3-1].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeAckPacket {
    packet_id: PacketId,
    acks: Vec<SubscribeAck>,
}

impl SubscribeAckPacket {
    #[must_use]
    pub fn new(packet_id: PacketId, ack: SubscribeAck) -> Self {
        Self {
            packet_id,
            acks: vec![ack],
        }
    }

    #[must_use]
    pub const fn with_vec(packet_id: PacketId, acks: Vec<SubscribeAck>) -> Self {
        Self { packet_id, acks }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn acks(&self) -> &[SubscribeAck] {
        &self.acks
    }
}

impl DecodePacket for SubscribeAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::SubscribeAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() < 2 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let packet_id = ba.read_u16()?;
        let mut acks = Vec::new();
        for _ in 0..fixed_header.remaining_length() - 2 {
            acks.push(SubscribeAck::try_from(ba.read_byte()?)?);
        }
        Ok(Self { packet_id, acks })
    }
}

impl EncodePacket for SubscribeAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let remaining_length = 2 + self.acks.len();
        let fixed_header = FixedHeader::new(PacketType::SubscribeAck, remaining_length)?;
        let header_bytes = fixed_header.encode(buf)?;
        buf.write_u16::<BigEndian>(self.packet_id)?;
        for ack in &self.acks {
            buf.push(ack.to_byte());
        }
        Ok(header_bytes + remaining_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = SubscribeAckPacket::with_vec(
            3,
            vec![
                SubscribeAck::QoS(QoS::ExactOnce),
                SubscribeAck::Failed,
                SubscribeAck::QoS(QoS::AtMostOnce),
            ],
        );
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x90, 0x05, 0x00, 0x03, 0x02, 0x80, 0x00]);
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribeAckPacket::decode(&mut ba).unwrap(), packet);
    }
}
