// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::convert::TryFrom;
use std::io::Write;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType, QoS, TopicFilter,
};

/// One topic filter / requested QoS pair in the SUBSCRIBE payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribeTopic {
    filter: TopicFilter,
    qos: QoS,
}

impl SubscribeTopic {
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn new(filter: &str, qos: QoS) -> Result<Self, DecodeError> {
        let filter = TopicFilter::parse(filter)?;
        Ok(Self { filter, qos })
    }

    #[must_use]
    pub const fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }

    fn bytes(&self) -> usize {
        2 + self.filter.filter().len() + 1
    }
}

/// Client request to subscribe to one or more topic filters.
///
/// The payload MUST contain at least one filter/QoS pair [MQTT-3.8.3-3].
/// Each subscription replaces any existing subscription with the same
/// filter [MQTT-3.8.4-3].
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    packet_id: PacketId,
    topics: Vec<SubscribeTopic>,
}

impl SubscribePacket {
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn new(filter: &str, qos: QoS, packet_id: PacketId) -> Result<Self, DecodeError> {
        let topic = SubscribeTopic::new(filter, qos)?;
        Ok(Self {
            packet_id,
            topics: vec![topic],
        })
    }

    #[must_use]
    pub fn with_topics(packet_id: PacketId, topics: Vec<SubscribeTopic>) -> Self {
        Self { packet_id, topics }
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topics(&self) -> &[SubscribeTopic] {
        &self.topics
    }
}

impl DecodePacket for SubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Subscribe {
            return Err(DecodeError::InvalidPacketType);
        }

        if fixed_header.remaining_length() < 2 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let packet_id = ba.read_u16()?;
        if packet_id == 0 {
            return Err(DecodeError::InvalidPacketId);
        }

        let mut remaining = fixed_header.remaining_length() - 2;
        let mut topics = Vec::new();
        while remaining > 0 {
            let filter = TopicFilter::decode(ba)?;
            // The upper six bits of the requested QoS byte are reserved; the
            // broker MUST treat the packet as malformed if they are non-zero
            // or QoS is not 0, 1 or 2 [MQTT-3-8.3-4].
            let qos_byte = ba.read_byte()?;
            if qos_byte & 0b1111_1100 != 0 {
                return Err(DecodeError::InvalidQoS);
            }
            let qos = QoS::try_from(qos_byte)?;
            let filter_bytes = 2 + filter.filter().len() + 1;
            if filter_bytes > remaining {
                return Err(DecodeError::InvalidRemainingLength);
            }
            remaining -= filter_bytes;
            topics.push(SubscribeTopic { filter, qos });
        }

        if topics.is_empty() {
            return Err(DecodeError::EmptyTopicFilter);
        }

        Ok(Self { packet_id, topics })
    }
}

impl EncodePacket for SubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let remaining_length = 2 + self.topics.iter().map(SubscribeTopic::bytes).sum::<usize>();
        let fixed_header = FixedHeader::new(PacketType::Subscribe, remaining_length)?;
        fixed_header.encode(buf)?;
        buf.write_u16::<BigEndian>(self.packet_id)?;
        for topic in &self.topics {
            buf.write_u16::<BigEndian>(topic.filter.filter().len() as u16)?;
            buf.write_all(topic.filter.filter().as_bytes())?;
            buf.push(topic.qos as u8);
        }
        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = SubscribePacket::new("topic/#", QoS::AtLeastOnce, 42).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(SubscribePacket::decode(&mut ba).unwrap(), packet);
    }

    #[test]
    fn test_decode_empty_payload() {
        // SUBSCRIBE with no filter/qos pairs is a protocol violation.
        let buf = [0x82, 0x02, 0x00, 0x01];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            SubscribePacket::decode(&mut ba),
            Err(DecodeError::EmptyTopicFilter)
        );
    }

    #[test]
    fn test_decode_reserved_qos_bits() {
        let buf = [
            0x82, 0x07, 0x00, 0x01, 0x00, 0x02, b'a', b'b', 0x42,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            SubscribePacket::decode(&mut ba),
            Err(DecodeError::InvalidQoS)
        );
    }
}
