// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::topic::validate_sub_topic;
use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, PacketId,
    PacketType,
};

/// Client request to remove one or more subscriptions.
///
/// The topic filters are compared character-by-character with the current
/// subscription set [MQTT-3.10.4-1]; no wildcard expansion happens here.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    packet_id: PacketId,
    topics: Vec<String>,
}

impl UnsubscribePacket {
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn new(filter: &str, packet_id: PacketId) -> Result<Self, DecodeError> {
        validate_sub_topic(filter)?;
        Ok(Self {
            packet_id,
            topics: vec![filter.to_string()],
        })
    }

    #[must_use]
    pub const fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }
}

impl DecodePacket for UnsubscribePacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Unsubscribe {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() < 2 {
            return Err(DecodeError::InvalidRemainingLength);
        }
        let packet_id = ba.read_u16()?;

        let mut remaining = fixed_header.remaining_length() - 2;
        let mut topics = Vec::new();
        while remaining > 0 {
            let len = ba.read_u16()? as usize;
            let filter = ba.read_string(len)?;
            validate_sub_topic(&filter)?;
            if 2 + len > remaining {
                return Err(DecodeError::InvalidRemainingLength);
            }
            remaining -= 2 + len;
            topics.push(filter);
        }

        // An UNSUBSCRIBE packet with no payload is a protocol violation
        // [MQTT-3.10.3-2].
        if topics.is_empty() {
            return Err(DecodeError::EmptyTopicFilter);
        }

        Ok(Self { packet_id, topics })
    }
}

impl EncodePacket for UnsubscribePacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();
        let remaining_length = 2 + self.topics.iter().map(|t| 2 + t.len()).sum::<usize>();
        let fixed_header = FixedHeader::new(PacketType::Unsubscribe, remaining_length)?;
        fixed_header.encode(buf)?;
        buf.write_u16::<BigEndian>(self.packet_id)?;
        for topic in &self.topics {
            buf.write_u16::<BigEndian>(topic.len() as u16)?;
            buf.write_all(topic.as_bytes())?;
        }
        Ok(buf.len() - old_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let packet = UnsubscribePacket::new("topic/#", 11).unwrap();
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        assert_eq!(UnsubscribePacket::decode(&mut ba).unwrap(), packet);
    }
}
