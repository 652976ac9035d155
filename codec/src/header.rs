// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS, VarInt};

/// Control packet type in the upper four bits of the first header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to broker.
    Connect,

    /// Broker reply to connect request.
    ConnectAck,

    /// Publish message.
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement, QoS 1 response.
    PublishAck,

    /// Publish received, first QoS 2 response.
    PublishReceived,

    /// Publish release, second QoS 2 step.
    PublishRelease,

    /// Publish complete, final QoS 2 step.
    PublishComplete,

    /// Client subscribe request.
    Subscribe,

    /// Subscribe acknowledgement.
    SubscribeAck,

    /// Unsubscribe request.
    Unsubscribe,

    /// Unsubscribe acknowledgement.
    UnsubscribeAck,

    /// Ping request.
    PingRequest,

    /// Ping response.
    PingResponse,

    /// Peer is disconnecting.
    Disconnect,
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits: u8 = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
        };

        let flag_bits: u8 = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0b0000_0000 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactOnce => 0b0000_0100,
                };
                let retain = if retain { 0b0000_0001 } else { 0b0000_0000 };
                dup | qos | retain
            }
            // Bits 3,2,1,0 of the fixed header of PUBREL, SUBSCRIBE and
            // UNSUBSCRIBE packets are reserved and MUST be set to 0,0,1,0
            // [MQTT-3.6.1-1], [MQTT-3.8.1-1], [MQTT-3.10.1-1].
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0b0000_0000,
        };
        (type_bits << 4) | flag_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type from the first byte of the fixed header.
    ///
    /// # Errors
    ///
    /// Where a flag bit is marked as reserved it MUST be set to the listed
    /// value; if invalid flags are received, the receiver MUST close the
    /// network connection [MQTT-2.2.2-2]. Returns `InvalidPacketFlags` then.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;
        let with_flag = |packet_type: Self, expected: u8| {
            if flag == expected {
                Ok(packet_type)
            } else {
                log::error!("header: Invalid flag {flag:#b} in {packet_type:?}");
                Err(DecodeError::InvalidPacketFlags)
            }
        };
        match type_bits {
            1 => with_flag(Self::Connect, 0b0000_0000),
            2 => with_flag(Self::ConnectAck, 0b0000_0000),
            3 => {
                let dup = (flag & 0b0000_1000) == 0b0000_1000;
                let retain = (flag & 0b0000_0001) == 0b0000_0001;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactOnce,
                    // A PUBLISH packet MUST NOT have both QoS bits set to 1
                    // [MQTT-3.3.1-4].
                    _ => return Err(DecodeError::InvalidPacketFlags),
                };
                Ok(Self::Publish { dup, qos, retain })
            }
            4 => with_flag(Self::PublishAck, 0b0000_0000),
            5 => with_flag(Self::PublishReceived, 0b0000_0000),
            6 => with_flag(Self::PublishRelease, 0b0000_0010),
            7 => with_flag(Self::PublishComplete, 0b0000_0000),
            8 => with_flag(Self::Subscribe, 0b0000_0010),
            9 => with_flag(Self::SubscribeAck, 0b0000_0000),
            10 => with_flag(Self::Unsubscribe, 0b0000_0010),
            11 => with_flag(Self::UnsubscribeAck, 0b0000_0000),
            12 => with_flag(Self::PingRequest, 0b0000_0000),
            13 => with_flag(Self::PingResponse, 0b0000_0000),
            14 => with_flag(Self::Disconnect, 0b0000_0000),
            _ => Err(DecodeError::InvalidPacketType),
        }
    }
}

/// Fixed header part of an mqtt control packet, at least two bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` is out of range.
    pub const fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, EncodeError> {
        let remaining_length = match VarInt::from(remaining_length) {
            Ok(var_int) => var_int,
            Err(_err) => return Err(EncodeError::InvalidVarInt),
        };
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Byte length of the encoded header itself.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        1 + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;
        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(self.packet_type.into());
        let len_bytes = self.remaining_length.encode(buf)?;
        Ok(1 + len_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut buf = Vec::new();
        let fixed_header = FixedHeader::new(PacketType::PingResponse, 0).unwrap();
        assert_eq!(fixed_header.encode(&mut buf), Ok(2));
        assert_eq!(&buf, &[0xd0, 0x00]);
    }

    #[test]
    fn test_decode() {
        let buf = [0x30, 0x13, 0x00, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f];
        let mut ba = ByteArray::new(&buf);
        let fixed_header = FixedHeader::decode(&mut ba).unwrap();
        assert_eq!(
            fixed_header.packet_type(),
            PacketType::Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false
            }
        );
        assert_eq!(fixed_header.remaining_length(), 19);
    }

    #[test]
    fn test_decode_reserved_flags() {
        // Subscribe with flag bits 0b0000 is malformed.
        let buf = [0x80, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            FixedHeader::decode(&mut ba),
            Err(DecodeError::InvalidPacketFlags)
        );
    }
}
