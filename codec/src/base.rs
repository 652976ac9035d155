// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::{ByteArray, DecodeError, EncodeError};

/// Packet identifier.
///
/// SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where QoS > 0) Control Packets
/// MUST contain a non-zero 16-bit Packet Identifier [MQTT-2.3.1-1].
pub type PacketId = u16;

/// Decode packet from byte stream.
pub trait DecodePacket: Sized {
    /// # Errors
    ///
    /// Returns error if the byte stream does not contain a valid packet.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Encode packet into byte stream.
pub trait EncodePacket {
    /// # Errors
    ///
    /// Returns error if packet fields are invalid or buffer write fails.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Quality of service level of a publish message or subscription.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

/// Protocol version in the variable header of a CONNECT packet.
///
/// `V31Bridge` is the nonstandard broker-to-broker variant: protocol name
/// `MQIsdp` with 0x80 added to the version byte. A broker which accepts it
/// treats the peer as a bridge.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum ProtocolLevel {
    V31 = 3,

    #[default]
    V311 = 4,

    V31Bridge = 131,
}

pub const PROTOCOL_NAME_V31: &str = "MQIsdp";
pub const PROTOCOL_NAME_V311: &str = "MQTT";

impl ProtocolLevel {
    /// Protocol name string matching this level.
    #[must_use]
    pub const fn protocol_name(self) -> &'static str {
        match self {
            Self::V31 | Self::V31Bridge => PROTOCOL_NAME_V31,
            Self::V311 => PROTOCOL_NAME_V311,
        }
    }
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            3 => Ok(Self::V31),
            4 => Ok(Self::V311),
            131 => Ok(Self::V31Bridge),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}
