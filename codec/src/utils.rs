// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::Rng;

use crate::{ByteArray, DecodeError, DecodePacket, FixedHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringError {
    InvalidUtf8,

    /// Contains null or other forbidden code points.
    InvalidChar,
}

/// Convert byte slice into an MQTT UTF-8 string.
///
/// The character data in a UTF-8 encoded string MUST be well-formed UTF-8 and
/// MUST NOT include encodings of the null character U+0000 [MQTT-1.5.3-1/2].
///
/// # Errors
///
/// Returns error if `bytes` is not well formed.
pub fn to_utf8_string(bytes: &[u8]) -> Result<String, StringError> {
    let s = std::str::from_utf8(bytes).map_err(|_| StringError::InvalidUtf8)?;
    if s.chars().any(|c| c == '\u{0000}') {
        return Err(StringError::InvalidChar);
    }
    Ok(s.to_string())
}

/// Generate a random client id, used when a client connects with a zero byte
/// client id and a clean session.
#[must_use]
pub fn random_client_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: u64 = rng.gen();
    format!("veles-{suffix:016x}")
}

/// Total byte length of the first packet in `buf`, or None while the fixed
/// header is still incomplete.
///
/// # Errors
///
/// Returns error if the header bytes are malformed.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let mut ba = ByteArray::new(buf);
    match FixedHeader::decode(&mut ba) {
        Ok(fixed_header) => Ok(Some(fixed_header.bytes() + fixed_header.remaining_length())),
        // The length field continues beyond the buffered bytes.
        Err(DecodeError::OutOfRange) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_utf8_string() {
        assert_eq!(to_utf8_string(b"topic/a"), Ok("topic/a".to_string()));
        assert_eq!(to_utf8_string(b"a\x00b"), Err(StringError::InvalidChar));
        assert_eq!(to_utf8_string(&[0xff, 0xfe]), Err(StringError::InvalidUtf8));
    }

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        assert!(id.starts_with("veles-"));
        assert_ne!(id, random_client_id());
    }
}
