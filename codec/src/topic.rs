// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic names and topic filters.
//!
//! Rules are defined in MQTT chapter-4.7, Topic Names and Topic Filters.

use byteorder::{BigEndian, WriteBytesExt};
use std::io::Write;

use crate::{ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    EmptyTopic,
    TooManyData,

    /// Misplaced wildcard character, or wildcard in a topic name.
    InvalidChar,
}

/// One level of a topic filter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum FilterPart {
    /// Literal level name. May be empty, as empty levels are valid.
    Normal(String),

    /// `+` char, matches exactly one level.
    Single,

    /// `#` char, matches all remaining levels. Must be the last part.
    Multi,
}

/// Validate a topic filter used in SUBSCRIBE/UNSUBSCRIBE packets.
///
/// `#` must be the last character and occupy a whole level; `+` must occupy
/// a whole level.
///
/// # Errors
///
/// Returns error if the filter is empty or a wildcard is misplaced.
///
/// ```
/// use veles_codec::topic::validate_sub_topic;
/// assert!(validate_sub_topic("sport/tennis/player/#").is_ok());
/// assert!(validate_sub_topic("sport/tennis/player#").is_err());
/// assert!(validate_sub_topic("#").is_ok());
/// assert!(validate_sub_topic("sport/#/player").is_err());
/// assert!(validate_sub_topic("+").is_ok());
/// assert!(validate_sub_topic("sport+").is_err());
/// ```
pub fn validate_sub_topic(filter: &str) -> Result<(), TopicError> {
    if filter.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if filter.len() > u16::MAX as usize {
        return Err(TopicError::TooManyData);
    }
    let bytes = filter.as_bytes();
    for (index, b) in bytes.iter().enumerate() {
        if b == &b'#' {
            // Must cover a whole level and be the last character.
            if index > 0 && bytes[index - 1] != b'/' {
                return Err(TopicError::InvalidChar);
            }
            if index != bytes.len() - 1 {
                return Err(TopicError::InvalidChar);
            }
        } else if b == &b'+' {
            if index > 0 && bytes[index - 1] != b'/' {
                return Err(TopicError::InvalidChar);
            }
            if index < bytes.len() - 1 && bytes[index + 1] != b'/' {
                return Err(TopicError::InvalidChar);
            }
        }
    }
    Ok(())
}

/// Validate a topic name used in PUBLISH packets: non-empty, within length
/// bounds, no wildcard characters.
///
/// # Errors
///
/// Returns error if topic name is invalid.
pub fn validate_pub_topic(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::EmptyTopic);
    }
    if topic.len() > u16::MAX as usize {
        return Err(TopicError::TooManyData);
    }
    if topic.bytes().any(|b| b == b'+' || b == b'#') {
        return Err(TopicError::InvalidChar);
    }
    Ok(())
}

/// A topic filter, possibly containing wildcards.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicFilter {
    filter: String,
    parts: Vec<FilterPart>,
    has_wildcards: bool,
}

impl TopicFilter {
    /// Parse a topic filter.
    ///
    /// # Errors
    ///
    /// Returns error if the filter is not a valid subscribe topic.
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        validate_sub_topic(filter)?;
        let parts: Vec<FilterPart> = filter
            .split('/')
            .map(|part| match part {
                "+" => FilterPart::Single,
                "#" => FilterPart::Multi,
                _ => FilterPart::Normal(part.to_string()),
            })
            .collect();
        let has_wildcards = parts
            .iter()
            .any(|p| matches!(p, FilterPart::Single | FilterPart::Multi));
        Ok(Self {
            filter: filter.to_string(),
            parts,
            has_wildcards,
        })
    }

    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Whether the filter contains `+` or `#`.
    #[must_use]
    pub const fn has_wildcards(&self) -> bool {
        self.has_wildcards
    }

    /// Check whether a concrete topic name matches this filter.
    ///
    /// `+` matches exactly one level, a trailing `#` matches zero or more
    /// levels. A wildcard in the first level never captures topics starting
    /// with `$`, so that `#` does not deliver `$SYS` state to ordinary
    /// subscribers.
    #[must_use]
    pub fn is_match(&self, topic: &str) -> bool {
        if topic.starts_with('$')
            && !matches!(self.parts.first(), Some(FilterPart::Normal(_)))
        {
            return false;
        }
        let topic_parts: Vec<&str> = topic.split('/').collect();
        let mut index = 0;
        for part in &self.parts {
            match part {
                FilterPart::Multi => return true,
                FilterPart::Single => {
                    if index >= topic_parts.len() {
                        return false;
                    }
                    index += 1;
                }
                FilterPart::Normal(name) => {
                    if index >= topic_parts.len() || name != topic_parts[index] {
                        return false;
                    }
                    index += 1;
                }
            }
        }
        // "a/#" also matches "a", with zero trailing levels.
        index == topic_parts.len()
    }

    /// Number of literal levels before the first wildcard.
    #[must_use]
    fn concrete_prefix_len(&self) -> usize {
        self.parts
            .iter()
            .take_while(|p| matches!(p, FilterPart::Normal(_)))
            .count()
    }

    #[must_use]
    fn multi_wildcards(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, FilterPart::Multi))
            .count()
    }
}

/// Of two filters matching the same topic, pick the more specific one.
///
/// A filter without wildcards wins; between two wildcard filters the longer
/// concrete prefix wins, then the one with fewer `#`. Used to choose the
/// granted QoS when one client holds several overlapping subscriptions.
#[must_use]
pub fn most_specific<'a>(a: &'a TopicFilter, b: &'a TopicFilter) -> &'a TopicFilter {
    match (a.has_wildcards(), b.has_wildcards()) {
        (false, _) => a,
        (true, false) => b,
        (true, true) => {
            let a_prefix = a.concrete_prefix_len();
            let b_prefix = b.concrete_prefix_len();
            if a_prefix != b_prefix {
                if a_prefix > b_prefix {
                    a
                } else {
                    b
                }
            } else if a.multi_wildcards() <= b.multi_wildcards() {
                a
            } else {
                b
            }
        }
    }
}

impl DecodePacket for TopicFilter {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()? as usize;
        let s = ba.read_string(len)?;
        Self::parse(&s).map_err(Into::into)
    }
}

impl EncodePacket for TopicFilter {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.filter.len() as u16)?;
        buf.write_all(self.filter.as_bytes())?;
        Ok(2 + self.filter.len())
    }
}

/// A concrete topic name, as used in PUBLISH packets.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PubTopic(String);

impl PubTopic {
    /// # Errors
    ///
    /// Returns error if `topic` is empty or contains wildcards.
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        validate_pub_topic(topic)?;
        Ok(Self(topic.to_string()))
    }

    /// Byte length in packet, including the length prefix.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        2 + self.0.len()
    }
}

impl AsRef<str> for PubTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl DecodePacket for PubTopic {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let len = ba.read_u16()? as usize;
        let s = ba.read_string(len)?;
        validate_pub_topic(&s)?;
        Ok(Self(s))
    }
}

impl EncodePacket for PubTopic {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0.len() as u16)?;
        buf.write_all(self.0.as_bytes())?;
        Ok(2 + self.0.len())
    }
}

/// Filter/QoS pair held by the subscription stores.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscribePattern {
    filter: TopicFilter,
    qos: QoS,
}

impl SubscribePattern {
    /// # Errors
    ///
    /// Returns error if `filter` is not a valid topic filter.
    pub fn parse(filter: &str, qos: QoS) -> Result<Self, TopicError> {
        let filter = TopicFilter::parse(filter)?;
        Ok(Self { filter, qos })
    }

    #[must_use]
    pub const fn new(filter: TopicFilter, qos: QoS) -> Self {
        Self { filter, qos }
    }

    #[must_use]
    pub const fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    #[must_use]
    pub const fn qos(&self) -> QoS {
        self.qos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concrete_topic_matches_itself() {
        for topic in ["a", "a/b/c", "a//b", "some topic/with space"] {
            let filter = TopicFilter::parse(topic).unwrap();
            assert!(!filter.has_wildcards());
            assert!(filter.is_match(topic));
        }
    }

    #[test]
    fn test_multi_wildcard() {
        let filter = TopicFilter::parse("#").unwrap();
        assert!(filter.is_match("a"));
        assert!(filter.is_match("a/b/c"));
        assert!(filter.is_match(""));
        // `#` never captures `$`-rooted topics.
        assert!(!filter.is_match("$SYS/broker/uptime"));

        let filter = TopicFilter::parse("a/#").unwrap();
        assert!(filter.is_match("a/b/c"));
        // Zero trailing levels.
        assert!(filter.is_match("a"));
        assert!(!filter.is_match("b/a"));
    }

    #[test]
    fn test_system_topics() {
        let filter = TopicFilter::parse("$SYS/#").unwrap();
        assert!(filter.is_match("$SYS/broker/uptime"));
        assert!(!filter.is_match("topic/a"));

        let filter = TopicFilter::parse("+/broker/uptime").unwrap();
        assert!(!filter.is_match("$SYS/broker/uptime"));
    }

    #[test]
    fn test_single_wildcard() {
        let filter = TopicFilter::parse("a/+/c").unwrap();
        assert!(filter.is_match("a/b/c"));
        assert!(!filter.is_match("a/b/d"));
        assert!(!filter.is_match("a/c"));
        assert!(!filter.is_match("a/b/c/d"));

        let filter = TopicFilter::parse("a/+").unwrap();
        assert!(filter.is_match("a/b"));
        assert!(filter.is_match("a/"));
        assert!(!filter.is_match("a"));
    }

    #[test]
    fn test_empty_levels() {
        let filter = TopicFilter::parse("a//c").unwrap();
        assert!(filter.is_match("a//c"));
        assert!(!filter.is_match("a/b/c"));

        let filter = TopicFilter::parse("a/+/c").unwrap();
        assert!(filter.is_match("a//c"));
    }

    #[test]
    fn test_most_specific() {
        let concrete = TopicFilter::parse("a/b/c").unwrap();
        let single = TopicFilter::parse("a/+/c").unwrap();
        let multi = TopicFilter::parse("a/#").unwrap();
        let any = TopicFilter::parse("#").unwrap();

        assert_eq!(most_specific(&concrete, &single), &concrete);
        assert_eq!(most_specific(&single, &concrete), &concrete);
        // Longer concrete prefix wins.
        assert_eq!(most_specific(&single, &multi), &single);
        // Fewer `#` wins on equal prefix.
        assert_eq!(most_specific(&single, &any), &single);
    }

    #[test]
    fn test_validate_pub_topic() {
        assert!(validate_pub_topic("sport/tennis").is_ok());
        assert!(validate_pub_topic("sport/#").is_err());
        assert!(validate_pub_topic("sport/+").is_err());
        assert!(validate_pub_topic("").is_err());
    }
}
