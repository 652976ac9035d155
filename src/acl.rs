// Copyright (c) 2023 Veles Authors. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic access control.
//!
//! Rules are read from an acl file of the form:
//!
//! ```txt
//! # rules before the first user line apply to every client
//! topic read $SYS/#
//! topic readwrite data/#
//!
//! user admin
//! topic readwrite #
//! ```
//!
//! With no acl file configured everything is allowed. With one configured,
//! access not granted by a matching rule is denied.

use codec::TopicFilter;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{Error, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleAccess {
    Read,
    Write,
    ReadWrite,
}

impl RuleAccess {
    const fn covers(self, access: Access) -> bool {
        match self {
            Self::ReadWrite => true,
            Self::Read => matches!(access, Access::Read),
            Self::Write => matches!(access, Access::Write),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    access: RuleAccess,
    filter: TopicFilter,
}

#[derive(Debug, Default)]
struct AclData {
    /// Rules that apply to every client.
    default_rules: Vec<Rule>,

    /// Per-user rule lists, in addition to the defaults.
    user_rules: HashMap<String, Vec<Rule>>,

    /// False when no acl file is configured; everything is allowed then.
    enforced: bool,
}

/// Shared access-control store, readable from every listener and the
/// dispatcher, reloaded on SIGHUP.
#[derive(Debug, Default)]
pub struct AclStore {
    path: Option<PathBuf>,
    data: RwLock<AclData>,
}

impl AclStore {
    /// Load rules from `acl_file`, or an allow-everything store for None.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load(acl_file: Option<&PathBuf>) -> Result<Self, Error> {
        let store = Self {
            path: acl_file.cloned(),
            data: RwLock::new(AclData::default()),
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-read the acl file, on SIGHUP.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed; the previous
    /// rules stay in place then.
    pub fn reload(&self) -> Result<(), Error> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let parsed = Self::parse_file(path)?;
        let mut data = self.data.write().expect("acl lock poisoned");
        *data = parsed;
        Ok(())
    }

    fn parse_file(path: &Path) -> Result<AclData, Error> {
        let content = fs::read_to_string(path)?;
        let mut data = AclData {
            enforced: true,
            ..AclData::default()
        };
        let mut current_user: Option<String> = None;

        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("user") => {
                    let username = parts.next().ok_or_else(|| {
                        Error::from_string(
                            ErrorKind::FormatError,
                            format!("acl: Missing username at line {}", line_no + 1),
                        )
                    })?;
                    current_user = Some(username.to_string());
                }
                Some("topic") => {
                    let rule = Self::parse_topic_rule(&mut parts, line_no)?;
                    match &current_user {
                        Some(user) => data
                            .user_rules
                            .entry(user.clone())
                            .or_default()
                            .push(rule),
                        None => data.default_rules.push(rule),
                    }
                }
                Some(keyword) => {
                    return Err(Error::from_string(
                        ErrorKind::FormatError,
                        format!("acl: Unknown keyword {keyword} at line {}", line_no + 1),
                    ));
                }
                None => (),
            }
        }
        Ok(data)
    }

    fn parse_topic_rule<'a>(
        parts: &mut impl Iterator<Item = &'a str>,
        line_no: usize,
    ) -> Result<Rule, Error> {
        let first = parts.next().ok_or_else(|| {
            Error::from_string(
                ErrorKind::FormatError,
                format!("acl: Missing topic at line {}", line_no + 1),
            )
        })?;
        let (access, filter_str) = match first {
            "read" => (RuleAccess::Read, parts.next()),
            "write" => (RuleAccess::Write, parts.next()),
            "readwrite" => (RuleAccess::ReadWrite, parts.next()),
            filter => (RuleAccess::ReadWrite, Some(filter)),
        };
        let filter_str = filter_str.ok_or_else(|| {
            Error::from_string(
                ErrorKind::FormatError,
                format!("acl: Missing topic at line {}", line_no + 1),
            )
        })?;
        let filter = TopicFilter::parse(filter_str).map_err(|err| {
            Error::from_string(
                ErrorKind::FormatError,
                format!("acl: Invalid topic {filter_str} at line {}: {err:?}", line_no + 1),
            )
        })?;
        Ok(Rule { access, filter })
    }

    /// Check whether `client_id`/`username` may read or write `topic`.
    #[must_use]
    pub fn allow(
        &self,
        username: Option<&str>,
        _client_id: &str,
        topic: &str,
        access: Access,
    ) -> bool {
        let data = self.data.read().expect("acl lock poisoned");
        if !data.enforced {
            return true;
        }
        let granted = |rules: &[Rule]| {
            rules
                .iter()
                .any(|rule| rule.access.covers(access) && rule.filter.is_match(topic))
        };
        if granted(&data.default_rules) {
            return true;
        }
        username
            .and_then(|name| data.user_rules.get(name))
            .is_some_and(|rules| granted(rules))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_from(name: &str, content: &str) -> AclStore {
        let mut path = std::env::temp_dir();
        path.push(format!("veles-acl-test-{}-{name}.conf", std::process::id()));
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let store = AclStore::load(Some(&path)).unwrap();
        let _ret = fs::remove_file(&path);
        store
    }

    #[test]
    fn test_no_acl_file_allows_everything() {
        let store = AclStore::load(None).unwrap();
        assert!(store.allow(None, "c", "any/topic", Access::Write));
        assert!(store.allow(Some("u"), "c", "any/topic", Access::Read));
    }

    #[test]
    fn test_default_rules() {
        let store = store_from(
            "default",
            "# default section\n\
             topic read $SYS/#\n\
             topic readwrite data/#\n",
        );
        assert!(store.allow(None, "c", "$SYS/broker/uptime", Access::Read));
        assert!(!store.allow(None, "c", "$SYS/broker/uptime", Access::Write));
        assert!(store.allow(None, "c", "data/x", Access::Write));
        assert!(!store.allow(None, "c", "private/x", Access::Read));
    }

    #[test]
    fn test_user_rules_extend_defaults() {
        let store = store_from(
            "users",
            "topic read public/#\n\
             user admin\n\
             topic readwrite #\n",
        );
        assert!(store.allow(None, "c", "public/a", Access::Read));
        assert!(!store.allow(None, "c", "secret/a", Access::Read));
        assert!(store.allow(Some("admin"), "c", "secret/a", Access::Write));
        assert!(!store.allow(Some("guest"), "c", "secret/a", Access::Read));
    }

    #[test]
    fn test_bare_topic_rule_is_readwrite() {
        let store = store_from("bare", "topic data/#\n");
        assert!(store.allow(None, "c", "data/a", Access::Read));
        assert!(store.allow(None, "c", "data/a", Access::Write));
    }
}
