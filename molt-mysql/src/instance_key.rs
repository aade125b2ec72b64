use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default MySQL server port.
pub const DEFAULT_INSTANCE_PORT: u16 = 3306;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseInstanceKeyError {
    #[error("empty instance key")]
    Empty,
    #[error("invalid port in instance key `{0}`")]
    InvalidPort(String),
}

/// A host:port pair identifying a MySQL instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub hostname: String,
    pub port: u16,
}

impl InstanceKey {
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        InstanceKey {
            hostname: hostname.into(),
            port,
        }
    }
}

impl FromStr for InstanceKey {
    type Err = ParseInstanceKeyError;

    /// Parses `host`, `host:port`, or `[ipv6]:port`. A missing port defaults
    /// to 3306.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseInstanceKeyError::Empty);
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ParseInstanceKeyError::InvalidPort(s.to_string()))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => port
                    .parse()
                    .map_err(|_| ParseInstanceKeyError::InvalidPort(s.to_string()))?,
                None => DEFAULT_INSTANCE_PORT,
            };
            return Ok(InstanceKey::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') => {
                let port = port
                    .parse()
                    .map_err(|_| ParseInstanceKeyError::InvalidPort(s.to_string()))?;
                Ok(InstanceKey::new(host, port))
            }
            Some(_) => Err(ParseInstanceKeyError::InvalidPort(s.to_string())),
            None => Ok(InstanceKey::new(s, DEFAULT_INSTANCE_PORT)),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// A deduplicated, ordered set of instance keys.
///
/// Used for the throttle-control replica list; output is always sorted so
/// interactive queries are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceKeyMap {
    keys: BTreeSet<InstanceKey>,
}

impl InstanceKeyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the set with keys parsed from a comma delimited list.
    /// Empty segments are skipped.
    pub fn read_comma_delimited_list(&mut self, list: &str) -> Result<(), ParseInstanceKeyError> {
        let mut keys = BTreeSet::new();
        for token in list.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            keys.insert(token.parse()?);
        }
        self.keys = keys;
        Ok(())
    }

    pub fn add_key(&mut self, key: InstanceKey) {
        self.keys.insert(key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstanceKey> {
        self.keys.iter()
    }

    pub fn to_comma_delimited_list(&self) -> String {
        self.keys
            .iter()
            .map(InstanceKey::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_and_port() {
        let key: InstanceKey = "replica-1:3307".parse().unwrap();
        assert_eq!(key, InstanceKey::new("replica-1", 3307));
    }

    #[test]
    fn parse_host_defaults_port() {
        let key: InstanceKey = "replica-1".parse().unwrap();
        assert_eq!(key.port, DEFAULT_INSTANCE_PORT);
    }

    #[test]
    fn parse_bracketed_ipv6() {
        let key: InstanceKey = "[2001:db8::1]:3310".parse().unwrap();
        assert_eq!(key, InstanceKey::new("2001:db8::1", 3310));
    }

    #[test]
    fn parse_rejects_bad_port() {
        assert!("replica-1:port".parse::<InstanceKey>().is_err());
        assert!("".parse::<InstanceKey>().is_err());
    }

    #[test]
    fn comma_delimited_list_is_sorted_and_deduplicated() {
        let mut map = InstanceKeyMap::new();
        map.read_comma_delimited_list("host9:3306, host3:3306,host1:3306,host3:3306")
            .unwrap();
        assert_eq!(
            map.to_comma_delimited_list(),
            "host1:3306,host3:3306,host9:3306"
        );
        assert_eq!(map.len(), 3);
    }

    #[test]
    fn comma_delimited_list_skips_empty_segments() {
        let mut map = InstanceKeyMap::new();
        map.read_comma_delimited_list("host1, ,host2,").unwrap();
        assert_eq!(map.len(), 2);
    }
}
