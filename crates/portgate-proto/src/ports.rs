//! Public-port allowlist.
//!
//! Controls which remote ports clients may register tunnels on. Supports
//! individual ports ("3000") and inclusive ranges ("9000-9100"). An empty
//! allowlist allows every port.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One allowlist entry: a single port or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortEntry {
    Single(u16),
    Range(u16, u16),
}

impl PortEntry {
    fn contains(&self, port: u16) -> bool {
        match *self {
            PortEntry::Single(p) => p == port,
            PortEntry::Range(min, max) => (min..=max).contains(&port),
        }
    }
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PortEntry::Single(p) => write!(f, "{p}"),
            PortEntry::Range(min, max) => write!(f, "{min}-{max}"),
        }
    }
}

/// Allowlist of registrable public ports. Empty means all ports are allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortList {
    entries: Vec<PortEntry>,
}

#[derive(Debug, Error, PartialEq)]
pub enum PortListError {
    #[error("invalid port '{0}' in allowlist")]
    InvalidPort(String),

    #[error("invalid port range '{0}': expected <min>-<max> with min <= max")]
    InvalidRange(String),
}

impl PortList {
    /// Allowlist permitting every port.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<PortEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a client may register a tunnel on `port`.
    pub fn allows(&self, port: u16) -> bool {
        self.entries.is_empty() || self.entries.iter().any(|e| e.contains(port))
    }
}

impl fmt::Display for PortList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "(all ports)");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{entry}")?;
        }
        Ok(())
    }
}

impl FromStr for PortList {
    type Err = PortListError;

    /// Parse a comma-separated list like `"3000,9000-9100,8443"`. An empty
    /// string yields the allow-all list.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = Vec::new();
        for raw in s.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if let Some((min, max)) = raw.split_once('-') {
                let min: u16 = min
                    .trim()
                    .parse()
                    .map_err(|_| PortListError::InvalidRange(raw.to_string()))?;
                let max: u16 = max
                    .trim()
                    .parse()
                    .map_err(|_| PortListError::InvalidRange(raw.to_string()))?;
                if min == 0 || min > max {
                    return Err(PortListError::InvalidRange(raw.to_string()));
                }
                entries.push(PortEntry::Range(min, max));
            } else {
                let port: u16 = raw
                    .parse()
                    .map_err(|_| PortListError::InvalidPort(raw.to_string()))?;
                if port == 0 {
                    return Err(PortListError::InvalidPort(raw.to_string()));
                }
                entries.push(PortEntry::Single(port));
            }
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_allows_everything() {
        let list = PortList::allow_all();
        assert!(list.is_empty());
        assert!(list.allows(1));
        assert!(list.allows(65535));
    }

    #[test]
    fn parses_singles_and_ranges() {
        let list: PortList = "3000, 9000-9100 ,8443".parse().unwrap();
        assert!(list.allows(3000));
        assert!(list.allows(9000));
        assert!(list.allows(9050));
        assert!(list.allows(9100));
        assert!(list.allows(8443));
        assert!(!list.allows(2999));
        assert!(!list.allows(9101));
        assert_eq!(list.to_string(), "3000,9000-9100,8443");
    }

    #[test]
    fn empty_string_is_allow_all() {
        let list: PortList = "".parse().unwrap();
        assert!(list.is_empty());
        assert!(list.allows(12345));
    }

    #[test]
    fn rejects_bad_entries() {
        assert_eq!(
            "abc".parse::<PortList>(),
            Err(PortListError::InvalidPort("abc".to_string()))
        );
        assert_eq!(
            "9100-9000".parse::<PortList>(),
            Err(PortListError::InvalidRange("9100-9000".to_string()))
        );
        assert_eq!(
            "0".parse::<PortList>(),
            Err(PortListError::InvalidPort("0".to_string()))
        );
        assert_eq!(
            "0-100".parse::<PortList>(),
            Err(PortListError::InvalidRange("0-100".to_string()))
        );
    }
}
