//! Versioned capability identifiers (`<namespace>.<action>@v<N>`)

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Serialize, Serializer};

static CAPABILITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9_-]+)\.([a-z0-9_.-]+)@v([0-9]+)$").expect("valid regex")
});

/// Identifier that does not match `<namespace>.<action>@v<N>`
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("capability must match <namespace>.<action>@v<N>, got {0:?}")]
pub struct InvalidCapability(pub String);

/// Parsed capability identifier, e.g. `modbus.write_hr@v1`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapabilityId {
    id: String,
    namespace_end: usize,
    action_end: usize,
    version: u32,
}

impl CapabilityId {
    /// Full identifier including version
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.id
    }

    /// Protocol namespace (`modbus`, `opcua`)
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.id[..self.namespace_end]
    }

    /// Action within the namespace (`write_hr`)
    #[must_use]
    pub fn action(&self) -> &str {
        &self.id[self.namespace_end + 1..self.action_end]
    }

    /// Contract version (`1` for `@v1`)
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }

    /// Unversioned `<namespace>.<action>`, used as the result discriminant
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.id[..self.action_end]
    }
}

impl FromStr for CapabilityId {
    type Err = InvalidCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidCapability(s.to_string());
        let caps = CAPABILITY_REGEX.captures(s).ok_or_else(invalid)?;

        let namespace = caps.get(1).ok_or_else(invalid)?;
        let action = caps.get(2).ok_or_else(invalid)?;
        let version = caps
            .get(3)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(invalid)?;

        Ok(Self {
            id: s.to_string(),
            namespace_end: namespace.end(),
            action_end: action.end(),
            version,
        })
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl Serialize for CapabilityId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_parts() {
        let cap: CapabilityId = "modbus.write_hr@v1".parse().unwrap();
        assert_eq!(cap.namespace(), "modbus");
        assert_eq!(cap.action(), "write_hr");
        assert_eq!(cap.version(), 1);
        assert_eq!(cap.kind(), "modbus.write_hr");
        assert_eq!(cap.as_str(), "modbus.write_hr@v1");
    }

    #[test]
    fn action_may_contain_dots() {
        let cap: CapabilityId = "opcua.node.write@v12".parse().unwrap();
        assert_eq!(cap.namespace(), "opcua");
        assert_eq!(cap.action(), "node.write");
        assert_eq!(cap.version(), 12);
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "modbus.write_hr",
            "modbus@v1",
            "Modbus.write@v1",
            "modbus.write@1",
            "modbus.write@v",
            ".write@v1",
            "modbus.write@v1 ",
            "",
        ] {
            assert!(bad.parse::<CapabilityId>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn serializes_as_string() {
        let cap: CapabilityId = "opcua.write@v1".parse().unwrap();
        assert_eq!(serde_json::to_value(&cap).unwrap(), "opcua.write@v1");
    }
}
