pub mod lines;
pub mod log_feed;
pub mod protocol;
pub mod reconcile;
pub mod render;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Rendered in place of a usage figure the control plane did not report.
pub const UNKNOWN_USAGE: &str = "--";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Creating,
    Deleting,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberState::Stopped => "Stopped",
            MemberState::Starting => "Starting",
            MemberState::Running => "Running",
            MemberState::Stopping => "Stopping",
            MemberState::Creating => "Creating",
            MemberState::Deleting => "Deleting",
        }
    }

    /// Running and Stopped are the only states a viewer may act on.
    pub fn is_stable(&self) -> bool {
        matches!(self, MemberState::Running | MemberState::Stopped)
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberState {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "stopped" => Ok(MemberState::Stopped),
            "starting" => Ok(MemberState::Starting),
            "running" => Ok(MemberState::Running),
            "stopping" => Ok(MemberState::Stopping),
            "creating" | "installing" => Ok(MemberState::Creating),
            "deleting" | "uninstalling" => Ok(MemberState::Deleting),
            other => Err(format!("Unknown member state: {other}")),
        }
    }
}

impl Serialize for MemberState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MemberState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetMember {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(alias = "State")]
    pub state: MemberState,
    #[serde(
        default,
        alias = "Memory",
        deserialize_with = "deserialize_usage",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory: Option<String>,
    #[serde(
        default,
        alias = "Disk",
        deserialize_with = "deserialize_usage",
        skip_serializing_if = "Option::is_none"
    )]
    pub disk: Option<String>,
}

impl FleetMember {
    pub fn new(name: impl Into<String>, state: MemberState) -> Self {
        Self {
            name: name.into(),
            state,
            memory: None,
            disk: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStats {
    #[serde(default, alias = "InstanceName", alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Memory", deserialize_with = "deserialize_usage")]
    pub memory: Option<String>,
    #[serde(default, alias = "Disk", deserialize_with = "deserialize_usage")]
    pub disk: Option<String>,
}

/// Parses a `list-json` document. A lone object counts as a one-member
/// fleet and `null` as an empty one.
pub fn parse_snapshot(value: Value) -> Result<Vec<FleetMember>, serde_json::Error> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Object(_) => Ok(vec![serde_json::from_value(value)?]),
        other => serde_json::from_value(other),
    }
}

/// Parses a `monitor-json` document for `requested`. A missing instance name
/// is attributed to the member that was asked for.
pub fn parse_stats(value: Value, requested: &str) -> Result<MemberStats, serde_json::Error> {
    let mut stats: MemberStats = serde_json::from_value(value)?;
    if stats.name.trim().is_empty() {
        stats.name = requested.to_string();
    }
    Ok(stats)
}

/// Usage figures arrive as strings, numbers or null; `--` and blanks mean unknown.
fn deserialize_usage<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    let text = match val {
        Value::Null => return Ok(None),
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => return Err(serde::de::Error::custom("expected string or number for usage")),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == UNKNOWN_USAGE {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_accepts_control_plane_keys() {
        let value = serde_json::json!([
            {"Name": "alpha", "State": "Running", "Memory": "512MB", "Disk": "--"},
            {"Name": "beta", "State": "stopped"}
        ]);
        let members = parse_snapshot(value).expect("snapshot");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].name, "alpha");
        assert_eq!(members[0].state, MemberState::Running);
        assert_eq!(members[0].memory.as_deref(), Some("512MB"));
        assert_eq!(members[0].disk, None);
        assert_eq!(members[1].state, MemberState::Stopped);
    }

    #[test]
    fn single_object_snapshot_is_one_member() {
        let value = serde_json::json!({"Name": "solo", "State": "Installing"});
        let members = parse_snapshot(value).expect("snapshot");
        assert_eq!(members, vec![FleetMember::new("solo", MemberState::Creating)]);
    }

    #[test]
    fn unknown_state_fails_the_snapshot() {
        let value = serde_json::json!([{"Name": "x", "State": "Converting"}]);
        assert!(parse_snapshot(value).is_err());
    }

    #[test]
    fn wire_encoding_uses_lowercase_keys() {
        let member = FleetMember {
            memory: Some("1GB".to_string()),
            ..FleetMember::new("alpha", MemberState::Stopped)
        };
        let encoded = serde_json::to_value(&member).expect("encode");
        assert_eq!(
            encoded,
            serde_json::json!({"name": "alpha", "state": "Stopped", "memory": "1GB"})
        );
    }

    #[test]
    fn stats_fall_back_to_requested_name() {
        let stats = parse_stats(serde_json::json!({"Memory": 256, "Disk": "2GB"}), "alpha")
            .expect("stats");
        assert_eq!(stats.name, "alpha");
        assert_eq!(stats.memory.as_deref(), Some("256"));
        assert_eq!(stats.disk.as_deref(), Some("2GB"));

        let named = parse_stats(
            serde_json::json!({"InstanceName": "beta", "Memory": null}),
            "alpha",
        )
        .expect("stats");
        assert_eq!(named.name, "beta");
        assert_eq!(named.memory, None);
    }

    #[test]
    fn only_running_and_stopped_are_stable() {
        assert!(MemberState::Running.is_stable());
        assert!(MemberState::Stopped.is_stable());
        assert!(!MemberState::Starting.is_stable());
        assert!(!MemberState::Deleting.is_stable());
    }
}
