//! Declarative plugin metadata: identity, capabilities, dependencies, and
//! the host-version constraints a plugin declares against the runtime.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::version::Version;

/// Stable identifier for a plugin, unique within a single manager.
pub type PluginId = String;

/// Closed capability taxonomy a plugin can claim in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Ui,
    Service,
    Network,
    DataProcessing,
    Scripting,
    FileSystem,
    Database,
    AsyncInit,
    HotReload,
    Configuration,
    Logging,
    Security,
    Threading,
    Monitoring,
}

impl Capability {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Capability::Ui => "UI",
            Capability::Service => "Service",
            Capability::Network => "Network",
            Capability::DataProcessing => "DataProcessing",
            Capability::Scripting => "Scripting",
            Capability::FileSystem => "FileSystem",
            Capability::Database => "Database",
            Capability::AsyncInit => "AsyncInit",
            Capability::HotReload => "HotReload",
            Capability::Configuration => "Configuration",
            Capability::Logging => "Logging",
            Capability::Security => "Security",
            Capability::Threading => "Threading",
            Capability::Monitoring => "Monitoring",
        }
    }

    pub fn from_wire_str(s: &str) -> Option<Self> {
        Some(match s {
            "UI" => Capability::Ui,
            "Service" => Capability::Service,
            "Network" => Capability::Network,
            "DataProcessing" => Capability::DataProcessing,
            "Scripting" => Capability::Scripting,
            "FileSystem" => Capability::FileSystem,
            "Database" => Capability::Database,
            "AsyncInit" => Capability::AsyncInit,
            "HotReload" => Capability::HotReload,
            "Configuration" => Capability::Configuration,
            "Logging" => Capability::Logging,
            "Security" => Capability::Security,
            "Threading" => Capability::Threading,
            "Monitoring" => Capability::Monitoring,
            _ => return None,
        })
    }
}

/// Plugin load/scheduling priority, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Declarative descriptor attached to every plugin. Capabilities serialize
/// as an array of wire strings even though they are held internally as a
/// `HashSet`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub id: PluginId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub version: Version,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub dependencies: Vec<PluginId>,
    #[serde(default)]
    pub optional_dependencies: Vec<PluginId>,
    #[serde(
        default,
        serialize_with = "serialize_capabilities",
        deserialize_with = "deserialize_capabilities"
    )]
    pub capabilities: HashSet<Capability>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub min_host_version: Option<Version>,
    #[serde(default)]
    pub max_host_version: Option<Version>,
    #[serde(default)]
    pub custom_data: Option<JsonValue>,
}

fn serialize_capabilities<S>(caps: &HashSet<Capability>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    use serde::ser::SerializeSeq;
    let mut seq = serializer.serialize_seq(Some(caps.len()))?;
    for cap in caps {
        seq.serialize_element(cap.as_wire_str())?;
    }
    seq.end()
}

fn deserialize_capabilities<'de, D>(deserializer: D) -> Result<HashSet<Capability>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let strings: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(strings
        .into_iter()
        .filter_map(|s| Capability::from_wire_str(&s))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PluginMetadata {
        PluginMetadata {
            id: "com.example.foo".into(),
            name: "Foo".into(),
            description: "A sample plugin".into(),
            version: Version::new(1, 0, 0),
            author: "Example Corp".into(),
            license: "MIT".into(),
            homepage: String::new(),
            category: "utility".into(),
            tags: HashSet::new(),
            dependencies: vec!["com.example.bar".into()],
            optional_dependencies: vec![],
            capabilities: [Capability::Service, Capability::Network]
                .into_iter()
                .collect(),
            priority: Priority::Normal,
            min_host_version: Some(Version::new(1, 0, 0)),
            max_host_version: None,
            custom_data: None,
        }
    }

    #[test]
    fn round_trips_through_json() {
        let meta = sample();
        let json = serde_json::to_string(&meta).unwrap();
        let back: PluginMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(meta.id, back.id);
        assert_eq!(meta.version, back.version);
        assert_eq!(meta.capabilities, back.capabilities);
        assert_eq!(meta.dependencies, back.dependencies);
    }

    #[test]
    fn capabilities_serialize_as_wire_strings() {
        let meta = sample();
        let json = serde_json::to_value(&meta).unwrap();
        let caps = json["capabilities"].as_array().unwrap();
        let strs: HashSet<&str> = caps.iter().map(|v| v.as_str().unwrap()).collect();
        assert!(strs.contains("Service"));
        assert!(strs.contains("Network"));
    }
}
