//! Package specification produced by import.
//!
//! Lists every chart to install, with the packaged chart inlined and values
//! overrides pointing images at the destination registry.

use std::collections::BTreeMap;

use chartpack_core::error::Result;
use chartpack_core::DEFAULT_STAGE;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Package {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub packages: BTreeMap<String, PackageSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub releases: BTreeMap<String, PackageRelease>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    pub version: String,
    /// Packaged chart, base64 encoded on the wire.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub chart: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub overrides: serde_json::Value,
}

impl PackageSpec {
    pub fn stage(&self) -> &str {
        self.stage.as_deref().unwrap_or(DEFAULT_STAGE)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageRelease {
    pub package: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub overrides: serde_json::Value,
}

impl Package {
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.trim()).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chart_is_base64_encoded() {
        let mut package = Package::default();
        package.packages.insert(
            "demo".to_string(),
            PackageSpec {
                version: "1.0.0".to_string(),
                chart: Some(b"chart".to_vec()),
                overrides: json!({"images": {"main": {"image": "pause", "tag": "3.5"}}}),
                ..Default::default()
            },
        );

        let yaml = package.to_yaml().unwrap();
        assert!(yaml.contains("chart: Y2hhcnQ="));
        assert!(!yaml.contains("stage"));
        assert!(!yaml.contains("releases"));

        let parsed = Package::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, package);
        assert_eq!(parsed.packages["demo"].stage(), "prd");
    }

    #[test]
    fn test_release_references_package() {
        let yaml = "packages:\n  demo:\n    version: 1.0.0\n    stage: dev\nreleases:\n  demo-a:\n    package: demo\n    overrides:\n      replicas: 2\n";
        let package = Package::from_yaml(yaml).unwrap();

        assert_eq!(package.packages["demo"].stage(), "dev");
        assert!(package.packages["demo"].chart.is_none());
        assert_eq!(package.releases["demo-a"].package, "demo");
        assert_eq!(package.releases["demo-a"].overrides["replicas"], 2);
    }

    #[test]
    fn test_invalid_base64_rejected() {
        let yaml = "packages:\n  demo:\n    version: 1.0.0\n    chart: '***'\n";
        assert!(Package::from_yaml(yaml).is_err());
    }
}
