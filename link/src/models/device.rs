//! Device records produced by discovery

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Device family
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    /// Cat-deterrent camera
    Bootboots,

    /// Heater controller
    KappaWarmer,

    #[default]
    #[serde(other)]
    Unknown,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Bootboots => "bootboots",
            DeviceType::KappaWarmer => "kappa-warmer",
            DeviceType::Unknown => "unknown",
        }
    }

    /// Capabilities assumed when discovery does not report any
    pub fn default_capabilities(&self) -> BTreeSet<Capability> {
        match self {
            DeviceType::Bootboots => [
                Capability::Photos,
                Capability::Logs,
                Capability::Settings,
                Capability::Camera,
            ]
            .into_iter()
            .collect(),
            DeviceType::KappaWarmer => [Capability::Settings, Capability::Heater].into_iter().collect(),
            DeviceType::Unknown => BTreeSet::new(),
        }
    }
}

impl FromStr for DeviceType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().replace('_', "-").as_str() {
            "bootboots" => DeviceType::Bootboots,
            "kappa-warmer" | "kappawarmer" => DeviceType::KappaWarmer,
            _ => DeviceType::Unknown,
        })
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Feature tag advertised by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Photos,
    Logs,
    Settings,
    Camera,
    Heater,
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "photos" => Ok(Capability::Photos),
            "logs" => Ok(Capability::Logs),
            "settings" => Ok(Capability::Settings),
            "camera" => Ok(Capability::Camera),
            "heater" => Ok(Capability::Heater),
            _ => Err(format!("Unknown capability: {}", s)),
        }
    }
}

/// A controllable endpoint.
///
/// `id` is the transport address: a Bluetooth peripheral id or local name
/// for the GATT transport, the IoT thing name for the relay transport.
/// `connected` is advisory only; the transport owns the real state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub device_type: DeviceType,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub connected: bool,
}

impl Device {
    /// Create a device with the default capabilities of its type
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            project: String::new(),
            capabilities: device_type.default_capabilities(),
            device_type,
            connected: false,
        }
    }

    /// Set the project namespace
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}
