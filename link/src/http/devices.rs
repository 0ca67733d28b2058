//! Device discovery

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::authn::Credentials;
use crate::errors::LinkError;
use crate::http::client::ApiClient;
use crate::models::{Capability, Device, DeviceType};

/// Project the client is configured for by default
pub const DEFAULT_PROJECT: &str = "catcam";

/// One entry of `GET /devices`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub thing_name: String,

    #[serde(default)]
    pub thing_arn: Option<String>,

    #[serde(default)]
    pub project: Option<String>,

    /// Kept as text so an unfamiliar type does not fail the whole listing
    #[serde(default)]
    pub device_type: Option<String>,

    #[serde(default)]
    pub capabilities: Option<Vec<String>>,
}

impl DeviceRecord {
    /// Build a [`Device`], inferring capabilities from the type when the
    /// record has none. Records without a project take the one the listing
    /// was filtered on, if any.
    pub fn into_device(self, filter: Option<&str>) -> Device {
        let device_type = self
            .device_type
            .as_deref()
            .and_then(|t| t.parse::<DeviceType>().ok())
            .unwrap_or(DeviceType::Bootboots);

        let capabilities = match self.capabilities {
            Some(names) => names
                .iter()
                .filter_map(|name| match name.parse::<Capability>() {
                    Ok(capability) => Some(capability),
                    Err(_) => {
                        debug!("Ignoring unknown capability {} on {}", name, self.thing_name);
                        None
                    }
                })
                .collect(),
            None => device_type.default_capabilities(),
        };

        let project = self
            .project
            .or_else(|| filter.map(str::to_string))
            .unwrap_or_default();
        let mut device = Device::new(&self.thing_name, &self.thing_name, device_type).with_project(&project);
        device.capabilities = capabilities;
        device
    }
}

/// Body of `GET /devices`
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceListResponse {
    #[serde(default)]
    pub devices: Vec<DeviceRecord>,

    #[serde(default)]
    pub count: Option<usize>,
}

impl ApiClient {
    /// List the devices registered to `project`, or to every project the
    /// credentials can see when `project` is `None`
    pub async fn list_devices(&self, credentials: &Credentials, project: Option<&str>) -> Result<Vec<Device>, LinkError> {
        let query: Vec<(&str, &str)> = project.map(|p| ("project", p)).into_iter().collect();
        let response: DeviceListResponse = self.get("/devices", &query, credentials).await?;

        if let Some(count) = response.count {
            if count != response.devices.len() {
                debug!("Device count {} differs from {} entries", count, response.devices.len());
            }
        }

        let devices: Vec<Device> = response
            .devices
            .into_iter()
            .map(|record| record.into_device(project))
            .collect();
        info!("Discovered {} device(s) in project {}", devices.len(), project.unwrap_or("*"));
        Ok(devices)
    }
}
