use super::{Device, DeviceRecord};
use crate::config::DeviceConfig;
use crate::error::{MechError, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// Process-wide table of devices, fixed after startup
pub struct DeviceRegistry {
    devices: Vec<Arc<Device>>,
}

impl DeviceRegistry {
    /// Build the registry from the `[[device]]` tables, ordered by id
    pub fn from_configs(configs: &[DeviceConfig]) -> Self {
        let mut devices: Vec<Arc<Device>> = configs
            .iter()
            .map(|config| {
                info!(
                    "Registering device {} ({}) at {}",
                    config.id, config.name, config.endpoint
                );
                Arc::new(Device::from_config(config))
            })
            .collect();
        devices.sort_by_key(|device| device.id());
        Self { devices }
    }

    /// Look a device up by its stable id
    pub fn get(&self, id: u32) -> Result<Arc<Device>> {
        self.devices
            .iter()
            .find(|device| device.id() == id)
            .cloned()
            .ok_or_else(|| MechError::NotFound(format!("device {}", id)))
    }

    /// Resolve a mechanism name as sent by clients
    ///
    /// An exact (case-insensitive) name or a numeric id wins; otherwise the lowest id whose
    /// name contains the fragment is returned.
    ///
    /// # Arguments
    /// * `fragment` - Mechanism name, part of one, or a device id
    ///
    /// # Returns
    /// * `Result<Arc<Device>>` - The matching device or `NotFound`
    pub fn find(&self, fragment: &str) -> Result<Arc<Device>> {
        let wanted = fragment.trim().to_ascii_lowercase();
        if wanted.is_empty() {
            return Err(MechError::InvalidArguments(
                "mechanism name required".to_string(),
            ));
        }

        if let Some(device) = self
            .devices
            .iter()
            .find(|device| device.name().eq_ignore_ascii_case(&wanted))
        {
            return Ok(device.clone());
        }

        if let Ok(id) = wanted.parse::<u32>() {
            if let Ok(device) = self.get(id) {
                return Ok(device);
            }
        }

        let found = self
            .devices
            .iter()
            .find(|device| device.name().to_ascii_lowercase().contains(&wanted))
            .cloned();
        debug!("Resolved mechanism '{}' -> {:?}", fragment, found.as_ref().map(|d| d.id()));
        found.ok_or_else(|| MechError::NotFound(format!("mechanism {}", fragment)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Records of every device, ordered by id
    pub fn snapshots(&self) -> Vec<DeviceRecord> {
        self.iter().map(|device| device.snapshot()).collect()
    }

    /// Close every open transport, best effort
    pub async fn close_all(&self) {
        for device in self.iter() {
            device.close().await;
        }
        info!("Closed {} device transports", self.devices.len());
    }
}
