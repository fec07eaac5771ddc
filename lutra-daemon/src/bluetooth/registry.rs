/*!
 * Device Registry
 * Authoritative map from bus object path to Device, shared between the
 * notification worker and concurrent command/query callers.
 */

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::transport::PropSet;
use super::Device;

/// Outcome of one `apply` call.
#[derive(Debug, Default)]
pub struct Applied {
    /// The stored record was created or actually differs from before.
    pub changed: bool,
    /// Set when this call transitioned the device from disconnected to
    /// connected: a copy of the record at the moment of the edge.
    pub edge: Option<Device>,
}

pub struct DeviceRegistry {
    devices: RwLock<HashMap<String, Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
        }
    }

    /// Merge a partial property set into the device at `path`, creating it
    /// if absent. Idempotent: re-applying the same set changes nothing and
    /// reports `changed == false`. Unknown keys and type-mismatched values
    /// are ignored.
    pub async fn apply(&self, path: &str, props: &PropSet) -> Applied {
        let mut devices = self.devices.write().await;

        let device = devices.entry(path.to_string()).or_insert_with(|| Device {
            path: path.to_string(),
            ..Device::default()
        });

        let before = device.clone();
        let was_connected = device.connected;

        for (key, value) in props {
            match key.as_str() {
                "Address" => {
                    if let Some(v) = value.as_str() {
                        device.address = v.to_string();
                    }
                }
                "Name" | "Alias" => {
                    if let Some(v) = value.as_str() {
                        if !v.is_empty() {
                            device.name = v.to_string();
                        }
                    }
                }
                "Paired" => {
                    if let Some(v) = value.as_bool() {
                        device.paired = v;
                    }
                }
                "Connected" => {
                    if let Some(v) = value.as_bool() {
                        device.connected = v;
                    }
                }
                "Trusted" => {
                    if let Some(v) = value.as_bool() {
                        device.trusted = v;
                    }
                }
                "RSSI" => {
                    if let Some(v) = value.as_i16() {
                        device.rssi = v;
                    }
                }
                "Icon" => {
                    if let Some(v) = value.as_str() {
                        device.icon = v.to_string();
                    }
                }
                _ => {}
            }
        }

        let edge = if !was_connected && device.connected {
            Some(device.clone())
        } else {
            None
        };

        Applied {
            changed: *device != before,
            edge,
        }
    }

    /// Delete the device at `path`. Returns whether it was present; absent
    /// paths are a silent no-op so that a manual removal and a later async
    /// removal notification cannot double-fire.
    pub async fn remove(&self, path: &str) -> bool {
        self.devices.write().await.remove(path).is_some()
    }

    pub async fn contains(&self, path: &str) -> bool {
        self.devices.read().await.contains_key(path)
    }

    pub async fn get(&self, path: &str) -> Option<Device> {
        self.devices.read().await.get(path).cloned()
    }

    /// Immutable copy of every known device.
    pub async fn snapshot(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// The subset worth showing as managed: paired or connected.
    pub async fn paired_or_connected(&self) -> Vec<Device> {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| d.paired || d.connected)
            .cloned()
            .collect()
    }
}
