/*!
 * Device Commands
 * Imperative pair/connect/trust/disconnect/remove calls. Each command
 * force-refreshes the device afterwards so the registry does not have to
 * wait for the matching push notification.
 */

use tracing::{info, warn};

use super::transport::{PropValue, BLUEZ_ADAPTER_IFACE, BLUEZ_DEVICE_IFACE};
use super::{BluetoothError, BluetoothManager, Shared};

impl BluetoothManager {
    /// Mark the device as trusted so BlueZ allows it to reconnect on its own.
    pub async fn trust(&self, address: &str) -> Result<(), BluetoothError> {
        let path = self.shared.resolve_device(address).await?;

        info!("trusting device {address}");
        self.shared
            .bus
            .set_property(&path, BLUEZ_DEVICE_IFACE, "Trusted", PropValue::Bool(true))
            .await
            .map_err(|source| BluetoothError::CommandFailed {
                op: "trust",
                address: address.to_string(),
                source,
            })?;

        self.shared.refresh_device(&path).await;
        Ok(())
    }

    /// Initiate pairing with the device.
    pub async fn pair(&self, address: &str) -> Result<(), BluetoothError> {
        let path = self.shared.resolve_device(address).await?;

        info!("pairing with device {address}");
        self.shared
            .bus
            .call(&path, BLUEZ_DEVICE_IFACE, "Pair")
            .await
            .map_err(|source| BluetoothError::CommandFailed {
                op: "pair",
                address: address.to_string(),
                source,
            })?;

        self.shared.refresh_device(&path).await;
        Ok(())
    }

    /// Connect to the device, trusting it first so a later reboot can
    /// re-establish the link unattended. A trust failure is logged but does
    /// not abort the connect attempt.
    pub async fn connect(&self, address: &str) -> Result<(), BluetoothError> {
        let path = self.shared.resolve_device(address).await?;

        if let Err(err) = self.trust(address).await {
            warn!("failed to trust {address} before connecting: {err}");
        }

        info!("connecting to device {address}");
        self.shared
            .bus
            .call(&path, BLUEZ_DEVICE_IFACE, "Connect")
            .await
            .map_err(|source| BluetoothError::CommandFailed {
                op: "connect",
                address: address.to_string(),
                source,
            })?;

        self.shared.refresh_device(&path).await;
        Ok(())
    }

    /// Disconnect from the device.
    pub async fn disconnect(&self, address: &str) -> Result<(), BluetoothError> {
        let path = self.shared.resolve_device(address).await?;

        info!("disconnecting from device {address}");
        self.shared
            .bus
            .call(&path, BLUEZ_DEVICE_IFACE, "Disconnect")
            .await
            .map_err(|source| BluetoothError::CommandFailed {
                op: "disconnect",
                address: address.to_string(),
                source,
            })?;

        self.shared.refresh_device(&path).await;
        Ok(())
    }

    /// Unpair and forget the device. The registry entry is dropped right
    /// here rather than waiting for the asynchronous removal notification,
    /// so a snapshot taken after this call no longer shows the device; the
    /// notification arriving later is then a silent no-op.
    pub async fn remove(&self, address: &str) -> Result<(), BluetoothError> {
        let path = self.shared.resolve_device(address).await?;

        info!("removing device {address}");
        self.shared
            .bus
            .call_with_object(
                &self.shared.adapter_path,
                BLUEZ_ADAPTER_IFACE,
                "RemoveDevice",
                &path,
            )
            .await
            .map_err(|source| BluetoothError::CommandFailed {
                op: "remove",
                address: address.to_string(),
                source,
            })?;

        self.shared.remove_and_notify(&path).await;
        Ok(())
    }
}

impl Shared {
    /// Map a hardware address to its bus object path and require the device
    /// to be currently known. The mapping itself is deterministic
    /// (XX:XX:... -> dev_XX_XX_...), no lookup involved.
    async fn resolve_device(&self, address: &str) -> Result<String, BluetoothError> {
        let path = format!("{}/dev_{}", self.adapter_path, address.replace(':', "_"));
        if !self.registry.contains(&path).await {
            return Err(BluetoothError::DeviceNotFound(address.to_string()));
        }
        Ok(path)
    }

    /// Fetch the device's full property set and merge it through the normal
    /// apply path, closing the race with the still-in-flight notification
    /// for the command that just ran. Failure is logged, never surfaced:
    /// the command's primary effect already happened.
    async fn refresh_device(&self, path: &str) {
        match self.bus.get_all(path, BLUEZ_DEVICE_IFACE).await {
            Ok(props) => self.apply_and_notify(path, &props).await,
            Err(err) => warn!("failed to refresh device {path}: {err}"),
        }
    }
}
