/*!
 * Bluetooth Device Management
 * Keeps an authoritative registry of BlueZ devices in sync with the system
 * bus and exposes discovery and pair/connect/trust commands on top of it.
 */

pub mod error;
pub mod transport;

mod bluez;
mod commands;
mod discovery;
mod reconcile;
mod registry;
mod rfkill;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use bluez::BluezTransport;
pub use error::BluetoothError;
pub use transport::{BusEvent, BusTransport, PropValue};

use registry::DeviceRegistry;
use transport::{BLUEZ_ADAPTER_IFACE, BusError};

/// One discovered Bluetooth device. `path` is the bus object path (registry
/// key); `address` the stable hardware address shown to users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub path: String,
    pub address: String,
    pub name: String,
    pub paired: bool,
    pub connected: bool,
    pub trusted: bool,
    pub rssi: i16,
    pub icon: String,
}

type ChangeHook = Arc<dyn Fn(Vec<Device>) + Send + Sync>;
type ConnectHook = Arc<dyn Fn(Device) + Send + Sync>;

/// State shared between the engine facade and the notification worker.
pub(crate) struct Shared {
    bus: Arc<dyn BusTransport>,
    adapter_path: String,
    registry: DeviceRegistry,
    scanning: RwLock<bool>,
    scan_cancel: Notify,
    on_change: std::sync::RwLock<Option<ChangeHook>>,
    on_connect: std::sync::RwLock<Option<ConnectHook>>,
}

/// Bluetooth engine: adapter bootstrap, device registry, discovery session
/// and device commands, reconciled against the bus notification stream.
pub struct BluetoothManager {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BluetoothManager {
    /// Locate the adapter, power it on (best effort), subscribe to bus
    /// notifications and perform the initial bulk load.
    ///
    /// Fails only when the bus is unreachable or no adapter exists; a
    /// power-on failure leaves the engine running degraded.
    pub async fn new(bus: Arc<dyn BusTransport>) -> Result<Self, BluetoothError> {
        let objects = bus
            .managed_objects()
            .await
            .map_err(BluetoothError::TransportUnavailable)?;

        // Exactly one adapter is supported; take the first one reported.
        let adapter_path = objects
            .iter()
            .find(|(_, ifaces)| ifaces.contains_key(BLUEZ_ADAPTER_IFACE))
            .map(|(path, _)| path.clone())
            .ok_or(BluetoothError::AdapterNotFound)?;
        info!("using bluetooth adapter at {adapter_path}");

        let shared = Arc::new(Shared {
            bus,
            adapter_path,
            registry: DeviceRegistry::new(),
            scanning: RwLock::new(false),
            scan_cancel: Notify::new(),
            on_change: std::sync::RwLock::new(None),
            on_connect: std::sync::RwLock::new(None),
        });

        if let Err(err) = shared.ensure_powered().await {
            warn!("failed to power on adapter: {err}");
        }

        let events = shared
            .bus
            .subscribe()
            .await
            .map_err(BluetoothError::TransportUnavailable)?;
        let worker = tokio::spawn(reconcile::run_worker(Arc::clone(&shared), events));

        // Absorb devices BlueZ already knows about (paired before startup).
        shared.load_existing_devices().await;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Snapshot of every known device.
    pub async fn get_devices(&self) -> Vec<Device> {
        self.shared.registry.snapshot().await
    }

    /// Snapshot of paired or connected devices only.
    pub async fn get_paired_devices(&self) -> Vec<Device> {
        self.shared.registry.paired_or_connected().await
    }

    /// Register the registry-changed handler. Replaces any prior handler;
    /// invoked with a fresh snapshot on a detached task, never under a lock.
    pub fn set_on_change(&self, hook: impl Fn(Vec<Device>) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.on_change.write() {
            *slot = Some(Arc::new(hook));
        }
    }

    /// Register the device-connected handler, fired once per connection
    /// edge with a copy of the device at the moment of the transition.
    pub fn set_on_connect(&self, hook: impl Fn(Device) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.shared.on_connect.write() {
            *slot = Some(Arc::new(hook));
        }
    }

    /// Stop discovery if active, drop the bus subscription and wait for the
    /// notification worker to drain.
    pub async fn close(&self) -> Result<(), BluetoothError> {
        info!("closing bluetooth engine");
        self.cancel_scan();
        if let Err(err) = self.stop_discovery().await {
            warn!("failed to stop discovery while closing: {err}");
        }

        self.shared.bus.close().await;
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
        info!("bluetooth engine closed");
        Ok(())
    }
}

impl Shared {
    /// Make sure the adapter is powered, recovering from an rfkill soft
    /// block with exactly one retry.
    async fn ensure_powered(&self) -> Result<(), BluetoothError> {
        let powered = self
            .bus
            .get_property(&self.adapter_path, BLUEZ_ADAPTER_IFACE, "Powered")
            .await
            .map_err(BluetoothError::PowerOnFailed)?;
        if powered.as_bool() == Some(true) {
            return Ok(());
        }

        info!("powering on bluetooth adapter");
        let first = self.set_powered_on().await;
        let Err(err) = first else {
            return Ok(());
        };

        // The radio may be soft-blocked by an OS kill switch; unblock and
        // retry the power-on once.
        if let Err(unblock_err) = rfkill::try_unblock().await {
            warn!("rfkill unblock failed or unavailable: {unblock_err}");
            return Err(BluetoothError::PowerOnFailed(err));
        }

        info!("retrying adapter power-on after rfkill unblock");
        self.set_powered_on()
            .await
            .map_err(BluetoothError::PowerOnFailed)
    }

    async fn set_powered_on(&self) -> Result<(), BusError> {
        self.bus
            .set_property(
                &self.adapter_path,
                BLUEZ_ADAPTER_IFACE,
                "Powered",
                PropValue::Bool(true),
            )
            .await
    }
}
