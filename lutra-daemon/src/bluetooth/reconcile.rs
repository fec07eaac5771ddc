/*!
 * Signal Reconciler
 * Applies the bus notification stream to the registry, one event at a
 * time, and dispatches change/connected hooks outside every lock.
 */

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::transport::{BusEvent, PropSet, BLUEZ_DEVICE_IFACE};
use super::Shared;

/// Notification worker: consumes bus events strictly in arrival order
/// until the subscription is dropped.
pub(crate) async fn run_worker(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<BusEvent>,
) {
    debug!("bluetooth notification worker started");
    while let Some(event) = events.recv().await {
        shared.handle_event(event).await;
    }
    debug!("bluetooth notification worker stopped");
}

impl Shared {
    async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::InterfacesAdded { path, interfaces } => {
                if let Some(props) = interfaces.get(BLUEZ_DEVICE_IFACE) {
                    self.apply_and_notify(&path, props).await;
                }
            }
            BusEvent::InterfacesRemoved { path } => {
                self.remove_and_notify(&path).await;
            }
            BusEvent::PropertiesChanged {
                path,
                interface,
                changed,
            } => {
                if interface == BLUEZ_DEVICE_IFACE {
                    self.apply_and_notify(&path, &changed).await;
                }
            }
        }
    }

    /// Merge a property set into the registry and fire hooks for whatever
    /// actually changed. Paths outside the managed adapter's device subtree
    /// are ignored.
    pub(crate) async fn apply_and_notify(&self, path: &str, props: &PropSet) {
        if !self.is_managed_device_path(path) {
            return;
        }

        let applied = self.registry.apply(path, props).await;

        if applied.changed {
            self.dispatch_change().await;
        }
        if let Some(device) = applied.edge {
            debug!("device connected: {}", device.address);
            let hook = self
                .on_connect
                .read()
                .ok()
                .and_then(|slot| slot.clone());
            if let Some(hook) = hook {
                tokio::spawn(async move { hook(device) });
            }
        }
    }

    /// Drop a device from the registry; the change hook fires only if the
    /// path was actually present (duplicate removals stay silent).
    pub(crate) async fn remove_and_notify(&self, path: &str) {
        if self.registry.remove(path).await {
            debug!("device removed: {path}");
            self.dispatch_change().await;
        }
    }

    /// Full enumeration of bus objects, merging every device-capable one.
    /// Runs at startup and again when a discovery session begins, to absorb
    /// devices registered while the engine was not watching.
    pub(crate) async fn load_existing_devices(&self) {
        let objects = match self.bus.managed_objects().await {
            Ok(objects) => objects,
            Err(err) => {
                warn!("failed to enumerate bus objects: {err}");
                return;
            }
        };

        for (path, interfaces) in &objects {
            if let Some(props) = interfaces.get(BLUEZ_DEVICE_IFACE) {
                self.apply_and_notify(path, props).await;
            }
        }
    }

    fn is_managed_device_path(&self, path: &str) -> bool {
        path.strip_prefix(self.adapter_path.as_str())
            .is_some_and(|rest| rest.starts_with("/dev_"))
    }

    /// Deliver a fresh snapshot to the registry-changed hook on a detached
    /// task, with no registry lock held.
    async fn dispatch_change(&self) {
        let hook = self.on_change.read().ok().and_then(|slot| slot.clone());
        if let Some(hook) = hook {
            let snapshot = self.registry.snapshot().await;
            tokio::spawn(async move { hook(snapshot) });
        }
    }
}
