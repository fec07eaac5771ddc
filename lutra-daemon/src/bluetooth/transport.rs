/*!
 * Bus Transport Abstraction
 * The engine talks to BlueZ through this trait so the reconciliation and
 * command paths can be driven by an in-memory transport in tests.
 */

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub const BLUEZ_ADAPTER_IFACE: &str = "org.bluez.Adapter1";
pub const BLUEZ_DEVICE_IFACE: &str = "org.bluez.Device1";

/// A single property value as reported by the bus. Only the shapes the
/// device and adapter interfaces actually use are modeled; anything else is
/// dropped before it reaches the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum PropValue {
    Bool(bool),
    Str(String),
    I16(i16),
    U32(u32),
}

impl PropValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> Option<i16> {
        match self {
            PropValue::I16(n) => Some(*n),
            _ => None,
        }
    }
}

/// Partial property set for one interface on one object.
pub type PropSet = HashMap<String, PropValue>;

/// Push notifications delivered by the bus subscription.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A new object appeared, with its full per-interface property sets.
    InterfacesAdded {
        path: String,
        interfaces: HashMap<String, PropSet>,
    },
    /// An object disappeared.
    InterfacesRemoved { path: String },
    /// Properties changed on one interface of an existing object.
    PropertiesChanged {
        path: String,
        interface: String,
        changed: PropSet,
    },
}

/// Error from a bus call. `name` carries the remote error name (for example
/// `org.bluez.Error.Failed`) when the daemon supplied one, so callers can
/// classify expected failures.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BusError {
    pub name: Option<String>,
    pub message: String,
}

impl BusError {
    pub fn new(name: Option<String>, message: impl Into<String>) -> Self {
        Self {
            name,
            message: message.into(),
        }
    }

    /// True when the error means "discovery was already stopped" — BlueZ
    /// reports this as Failed ("No discovery started") or NotReady.
    pub fn means_discovery_idle(&self) -> bool {
        matches!(
            self.name.as_deref(),
            Some("org.bluez.Error.Failed") | Some("org.bluez.Error.NotReady")
        )
    }
}

/// Call/response plus push-notification access to the device-management bus.
///
/// Implementations must be safe to share across tasks; the engine issues
/// calls from command handlers concurrently with the notification worker.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Full enumeration: object path -> interface name -> property set.
    async fn managed_objects(
        &self,
    ) -> Result<HashMap<String, HashMap<String, PropSet>>, BusError>;

    /// `org.freedesktop.DBus.Properties.Get` on one object.
    async fn get_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
    ) -> Result<PropValue, BusError>;

    /// `org.freedesktop.DBus.Properties.Set` on one object.
    async fn set_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
        value: PropValue,
    ) -> Result<(), BusError>;

    /// `org.freedesktop.DBus.Properties.GetAll` for one interface.
    async fn get_all(&self, path: &str, iface: &str) -> Result<PropSet, BusError>;

    /// Invoke a no-argument method (StartDiscovery, Pair, Connect, ...).
    async fn call(&self, path: &str, iface: &str, method: &str) -> Result<(), BusError>;

    /// Invoke a method taking a single object-path argument (RemoveDevice).
    async fn call_with_object(
        &self,
        path: &str,
        iface: &str,
        method: &str,
        object: &str,
    ) -> Result<(), BusError>;

    /// Subscribe to object-added / object-removed / property-changed
    /// notifications. At most one subscription is active per transport.
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEvent>, BusError>;

    /// Drop the subscription and release the bus connection. The receiver
    /// handed out by `subscribe` terminates after this.
    async fn close(&self);
}
