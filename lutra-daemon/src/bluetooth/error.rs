use thiserror::Error;

use super::transport::BusError;

/// Errors surfaced by the Bluetooth engine.
///
/// Refresh failures after a successful command are deliberately absent: the
/// primary effect already happened, so they are logged and swallowed.
#[derive(Debug, Error)]
pub enum BluetoothError {
    /// The system bus cannot be reached. Fatal at startup.
    #[error("cannot reach system bus: {0}")]
    TransportUnavailable(#[source] BusError),

    /// No object exposing the adapter interface exists. Fatal at startup.
    #[error("no bluetooth adapter found")]
    AdapterNotFound,

    /// Powering the adapter on failed even after the rfkill recovery path.
    /// Non-fatal: the engine keeps running degraded.
    #[error("failed to power on adapter: {0}")]
    PowerOnFailed(#[source] BusError),

    /// No device with this address is currently known to the registry.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// A device command's bus call failed.
    #[error("failed to {op} {address}: {source}")]
    CommandFailed {
        op: &'static str,
        address: String,
        #[source]
        source: BusError,
    },

    /// Starting or stopping a discovery session failed.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(#[source] BusError),
}
