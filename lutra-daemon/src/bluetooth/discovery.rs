/*!
 * Discovery Session
 * Idle/Scanning state machine guarding StartDiscovery/StopDiscovery
 * against double starts and races with adapter power state.
 */

use std::time::Duration;

use tracing::{debug, info, warn};

use super::transport::BLUEZ_ADAPTER_IFACE;
use super::{BluetoothError, BluetoothManager};

impl BluetoothManager {
    /// Begin scanning for nearby devices. Calling while already scanning is
    /// a successful no-op.
    ///
    /// Power is re-asserted here (not only at startup) because rfkill or
    /// another process may have switched the radio off since then. The bulk
    /// load runs again for the same reason: BlueZ may have registered
    /// devices while no session was active.
    pub async fn start_discovery(&self) -> Result<(), BluetoothError> {
        {
            let mut scanning = self.shared.scanning.write().await;
            if *scanning {
                debug!("discovery already in progress");
                return Ok(());
            }
            *scanning = true;
        }

        if let Err(err) = self.shared.ensure_powered().await {
            *self.shared.scanning.write().await = false;
            warn!("cannot start discovery: {err}");
            return Err(err);
        }

        self.shared.load_existing_devices().await;

        info!("starting bluetooth discovery");
        if let Err(err) = self
            .shared
            .bus
            .call(&self.shared.adapter_path, BLUEZ_ADAPTER_IFACE, "StartDiscovery")
            .await
        {
            *self.shared.scanning.write().await = false;
            warn!("failed to start discovery: {err}");
            return Err(BluetoothError::DiscoveryFailed(err));
        }

        Ok(())
    }

    /// Stop scanning. Calling while idle is a successful no-op, and so is a
    /// bus response saying discovery was not running: the caller's intent
    /// ("make sure scanning is off") is already satisfied.
    pub async fn stop_discovery(&self) -> Result<(), BluetoothError> {
        {
            let scanning = self.shared.scanning.read().await;
            if !*scanning {
                debug!("discovery not in progress");
                return Ok(());
            }
        }

        info!("stopping bluetooth discovery");
        let result = self
            .shared
            .bus
            .call(&self.shared.adapter_path, BLUEZ_ADAPTER_IFACE, "StopDiscovery")
            .await;

        // Idle regardless of what the bus said.
        *self.shared.scanning.write().await = false;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.means_discovery_idle() => {
                debug!("discovery was not active on the bus");
                Ok(())
            }
            Err(err) => {
                warn!("failed to stop discovery: {err}");
                Err(BluetoothError::DiscoveryFailed(err))
            }
        }
    }

    /// Whether a discovery session is currently active.
    pub async fn is_scanning(&self) -> bool {
        *self.shared.scanning.read().await
    }

    /// Scan for `duration`, then stop. `cancel_scan` cuts the wait short;
    /// discovery is stopped either way.
    pub async fn scan_for(&self, duration: Duration) -> Result<(), BluetoothError> {
        // Arm cancellation before starting: a cancel_scan arriving while
        // start_discovery is still mid-flight (power re-assert, bulk load,
        // the StartDiscovery call itself) must not be lost.
        let cancelled = self.shared.scan_cancel.notified();
        tokio::pin!(cancelled);
        cancelled.as_mut().enable();

        self.start_discovery().await?;

        tokio::select! {
            () = tokio::time::sleep(duration) => {}
            () = &mut cancelled => {
                debug!("bounded scan cancelled");
            }
        }

        self.stop_discovery().await
    }

    /// Release any `scan_for` currently waiting out its duration.
    pub fn cancel_scan(&self) {
        self.shared.scan_cancel.notify_waiters();
    }
}
