use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::error::BluetoothError;
use super::transport::{
    BusError, BusEvent, BusTransport, PropSet, PropValue, BLUEZ_ADAPTER_IFACE,
    BLUEZ_DEVICE_IFACE,
};
use super::{BluetoothManager, Device};

const ADAPTER: &str = "/org/bluez/hci0";
const DEV_PATH: &str = "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF";
const DEV_ADDR: &str = "AA:BB:CC:DD:EE:FF";

#[derive(Default)]
struct MockState {
    objects: HashMap<String, HashMap<String, PropSet>>,
    calls: Vec<String>,
    failures: HashMap<String, BusError>,
    delays: HashMap<String, Duration>,
    get_all: HashMap<String, PropSet>,
    events_tx: Option<mpsc::UnboundedSender<BusEvent>>,
}

/// Scripted in-memory bus: a fixed object tree, a call log, injectable
/// failures per method and a sender for pushing notifications.
#[derive(Default)]
struct MockBus {
    state: Mutex<MockState>,
}

impl MockBus {
    fn with_adapter() -> Self {
        let bus = Self::default();
        bus.add_object(ADAPTER, BLUEZ_ADAPTER_IFACE, props(&[("Powered", PropValue::Bool(true))]));
        bus
    }

    fn add_object(&self, path: &str, iface: &str, properties: PropSet) {
        self.state
            .lock()
            .unwrap()
            .objects
            .entry(path.to_string())
            .or_default()
            .insert(iface.to_string(), properties);
    }

    fn fail(&self, key: &str, name: Option<&str>) {
        self.state.lock().unwrap().failures.insert(
            key.to_string(),
            BusError::new(name.map(str::to_string), format!("{key} rejected")),
        );
    }

    fn slow(&self, method: &str, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .delays
            .insert(method.to_string(), delay);
    }

    fn answer_get_all(&self, path: &str, properties: PropSet) {
        self.state
            .lock()
            .unwrap()
            .get_all
            .insert(path.to_string(), properties);
    }

    fn emit(&self, event: BusEvent) {
        let state = self.state.lock().unwrap();
        state
            .events_tx
            .as_ref()
            .expect("no active subscription")
            .send(event)
            .expect("worker gone");
    }

    fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn count(&self, method: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == method).count()
    }

    fn checked(&self, key: &str) -> Result<(), BusError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(key.to_string());
        match state.failures.get(key) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BusTransport for MockBus {
    async fn managed_objects(
        &self,
    ) -> Result<HashMap<String, HashMap<String, PropSet>>, BusError> {
        Ok(self.state.lock().unwrap().objects.clone())
    }

    async fn get_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
    ) -> Result<PropValue, BusError> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(path)
            .and_then(|ifaces| ifaces.get(iface))
            .and_then(|properties| properties.get(name))
            .cloned()
            .ok_or_else(|| BusError::new(None, format!("no such property {name}")))
    }

    async fn set_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
        value: PropValue,
    ) -> Result<(), BusError> {
        self.checked(&format!("Set:{name}"))?;
        self.state
            .lock()
            .unwrap()
            .objects
            .entry(path.to_string())
            .or_default()
            .entry(iface.to_string())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    async fn get_all(&self, path: &str, iface: &str) -> Result<PropSet, BusError> {
        self.checked("GetAll")?;
        let state = self.state.lock().unwrap();
        if let Some(properties) = state.get_all.get(path) {
            return Ok(properties.clone());
        }
        Ok(state
            .objects
            .get(path)
            .and_then(|ifaces| ifaces.get(iface))
            .cloned()
            .unwrap_or_default())
    }

    async fn call(&self, _path: &str, _iface: &str, method: &str) -> Result<(), BusError> {
        let delay = self.state.lock().unwrap().delays.get(method).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.checked(method)
    }

    async fn call_with_object(
        &self,
        _path: &str,
        _iface: &str,
        method: &str,
        _object: &str,
    ) -> Result<(), BusError> {
        self.checked(method)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEvent>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().events_tx = Some(tx);
        Ok(rx)
    }

    async fn close(&self) {
        self.state.lock().unwrap().events_tx = None;
    }
}

fn props(entries: &[(&str, PropValue)]) -> PropSet {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn device_props(connected: bool) -> PropSet {
    props(&[
        ("Address", PropValue::Str(DEV_ADDR.into())),
        ("Name", PropValue::Str("Speaker".into())),
        ("Connected", PropValue::Bool(connected)),
    ])
}

async fn engine_with_device() -> (Arc<MockBus>, BluetoothManager) {
    let bus = Arc::new(MockBus::with_adapter());
    bus.add_object(DEV_PATH, BLUEZ_DEVICE_IFACE, device_props(false));
    let manager = BluetoothManager::new(bus.clone()).await.unwrap();
    (bus, manager)
}

/// Let spawned hook dispatch tasks run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn startup_requires_an_adapter() {
    let bus = Arc::new(MockBus::default());
    let result = BluetoothManager::new(bus).await;
    assert!(matches!(result, Err(BluetoothError::AdapterNotFound)));
}

#[tokio::test]
async fn startup_survives_power_on_failure() {
    let bus = Arc::new(MockBus::with_adapter());
    bus.add_object(ADAPTER, BLUEZ_ADAPTER_IFACE, props(&[("Powered", PropValue::Bool(false))]));
    bus.fail("Set:Powered", None);

    // Degraded but running is preferred over refusing to start.
    let manager = BluetoothManager::new(bus).await.unwrap();
    assert!(manager.get_devices().await.is_empty());
}

#[tokio::test]
async fn bulk_load_absorbs_known_devices() {
    let (_bus, manager) = engine_with_device().await;

    let devices = manager.get_devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address, DEV_ADDR);
    assert_eq!(devices[0].path, DEV_PATH);
    assert!(!devices[0].connected);
}

#[tokio::test]
async fn notifications_flow_into_the_registry() {
    let (bus, manager) = engine_with_device().await;

    bus.emit(BusEvent::PropertiesChanged {
        path: DEV_PATH.to_string(),
        interface: BLUEZ_DEVICE_IFACE.to_string(),
        changed: props(&[("RSSI", PropValue::I16(-42))]),
    });
    // Non-device interfaces and foreign paths must be ignored.
    bus.emit(BusEvent::PropertiesChanged {
        path: DEV_PATH.to_string(),
        interface: "org.bluez.MediaControl1".to_string(),
        changed: props(&[("Connected", PropValue::Bool(true))]),
    });
    bus.emit(BusEvent::PropertiesChanged {
        path: "/org/bluez/hci1/dev_11_22_33_44_55_66".to_string(),
        interface: BLUEZ_DEVICE_IFACE.to_string(),
        changed: props(&[("Connected", PropValue::Bool(true))]),
    });
    settle().await;

    let devices = manager.get_devices().await;
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].rssi, -42);
    assert!(!devices[0].connected);
}

#[tokio::test]
async fn interfaces_added_and_removed_track_lifecycle() {
    let (bus, manager) = engine_with_device().await;

    let second = "/org/bluez/hci0/dev_11_22_33_44_55_66";
    bus.emit(BusEvent::InterfacesAdded {
        path: second.to_string(),
        interfaces: HashMap::from([(
            BLUEZ_DEVICE_IFACE.to_string(),
            props(&[("Address", PropValue::Str("11:22:33:44:55:66".into()))]),
        )]),
    });
    settle().await;
    assert_eq!(manager.get_devices().await.len(), 2);

    bus.emit(BusEvent::InterfacesRemoved {
        path: second.to_string(),
    });
    settle().await;
    assert_eq!(manager.get_devices().await.len(), 1);
}

#[tokio::test]
async fn double_start_issues_one_bus_call() {
    let (bus, manager) = engine_with_device().await;

    manager.start_discovery().await.unwrap();
    manager.start_discovery().await.unwrap();

    assert!(manager.is_scanning().await);
    assert_eq!(bus.count("StartDiscovery"), 1);
}

#[tokio::test]
async fn stop_while_idle_is_a_successful_noop() {
    let (bus, manager) = engine_with_device().await;

    manager.stop_discovery().await.unwrap();
    assert!(!manager.is_scanning().await);
    assert_eq!(bus.count("StopDiscovery"), 0);
}

#[tokio::test]
async fn stop_tolerates_discovery_not_active_errors() {
    let (bus, manager) = engine_with_device().await;
    bus.fail("StopDiscovery", Some("org.bluez.Error.Failed"));

    manager.start_discovery().await.unwrap();
    manager.stop_discovery().await.unwrap();
    assert!(!manager.is_scanning().await);
}

#[tokio::test]
async fn failed_start_reverts_to_idle() {
    let (bus, manager) = engine_with_device().await;
    bus.fail("StartDiscovery", Some("org.bluez.Error.NotReady"));

    let result = manager.start_discovery().await;
    assert!(matches!(result, Err(BluetoothError::DiscoveryFailed(_))));
    assert!(!manager.is_scanning().await);
}

#[tokio::test]
async fn cancel_releases_a_bounded_scan() {
    let (_bus, manager) = engine_with_device().await;
    let manager = Arc::new(manager);

    let scanner = Arc::clone(&manager);
    let scan = tokio::spawn(async move { scanner.scan_for(Duration::from_secs(3600)).await });

    settle().await;
    assert!(manager.is_scanning().await);

    manager.cancel_scan();
    timeout(Duration::from_secs(1), scan)
        .await
        .expect("scan did not end after cancellation")
        .unwrap()
        .unwrap();
    assert!(!manager.is_scanning().await);
}

#[tokio::test]
async fn cancel_while_scan_is_still_starting_is_not_lost() {
    let (bus, manager) = engine_with_device().await;
    bus.slow("StartDiscovery", Duration::from_millis(300));
    let manager = Arc::new(manager);

    let scanner = Arc::clone(&manager);
    let scan = tokio::spawn(async move { scanner.scan_for(Duration::from_secs(3600)).await });

    // Fire the cancellation while scan_for is still inside the slow
    // StartDiscovery bus call, before it parks on the duration wait.
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.cancel_scan();

    timeout(Duration::from_secs(2), scan)
        .await
        .expect("cancellation was lost: scan_for kept waiting out its bound")
        .unwrap()
        .unwrap();
    assert!(!manager.is_scanning().await);
    assert_eq!(bus.count("StopDiscovery"), 1);
}

#[tokio::test]
async fn commands_on_unknown_addresses_touch_nothing() {
    let bus = Arc::new(MockBus::with_adapter());
    let manager = BluetoothManager::new(bus.clone()).await.unwrap();

    let result = manager.connect(DEV_ADDR).await;
    assert!(matches!(result, Err(BluetoothError::DeviceNotFound(_))));
    assert!(bus.calls().is_empty());
}

#[tokio::test]
async fn connect_trusts_refreshes_and_fires_one_edge() {
    let (bus, manager) = engine_with_device().await;
    bus.answer_get_all(DEV_PATH, device_props(true));

    let (edge_tx, mut edge_rx) = mpsc::unbounded_channel();
    manager.set_on_connect(move |device: Device| {
        let _ = edge_tx.send(device);
    });

    manager.connect(DEV_ADDR).await.unwrap();

    let connected = timeout(Duration::from_secs(1), edge_rx.recv())
        .await
        .expect("no connection edge delivered")
        .unwrap();
    assert_eq!(connected.address, DEV_ADDR);

    // Already-connected refreshes must not fire a second edge.
    assert!(timeout(Duration::from_millis(100), edge_rx.recv()).await.is_err());

    let calls = bus.calls();
    assert!(calls.contains(&"Set:Trusted".to_string()));
    assert!(calls.contains(&"Connect".to_string()));

    let devices = manager.get_devices().await;
    assert!(devices[0].connected);
}

#[tokio::test]
async fn connect_proceeds_when_trust_fails() {
    let (bus, manager) = engine_with_device().await;
    bus.fail("Set:Trusted", Some("org.bluez.Error.Failed"));

    manager.connect(DEV_ADDR).await.unwrap();
    assert_eq!(bus.count("Connect"), 1);
}

#[tokio::test]
async fn failed_connect_surfaces_the_bus_error() {
    let (bus, manager) = engine_with_device().await;
    bus.fail("Connect", Some("org.bluez.Error.Failed"));

    let result = manager.connect(DEV_ADDR).await;
    match result {
        Err(BluetoothError::CommandFailed { op, address, .. }) => {
            assert_eq!(op, "connect");
            assert_eq!(address, DEV_ADDR);
        }
        other => panic!("expected CommandFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn refresh_failure_does_not_fail_the_command() {
    let (bus, manager) = engine_with_device().await;
    bus.fail("GetAll", None);

    manager.pair(DEV_ADDR).await.unwrap();
    assert_eq!(bus.count("Pair"), 1);
}

#[tokio::test]
async fn remove_deletes_synchronously_then_ignores_the_echo() {
    let (bus, manager) = engine_with_device().await;

    manager.remove(DEV_ADDR).await.unwrap();
    assert_eq!(bus.count("RemoveDevice"), 1);
    // Deleted before any notification arrives.
    assert!(manager.get_devices().await.is_empty());

    // The async removal notification for the same path is a silent no-op.
    bus.emit(BusEvent::InterfacesRemoved {
        path: DEV_PATH.to_string(),
    });
    settle().await;
    assert!(manager.get_devices().await.is_empty());
}

#[tokio::test]
async fn change_hook_receives_snapshots() {
    let (bus, manager) = engine_with_device().await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    manager.set_on_change(move |devices: Vec<Device>| {
        let _ = tx.send(devices);
    });

    bus.emit(BusEvent::PropertiesChanged {
        path: DEV_PATH.to_string(),
        interface: BLUEZ_DEVICE_IFACE.to_string(),
        changed: props(&[("Paired", PropValue::Bool(true))]),
    });

    let snapshot = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no change notification delivered")
        .unwrap();
    assert_eq!(snapshot.len(), 1);
    assert!(snapshot[0].paired);

    assert_eq!(manager.get_paired_devices().await.len(), 1);
}

#[tokio::test]
async fn close_stops_discovery_and_the_worker() {
    let (bus, manager) = engine_with_device().await;

    manager.start_discovery().await.unwrap();
    manager.close().await.unwrap();

    assert!(!manager.is_scanning().await);
    assert_eq!(bus.count("StopDiscovery"), 1);
    // Subscription dropped on close.
    assert!(bus.state.lock().unwrap().events_tx.is_none());
}
