/*!
 * BlueZ Transport
 * BusTransport implementation over the system bus, using dbus-tokio for
 * the connection I/O and typed signal matches for the notification stream.
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbus::arg::{cast, PropMap, RefArg, Variant};
use dbus::message::MatchRule;
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Path;
use dbus_tokio::connection;
use tokio::sync::{mpsc, Mutex};
use tracing::error;

use super::transport::{BusError, BusEvent, BusTransport, PropSet, PropValue};

const BLUEZ_SERVICE: &str = "org.bluez";
const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

const CALL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct BluezTransport {
    conn: Arc<SyncConnection>,
    matches: Mutex<Vec<MsgMatch>>,
}

impl BluezTransport {
    /// Connect to the system bus. The connection's I/O runs on a spawned
    /// task for the lifetime of the process.
    pub fn new() -> Result<Self, BusError> {
        let (resource, conn) = connection::new_system_sync().map_err(to_bus_err)?;

        tokio::spawn(async move {
            let err = resource.await;
            error!("lost connection to system bus: {err}");
        });

        Ok(Self {
            conn,
            matches: Mutex::new(Vec::new()),
        })
    }

    fn proxy<'a>(&self, path: &'a str) -> Proxy<'a, Arc<SyncConnection>> {
        Proxy::new(BLUEZ_SERVICE, path, CALL_TIMEOUT, self.conn.clone())
    }
}

#[async_trait]
impl BusTransport for BluezTransport {
    async fn managed_objects(
        &self,
    ) -> Result<HashMap<String, HashMap<String, PropSet>>, BusError> {
        let (objects,): (HashMap<Path<'static>, HashMap<String, PropMap>>,) = self
            .proxy("/")
            .method_call(OBJECT_MANAGER_IFACE, "GetManagedObjects", ())
            .await
            .map_err(to_bus_err)?;

        Ok(objects
            .into_iter()
            .map(|(path, interfaces)| {
                let interfaces = interfaces
                    .iter()
                    .map(|(name, props)| (name.clone(), convert_props(props)))
                    .collect();
                (path.to_string(), interfaces)
            })
            .collect())
    }

    async fn get_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
    ) -> Result<PropValue, BusError> {
        let (value,): (Variant<Box<dyn RefArg + 'static>>,) = self
            .proxy(path)
            .method_call(PROPERTIES_IFACE, "Get", (iface, name))
            .await
            .map_err(to_bus_err)?;

        convert_value(&value)
            .ok_or_else(|| BusError::new(None, format!("unsupported type for property {name}")))
    }

    async fn set_property(
        &self,
        path: &str,
        iface: &str,
        name: &str,
        value: PropValue,
    ) -> Result<(), BusError> {
        let proxy = self.proxy(path);
        let result = match value {
            PropValue::Bool(v) => {
                proxy
                    .method_call(PROPERTIES_IFACE, "Set", (iface, name, Variant(v)))
                    .await
            }
            PropValue::Str(v) => {
                proxy
                    .method_call(PROPERTIES_IFACE, "Set", (iface, name, Variant(v)))
                    .await
            }
            PropValue::I16(v) => {
                proxy
                    .method_call(PROPERTIES_IFACE, "Set", (iface, name, Variant(v)))
                    .await
            }
            PropValue::U32(v) => {
                proxy
                    .method_call(PROPERTIES_IFACE, "Set", (iface, name, Variant(v)))
                    .await
            }
        };
        result.map_err(to_bus_err)
    }

    async fn get_all(&self, path: &str, iface: &str) -> Result<PropSet, BusError> {
        let (props,): (PropMap,) = self
            .proxy(path)
            .method_call(PROPERTIES_IFACE, "GetAll", (iface,))
            .await
            .map_err(to_bus_err)?;
        Ok(convert_props(&props))
    }

    async fn call(&self, path: &str, iface: &str, method: &str) -> Result<(), BusError> {
        self.proxy(path)
            .method_call(iface, method, ())
            .await
            .map_err(to_bus_err)
    }

    async fn call_with_object(
        &self,
        path: &str,
        iface: &str,
        method: &str,
        object: &str,
    ) -> Result<(), BusError> {
        self.proxy(path)
            .method_call(iface, method, (Path::from(object.to_string()),))
            .await
            .map_err(to_bus_err)
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<BusEvent>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let added_tx = tx.clone();
        let added = self
            .conn
            .add_match(MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesAdded"))
            .await
            .map_err(to_bus_err)?
            .cb(
                move |_msg, (path, interfaces): (Path<'static>, HashMap<String, PropMap>)| {
                    let interfaces = interfaces
                        .iter()
                        .map(|(name, props)| (name.clone(), convert_props(props)))
                        .collect();
                    let _ = added_tx.send(BusEvent::InterfacesAdded {
                        path: path.to_string(),
                        interfaces,
                    });
                    true
                },
            );

        let removed_tx = tx.clone();
        let removed = self
            .conn
            .add_match(MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesRemoved"))
            .await
            .map_err(to_bus_err)?
            .cb(move |_msg, (path, _interfaces): (Path<'static>, Vec<String>)| {
                let _ = removed_tx.send(BusEvent::InterfacesRemoved {
                    path: path.to_string(),
                });
                true
            });

        let changed_tx = tx;
        let changed = self
            .conn
            .add_match(MatchRule::new_signal(PROPERTIES_IFACE, "PropertiesChanged"))
            .await
            .map_err(to_bus_err)?
            .cb(
                move |msg, (iface, props, _invalidated): (String, PropMap, Vec<String>)| {
                    if let Some(path) = msg.path() {
                        let _ = changed_tx.send(BusEvent::PropertiesChanged {
                            path: path.to_string(),
                            interface: iface,
                            changed: convert_props(&props),
                        });
                    }
                    true
                },
            );

        self.matches.lock().await.extend([added, removed, changed]);
        Ok(rx)
    }

    async fn close(&self) {
        for m in self.matches.lock().await.drain(..) {
            if let Err(err) = self.conn.remove_match(m.token()).await {
                error!("failed to remove signal match: {err}");
            }
        }
    }
}

fn to_bus_err(err: dbus::Error) -> BusError {
    BusError::new(
        err.name().map(str::to_string),
        err.message().unwrap_or("d-bus call failed").to_string(),
    )
}

fn convert_props(props: &PropMap) -> PropSet {
    props
        .iter()
        .filter_map(|(key, value)| convert_value(value).map(|v| (key.clone(), v)))
        .collect()
}

/// Narrow a variant to the shapes the engine models. Anything else (arrays,
/// dicts, wider integers) is dropped here rather than crashing the
/// reconciliation path downstream.
fn convert_value(value: &Variant<Box<dyn RefArg + 'static>>) -> Option<PropValue> {
    let inner: &(dyn RefArg + 'static) = &*value.0;
    if let Some(v) = cast::<bool>(inner) {
        return Some(PropValue::Bool(*v));
    }
    if let Some(v) = inner.as_str() {
        return Some(PropValue::Str(v.to_string()));
    }
    if let Some(v) = cast::<i16>(inner) {
        return Some(PropValue::I16(*v));
    }
    if let Some(v) = cast::<u32>(inner) {
        return Some(PropValue::U32(*v));
    }
    None
}
