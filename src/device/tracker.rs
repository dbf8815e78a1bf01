//! Device tracker
//!
//! Consumes the bridge's tracking stream, maintains the process-wide device
//! set, enriches first-seen devices with their product properties, and fans
//! change events out to SSE subscribers.
//!
//! Property fetches never block the tracking loop: the change event for a
//! new device may precede its enrichment, in which case a second event
//! follows once the properties land.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adb::AdbBridge;
use crate::device::model::{Device, DeviceSetSnapshot, DeviceState};

/// Bound for each SSE subscriber's event queue; overflow drops the newest
/// event (the next change re-delivers the full set anyway)
const LISTENER_QUEUE_DEPTH: usize = 16;

/// Tracks the device set and broadcasts changes
pub struct DeviceTracker {
    bridge: AdbBridge,
    devices: Mutex<HashMap<String, Device>>,
    listeners: Mutex<Vec<mpsc::Sender<Vec<Device>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceTracker {
    /// Create the tracker and start consuming the tracking stream
    pub fn spawn(bridge: AdbBridge) -> Arc<Self> {
        let tracker = Arc::new(Self {
            bridge: bridge.clone(),
            devices: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        });

        let task = {
            let tracker = Arc::downgrade(&tracker);
            tokio::spawn(async move {
                track_loop(tracker, bridge).await;
            })
        };
        *tracker.task.lock().expect("task lock poisoned") = Some(task);
        tracker
    }

    /// Current device set, offline devices included
    pub fn devices(&self) -> Vec<Device> {
        let mut list: Vec<Device> = self
            .devices
            .lock()
            .expect("devices lock poisoned")
            .values()
            .cloned()
            .collect();
        list.sort_by(|a, b| a.serial.cmp(&b.serial));
        list
    }

    /// One device by serial
    pub fn device(&self, serial: &str) -> Option<Device> {
        self.devices
            .lock()
            .expect("devices lock poisoned")
            .get(serial)
            .cloned()
    }

    /// Whether the device is currently online
    pub fn is_online(&self, serial: &str) -> bool {
        self.device(serial).map(|d| d.state.is_online()).unwrap_or(false)
    }

    /// Subscribe to change events; each event is the full device set
    pub fn subscribe(&self) -> mpsc::Receiver<Vec<Device>> {
        let (tx, rx) = mpsc::channel(LISTENER_QUEUE_DEPTH);
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .push(tx);
        rx
    }

    /// Stop consuming the tracking stream
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        self.listeners
            .lock()
            .expect("listeners lock poisoned")
            .clear();
    }

    /// Broadcast the full set to every listener; a full queue drops this
    /// event for that listener, closed listeners are pruned
    fn emit(&self) {
        let set = self.devices();
        let mut listeners = self.listeners.lock().expect("listeners lock poisoned");
        listeners.retain(|tx| match tx.try_send(set.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!("Device event dropped for slow listener");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Apply one tracking snapshot; returns whether anything changed
    fn apply(&self, snapshot: &DeviceSetSnapshot) -> (bool, Vec<String>) {
        let mut changed = false;
        let mut newly_online = Vec::new();
        let now = Utc::now();

        let mut devices = self.devices.lock().expect("devices lock poisoned");
        let seen: HashMap<&str, DeviceState> = snapshot
            .devices
            .iter()
            .map(|(s, st)| (s.as_str(), *st))
            .collect();

        for (serial, state) in &snapshot.devices {
            match devices.get_mut(serial) {
                Some(device) => {
                    device.last_seen_at = now;
                    if device.state != *state {
                        tracing::info!(serial = %serial, from = ?device.state, to = ?state, "Device state changed");
                        if state.is_online() && device.model.is_none() {
                            newly_online.push(serial.clone());
                        }
                        device.state = *state;
                        changed = true;
                    }
                }
                None => {
                    tracing::info!(serial = %serial, state = ?state, "Device connected");
                    devices.insert(serial.clone(), Device::new(serial.clone(), *state));
                    if state.is_online() {
                        newly_online.push(serial.clone());
                    }
                    changed = true;
                }
            }
        }

        // Devices that vanished from the set stay registered as offline
        for (serial, device) in devices.iter_mut() {
            if !seen.contains_key(serial.as_str()) && device.state != DeviceState::Offline {
                tracing::info!(serial = %serial, "Device disconnected");
                device.state = DeviceState::Offline;
                changed = true;
            }
        }

        (changed, newly_online)
    }
}

async fn track_loop(tracker: Weak<DeviceTracker>, bridge: AdbBridge) {
    let mut events = bridge.track_devices();

    while let Some(snapshot) = events.recv().await {
        let Some(tracker) = tracker.upgrade() else {
            return;
        };

        let (changed, newly_online) = tracker.apply(&snapshot);
        if changed {
            tracker.emit();
        }

        for serial in newly_online {
            let tracker = Arc::downgrade(&tracker);
            tokio::spawn(async move {
                enrich_device(tracker, serial).await;
            });
        }
    }
}

/// Fetch product properties for a device and emit a follow-up event
async fn enrich_device(tracker: Weak<DeviceTracker>, serial: String) {
    let Some(t) = tracker.upgrade() else { return };
    let bridge = t.bridge.clone();
    drop(t);

    let model = bridge.getprop(&serial, "ro.product.model").await.ok();
    let manufacturer = bridge.getprop(&serial, "ro.product.manufacturer").await.ok();

    let Some(tracker) = tracker.upgrade() else {
        return;
    };
    let mut updated = false;
    {
        let mut devices = tracker.devices.lock().expect("devices lock poisoned");
        if let Some(device) = devices.get_mut(&serial) {
            if let Some(model) = model.filter(|m| !m.is_empty()) {
                device.model = Some(model);
                updated = true;
            }
            if let Some(manufacturer) = manufacturer.filter(|m| !m.is_empty()) {
                device.manufacturer = Some(manufacturer);
                updated = true;
            }
        }
    }
    if updated {
        tracing::debug!(serial = %serial, "Device properties enriched");
        tracker.emit();
    }
}
