//! Named collection of devices with atomic bulk lifecycle

use super::{Device, DeviceError};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("a device named {0} already exists")]
    DuplicateDevice(String),
    #[error("no device named {0}")]
    UnknownDevice(String),
    #[error("device {name}: {source}")]
    Device {
        name: String,
        source: DeviceError,
    },
}

impl RegistryError {
    fn device(name: &str, source: DeviceError) -> Self {
        Self::Device {
            name: name.to_string(),
            source,
        }
    }
}

/// The devices a trial runs over, keyed by name. Bulk operations are
/// best-effort atomic: a failure rolls the already-touched devices back in
/// reverse order, so the registry never ends up half-connected or
/// half-recording. Callers serialize access with one outer mutex.
#[derive(Default)]
pub struct Registry {
    devices: BTreeMap<String, Device>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    pub fn add(&mut self, device: Device) -> Result<(), RegistryError> {
        let name = device.name().to_string();
        if self.devices.contains_key(&name) {
            return Err(RegistryError::DuplicateDevice(name));
        }
        info!(device = %name, "Device registered");
        self.devices.insert(name, device);
        Ok(())
    }

    /// Take a device out of the registry (it is disconnected on the way out)
    pub fn remove(&mut self, name: &str) -> Result<Device, RegistryError> {
        let mut device = self
            .devices
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))?;
        device.disconnect();
        info!(device = name, "Device removed");
        Ok(device)
    }

    pub fn get(&self, name: &str) -> Result<&Device, RegistryError> {
        self.devices
            .get(name)
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Device, RegistryError> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| RegistryError::UnknownDevice(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Device)> {
        self.devices.iter()
    }

    /// Names of the devices with the data-collector capability
    pub fn collector_names(&self) -> Vec<String> {
        self.devices
            .values()
            .filter(|d| d.is_collector())
            .map(|d| d.name().to_string())
            .collect()
    }

    /// Connect every device; on failure, disconnect the ones already
    /// connected, newest first
    pub fn connect_all(&mut self) -> Result<(), RegistryError> {
        let names: Vec<String> = self.devices.keys().cloned().collect();
        let mut connected = Vec::new();
        for name in names {
            let device = self.devices.get_mut(&name).unwrap();
            if let Err(e) = device.connect() {
                warn!(device = %name, "Connect failed, rolling back - {e}");
                for done in connected.iter().rev() {
                    let device: &mut Device = self.devices.get_mut(done).unwrap();
                    device.disconnect();
                }
                return Err(RegistryError::device(&name, e));
            }
            connected.push(name);
        }
        Ok(())
    }

    /// Disconnect every device; never fails
    pub fn disconnect_all(&mut self) {
        for device in self.devices.values_mut() {
            device.disconnect();
        }
    }

    /// Disconnect and drop every device
    pub fn clear(&mut self) {
        self.disconnect_all();
        self.devices.clear();
    }

    /// Start a trial on every data collector; on failure, stop the ones
    /// already recording, newest first
    pub fn start_recording_all(&mut self) -> Result<(), RegistryError> {
        let names = self.collector_names();
        let mut started = Vec::new();
        for name in names {
            let device = self.devices.get_mut(&name).unwrap();
            if let Err(e) = device.start_recording() {
                warn!(device = %name, "Start recording failed, rolling back - {e}");
                for done in started.iter().rev() {
                    let device: &mut Device = self.devices.get_mut(done).unwrap();
                    if let Err(e) = device.stop_recording() {
                        warn!(device = %done, "Rollback stop failed - {e}");
                    }
                }
                return Err(RegistryError::device(&name, e));
            }
            started.push(name);
        }
        Ok(())
    }

    /// End the trial on every data collector
    pub fn stop_recording_all(&mut self) -> Result<(), RegistryError> {
        let mut first_error = None;
        for name in self.collector_names() {
            let device = self.devices.get_mut(&name).unwrap();
            if let Err(e) = device.stop_recording() {
                warn!(device = %name, "Stop recording failed - {e}");
                first_error.get_or_insert(RegistryError::device(&name, e));
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The last trial of every data collector, keyed by device name
    pub fn serialize_last_trial(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (name, device) in &self.devices {
            if let Some(trial) = device.trial_data() {
                let trial = trial.lock().unwrap();
                out.insert(name.clone(), json!(&*trial));
            }
        }
        Value::Object(out)
    }

    /// Tail samples of every collector past its `marks` entry, advancing the
    /// marks to the newest pushed stamp. Devices with nothing new are left
    /// out of the snapshot.
    pub fn live_data_since(&self, marks: &mut BTreeMap<String, Duration>) -> Value {
        let mut out = serde_json::Map::new();
        for (name, device) in &self.devices {
            let Some(trial) = device.trial_data() else {
                continue;
            };
            let trial = trial.lock().unwrap();
            let tail = match marks.get(name) {
                // First push for this device: everything retained so far
                None => trial.tail(usize::MAX),
                Some(&mark) => trial.since(mark),
            };
            if tail.is_empty() {
                continue;
            }
            marks.insert(name.clone(), tail.back().unwrap().t_rel);
            out.insert(name.clone(), json!(&tail));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::*;
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn duplicate_and_unknown_names() {
        let mut registry = Registry::new();
        let (dev, _, _) = scripted_device("a");
        registry.add(dev).unwrap();
        let (dup, _, _) = scripted_device("a");
        assert_eq!(
            registry.add(dup),
            Err(RegistryError::DuplicateDevice("a".into()))
        );
        assert!(registry.get("a").is_ok());
        assert_eq!(
            registry.get("b").err(),
            Some(RegistryError::UnknownDevice("b".into()))
        );
        assert!(registry.remove("a").is_ok());
        assert_eq!(
            registry.remove("a").err(),
            Some(RegistryError::UnknownDevice("a".into()))
        );
    }

    #[test]
    fn connect_all_rolls_back_on_failure() {
        let mut registry = Registry::new();
        let (first, _, _) = scripted_device("a");
        let (second, _, fail_second) = scripted_device("b");
        registry.add(first).unwrap();
        registry.add(second).unwrap();
        fail_second.store(true, Ordering::Relaxed);

        let err = registry.connect_all().unwrap_err();
        assert!(matches!(err, RegistryError::Device { ref name, .. } if name == "b"));
        // Nothing is left connected
        assert!(!registry.get("a").unwrap().is_connected());
        assert!(!registry.get("b").unwrap().is_connected());

        // And the operation can be retried once the fault clears
        fail_second.store(false, Ordering::Relaxed);
        registry.connect_all().unwrap();
        assert!(registry.get("a").unwrap().is_connected());
        assert!(registry.get("b").unwrap().is_connected());
        registry.disconnect_all();
    }

    #[test]
    fn recording_rolls_back_on_failure() {
        let mut registry = Registry::new();
        let streaming = scripted_collector_device("a", std::time::Duration::from_millis(1));
        // "b" never starts streaming, so start_recording_all must fail on it
        let idle = scripted_collector_device("b", std::time::Duration::from_millis(1));
        registry.add(streaming).unwrap();
        registry.add(idle).unwrap();
        registry.connect_all().unwrap();
        registry.get_mut("a").unwrap().start_data_streaming().unwrap();

        let err = registry.start_recording_all().unwrap_err();
        assert!(matches!(err, RegistryError::Device { ref name, .. } if name == "b"));
        assert!(!registry.get("a").unwrap().is_recording());

        registry.get_mut("b").unwrap().start_data_streaming().unwrap();
        registry.start_recording_all().unwrap();
        assert!(registry.get("a").unwrap().is_recording());
        assert!(registry.get("b").unwrap().is_recording());
        registry.stop_recording_all().unwrap();
        registry.disconnect_all();
    }

    #[test]
    fn trial_serialization_covers_collectors_only() {
        let mut registry = Registry::new();
        let (plain, _, _) = scripted_device("stim");
        registry
            .add(scripted_collector_device("emg", std::time::Duration::from_millis(1)))
            .unwrap();
        registry.add(plain).unwrap();
        let value = registry.serialize_last_trial();
        let map = value.as_object().unwrap();
        assert!(map.contains_key("emg"));
        assert!(!map.contains_key("stim"));
    }

    #[test]
    fn live_marks_never_resend_old_samples() {
        let mut registry = Registry::new();
        registry
            .add(scripted_collector_device("emg", std::time::Duration::from_millis(2)))
            .unwrap();
        registry.connect_all().unwrap();
        registry.get_mut("emg").unwrap().start_data_streaming().unwrap();
        registry.start_recording_all().unwrap();

        let mut marks = BTreeMap::new();
        let mut seen_stamps: Vec<u64> = Vec::new();
        for _ in 0..5 {
            std::thread::sleep(std::time::Duration::from_millis(10));
            let snapshot = registry.live_data_since(&mut marks);
            if let Some(series) = snapshot.get("emg") {
                for point in series["data"].as_array().unwrap() {
                    seen_stamps.push(point[0].as_u64().unwrap());
                }
            }
        }
        assert!(!seen_stamps.is_empty());
        // Strictly increasing: no duplicates, no reordering
        assert!(seen_stamps.windows(2).all(|w| w[0] < w[1]));
        registry.stop_recording_all().unwrap();
        registry.disconnect_all();
    }
}
