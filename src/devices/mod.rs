//! Device runtime: worker-backed devices and data collectors
//!
//! Every piece of hardware is composed from two orthogonal capabilities: a
//! command-bearing transport (a [`CommandDriver`] run by a dedicated worker
//! thread) and, optionally, a periodic data producer (a [`CollectorDriver`]
//! run by a second worker). The [`Device`] struct owns both workers and is
//! what the registry and the control server talk to.

pub mod collector;
pub mod delsys;
pub mod link;
pub mod magstim;
pub mod registry;
pub mod worker;

use crate::timeseries::TimeSeries;
use collector::CollectorWorker;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use worker::{CommandWorker, Heartbeat};
use tracing::warn;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("the device is not connected")]
    NotConnected,
    #[error("the device is already connected")]
    AlreadyConnected,
    #[error("could not connect to the device: {0}")]
    ConnectFailed(String),
    #[error("the transport was closed mid-stream")]
    TransportClosed,
    #[error("the device is already streaming data")]
    AlreadyStreaming,
    #[error("the device is not streaming data")]
    NotStreaming,
    #[error("the device is already recording")]
    AlreadyRecording,
    #[error("the device is not recording")]
    NotRecording,
    #[error("the device does not collect data")]
    NotACollector,
    #[error("the command is not recognized by this device")]
    UnknownCommand,
    #[error("the stimulator is already armed")]
    AlreadyArmed,
    #[error("the stimulator is not armed")]
    NotArmed,
}

/// Commands accepted by [`Device::send`]. Each driver handles its own subset
/// and answers [`DeviceError::UnknownCommand`] for the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    // Delsys command channel
    Start,
    Stop,
    BackwardsCompatibility,
    Upsample,
    // Magstim serial
    Poke,
    Print(String),
    GetTemperature,
    Arm,
    Disarm,
    SetFastCommunication(bool),
}

/// Successful command replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Ok,
    /// Commands that read something back (e.g. a temperature)
    Value(i32),
}

/// Hooks run on the command worker thread. All transport I/O for the command
/// side of a device lives behind these.
pub trait CommandDriver: Send + 'static {
    /// Open the transport. Failure aborts the worker and surfaces as
    /// [`DeviceError::ConnectFailed`] from [`Device::connect`].
    fn connect(&mut self) -> Result<(), DeviceError>;

    /// Close the transport. Must be safe to call on a dead transport.
    fn disconnect(&mut self);

    /// Handle one queued command. The heartbeat is passed so drivers can
    /// retune the keep-alive cadence (Magstim arm/disarm).
    fn command(&mut self, command: &Command, heartbeat: &mut Heartbeat)
        -> Result<Ack, DeviceError>;

    /// Keep-alive hook, invoked once per heartbeat interval
    fn ping(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Initial keep-alive interval
    fn keep_alive_interval(&self) -> Duration;
}

/// Hooks run on the data-collector worker thread.
pub trait CollectorDriver: Send + 'static {
    fn channel_count(&self) -> usize;

    /// Cadence of [`CollectorDriver::read_frames`] calls
    fn tick_interval(&self) -> Duration;

    /// Fresh trial series for this device (fixed-rate for framed devices)
    fn new_series(&self) -> TimeSeries;

    /// Suppress the too-slow-tick warning (drivers whose read blocks for the
    /// frame period set this)
    fn ignore_slow_ticks(&self) -> bool {
        false
    }

    /// Begin physical acquisition. Runs before the first tick; returning an
    /// error aborts the worker.
    fn start_streaming(&mut self) -> Result<(), DeviceError>;

    /// End physical acquisition. Runs after the last tick.
    fn stop_streaming(&mut self) -> Result<(), DeviceError>;

    /// Read whatever sample rows the device has made available, one inner
    /// vector per row
    fn read_frames(&mut self) -> Result<Vec<Vec<f64>>, DeviceError>;
}

/// The collector half of a device: second worker plus the trial series it
/// appends to while recording.
struct Collector {
    driver: Option<Box<dyn CollectorDriver>>,
    worker: Option<CollectorWorker>,
    channel_count: usize,
    trial: Arc<Mutex<TimeSeries>>,
}

impl Collector {
    fn new(driver: Box<dyn CollectorDriver>) -> Self {
        let trial = Arc::new(Mutex::new(driver.new_series()));
        Self {
            channel_count: driver.channel_count(),
            driver: Some(driver),
            worker: None,
            trial,
        }
    }

    fn is_streaming(&self) -> bool {
        self.worker.as_ref().is_some_and(CollectorWorker::is_streaming)
    }

    fn is_recording(&self) -> bool {
        self.worker.as_ref().is_some_and(CollectorWorker::is_recording)
    }
}

/// A named device composed of a command worker and an optional data collector.
///
/// Created disconnected; `connect` spawns the command worker, `disconnect`
/// always succeeds and joins every worker it started.
pub struct Device {
    name: String,
    driver: Option<Box<dyn CommandDriver>>,
    worker: Option<CommandWorker>,
    has_failed_to_connect: bool,
    collector: Option<Collector>,
}

impl Device {
    /// A command-only device (e.g. a stimulator)
    pub fn new(name: impl Into<String>, driver: Box<dyn CommandDriver>) -> Self {
        Self {
            name: name.into(),
            driver: Some(driver),
            worker: None,
            has_failed_to_connect: false,
            collector: None,
        }
    }

    /// A device that also produces data
    pub fn with_collector(
        name: impl Into<String>,
        driver: Box<dyn CommandDriver>,
        collector: Box<dyn CollectorDriver>,
    ) -> Self {
        Self {
            name: name.into(),
            driver: Some(driver),
            worker: None,
            has_failed_to_connect: false,
            collector: Some(Collector::new(collector)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.worker.as_ref().is_some_and(CommandWorker::is_connected)
    }

    pub fn has_failed_to_connect(&self) -> bool {
        self.has_failed_to_connect
    }

    pub fn is_streaming(&self) -> bool {
        self.collector.as_ref().is_some_and(Collector::is_streaming)
    }

    pub fn is_recording(&self) -> bool {
        self.collector.as_ref().is_some_and(Collector::is_recording)
    }

    /// Whether this device has the data-collector capability
    pub fn is_collector(&self) -> bool {
        self.collector.is_some()
    }

    pub fn channel_count(&self) -> Option<usize> {
        self.collector.as_ref().map(|c| c.channel_count)
    }

    /// The trial series, shared with the collector worker
    pub fn trial_data(&self) -> Option<Arc<Mutex<TimeSeries>>> {
        self.collector.as_ref().map(|c| Arc::clone(&c.trial))
    }

    /// Spawn the command worker and run the driver's connect hook on it
    pub fn connect(&mut self) -> Result<(), DeviceError> {
        if self.is_connected() {
            return Err(DeviceError::AlreadyConnected);
        }
        // Reap a worker that died on its own (transport failure)
        if let Some(dead) = self.worker.take() {
            self.driver = Some(dead.shutdown());
        }
        let driver = self.driver.take().ok_or(DeviceError::NotConnected)?;
        match CommandWorker::spawn(self.name.clone(), driver) {
            Ok(worker) => {
                self.worker = Some(worker);
                self.has_failed_to_connect = false;
                Ok(())
            }
            Err((driver, err)) => {
                self.driver = Some(driver);
                self.has_failed_to_connect = true;
                Err(err)
            }
        }
    }

    /// Stop streaming if needed, stop the keep-alive, join the workers.
    /// Never fails; calling it on a disconnected device is a no-op.
    pub fn disconnect(&mut self) {
        if self.is_streaming() {
            if let Err(e) = self.stop_data_streaming() {
                warn!(device = %self.name, "Error while stopping the data stream - {e}");
            }
        }
        if let Some(worker) = self.worker.take() {
            self.driver = Some(worker.shutdown());
        }
    }

    /// Queue a command on the worker and wait for its reply
    pub fn send(&self, command: Command) -> Result<Ack, DeviceError> {
        self.worker
            .as_ref()
            .ok_or(DeviceError::NotConnected)?
            .send(command)
    }

    /// Queue a command without waiting; replies `Ok` as soon as it is queued
    pub fn send_fast(&self, command: Command) -> Result<Ack, DeviceError> {
        self.worker
            .as_ref()
            .ok_or(DeviceError::NotConnected)?
            .send_fast(command)
    }

    /// Spawn the collector worker and begin physical acquisition
    pub fn start_data_streaming(&mut self) -> Result<(), DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let collector = self.collector.as_mut().ok_or(DeviceError::NotACollector)?;
        if collector.is_streaming() {
            return Err(DeviceError::AlreadyStreaming);
        }
        if let Some(dead) = collector.worker.take() {
            collector.driver = Some(dead.join());
        }
        let driver = collector.driver.take().ok_or(DeviceError::NotStreaming)?;
        match CollectorWorker::spawn(self.name.clone(), driver, Arc::clone(&collector.trial)) {
            Ok(worker) => {
                collector.worker = Some(worker);
                Ok(())
            }
            Err((driver, err)) => {
                collector.driver = Some(driver);
                Err(err)
            }
        }
    }

    /// End acquisition and join the collector worker
    pub fn stop_data_streaming(&mut self) -> Result<(), DeviceError> {
        let collector = self.collector.as_mut().ok_or(DeviceError::NotACollector)?;
        let worker = collector.worker.take().ok_or(DeviceError::NotStreaming)?;
        if !worker.is_streaming() {
            // The worker died on its own; reap it
            collector.driver = Some(worker.join());
            return Err(DeviceError::NotStreaming);
        }
        collector.driver = Some(worker.join());
        Ok(())
    }

    /// Begin a new trial: reset the trial clock and gate samples in
    pub fn start_recording(&mut self) -> Result<(), DeviceError> {
        let collector = self.collector.as_mut().ok_or(DeviceError::NotACollector)?;
        let worker = collector.worker.as_ref().ok_or(DeviceError::NotStreaming)?;
        if !worker.is_streaming() {
            return Err(DeviceError::NotStreaming);
        }
        if worker.is_recording() {
            return Err(DeviceError::AlreadyRecording);
        }
        collector.trial.lock().unwrap().reset();
        worker.set_recording(true);
        Ok(())
    }

    /// Stop gating samples in; the trial data stays until the next start
    pub fn stop_recording(&mut self) -> Result<(), DeviceError> {
        let collector = self.collector.as_mut().ok_or(DeviceError::NotACollector)?;
        let worker = collector.worker.as_ref().ok_or(DeviceError::NotRecording)?;
        if !worker.is_recording() {
            return Err(DeviceError::NotRecording);
        }
        worker.set_recording(false);
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Scriptable drivers shared by the registry and server tests

    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Command driver whose hooks just log their invocations
    pub struct ScriptedCommandDriver {
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_connect: Arc<AtomicBool>,
    }

    impl ScriptedCommandDriver {
        pub fn new() -> (Self, Arc<Mutex<Vec<String>>>, Arc<AtomicBool>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            let fail = Arc::new(AtomicBool::new(false));
            (
                Self {
                    log: Arc::clone(&log),
                    fail_connect: Arc::clone(&fail),
                },
                log,
                fail,
            )
        }
    }

    impl CommandDriver for ScriptedCommandDriver {
        fn connect(&mut self) -> Result<(), DeviceError> {
            if self.fail_connect.load(Ordering::Relaxed) {
                return Err(DeviceError::ConnectFailed("scripted failure".into()));
            }
            self.log.lock().unwrap().push("connect".into());
            Ok(())
        }

        fn disconnect(&mut self) {
            self.log.lock().unwrap().push("disconnect".into());
        }

        fn command(
            &mut self,
            command: &Command,
            _heartbeat: &mut Heartbeat,
        ) -> Result<Ack, DeviceError> {
            self.log.lock().unwrap().push(format!("command {command:?}"));
            Ok(Ack::Ok)
        }

        fn ping(&mut self) -> Result<(), DeviceError> {
            self.log.lock().unwrap().push("ping".into());
            Ok(())
        }

        fn keep_alive_interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
    }

    /// Collector driver producing one constant-valued row per tick
    pub struct ScriptedCollectorDriver {
        pub channels: usize,
        pub interval: Duration,
        pub value: f64,
    }

    impl CollectorDriver for ScriptedCollectorDriver {
        fn channel_count(&self) -> usize {
            self.channels
        }

        fn tick_interval(&self) -> Duration {
            self.interval
        }

        fn new_series(&self) -> TimeSeries {
            TimeSeries::fixed_rate(self.interval, None)
        }

        fn start_streaming(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn stop_streaming(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn read_frames(&mut self) -> Result<Vec<Vec<f64>>, DeviceError> {
            Ok(vec![vec![self.value; self.channels]])
        }
    }

    pub fn scripted_device(name: &str) -> (Device, Arc<Mutex<Vec<String>>>, Arc<AtomicBool>) {
        let (driver, log, fail) = ScriptedCommandDriver::new();
        (Device::new(name, Box::new(driver)), log, fail)
    }

    pub fn scripted_collector_device(name: &str, interval: Duration) -> Device {
        let (driver, _, _) = ScriptedCommandDriver::new();
        Device::with_collector(
            name,
            Box::new(driver),
            Box::new(ScriptedCollectorDriver {
                channels: 2,
                interval,
                value: 1.5,
            }),
        )
    }
}
