//! The data-collector worker: periodic data checks feeding the trial series

use super::{CollectorDriver, DeviceError};
use crate::timeseries::TimeSeries;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Minimum spacing between too-slow-tick warnings
const SLOW_TICK_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a running collector worker.
///
/// The worker calls the driver's data hook at a fixed cadence and appends
/// the rows it returns to the shared trial series, but only while the
/// recording gate is open. Streaming is the physical acquisition; recording
/// is the logical "keep these samples" flag on top of it.
pub struct CollectorWorker {
    stop: Arc<AtomicBool>,
    streaming: Arc<AtomicBool>,
    recording: Arc<AtomicBool>,
    handle: JoinHandle<Box<dyn CollectorDriver>>,
}

impl CollectorWorker {
    /// Spawn the worker; the driver's start-streaming hook runs on it before
    /// the first tick and its failure is reported here.
    #[allow(clippy::type_complexity)]
    pub fn spawn(
        name: String,
        mut driver: Box<dyn CollectorDriver>,
        trial: Arc<Mutex<TimeSeries>>,
    ) -> Result<Self, (Box<dyn CollectorDriver>, DeviceError)> {
        let stop = Arc::new(AtomicBool::new(false));
        let streaming = Arc::new(AtomicBool::new(false));
        let recording = Arc::new(AtomicBool::new(false));
        let (startup_tx, startup_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);

        let worker_stop = Arc::clone(&stop);
        let worker_streaming = Arc::clone(&streaming);
        let worker_recording = Arc::clone(&recording);
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-data"))
            .spawn(move || {
                match driver.start_streaming() {
                    Ok(()) => {
                        worker_streaming.store(true, Ordering::Release);
                        let _ = startup_tx.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = startup_tx.send(Err(e));
                        return driver;
                    }
                }
                run(
                    &thread_name,
                    driver.as_mut(),
                    &trial,
                    &worker_stop,
                    &worker_recording,
                );
                worker_streaming.store(false, Ordering::Release);
                worker_recording.store(false, Ordering::Release);
                if let Err(e) = driver.stop_streaming() {
                    warn!(device = %thread_name, "Error while stopping the stream - {e}");
                }
                driver
            })
            .expect("could not spawn the collector worker");

        match startup_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                streaming,
                recording,
                handle,
            }),
            Ok(Err(e)) => {
                let driver = handle.join().expect("collector worker panicked");
                Err((driver, e))
            }
            Err(_) => {
                let driver = handle.join().expect("collector worker panicked");
                Err((driver, DeviceError::ConnectFailed("worker exited".into())))
            }
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    pub fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Release);
    }

    /// Stop ticking, run the stop-streaming hook, recover the driver
    pub fn join(self) -> Box<dyn CollectorDriver> {
        self.stop.store(true, Ordering::Release);
        self.handle.join().expect("collector worker panicked")
    }
}

/// The tick loop. A tick that overruns its interval reschedules immediately
/// instead of accumulating drift, and is reported at most once per second
/// unless the driver opted out of the warning.
fn run(
    name: &str,
    driver: &mut dyn CollectorDriver,
    trial: &Mutex<TimeSeries>,
    stop: &AtomicBool,
    recording: &AtomicBool,
) {
    let interval = driver.tick_interval();
    let ignore_slow = driver.ignore_slow_ticks();
    info!(device = name, "Data streaming started");
    let mut next_tick = Instant::now() + interval;
    let mut last_slow_warn: Option<Instant> = None;
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        if now < next_tick {
            std::thread::sleep(next_tick - now);
        }
        match driver.read_frames() {
            Ok(rows) => {
                if recording.load(Ordering::Acquire) && !rows.is_empty() {
                    let mut trial = trial.lock().unwrap();
                    for row in rows {
                        trial.push(row);
                    }
                }
            }
            Err(e) => {
                warn!(device = name, "Data check failed, stopping the stream - {e}");
                break;
            }
        }
        next_tick += interval;
        let now = Instant::now();
        if now > next_tick {
            next_tick = now;
            if !ignore_slow
                && last_slow_warn.is_none_or(|t| t.elapsed() >= SLOW_TICK_WARN_INTERVAL)
            {
                warn!(
                    device = name,
                    "Data check is slower than its interval ({interval:?})"
                );
                last_slow_warn = Some(now);
            }
        }
    }
    info!(device = name, "Data streaming stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingDriver {
        ticks: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        fail_start: bool,
    }

    impl CollectorDriver for CountingDriver {
        fn channel_count(&self) -> usize {
            1
        }

        fn tick_interval(&self) -> Duration {
            Duration::from_millis(1)
        }

        fn new_series(&self) -> TimeSeries {
            TimeSeries::fixed_rate(Duration::from_millis(1), None)
        }

        fn start_streaming(&mut self) -> Result<(), DeviceError> {
            if self.fail_start {
                return Err(DeviceError::ConnectFailed("no stream".into()));
            }
            Ok(())
        }

        fn stop_streaming(&mut self) -> Result<(), DeviceError> {
            self.stops.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn read_frames(&mut self) -> Result<Vec<Vec<f64>>, DeviceError> {
            self.ticks.fetch_add(1, Ordering::Relaxed);
            Ok(vec![vec![0.25]])
        }
    }

    #[test]
    fn start_failure_reports_and_returns_the_driver() {
        let trial = Arc::new(Mutex::new(TimeSeries::new(None)));
        let result = CollectorWorker::spawn(
            "counting".into(),
            Box::new(CountingDriver {
                ticks: Arc::new(AtomicUsize::new(0)),
                stops: Arc::new(AtomicUsize::new(0)),
                fail_start: true,
            }),
            trial,
        );
        assert!(matches!(result, Err((_, DeviceError::ConnectFailed(_)))));
    }

    #[test]
    fn ticks_only_record_when_gated() {
        let trial = Arc::new(Mutex::new(TimeSeries::fixed_rate(
            Duration::from_millis(1),
            None,
        )));
        let ticks = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let worker = CollectorWorker::spawn(
            "counting".into(),
            Box::new(CountingDriver {
                ticks: Arc::clone(&ticks),
                stops: Arc::clone(&stops),
                fail_start: false,
            }),
            Arc::clone(&trial),
        )
        .unwrap_or_else(|_| panic!("spawn failed"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(ticks.load(Ordering::Relaxed) > 0);
        assert!(trial.lock().unwrap().is_empty());
        worker.set_recording(true);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!trial.lock().unwrap().is_empty());
        let driver = worker.join();
        assert_eq!(stops.load(Ordering::Relaxed), 1);
        drop(driver);
    }
}
