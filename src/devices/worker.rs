//! The command worker: one thread per device owning all command I/O

use super::{Ack, Command, CommandDriver, DeviceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Keep-alive schedule for a command worker.
///
/// The next ping is due one interval after the previous beat. Retuning the
/// interval keeps the elapsed part of the current cycle, so a device that
/// just pinged does not get pinged again early, and an overdue ping fires
/// immediately rather than waiting a whole new interval.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    interval: Duration,
    last_beat: Instant,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_beat: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Time until the next ping is due, zero if overdue
    pub fn until_next(&self) -> Duration {
        (self.last_beat + self.interval).saturating_duration_since(Instant::now())
    }

    /// Mark a ping as sent
    pub fn beat(&mut self) {
        self.last_beat = Instant::now();
    }

    /// Change the cadence, preserving the elapsed part of the current cycle
    pub fn set_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }
}

/// One queued request for the worker
enum Job {
    Command {
        command: Command,
        reply: Option<SyncSender<Result<Ack, DeviceError>>>,
    },
    Disconnect,
}

/// Handle to a running command worker. The worker serializes commands and
/// keep-alive pings on one thread; replies come back on per-call one-shot
/// channels so concurrent senders never see each other's results.
pub struct CommandWorker {
    jobs: mpsc::Sender<Job>,
    handle: JoinHandle<Box<dyn CommandDriver>>,
    connected: Arc<AtomicBool>,
}

impl CommandWorker {
    /// Spawn the worker and run the driver's connect hook on it. On failure
    /// the driver is handed back so the device can retry later.
    #[allow(clippy::type_complexity)]
    pub fn spawn(
        name: String,
        mut driver: Box<dyn CommandDriver>,
    ) -> Result<Self, (Box<dyn CommandDriver>, DeviceError)> {
        let (jobs, queue) = mpsc::channel::<Job>();
        let (startup_tx, startup_rx) = mpsc::sync_channel::<Result<(), DeviceError>>(1);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_in_worker = Arc::clone(&connected);

        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{name}-cmd"))
            .spawn(move || {
                match driver.connect() {
                    Ok(()) => {
                        connected_in_worker.store(true, Ordering::Release);
                        let _ = startup_tx.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = startup_tx.send(Err(e));
                        return driver;
                    }
                }
                run(&thread_name, driver.as_mut(), &queue);
                connected_in_worker.store(false, Ordering::Release);
                driver.disconnect();
                drain(&queue);
                driver
            })
            .expect("could not spawn the command worker");

        // Wait for the connect hook before returning to the caller
        match startup_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                jobs,
                handle,
                connected,
            }),
            Ok(Err(e)) => {
                let driver = handle.join().expect("command worker panicked");
                Err((driver, e))
            }
            Err(_) => {
                let driver = handle.join().expect("command worker panicked");
                Err((driver, DeviceError::ConnectFailed("worker exited".into())))
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a command and wait for the worker's reply
    pub fn send(&self, command: Command) -> Result<Ack, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.jobs
            .send(Job::Command {
                command,
                reply: Some(reply_tx),
            })
            .map_err(|_| DeviceError::NotConnected)?;
        reply_rx.recv().map_err(|_| DeviceError::NotConnected)?
    }

    /// Queue a command without a reply channel
    pub fn send_fast(&self, command: Command) -> Result<Ack, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.jobs
            .send(Job::Command {
                command,
                reply: None,
            })
            .map_err(|_| DeviceError::NotConnected)?;
        Ok(Ack::Ok)
    }

    /// Stop the worker, join it and recover the driver
    pub fn shutdown(self) -> Box<dyn CommandDriver> {
        let _ = self.jobs.send(Job::Disconnect);
        self.handle.join().expect("command worker panicked")
    }
}

/// The worker loop: serialize queued commands with the keep-alive ping
fn run(name: &str, driver: &mut dyn CommandDriver, queue: &Receiver<Job>) {
    let mut heartbeat = Heartbeat::new(driver.keep_alive_interval());
    info!(device = name, "Device connected");
    loop {
        match queue.recv_timeout(heartbeat.until_next()) {
            Ok(Job::Command { command, reply }) => {
                let result = driver.command(&command, &mut heartbeat);
                let fatal = matches!(
                    result,
                    Err(DeviceError::TransportClosed) | Err(DeviceError::ConnectFailed(_))
                );
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
                if fatal {
                    warn!(device = name, "Transport failure, disconnecting");
                    break;
                }
            }
            Ok(Job::Disconnect) => {
                debug!(device = name, "Worker stopping");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = driver.ping() {
                    warn!(device = name, "Keep-alive failed, disconnecting - {e}");
                    break;
                }
                heartbeat.beat();
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Answer anything still queued after the transport died
fn drain(queue: &Receiver<Job>) {
    while let Ok(job) = queue.try_recv() {
        if let Job::Command {
            reply: Some(reply), ..
        } = job
        {
            let _ = reply.send(Err(DeviceError::NotConnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_is_due_after_interval() {
        let hb = Heartbeat::new(Duration::from_millis(50));
        assert!(hb.until_next() <= Duration::from_millis(50));
        assert!(hb.until_next() > Duration::from_millis(30));
    }

    #[test]
    fn retuning_preserves_elapsed_time() {
        let mut hb = Heartbeat::new(Duration::from_millis(100));
        std::thread::sleep(Duration::from_millis(20));
        hb.set_interval(Duration::from_millis(40));
        // ~20 of the 40 ms are already elapsed
        let next = hb.until_next();
        assert!(next <= Duration::from_millis(25), "next was {next:?}");
    }

    #[test]
    fn overdue_ping_fires_immediately() {
        let mut hb = Heartbeat::new(Duration::from_millis(200));
        std::thread::sleep(Duration::from_millis(30));
        hb.set_interval(Duration::from_millis(10));
        assert_eq!(hb.until_next(), Duration::ZERO);
        hb.beat();
        assert!(hb.until_next() > Duration::ZERO);
    }

    struct PingCounter {
        pings: Arc<AtomicUsize>,
        interval: Duration,
    }

    use std::sync::atomic::AtomicUsize;

    impl CommandDriver for PingCounter {
        fn connect(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn command(
            &mut self,
            _command: &Command,
            _heartbeat: &mut Heartbeat,
        ) -> Result<Ack, DeviceError> {
            Ok(Ack::Ok)
        }

        fn ping(&mut self) -> Result<(), DeviceError> {
            self.pings.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn keep_alive_interval(&self) -> Duration {
            self.interval
        }
    }

    #[test]
    fn pings_fire_at_the_keep_alive_cadence() {
        let pings = Arc::new(AtomicUsize::new(0));
        let worker = CommandWorker::spawn(
            "ping-counter".into(),
            Box::new(PingCounter {
                pings: Arc::clone(&pings),
                interval: Duration::from_millis(20),
            }),
        )
        .unwrap_or_else(|_| panic!("spawn failed"));
        std::thread::sleep(Duration::from_millis(110));
        let seen = pings.load(Ordering::Relaxed);
        assert!((3..=7).contains(&seen), "saw {seen} pings");
        worker.shutdown();
    }

    struct FailingDriver;

    impl CommandDriver for FailingDriver {
        fn connect(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn disconnect(&mut self) {}

        fn command(
            &mut self,
            _command: &Command,
            _heartbeat: &mut Heartbeat,
        ) -> Result<Ack, DeviceError> {
            Err(DeviceError::TransportClosed)
        }

        fn keep_alive_interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
    }

    #[test]
    fn transport_failure_kills_the_worker() {
        let worker = CommandWorker::spawn("failing".into(), Box::new(FailingDriver))
            .unwrap_or_else(|_| panic!("spawn failed"));
        assert_eq!(worker.send(Command::Poke), Err(DeviceError::TransportClosed));
        // The worker shut itself down; later sends see a dead device
        std::thread::sleep(Duration::from_millis(20));
        assert!(!worker.is_connected());
        assert_eq!(worker.send(Command::Poke), Err(DeviceError::NotConnected));
        worker.shutdown();
    }
}
