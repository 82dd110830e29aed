//! Delsys Trigno base-station drivers (EMG and analog)
//!
//! A Trigno base station exposes one ASCII command socket and one raw data
//! socket per stream. The command socket is shared when both the EMG and the
//! analog stream of the same station are in use; the data sockets deliver
//! frames of little-endian f32 samples at a fixed rate.

use super::link::{Link, TcpLink};
use super::worker::Heartbeat;
use super::{Ack, Command, CollectorDriver, CommandDriver, Device, DeviceError};
use crate::timeseries::TimeSeries;
use byte_slice_cast::AsMutByteSlice;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Trigno digital command port
pub const COMMAND_PORT: u16 = 50040;
/// EMG data stream port
pub const EMG_DATA_PORT: u16 = 50043;
/// Auxiliary analog data stream port
pub const ANALOG_DATA_PORT: u16 = 50044;

/// EMG channels per frame row
pub const EMG_CHANNELS: usize = 16;
/// Analog channels per frame row
pub const ANALOG_CHANNELS: usize = 48;
/// Sample rows per EMG frame, as observed on the wire
pub const EMG_SAMPLES_PER_FRAME: usize = 27;
/// Sample rows per analog frame
pub const ANALOG_SAMPLES_PER_FRAME: usize = 1;
/// EMG sample period (2 kHz)
pub const EMG_DELTA: Duration = Duration::from_micros(500);
/// Analog sample period (~148 Hz)
pub const ANALOG_DELTA: Duration = Duration::from_micros(6757);

const BYTES_PER_CHANNEL: usize = 4;
const TERMINATOR: &str = "\r\n\r\n";
const RESPONSE_BUFFER: usize = 128;
/// Commands answer within one keep-alive period; no explicit ping is needed
const KEEP_ALIVE: Duration = Duration::from_millis(100);
/// Bigger kernel buffer for the 2 kHz stream
const DATA_RECV_BUFFER: usize = 4 * 1024 * 1024;

/// Retained trial window per stream, sized for a couple of minutes
const EMG_TRIAL_CAPACITY: usize = 1 << 18;
const ANALOG_TRIAL_CAPACITY: usize = 1 << 15;

fn token(command: &Command) -> Option<&'static str> {
    match command {
        Command::Start => Some("START"),
        Command::Stop => Some("STOP"),
        Command::BackwardsCompatibility => Some("BACKWARDS COMPATIBILITY ON"),
        Command::Upsample => Some("UPSAMPLE ON"),
        _ => None,
    }
}

/// The ASCII command socket of one base station, shared by every stream
/// addressing that station. Opened on first use, closed when the last user
/// disconnects; `last_command` dedups repeated START/STOP from two streams.
pub struct CommandChannel {
    link: Box<dyn Link>,
    last_command: Option<Command>,
    open_count: usize,
}

/// Handle to a [`CommandChannel`], cloned into every driver bound to the
/// same base station
pub type SharedCommands = Arc<Mutex<CommandChannel>>;

impl CommandChannel {
    pub fn over(link: Box<dyn Link>) -> SharedCommands {
        Arc::new(Mutex::new(Self {
            link,
            last_command: None,
            open_count: 0,
        }))
    }

    /// Connect on first open and consume the station banner
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.open_count == 0 {
            self.link.connect()?;
            self.consume_banner()?;
            self.last_command = None;
        }
        self.open_count += 1;
        Ok(())
    }

    /// Drop one share; the socket closes when the last share goes
    fn close(&mut self) {
        if self.open_count > 0 {
            self.open_count -= 1;
            if self.open_count == 0 {
                self.link.disconnect();
                self.last_command = None;
            }
        }
    }

    /// The station greets with an ASCII banner terminated by a blank line
    fn consume_banner(&mut self) -> Result<(), DeviceError> {
        let mut banner = Vec::new();
        let mut buf = [0u8; RESPONSE_BUFFER];
        loop {
            let n = self.link.read_some(&mut buf)?;
            banner.extend_from_slice(&buf[..n]);
            if banner.windows(TERMINATOR.len()).any(|w| w == TERMINATOR.as_bytes()) {
                break;
            }
        }
        debug!("Consumed station banner ({} bytes)", banner.len());
        Ok(())
    }

    /// Send one ASCII command and check for the `OK` reply. Repeating the
    /// previous command is a wire-level no-op.
    fn send(&mut self, command: &Command) -> Result<Ack, DeviceError> {
        let token = token(command).ok_or(DeviceError::UnknownCommand)?;
        if self.last_command.as_ref() == Some(command) {
            return Ok(Ack::Ok);
        }
        self.link
            .write_all(format!("{token}{TERMINATOR}").as_bytes())?;
        self.last_command = Some(command.clone());
        if matches!(command, Command::Stop) {
            // The station stops answering once told to stop; reading here
            // can block forever
            return Ok(Ack::Ok);
        }
        let mut buf = [0u8; RESPONSE_BUFFER];
        let n = self.link.read_some(&mut buf)?;
        if buf[..n].starts_with(b"OK") {
            Ok(Ack::Ok)
        } else {
            Err(DeviceError::TransportClosed)
        }
    }
}

/// One stream variant of the base station
#[derive(Debug, Clone, Copy)]
struct Variant {
    channels: usize,
    samples_per_frame: usize,
    delta: Duration,
    trial_capacity: usize,
}

/// Command half: owns the shared command channel plus the (shared) data link
/// so connect can bring both sockets up together
struct DelsysCommandDriver {
    commands: SharedCommands,
    data: Arc<Mutex<Box<dyn Link>>>,
}

impl CommandDriver for DelsysCommandDriver {
    fn connect(&mut self) -> Result<(), DeviceError> {
        let mut commands = self.commands.lock().unwrap();
        commands.open()?;
        if let Err(e) = self.data.lock().unwrap().connect() {
            commands.close();
            return Err(e);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        self.data.lock().unwrap().disconnect();
        self.commands.lock().unwrap().close();
    }

    fn command(
        &mut self,
        command: &Command,
        _heartbeat: &mut Heartbeat,
    ) -> Result<Ack, DeviceError> {
        self.commands.lock().unwrap().send(command)
    }

    fn keep_alive_interval(&self) -> Duration {
        KEEP_ALIVE
    }
}

/// Data half: reads raw frames from the data socket, gated by START/STOP on
/// the shared command channel
struct DelsysCollectorDriver {
    commands: SharedCommands,
    data: Arc<Mutex<Box<dyn Link>>>,
    variant: Variant,
    /// Scratch frame; f32 storage viewed as bytes for the wire read
    frame: Vec<f32>,
}

impl DelsysCollectorDriver {
    fn new(commands: SharedCommands, data: Arc<Mutex<Box<dyn Link>>>, variant: Variant) -> Self {
        Self {
            commands,
            data,
            frame: vec![0f32; variant.channels * variant.samples_per_frame],
            variant,
        }
    }

    /// Read exactly one frame off the data socket into the scratch buffer.
    /// The stream is little-endian f32, as are all supported hosts.
    fn read_frame(&mut self) -> Result<(), DeviceError> {
        debug_assert_eq!(
            self.frame.len() * BYTES_PER_CHANNEL,
            self.variant.channels * self.variant.samples_per_frame * BYTES_PER_CHANNEL
        );
        self.data
            .lock()
            .unwrap()
            .read_exact(self.frame.as_mut_byte_slice())
    }
}

impl CollectorDriver for DelsysCollectorDriver {
    fn channel_count(&self) -> usize {
        self.variant.channels
    }

    fn tick_interval(&self) -> Duration {
        // The blocking frame read paces the loop; tick as fast as possible
        Duration::from_micros(1)
    }

    fn ignore_slow_ticks(&self) -> bool {
        true
    }

    fn new_series(&self) -> TimeSeries {
        TimeSeries::fixed_rate(self.variant.delta, Some(self.variant.trial_capacity))
    }

    fn start_streaming(&mut self) -> Result<(), DeviceError> {
        self.commands.lock().unwrap().send(&Command::Start)?;
        // Readiness barrier: the first frame after START marks the stream live
        self.read_frame()
    }

    fn stop_streaming(&mut self) -> Result<(), DeviceError> {
        self.commands.lock().unwrap().send(&Command::Stop)?;
        Ok(())
    }

    fn read_frames(&mut self) -> Result<Vec<Vec<f64>>, DeviceError> {
        self.read_frame()?;
        let channels = self.variant.channels;
        // An all-zero leading row means the station has not started producing
        // yet; skip the whole frame so trial time does not advance
        if self.frame[..channels].iter().all(|&v| v == 0.0) {
            return Ok(Vec::new());
        }
        Ok(self
            .frame
            .chunks_exact(channels)
            .map(|row| row.iter().map(|&v| f64::from(v)).collect())
            .collect())
    }
}

fn build_device(
    name: &'static str,
    commands: SharedCommands,
    data: Box<dyn Link>,
    variant: Variant,
) -> Device {
    let data = Arc::new(Mutex::new(data));
    Device::with_collector(
        name,
        Box::new(DelsysCommandDriver {
            commands: Arc::clone(&commands),
            data: Arc::clone(&data),
        }),
        Box::new(DelsysCollectorDriver::new(commands, data, variant)),
    )
}

/// One Trigno base station. Streams built from the same handle share its
/// command channel; the channel closes when the last stream disconnects.
pub struct Trigno {
    host: String,
    commands: SharedCommands,
}

impl Trigno {
    pub fn new(host: impl Into<String>) -> Self {
        let host = host.into();
        let commands = CommandChannel::over(Box::new(TcpLink::new(host.clone(), COMMAND_PORT)));
        Self { host, commands }
    }

    /// The 16-channel EMG stream at 2 kHz
    pub fn emg(&self) -> Device {
        self.emg_with_frame(EMG_SAMPLES_PER_FRAME)
    }

    /// EMG stream with an explicit frame size, for stations whose firmware
    /// batches a different number of rows
    pub fn emg_with_frame(&self, samples_per_frame: usize) -> Device {
        build_device(
            "delsys_emg",
            Arc::clone(&self.commands),
            Box::new(TcpLink::new(self.host.clone(), EMG_DATA_PORT).with_recv_buffer(DATA_RECV_BUFFER)),
            Variant {
                channels: EMG_CHANNELS,
                samples_per_frame,
                delta: EMG_DELTA,
                trial_capacity: EMG_TRIAL_CAPACITY,
            },
        )
    }

    /// The 48-channel auxiliary analog stream at ~148 Hz
    pub fn analog(&self) -> Device {
        build_device(
            "delsys_analog",
            Arc::clone(&self.commands),
            Box::new(TcpLink::new(self.host.clone(), ANALOG_DATA_PORT)),
            Variant {
                channels: ANALOG_CHANNELS,
                samples_per_frame: ANALOG_SAMPLES_PER_FRAME,
                delta: ANALOG_DELTA,
                trial_capacity: ANALOG_TRIAL_CAPACITY,
            },
        )
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use std::time::Instant;

    #[test]
    fn emg_burst_records_sine() {
        let (commands, command_link) = mock_commands();
        let mut dev = mock_emg(commands, SineDataLink::new(2000.0));
        dev.connect().unwrap();
        dev.start_data_streaming().unwrap();
        dev.start_recording().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        dev.stop_recording().unwrap();

        let trial = dev.trial_data().unwrap();
        let trial = trial.lock().unwrap();
        // 100 ms at 2 kHz, give or take a frame on either side
        assert!(
            (150..=220).contains(&trial.len()),
            "trial held {} samples",
            trial.len()
        );
        // The recording gate resets the trial clock, but the mock stream
        // started at START; realign by the first recorded value before
        // checking the waveform
        let first = trial.get(0).unwrap().channels[0].asin();
        let offset = (first * 2000.0 / (2.0 * std::f64::consts::PI)).round();
        for (k, sample) in trial.iter().enumerate().take(40) {
            let expected =
                (2.0 * std::f64::consts::PI * (offset + k as f64) / 2000.0).sin();
            assert!(
                (sample.channels[0] - expected).abs() < 1e-6,
                "sample {k}: {} vs {expected}",
                sample.channels[0]
            );
            assert_eq!(sample.t_rel, EMG_DELTA * k as u32);
            assert_eq!(sample.channels.len(), EMG_CHANNELS);
        }
        drop(trial);
        dev.disconnect();

        let log = command_link.0.lock().unwrap();
        assert_eq!(log.commands_seen, vec!["START".to_string(), "STOP".to_string()]);
    }

    #[test]
    fn zero_frames_after_start_are_skipped() {
        let (commands, _) = mock_commands();
        let mut data = SineDataLink::new(2000.0);
        // One barrier frame plus two all-zero frames before real data
        data.zero_frames = 3;
        let mut dev = mock_emg(commands, data);
        dev.connect().unwrap();
        dev.start_data_streaming().unwrap();
        dev.start_recording().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if dev.trial_data().unwrap().lock().unwrap().len() >= EMG_SAMPLES_PER_FRAME {
                break;
            }
            assert!(Instant::now() < deadline, "no non-zero data recorded");
            std::thread::sleep(Duration::from_millis(5));
        }
        let trial = dev.trial_data().unwrap();
        let trial = trial.lock().unwrap();
        // The first retained sample is the first non-zero one, at t_rel 0
        assert_eq!(trial.get(0).unwrap().t_rel, Duration::ZERO);
        assert!(trial.get(1).unwrap().channels[0] != 0.0);
        drop(trial);
        dev.disconnect();
    }

    #[test]
    fn shared_channel_dedups_and_closes_last() {
        let (commands, command_link) = mock_commands();
        let mut emg = mock_emg(Arc::clone(&commands), SineDataLink::new(2000.0));
        let mut second = mock_emg(Arc::clone(&commands), SineDataLink::new(2000.0));

        emg.connect().unwrap();
        second.connect().unwrap();
        // One physical connect for the two streams
        assert_eq!(command_link.0.lock().unwrap().connects, 1);

        emg.start_data_streaming().unwrap();
        second.start_data_streaming().unwrap();
        // The second START was suppressed by last_command
        assert_eq!(
            command_link.0.lock().unwrap().commands_seen,
            vec!["START".to_string()]
        );

        emg.disconnect();
        assert_eq!(command_link.0.lock().unwrap().disconnects, 0);
        second.disconnect();
        // Last one out closes the socket
        assert_eq!(command_link.0.lock().unwrap().disconnects, 1);
    }

    #[test]
    fn command_tokens() {
        assert_eq!(token(&Command::Start), Some("START"));
        assert_eq!(token(&Command::Stop), Some("STOP"));
        assert_eq!(
            token(&Command::BackwardsCompatibility),
            Some("BACKWARDS COMPATIBILITY ON")
        );
        assert_eq!(token(&Command::Upsample), Some("UPSAMPLE ON"));
        assert_eq!(token(&Command::Arm), None);
    }

    #[test]
    fn foreign_commands_are_rejected() {
        let (commands, _) = mock_commands();
        let mut dev = mock_emg(commands, SineDataLink::new(2000.0));
        dev.connect().unwrap();
        assert_eq!(dev.send(Command::Arm), Err(DeviceError::UnknownCommand));
        dev.disconnect();
    }
}
