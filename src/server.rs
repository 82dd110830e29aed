//! Three-socket control server driving the device registry
//!
//! A single remote client opens three TCP connections: commands in, command
//! acknowledgments (and payloads) out, and a periodic live-data push out. The
//! first command on a fresh session must be the handshake carrying the
//! server's protocol version; anything else disconnects the client and the
//! server goes back to accepting. A client error never takes the server down.

use crate::devices::delsys::Trigno;
use crate::devices::magstim;
use crate::devices::registry::Registry;
use crate::devices::{Device, DeviceError};
use crate::wire::{AckCode, ClientCommand, Packet, PACKET_LEN};
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const DEFAULT_COMMAND_PORT: u16 = 5000;
pub const DEFAULT_RESPONSE_PORT: u16 = 5001;
pub const DEFAULT_LIVE_DATA_PORT: u16 = 5002;
/// Missing sockets or a missing handshake past this kill the session
pub const DEFAULT_TIMEOUT_PERIOD: Duration = Duration::from_secs(5);
/// Cadence of the live-data push
pub const DEFAULT_LIVE_DATA_INTERVAL: Duration = Duration::from_millis(100);

/// Accept/shutdown poll cadence
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Command-read poll; bounds how long stop_server can take
const COMMAND_READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub command_port: u16,
    pub response_port: u16,
    pub live_data_port: u16,
    pub timeout_period: Duration,
    pub live_data_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command_port: DEFAULT_COMMAND_PORT,
            response_port: DEFAULT_RESPONSE_PORT,
            live_data_port: DEFAULT_LIVE_DATA_PORT,
            timeout_period: DEFAULT_TIMEOUT_PERIOD,
            live_data_interval: DEFAULT_LIVE_DATA_INTERVAL,
        }
    }
}

/// The devices the command set can bring up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    DelsysAnalog,
    DelsysEmg,
    Magstim,
}

impl DeviceKind {
    fn device_name(self) -> &'static str {
        match self {
            Self::DelsysAnalog => "delsys_analog",
            Self::DelsysEmg => "delsys_emg",
            Self::Magstim => "magstim",
        }
    }
}

/// Builds a device on demand; swapped out for scripted devices in tests
pub type DeviceFactory = Arc<dyn Fn(DeviceKind) -> Result<Device, DeviceError> + Send + Sync>;

/// Factory over the real hardware addresses
pub fn hardware_factory(delsys_host: String, magstim_port: Option<String>) -> DeviceFactory {
    let trigno = Trigno::new(delsys_host);
    Arc::new(move |kind| match kind {
        DeviceKind::DelsysEmg => Ok(trigno.emg()),
        DeviceKind::DelsysAnalog => Ok(trigno.analog()),
        DeviceKind::Magstim => match &magstim_port {
            Some(path) => Ok(magstim::rapid(path.clone())),
            None => magstim::rapid_auto(),
        },
    })
}

/// State shared between the accept worker, the live-data worker and the
/// server handle
struct Shared {
    running: AtomicBool,
    client_connected: AtomicBool,
    registry: Mutex<Registry>,
    live_socket: Mutex<Option<TcpStream>>,
}

/// The three bound port numbers, useful when the config asked for port 0
#[derive(Debug, Clone, Copy)]
pub struct BoundPorts {
    pub command: u16,
    pub response: u16,
    pub live_data: u16,
}

pub struct ControlServer {
    config: ServerConfig,
    factory: DeviceFactory,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    ports: Option<BoundPorts>,
}

impl ControlServer {
    pub fn new(config: ServerConfig, factory: DeviceFactory) -> Self {
        Self {
            config,
            factory,
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                client_connected: AtomicBool::new(false),
                registry: Mutex::new(Registry::new()),
                live_socket: Mutex::new(None),
            }),
            workers: Vec::new(),
            ports: None,
        }
    }

    /// Bind the three acceptors and spawn the accept and live-data workers.
    /// Non-blocking; the server runs until [`ControlServer::stop`].
    pub fn start(&mut self) -> io::Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let command = bind(self.config.command_port)?;
        let response = bind(self.config.response_port)?;
        let live_data = bind(self.config.live_data_port)?;
        let ports = BoundPorts {
            command: command.local_addr()?.port(),
            response: response.local_addr()?.port(),
            live_data: live_data.local_addr()?.port(),
        };
        self.ports = Some(ports);
        info!(
            "Server started on ports {}/{}/{}",
            ports.command, ports.response, ports.live_data
        );

        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);
        let config = self.config.clone();
        self.workers.push(
            std::thread::Builder::new()
                .name("server-accept".into())
                .spawn(move || serve(&shared, &config, &factory, command, response, live_data))
                .expect("could not spawn the accept worker"),
        );

        let shared = Arc::clone(&self.shared);
        let interval = self.config.live_data_interval;
        self.workers.push(
            std::thread::Builder::new()
                .name("server-live".into())
                .spawn(move || live_data_loop(&shared, interval))
                .expect("could not spawn the live-data worker"),
        );
        Ok(())
    }

    /// The ports actually bound, available after [`ControlServer::start`]
    pub fn ports(&self) -> Option<BoundPorts> {
        self.ports
    }

    pub fn is_client_connected(&self) -> bool {
        self.shared.client_connected.load(Ordering::Acquire)
    }

    /// Stop accepting, drop any client (disconnecting every device) and join
    /// the workers. Safe to call any number of times.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// One connected client session
struct Session {
    command: TcpStream,
    response: TcpStream,
}

/// The accept worker: wait for the three sockets, handshake, then relay
/// commands until the client goes away; repeat until the server stops
fn serve(
    shared: &Shared,
    config: &ServerConfig,
    factory: &DeviceFactory,
    command: TcpListener,
    response: TcpListener,
    live_data: TcpListener,
) {
    while shared.running.load(Ordering::Acquire) {
        let Some(mut session) = accept_session(shared, config, &command, &response, &live_data)
        else {
            continue;
        };
        if !handshake(config, &mut session) {
            disconnect_client(shared);
            continue;
        }
        shared.client_connected.store(true, Ordering::Release);
        info!("Handshake from client is valid");
        command_loop(shared, factory, &mut session);
        disconnect_client(shared);
    }
    disconnect_client(shared);
    info!("Server has shut down");
}

/// Accept one socket, polling the shutdown flag; `deadline` bounds the wait
fn poll_accept(
    what: &str,
    listener: &TcpListener,
    shared: &Shared,
    deadline: Option<Instant>,
) -> Option<TcpStream> {
    loop {
        if !shared.running.load(Ordering::Acquire) {
            return None;
        }
        if let Some(deadline) = deadline {
            if Instant::now() > deadline {
                warn!("Timed out waiting for the client's {what} socket");
                return None;
            }
        }
        match listener.accept() {
            Ok((socket, peer)) => {
                info!("Client {what} socket connected from {peer}");
                if socket.set_nonblocking(false).is_err() {
                    return None;
                }
                return Some(socket);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                error!("Accept failed on the {what} socket - {e}");
                return None;
            }
        }
    }
}

/// All three sockets must arrive within one timeout period of the first
fn accept_session(
    shared: &Shared,
    config: &ServerConfig,
    command: &TcpListener,
    response: &TcpListener,
    live_data: &TcpListener,
) -> Option<Session> {
    let command = poll_accept("command", command, shared, None)?;
    let deadline = Instant::now() + config.timeout_period;
    let response = poll_accept("response", response, shared, Some(deadline))?;
    let live = poll_accept("live-data", live_data, shared, Some(deadline))?;
    if live.set_nonblocking(true).is_err() {
        return None;
    }
    *shared.live_socket.lock().unwrap() = Some(live);
    Some(Session { command, response })
}

/// The first packet must be a version-matched handshake; the verdict goes
/// out on the response socket
fn handshake(config: &ServerConfig, session: &mut Session) -> bool {
    if session
        .command
        .set_read_timeout(Some(config.timeout_period))
        .is_err()
    {
        return false;
    }
    let packet = match Packet::read_from(&mut session.command) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("No handshake from client - {e}");
            return false;
        }
    };
    match packet.parse_command() {
        Ok(ClientCommand::Handshake) => send_ack(&mut session.response, AckCode::Ok),
        Ok(other) => {
            warn!("Invalid first command from client: {other:?}");
            let _ = send_ack(&mut session.response, AckCode::Nok);
            false
        }
        Err(e) => {
            warn!("Invalid handshake from client - {e}");
            let _ = send_ack(&mut session.response, AckCode::Nok);
            false
        }
    }
}

fn send_ack(response: &mut TcpStream, ack: AckCode) -> bool {
    if let Err(e) = Packet::ack(ack).write_to(response) {
        warn!("Could not acknowledge on the response socket - {e}");
        return false;
    }
    true
}

/// Read one packet, distinguishing "nothing yet" from "client gone"
fn try_read_packet(command: &mut TcpStream) -> io::Result<Option<Packet>> {
    let mut buf = [0u8; PACKET_LEN];
    match command.read_exact(&mut buf) {
        Ok(()) => Ok(Some(Packet::from_bytes(buf))),
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
        {
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Relay commands until the client disconnects or the server stops
fn command_loop(shared: &Shared, factory: &DeviceFactory, session: &mut Session) {
    if session
        .command
        .set_read_timeout(Some(COMMAND_READ_TIMEOUT))
        .is_err()
    {
        return;
    }
    while shared.running.load(Ordering::Acquire) {
        let packet = match try_read_packet(&mut session.command) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(e) => {
                info!("Client command socket closed - {e}");
                return;
            }
        };
        let command = match packet.parse_command() {
            Ok(command) => command,
            Err(e) => {
                warn!("Bad command packet - {e}");
                if !send_ack(&mut session.response, AckCode::Nok) {
                    return;
                }
                continue;
            }
        };
        if !handle_command(shared, factory, session, command) {
            return;
        }
    }
}

/// Execute one command and acknowledge it; false ends the session
fn handle_command(
    shared: &Shared,
    factory: &DeviceFactory,
    session: &mut Session,
    command: ClientCommand,
) -> bool {
    let result: Result<(), String> = match command {
        ClientCommand::ConnectDelsysAnalog => add_device(shared, factory, DeviceKind::DelsysAnalog),
        ClientCommand::ConnectDelsysEmg => add_device(shared, factory, DeviceKind::DelsysEmg),
        ClientCommand::ConnectMagstim => add_device(shared, factory, DeviceKind::Magstim),
        ClientCommand::DisconnectDelsysAnalog => {
            remove_device(shared, DeviceKind::DelsysAnalog)
        }
        ClientCommand::DisconnectDelsysEmg => remove_device(shared, DeviceKind::DelsysEmg),
        ClientCommand::DisconnectMagstim => remove_device(shared, DeviceKind::Magstim),
        ClientCommand::StartRecording => shared
            .registry
            .lock()
            .unwrap()
            .start_recording_all()
            .map_err(|e| e.to_string()),
        ClientCommand::StopRecording => shared
            .registry
            .lock()
            .unwrap()
            .stop_recording_all()
            .map_err(|e| e.to_string()),
        ClientCommand::GetLastTrialData => {
            let payload = shared
                .registry
                .lock()
                .unwrap()
                .serialize_last_trial()
                .to_string();
            match crate::wire::write_payload(&mut session.response, payload.as_bytes()) {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("Could not send the trial data - {e}");
                    return false;
                }
            }
        }
        ClientCommand::Handshake | ClientCommand::Failed => {
            Err(format!("unexpected command {command:?}"))
        }
    };
    let ack = match result {
        Ok(()) => AckCode::Ok,
        Err(e) => {
            warn!("Command {command:?} failed - {e}");
            AckCode::Nok
        }
    };
    send_ack(&mut session.response, ack)
}

/// Build, connect and (for collectors) start streaming a device, then hand
/// it to the registry
fn add_device(
    shared: &Shared,
    factory: &DeviceFactory,
    kind: DeviceKind,
) -> Result<(), String> {
    let mut registry = shared.registry.lock().unwrap();
    if registry.contains(kind.device_name()) {
        return Err(format!("{} is already connected", kind.device_name()));
    }
    let mut device = factory(kind).map_err(|e| e.to_string())?;
    device.connect().map_err(|e| e.to_string())?;
    if device.is_collector() {
        if let Err(e) = device.start_data_streaming() {
            device.disconnect();
            return Err(e.to_string());
        }
    }
    registry.add(device).map_err(|e| e.to_string())
}

fn remove_device(shared: &Shared, kind: DeviceKind) -> Result<(), String> {
    shared
        .registry
        .lock()
        .unwrap()
        .remove(kind.device_name())
        .map(drop)
        .map_err(|e| e.to_string())
}

/// Drop the client: every device disconnects and goes away, the live push
/// stops, and the accept loop starts over
fn disconnect_client(shared: &Shared) {
    let had_client = shared.client_connected.swap(false, Ordering::AcqRel);
    shared.registry.lock().unwrap().clear();
    *shared.live_socket.lock().unwrap() = None;
    if had_client {
        info!("Client disconnected");
    }
}

/// The live-data worker: every interval, push the tail of every collector's
/// trial since the previous push. A push that would block is skipped rather
/// than buffered.
fn live_data_loop(shared: &Shared, interval: Duration) {
    let mut marks: BTreeMap<String, Duration> = BTreeMap::new();
    while shared.running.load(Ordering::Acquire) {
        std::thread::sleep(interval);
        if !shared.client_connected.load(Ordering::Acquire) {
            marks.clear();
            continue;
        }
        let snapshot = shared
            .registry
            .lock()
            .unwrap()
            .live_data_since(&mut marks);
        let empty = snapshot.as_object().is_some_and(|o| o.is_empty());
        if empty {
            continue;
        }
        let payload = snapshot.to_string();
        let mut guard = shared.live_socket.lock().unwrap();
        let Some(socket) = guard.as_mut() else {
            continue;
        };
        match push_frame(socket, payload.as_bytes()) {
            PushOutcome::Sent | PushOutcome::Skipped => {}
            PushOutcome::Dead => {
                warn!("Live-data socket failed, dropping the push stream");
                *guard = None;
            }
        }
    }
}

enum PushOutcome {
    Sent,
    Skipped,
    Dead,
}

/// Write `(version, len)` + payload to the non-blocking live socket. If the
/// very first write would block, the whole frame is skipped; once a frame is
/// partially out it is completed so framing stays intact.
fn push_frame(socket: &mut TcpStream, payload: &[u8]) -> PushOutcome {
    let mut frame = Packet::new(payload.len() as u32).to_bytes().to_vec();
    frame.extend_from_slice(payload);
    let mut written = 0;
    while written < frame.len() {
        match socket.write(&frame[written..]) {
            Ok(0) => return PushOutcome::Dead,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if written == 0 {
                    return PushOutcome::Skipped;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_) => return PushOutcome::Dead,
        }
    }
    PushOutcome::Sent
}
