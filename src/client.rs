//! Mirror client of the control server, used for IPC and tests

use crate::timeseries::TimeSeries;
use crate::wire::{read_payload, AckCode, ClientCommand, Packet, WireError};
use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Replies are prompt; anything slower means the link is gone
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("the server refused the command")]
    Refused,
    #[error("the client is not connected")]
    NotConnected,
    #[error("could not parse the server payload: {0}")]
    BadPayload(String),
}

/// Called on the live-data worker with each pushed snapshot
pub type LiveDataCallback = Arc<dyn Fn(BTreeMap<String, TimeSeries>) + Send + Sync>;

/// Synchronous client over the three-socket protocol: commands out, acks and
/// payloads back, live data consumed on a background worker.
pub struct ControlClient {
    host: String,
    command_port: u16,
    response_port: u16,
    live_data_port: u16,
    command: Option<TcpStream>,
    response: Option<TcpStream>,
    /// Clone of the live socket kept to unblock the worker on disconnect
    live_shutdown: Option<TcpStream>,
    connected: Arc<AtomicBool>,
    live_worker: Option<JoinHandle<()>>,
    on_live_data: Option<LiveDataCallback>,
}

impl ControlClient {
    pub fn new(
        host: impl Into<String>,
        command_port: u16,
        response_port: u16,
        live_data_port: u16,
    ) -> Self {
        Self {
            host: host.into(),
            command_port,
            response_port,
            live_data_port,
            command: None,
            response: None,
            live_shutdown: None,
            connected: Arc::new(AtomicBool::new(false)),
            live_worker: None,
            on_live_data: None,
        }
    }

    /// Register the live-data consumer; takes effect at the next connect
    pub fn on_live_data(&mut self, callback: LiveDataCallback) {
        self.on_live_data = Some(callback);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Open the three sockets in protocol order and shake hands
    pub fn connect(&mut self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }
        let command = TcpStream::connect((self.host.as_str(), self.command_port))
            .map_err(WireError::from)?;
        let response = TcpStream::connect((self.host.as_str(), self.response_port))
            .map_err(WireError::from)?;
        let live = TcpStream::connect((self.host.as_str(), self.live_data_port))
            .map_err(WireError::from)?;
        response
            .set_read_timeout(Some(RESPONSE_TIMEOUT))
            .map_err(WireError::from)?;

        self.live_shutdown = live.try_clone().ok();
        self.command = Some(command);
        self.response = Some(response);
        self.connected.store(true, Ordering::Release);
        self.spawn_live_worker(live);

        match self.send_command(ClientCommand::Handshake) {
            Ok(()) => {
                info!("Connected to the server");
                Ok(())
            }
            Err(e) => {
                warn!("Handshake failed - {e}");
                self.disconnect();
                Err(e)
            }
        }
    }

    fn spawn_live_worker(&mut self, mut live: TcpStream) {
        let connected = Arc::clone(&self.connected);
        let callback = self.on_live_data.clone();
        self.live_worker = Some(
            std::thread::Builder::new()
                .name("client-live".into())
                .spawn(move || {
                    while connected.load(Ordering::Acquire) {
                        let payload = match read_payload(&mut live) {
                            Ok(payload) => payload,
                            Err(_) => break,
                        };
                        let parsed: Result<BTreeMap<String, TimeSeries>, _> =
                            serde_json::from_slice(&payload);
                        match parsed {
                            Ok(data) => {
                                debug!("Live data received ({} devices)", data.len());
                                if let Some(callback) = &callback {
                                    callback(data);
                                }
                            }
                            Err(e) => warn!("Could not parse live data - {e}"),
                        }
                    }
                })
                .expect("could not spawn the live-data worker"),
        );
    }

    /// Send one command and wait for its acknowledgment
    fn send_command(&mut self, command: ClientCommand) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let sock = self.command.as_mut().ok_or(ClientError::NotConnected)?;
        Packet::command(command).write_to(sock)?;
        self.wait_ack()
    }

    fn wait_ack(&mut self) -> Result<(), ClientError> {
        let sock = self.response.as_mut().ok_or(ClientError::NotConnected)?;
        let ack = Packet::read_from(sock)?.parse_ack()?;
        match ack {
            AckCode::Ok => Ok(()),
            AckCode::Nok => Err(ClientError::Refused),
        }
    }

    pub fn add_delsys_emg_device(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::ConnectDelsysEmg)
    }

    pub fn add_delsys_analog_device(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::ConnectDelsysAnalog)
    }

    pub fn add_magstim_device(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::ConnectMagstim)
    }

    pub fn remove_delsys_emg_device(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::DisconnectDelsysEmg)
    }

    pub fn remove_delsys_analog_device(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::DisconnectDelsysAnalog)
    }

    pub fn remove_magstim_device(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::DisconnectMagstim)
    }

    pub fn start_recording(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::StartRecording)
    }

    pub fn stop_recording(&mut self) -> Result<(), ClientError> {
        self.send_command(ClientCommand::StopRecording)
    }

    /// Fetch the last trial of every collector, keyed by device name
    pub fn get_last_trial_data(
        &mut self,
    ) -> Result<BTreeMap<String, TimeSeries>, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let sock = self.command.as_mut().ok_or(ClientError::NotConnected)?;
        Packet::command(ClientCommand::GetLastTrialData).write_to(sock)?;
        // The payload precedes the ack on the response socket
        let payload = {
            let response = self.response.as_mut().ok_or(ClientError::NotConnected)?;
            read_payload(response)?
        };
        self.wait_ack()?;
        serde_json::from_slice(&payload).map_err(|e| ClientError::BadPayload(e.to_string()))
    }

    /// Close everything and join the live-data worker. Safe to call any
    /// number of times, connected or not.
    pub fn disconnect(&mut self) {
        self.connected.store(false, Ordering::Release);
        if let Some(live) = self.live_shutdown.take() {
            let _ = live.shutdown(Shutdown::Both);
        }
        if let Some(command) = self.command.take() {
            let _ = command.shutdown(Shutdown::Both);
        }
        if let Some(response) = self.response.take() {
            let _ = response.shutdown(Shutdown::Both);
        }
        if let Some(worker) = self.live_worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}
