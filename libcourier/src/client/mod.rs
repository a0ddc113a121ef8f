// Copyright 2018-2020 Cargill Incorporated
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A synchronous RPC client to one service instance.
//!
//! The client owns one socket toward the instance, retries timed-out
//! requests with exponential backoff, and treats every other failure as
//! terminal.  An optional heartbeat supervisor runs on its own thread with
//! its own socket and publishes liveness through a shared atomic flag; the
//! two sockets never cross threads.

pub mod error;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error};
use uuid::Uuid;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::message::{RpcRequest, RpcResponse};
use crate::registry::{ServiceConfig, ServiceRegistry};
use crate::transport::{self, MessageSocket, OpenError, RecvError, Transport};
use crate::utils::current_timestamp_micros;

pub use error::{ClientError, ServiceClientTimeoutError, ServiceFunctionNotAvailableError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_MAX_TRIES: u32 = 3;
pub const DEFAULT_SLEEP_BEFORE_RETRY: Duration = Duration::from_millis(3000);
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(30_000);

const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(2000);
const HEARTBEAT_MAX_TRIES: u32 = 1;

/// Per-request policy.
#[derive(Clone, Debug)]
pub struct RequestOptions {
    /// Receive timeout; `None` blocks until the reply arrives.
    pub timeout: Option<Duration>,
    pub max_tries: u32,
    pub sleep_before_retry: Duration,
}

impl Default for RequestOptions {
    fn default() -> Self {
        RequestOptions {
            timeout: Some(DEFAULT_TIMEOUT),
            max_tries: DEFAULT_MAX_TRIES,
            sleep_before_retry: DEFAULT_SLEEP_BEFORE_RETRY,
        }
    }
}

/// Client construction policy.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// The timeout used by the convenience calls (`ping`, `healthcheck`,
    /// `description`, `stop`); `None` blocks.
    pub default_timeout: Option<Duration>,
    /// Whether to run the heartbeat supervisor thread.
    pub heartbeat: bool,
    pub heartbeat_frequency: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            default_timeout: Some(DEFAULT_TIMEOUT),
            heartbeat: true,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
        }
    }
}

struct HeartbeatHandle {
    stop_tx: Sender<()>,
    join_handle: JoinHandle<()>,
}

enum Beat {
    Alive,
    Timeout,
    Fatal(String),
}

pub struct ServiceClient {
    service_name: String,
    service_config: ServiceConfig,
    transport: Box<dyn Transport>,
    socket: Option<Box<dyn MessageSocket>>,
    default_timeout: Option<Duration>,
    guid: String,
    start_time: u64,
    shutdown_time: Option<u64>,
    alive: Arc<AtomicBool>,
    heartbeat: Option<HeartbeatHandle>,
}

impl ServiceClient {
    /// Builds a client from an explicit client-view config, as returned by
    /// service discovery.
    pub fn from_config(
        service_config: ServiceConfig,
        mut transport: Box<dyn Transport>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let socket = open_client_socket(&mut *transport, &service_config)
            .map_err(|err| ClientError::Transport(err.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let heartbeat = if options.heartbeat {
            Some(spawn_heartbeat(
                service_config.clone(),
                transport.clone(),
                Arc::clone(&alive),
                options.heartbeat_frequency,
            )?)
        } else {
            None
        };

        Ok(ServiceClient {
            service_name: service_config.name.clone(),
            service_config,
            transport,
            socket: Some(socket),
            default_timeout: options.default_timeout,
            guid: Uuid::new_v4().to_string(),
            start_time: current_timestamp_micros(),
            shutdown_time: None,
            alive,
            heartbeat,
        })
    }

    /// Builds a client toward one randomly discovered instance of the named
    /// service.
    pub fn connect(
        service_name: &str,
        registry: &mut ServiceRegistry,
        transport: Box<dyn Transport>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let service_config = registry
            .discover_service(service_name, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ClientError::Registry(
                    crate::registry::ServiceNotAvailableError(service_name.into()).into(),
                )
            })?;
        Self::from_config(service_config, transport, options)
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn shutdown_time(&self) -> Option<u64> {
        self.shutdown_time
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.service_config
    }

    /// Sends `[function_name, payload]` and returns the reply payload.
    ///
    /// A receive timeout closes the socket, waits
    /// `2^try * sleep_before_retry`, reopens, and tries again up to
    /// `max_tries`.  Any other failure is terminal: the client shuts down
    /// and the recorded error is returned.
    pub fn request(
        &mut self,
        function_name: &str,
        payload: &[u8],
        options: &RequestOptions,
    ) -> Result<Vec<u8>, ClientError> {
        if !self.service_config.functions.contains(function_name) {
            return Err(ServiceFunctionNotAvailableError {
                service: self.service_name.clone(),
                function: function_name.into(),
            }
            .into());
        }

        let mut try_num: u32 = 0;
        let mut sleep_duration: Option<Duration> = None;
        let mut recorded: Option<ClientError> = None;

        while self.alive() && try_num < options.max_tries {
            if let Some(duration) = sleep_duration.take() {
                debug!("will try again in {:?}", duration);
                thread::sleep(duration);
            }

            if self.socket.is_none() {
                match open_client_socket(&mut *self.transport, &self.service_config) {
                    Ok(socket) => self.socket = Some(socket),
                    Err(err) => {
                        recorded = Some(ClientError::Transport(err.to_string()));
                        break;
                    }
                }
            }
            let socket = match self.socket.as_mut() {
                Some(socket) => socket,
                None => break,
            };

            if let Err(err) = socket.send(&[function_name.as_bytes().to_vec(), payload.to_vec()]) {
                error!(
                    "error in client {} while requesting function: {} of service: {}: {}",
                    self.guid, function_name, self.service_name, err
                );
                recorded = Some(ClientError::Transport(err.to_string()));
                break;
            }

            match socket.recv(options.timeout) {
                Ok(mut frames) => {
                    if frames.is_empty() {
                        recorded = Some(ClientError::Transport("empty reply".into()));
                        break;
                    }
                    return Ok(frames.remove(0));
                }
                Err(RecvError::Timeout) => {
                    debug!(
                        "client {} can not complete function: {} of service: {} in {:?}",
                        self.guid, function_name, self.service_name, options.timeout
                    );
                    if let Some(mut socket) = self.socket.take() {
                        let _ = socket.close();
                    }
                    recorded = Some(
                        ServiceClientTimeoutError {
                            service: self.service_name.clone(),
                            function: function_name.into(),
                            timeout: options.timeout,
                            max_tries: options.max_tries,
                            sleep_before_retry: options.sleep_before_retry,
                        }
                        .into(),
                    );
                    sleep_duration =
                        Some(options.sleep_before_retry * 2u32.saturating_pow(try_num));
                    try_num += 1;
                }
                Err(err) => {
                    error!(
                        "error in client {} while requesting function: {} of service: {}: {}",
                        self.guid, function_name, self.service_name, err
                    );
                    recorded = Some(ClientError::Transport(err.to_string()));
                    break;
                }
            }
        }

        if !self.alive() {
            error!(
                "client {} for service {} is no longer alive, shutting it down",
                self.guid, self.service_name
            );
        }
        self.shutdown();

        Err(recorded.unwrap_or_else(|| {
            ClientError::Dead(format!(
                "client {} for service {} is not alive",
                self.guid, self.service_name
            ))
        }))
    }

    /// Sends a structured request and decodes the structured response.
    pub fn request_message<Req: RpcRequest, Res: RpcResponse>(
        &mut self,
        function_name: &str,
        request: &Req,
        options: &RequestOptions,
    ) -> Result<Res, ClientError> {
        let payload =
            serde_json::to_vec(request).map_err(|err| ClientError::Encode(err.to_string()))?;
        let reply = self.request(function_name, &payload, options)?;
        serde_json::from_slice(&reply).map_err(|err| ClientError::Decode(err.to_string()))
    }

    pub fn ping(&mut self) -> Result<Vec<u8>, ClientError> {
        self.request("heartbeat", b"ping", &self.convenience_options())
    }

    pub fn healthcheck(&mut self) -> Result<Vec<u8>, ClientError> {
        self.request("healthcheck", b"health", &self.convenience_options())
    }

    pub fn description(&mut self) -> Result<Vec<u8>, ClientError> {
        self.request("description", b"description", &self.convenience_options())
    }

    pub fn stop(&mut self) -> Result<Vec<u8>, ClientError> {
        self.request("stop", b"stop", &self.convenience_options())
    }

    fn convenience_options(&self) -> RequestOptions {
        RequestOptions {
            timeout: self.default_timeout,
            ..RequestOptions::default()
        }
    }

    /// Shuts the client down: flips the liveness flag, stops and joins the
    /// heartbeat supervisor, closes the socket, and stamps the shutdown
    /// time.  Idempotent; re-entering returns without effect.
    pub fn shutdown(&mut self) {
        if self.shutdown_time.is_some() {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.stop_tx.send(());
            if heartbeat.join_handle.join().is_err() {
                error!("heartbeat thread of client {} panicked", self.guid);
            } else {
                debug!("stopped heartbeat thread of client {}", self.guid);
            }
        }
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close();
        }
        self.shutdown_time = Some(current_timestamp_micros());
    }
}

impl Drop for ServiceClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn open_client_socket(
    transport: &mut dyn Transport,
    config: &ServiceConfig,
) -> Result<Box<dyn MessageSocket>, OpenError> {
    let address = transport::endpoint(config.connect_method, &config.host, config.port);
    transport.open(config.socket_type, config.connect_method, &address)
}

/// Runs the heartbeat supervisor until stopped or failed.  Every exit path
/// marks the client not-alive; the owning client observes the flag.
fn spawn_heartbeat(
    service_config: ServiceConfig,
    mut transport: Box<dyn Transport>,
    alive: Arc<AtomicBool>,
    heartbeat_frequency: Duration,
) -> Result<HeartbeatHandle, ClientError> {
    let (stop_tx, stop_rx) = bounded(1);
    let join_handle = thread::Builder::new()
        .name(format!(
            "{}-client-heartbeat-{}",
            service_config.name,
            current_timestamp_micros()
        ))
        .spawn(move || {
            let mut socket = match open_client_socket(&mut *transport, &service_config) {
                Ok(socket) => socket,
                Err(err) => {
                    error!("heartbeat thread could not open its socket: {}", err);
                    alive.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let mut try_num: u32 = 0;
            let mut wait = Duration::from_millis(0);
            let mut failure: Option<String> = None;

            loop {
                match stop_rx.recv_timeout(wait) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => (),
                }

                let outcome = match socket.send(&[b"heartbeat".to_vec(), b"heartbeat".to_vec()]) {
                    Ok(()) => match socket.recv(Some(HEARTBEAT_TIMEOUT)) {
                        Ok(_) => Beat::Alive,
                        Err(RecvError::Timeout) => Beat::Timeout,
                        Err(err) => Beat::Fatal(err.to_string()),
                    },
                    Err(err) => Beat::Fatal(err.to_string()),
                };

                match outcome {
                    Beat::Alive => {
                        wait = heartbeat_frequency;
                    }
                    Beat::Timeout => {
                        let _ = socket.close();
                        match open_client_socket(&mut *transport, &service_config) {
                            Ok(fresh) => socket = fresh,
                            Err(err) => {
                                failure = Some(err.to_string());
                                break;
                            }
                        }
                        wait = heartbeat_frequency * 2u32.saturating_pow(try_num);
                        try_num += 1;
                        if try_num >= HEARTBEAT_MAX_TRIES {
                            failure = Some(format!(
                                "no heartbeat reply within {:?}",
                                HEARTBEAT_TIMEOUT
                            ));
                            break;
                        }
                    }
                    Beat::Fatal(msg) => {
                        failure = Some(msg);
                        break;
                    }
                }
            }

            alive.store(false, Ordering::SeqCst);
            let _ = socket.close();
            match failure {
                Some(failure) => error!(
                    "heartbeat thread of {} client dying due to error: {}",
                    service_config.name, failure
                ),
                None => debug!(
                    "stopping heartbeat thread of {} client",
                    service_config.name
                ),
            }
        })
        .map_err(|err| ClientError::Transport(err.to_string()))?;

    Ok(HeartbeatHandle {
        stop_tx,
        join_handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::thread;
    use std::time::Instant;

    use crate::transport::inproc::InprocTransport;
    use crate::transport::{ConnectMethod, SocketType};

    fn client_view_config(functions: &[&str], port: u16) -> ServiceConfig {
        ServiceConfig {
            name: "mute".into(),
            env: "test".into(),
            guid: "abc".into(),
            pid: 42,
            host: "localhost".into(),
            port,
            socket_type: SocketType::Req,
            connect_method: ConnectMethod::Connect,
            functions: functions
                .iter()
                .map(|function| function.to_string())
                .collect::<HashSet<String>>(),
            start_time: 0,
            alive: true,
        }
    }

    fn bind_server(transport: &InprocTransport, port: u16) -> Box<dyn MessageSocket> {
        let mut transport = transport.clone();
        transport
            .open(
                SocketType::Rep,
                ConnectMethod::Bind,
                &format!("tcp://*:{}", port),
            )
            .expect("failed to bind server socket")
    }

    fn no_heartbeat() -> ClientOptions {
        ClientOptions {
            heartbeat: false,
            ..ClientOptions::default()
        }
    }

    #[test]
    fn test_unknown_function_fails_without_a_send() {
        let transport = InprocTransport::default();
        let mut server = bind_server(&transport, 9100);

        let mut client = ServiceClient::from_config(
            client_view_config(&["heartbeat"], 9100),
            Box::new(transport),
            no_heartbeat(),
        )
        .unwrap();

        match client.request("greet", b"alice", &RequestOptions::default()) {
            Err(ClientError::FunctionNotAvailable(err)) => {
                assert_eq!("greet", err.function);
                assert_eq!("mute", err.service);
            }
            other => panic!("Expected Err(FunctionNotAvailable), got {:?}", other.is_ok()),
        }

        // nothing reached the service
        match server.recv(Some(Duration::from_millis(50))) {
            Err(RecvError::Timeout) => (),
            other => panic!("Expected Err(Timeout), got {:?}", other.is_ok()),
        }
        // the failed lookup did not kill the client
        assert!(client.alive());
    }

    #[test]
    fn test_retry_on_timeout_sends_max_tries_times() {
        let transport = InprocTransport::default();
        let mut server = bind_server(&transport, 9101);

        let mut client = ServiceClient::from_config(
            client_view_config(&["greet"], 9101),
            Box::new(transport),
            no_heartbeat(),
        )
        .unwrap();

        let options = RequestOptions {
            timeout: Some(Duration::from_millis(100)),
            max_tries: 3,
            sleep_before_retry: Duration::from_millis(10),
        };
        let requested = Instant::now();
        match client.request("greet", b"alice", &options) {
            Err(ClientError::Timeout(err)) => {
                assert_eq!("greet", err.function);
                assert_eq!(3, err.max_tries);
            }
            other => panic!("Expected Err(Timeout), got {:?}", other.is_ok()),
        }
        // three waits plus the 10ms and 20ms backoffs
        assert!(requested.elapsed() >= Duration::from_millis(330));

        // the service saw exactly three sends
        for _ in 0..3 {
            server
                .recv(Some(Duration::from_millis(50)))
                .expect("expected a delivered request");
        }
        match server.recv(Some(Duration::from_millis(50))) {
            Err(RecvError::Timeout) => (),
            other => panic!("Expected Err(Timeout), got {:?}", other.is_ok()),
        }

        // a terminal error shuts the client down
        assert!(!client.alive());
        assert!(client.shutdown_time().is_some());
    }

    #[test]
    fn test_single_try_makes_exactly_one_send() {
        let transport = InprocTransport::default();
        let mut server = bind_server(&transport, 9102);

        let mut client = ServiceClient::from_config(
            client_view_config(&["greet"], 9102),
            Box::new(transport),
            no_heartbeat(),
        )
        .unwrap();

        let options = RequestOptions {
            timeout: Some(Duration::from_millis(50)),
            max_tries: 1,
            sleep_before_retry: Duration::from_millis(10),
        };
        assert!(client.request("greet", b"alice", &options).is_err());

        server
            .recv(Some(Duration::from_millis(50)))
            .expect("expected a delivered request");
        match server.recv(Some(Duration::from_millis(50))) {
            Err(RecvError::Timeout) => (),
            other => panic!("Expected Err(Timeout), got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_successful_request_round_trip() {
        let transport = InprocTransport::default();
        let mut server = bind_server(&transport, 9103);

        let server_thread = thread::spawn(move || {
            let request = server.recv(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(b"greet".to_vec(), request[0]);
            server.send(&[b"hello".to_vec()]).unwrap();
        });

        let mut client = ServiceClient::from_config(
            client_view_config(&["greet"], 9103),
            Box::new(transport),
            no_heartbeat(),
        )
        .unwrap();
        let reply = client
            .request("greet", b"alice", &RequestOptions::default())
            .unwrap();
        assert_eq!(b"hello".to_vec(), reply);
        assert!(client.alive());
        server_thread.join().unwrap();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let transport = InprocTransport::default();
        let _server = bind_server(&transport, 9104);

        let mut client = ServiceClient::from_config(
            client_view_config(&["greet"], 9104),
            Box::new(transport),
            no_heartbeat(),
        )
        .unwrap();

        client.shutdown();
        assert!(!client.alive());
        let stamped = client.shutdown_time();
        assert!(stamped.is_some());

        client.shutdown();
        assert_eq!(stamped, client.shutdown_time());
    }

    #[test]
    fn test_heartbeat_keeps_client_alive_and_stops_cleanly() {
        let transport = InprocTransport::default();
        let mut server = bind_server(&transport, 9105);

        let server_thread = thread::spawn(move || {
            // serve heartbeats until the socket goes away
            while let Ok(request) = server.recv(Some(Duration::from_millis(500))) {
                assert_eq!(b"heartbeat".to_vec(), request[0]);
                if server.send(&[b"PONG".to_vec()]).is_err() {
                    break;
                }
            }
        });

        let mut client = ServiceClient::from_config(
            client_view_config(&["heartbeat"], 9105),
            Box::new(transport),
            ClientOptions {
                heartbeat: true,
                heartbeat_frequency: Duration::from_millis(50),
                ..ClientOptions::default()
            },
        )
        .unwrap();

        // a few heartbeat cycles pass without the supervisor killing us
        thread::sleep(Duration::from_millis(200));
        assert!(client.alive());

        client.shutdown();
        assert!(!client.alive());
        drop(client);
        server_thread.join().unwrap();
    }
}
