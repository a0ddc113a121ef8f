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

//! The service runtime: one bound socket, a fixed set of named function
//! handlers, a single-threaded dispatch loop, and the registration
//! lifecycle.
//!
//! A service is assembled with [`ServiceBuilder`], which performs the
//! bootstrap sequence in contract order: compute identity, reserve a port,
//! open the socket, install handlers, register.  [`Service::run`] then
//! serves requests until a `stop` message, an interrupt through the running
//! flag, or a fatal error; the exit path deregisters the instance and
//! removes its pid file in every case.

pub mod error;
pub mod handlers;

use log::{debug, error, warn};
use rand::Rng;
use serde_derive::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use std::cmp;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BadServiceConfigError, ServiceSettings};
use crate::hex::to_hex;
use crate::registry::{ServiceConfig, ServiceRegistry};
use crate::transport::{self, ConnectMethod, MessageSocket, RecvError, SocketType, Transport};
use crate::utils::current_timestamp_micros;

pub use error::{
    BadServiceMessageHandlerError, BadServiceRequestError, HandlerError, ServiceError,
};
pub use handlers::{FunctionHandler, MessageHandler};

const FUNCTIONS_DECK_LENGTH: usize = 10;

// How long the dispatch loop waits on the socket before checking the
// running flag again.
const DISPATCH_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// The identity a service instance advertises: who it is, where it is
/// reachable, and since when.
#[derive(Clone, Debug)]
pub struct ServiceIdentity {
    pub description: String,
    pub name: String,
    pub env: String,
    pub version: String,
    pub guid: String,
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub socket_type: SocketType,
    pub connect_method: ConnectMethod,
    pub start_time: u64,
}

/// Rolling per-instance statistics, updated only by the dispatch loop.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ServiceStats {
    pub num_messages: u64,
    pub num_success: u64,
    pub num_error: u64,
    pub avg_response_time: f64,
    pub min_response_time: u64,
    pub max_response_time: u64,
    pub last_response_time: u64,
}

impl ServiceStats {
    /// Records one processed message.  `num_messages` has already been
    /// incremented when the message arrived.
    fn record(&mut self, response_time: u64, success: bool) {
        if success {
            self.num_success += 1;
        } else {
            self.num_error += 1;
        }
        self.last_response_time = response_time;
        self.max_response_time = cmp::max(self.max_response_time, response_time);
        // the first sample seeds the minimum so it is never pinned at zero
        if self.min_response_time == 0 {
            self.min_response_time = response_time;
        } else {
            self.min_response_time = cmp::min(self.min_response_time, response_time);
        }
        let processed = self.num_messages as f64;
        self.avg_response_time =
            (response_time as f64 + (processed - 1.0) * self.avg_response_time) / processed;
    }
}

/// A read-only view of the hosting service, handed to handlers with each
/// message.
pub struct ServiceContext<'a> {
    pub identity: &'a ServiceIdentity,
    pub functions: &'a [String],
    pub deck: &'a VecDeque<String>,
    pub stats: &'a ServiceStats,
}

/// Assembles and registers a [`Service`].
pub struct ServiceBuilder {
    settings: ServiceSettings,
    registry: Option<ServiceRegistry>,
    transport: Option<Box<dyn Transport>>,
    handlers: Vec<(String, Box<dyn MessageHandler>)>,
    running: Option<Arc<AtomicBool>>,
}

impl ServiceBuilder {
    pub fn new(settings: ServiceSettings) -> Self {
        ServiceBuilder {
            settings,
            registry: None,
            transport: None,
            handlers: Vec::new(),
            running: None,
        }
    }

    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Installs a handler for the named function.  User handlers override
    /// built-ins of the same name.
    pub fn with_handler(mut self, function: &str, handler: Box<dyn MessageHandler>) -> Self {
        self.handlers.push((function.into(), handler));
        self
    }

    /// Shares an externally owned running flag, so an interrupt handler can
    /// stop the dispatch loop.
    pub fn with_running_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = Some(running);
        self
    }

    /// Runs the bootstrap sequence and returns the ready-to-run service.
    ///
    /// Any failure after the port has been reserved triggers a best-effort
    /// deregistration before the error propagates.
    pub fn start(self) -> Result<Service, ServiceError> {
        let settings = self.settings;
        let mut registry = self.registry.ok_or_else(|| {
            BadServiceConfigError("a service registry must be provided".into())
        })?;
        let mut transport = self.transport.ok_or_else(|| {
            BadServiceConfigError("a transport must be provided".into())
        })?;

        let start_time = current_timestamp_micros();
        let pid = process::id();
        let host = match &settings.host {
            Some(host) => host.clone(),
            None => {
                debug!("can not determine hostname, falling back to localhost");
                "localhost".to_string()
            }
        };
        let guid = determine_guid(&settings.name, &host, pid, start_time);

        let port = registry.next_available_port(&settings.name, &guid, &host)?;

        let identity = ServiceIdentity {
            description: settings.description,
            name: settings.name,
            env: settings.env,
            version: settings.version,
            guid,
            pid,
            host,
            port,
            socket_type: settings.socket_type,
            connect_method: settings.connect_method,
            start_time,
        };

        let address = transport::endpoint(identity.connect_method, &identity.host, port);
        let socket = transport.open(identity.socket_type, identity.connect_method, &address)?;

        let mut handlers = handlers::built_in_handlers(pid);
        for (function, handler) in self.handlers {
            debug!(
                "registered handler: service: {}, function: {}",
                identity.name, function
            );
            handlers.insert(function, handler);
        }
        let mut functions: Vec<String> = handlers.keys().cloned().collect();
        functions.sort();

        let config = ServiceConfig {
            name: identity.name.clone(),
            env: identity.env.clone(),
            guid: identity.guid.clone(),
            pid,
            host: identity.host.clone(),
            port,
            socket_type: identity.socket_type,
            connect_method: identity.connect_method,
            functions: functions.iter().cloned().collect(),
            start_time,
            alive: true,
        };
        if let Err(err) = registry.register_service(&config) {
            error!("error while registering service: {}", err);
            if let Err(cleanup_err) =
                registry.deregister_service(&identity.name, &identity.guid, &identity.host)
            {
                warn!("unable to clean up after failed registration: {}", cleanup_err);
            }
            return Err(err.into());
        }

        let pid_file = match &settings.pid_dir {
            Some(pid_dir) => match write_pid_file(pid_dir, &identity, &functions) {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!("unable to write pid file: {}", err);
                    None
                }
            },
            None => None,
        };

        debug!(
            "started {} service: host: {}, port: {}, guid: {}",
            identity.name, identity.host, identity.port, identity.guid
        );

        Ok(Service {
            identity,
            functions,
            handlers,
            socket,
            registry,
            running: self
                .running
                .unwrap_or_else(|| Arc::new(AtomicBool::new(true))),
            function_deck: VecDeque::with_capacity(FUNCTIONS_DECK_LENGTH),
            stats: ServiceStats::default(),
            pid_file,
        })
    }
}

/// One running service instance.
pub struct Service {
    identity: ServiceIdentity,
    functions: Vec<String>,
    handlers: HashMap<String, Box<dyn MessageHandler>>,
    socket: Box<dyn MessageSocket>,
    registry: ServiceRegistry,
    running: Arc<AtomicBool>,
    function_deck: VecDeque<String>,
    stats: ServiceStats,
    pid_file: Option<PathBuf>,
}

impl Service {
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn stats(&self) -> &ServiceStats {
        &self.stats
    }

    /// The functions this instance advertises.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    /// A clone of the running flag; storing `false` stops the dispatch loop
    /// at its next poll.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Serves requests until stopped, then deregisters.
    ///
    /// The exit path runs on every way out: a `stop` message, the running
    /// flag flipping, or a fatal socket error.  Cleanup failures are logged
    /// and swallowed so they never mask the original outcome.
    pub fn run(&mut self) -> Result<(), ServiceError> {
        let result = self.dispatch_loop();
        match &result {
            Ok(()) => debug!("stopping {} service", self.identity.name),
            Err(err) => error!(
                "{} service crashed due to: {}",
                self.identity.name, err
            ),
        }

        if let Err(err) = self.registry.deregister_service(
            &self.identity.name,
            &self.identity.guid,
            &self.identity.host,
        ) {
            warn!("unable to deregister {} service: {}", self.identity.name, err);
        } else {
            debug!("deregistered {} service", self.identity.name);
        }

        if let Some(pid_file) = self.pid_file.take() {
            if let Err(err) = fs::remove_file(&pid_file) {
                debug!(
                    "unable to remove pid file {}: {}",
                    pid_file.display(),
                    err
                );
            }
        }

        let _ = self.socket.close();
        result
    }

    fn dispatch_loop(&mut self) -> Result<(), ServiceError> {
        while self.running.load(Ordering::SeqCst) {
            let frames = match self.socket.recv(Some(DISPATCH_POLL_TIMEOUT)) {
                Ok(frames) => frames,
                Err(RecvError::Timeout) => continue,
                Err(err) => return Err(ServiceError::Recv(err)),
            };

            let mut frames = frames.into_iter();
            let requested = String::from_utf8_lossy(&frames.next().unwrap_or_default()).into_owned();
            let payload = frames.next().unwrap_or_default();

            // unknown names fall through to the default handler
            let function = if self.handlers.contains_key(&requested) {
                requested
            } else {
                "default".to_string()
            };
            if function != "heartbeat" {
                debug!("received RPC for function: {}", function);
            }

            self.function_deck.push_front(function.clone());
            self.function_deck.truncate(FUNCTIONS_DECK_LENGTH);
            self.stats.num_messages += 1;

            let handling_started = Instant::now();
            let outcome = {
                let context = ServiceContext {
                    identity: &self.identity,
                    functions: &self.functions,
                    deck: &self.function_deck,
                    stats: &self.stats,
                };
                match self.handlers.get_mut(&function) {
                    Some(handler) => handler.handle(&payload, &context),
                    None => Err(HandlerError::Uncaught(format!(
                        "no handler installed for function: {}",
                        function
                    ))),
                }
            };

            let (response, success) = match outcome {
                Ok(response) => (response, true),
                Err(err) => {
                    error!(
                        "error while processing request for function: {}: {}",
                        function, err
                    );
                    (b"empty response".to_vec(), false)
                }
            };
            self.stats
                .record(handling_started.elapsed().as_micros() as u64, success);

            self.socket.send(&[response]).map_err(ServiceError::Send)?;

            if function == "stop" {
                debug!(
                    "stopping {} service in response to STOP message",
                    self.identity.name
                );
                break;
            }
        }
        Ok(())
    }
}

fn determine_guid(name: &str, host: &str, pid: u32, start_time: u64) -> String {
    let nonce: u64 = rand::thread_rng().gen_range(1, 1_000_000_000);
    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{} service, {}, {}, {}, {}",
            name, host, pid, start_time, nonce
        )
        .as_bytes(),
    );
    to_hex(hasher.finalize().as_slice())
}

fn write_pid_file(
    pid_dir: &Path,
    identity: &ServiceIdentity,
    functions: &[String],
) -> Result<PathBuf, io::Error> {
    let dir = pid_dir.join(&identity.name);
    fs::create_dir_all(&dir)?;
    let path = dir.join(identity.pid.to_string());

    let document = json!({
        "name": identity.name,
        "env": identity.env,
        "pid": identity.pid,
        "guid": identity.guid,
        "host": identity.host,
        "port": identity.port,
        "socket_type": identity.socket_type.as_str(),
        "connect_method": identity.connect_method.as_str(),
        "functions": functions,
        "start_time": identity.start_time,
        "cmdline": handlers::process_cmdline(identity.pid),
    });
    let contents = serde_json::to_string_pretty(&document)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(&path, contents)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use tempdir::TempDir;

    use crate::config::ServiceSettings;
    use crate::directory::memory::MemoryDirectory;
    use crate::registry::RegistryError;
    use crate::transport::inproc::InprocTransport;

    fn test_settings(name: &str) -> ServiceSettings {
        ServiceSettings::new(name, "test", "1.0", "a test service")
    }

    fn start_service(
        name: &str,
        directory: &MemoryDirectory,
        transport: &InprocTransport,
    ) -> Service {
        ServiceBuilder::new(test_settings(name))
            .with_registry(ServiceRegistry::new(Box::new(directory.clone())))
            .with_transport(Box::new(transport.clone()))
            .start()
            .expect("failed to start service")
    }

    fn client_socket(
        transport: &InprocTransport,
        host: &str,
        port: u16,
    ) -> Box<dyn MessageSocket> {
        let mut transport = transport.clone();
        transport
            .open(
                SocketType::Req,
                ConnectMethod::Connect,
                &transport::endpoint(ConnectMethod::Connect, host, port),
            )
            .expect("failed to open client socket")
    }

    fn request(socket: &mut Box<dyn MessageSocket>, function: &str, payload: &[u8]) -> Vec<u8> {
        socket
            .send(&[function.as_bytes().to_vec(), payload.to_vec()])
            .expect("failed to send request");
        socket
            .recv(Some(Duration::from_secs(5)))
            .expect("failed to receive reply")
            .remove(0)
    }

    #[test]
    fn test_bootstrap_reserves_port_and_registers() {
        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();
        let mut service = start_service("bootstrapped", &directory, &transport);

        assert_eq!(9000, service.identity().port);
        assert!(service.functions().contains(&"default".to_string()));
        assert!(service.functions().contains(&"heartbeat".to_string()));

        let mut registry = ServiceRegistry::new(Box::new(directory.clone()));
        let configs = registry.discover_service("bootstrapped", 1).unwrap();
        assert_eq!(service.identity().guid, configs[0].guid);
        assert_eq!(SocketType::Req, configs[0].socket_type);

        // stopping the loop deregisters the instance
        service.running_flag().store(false, Ordering::SeqCst);
        service.run().unwrap();
        match registry.discover_service("bootstrapped", 1) {
            Err(RegistryError::NotAvailable(_)) => (),
            other => panic!("Expected Err(NotAvailable), got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_dispatch_built_ins_and_stop() {
        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();
        let mut service = start_service("stoppable", &directory, &transport);
        let (host, port) = (service.identity().host.clone(), service.identity().port);

        let handle = thread::spawn(move || {
            service.run().unwrap();
            service
        });

        let mut socket = client_socket(&transport, &host, port);
        assert_eq!(b"PONG".to_vec(), request(&mut socket, "heartbeat", b"ping"));
        assert_eq!(
            "Function not available for service: stoppable",
            String::from_utf8(request(&mut socket, "no_such_function", b"")).unwrap()
        );
        assert_eq!(b"STOPPED".to_vec(), request(&mut socket, "stop", b"stop"));

        let service = handle.join().unwrap();
        assert_eq!(3, service.stats().num_messages);
        assert_eq!(3, service.stats().num_success);
    }

    #[test]
    fn test_stats_and_function_deck_via_description() {
        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();
        let mut service = start_service("described", &directory, &transport);
        let (host, port) = (service.identity().host.clone(), service.identity().port);

        let handle = thread::spawn(move || {
            service.run().unwrap();
        });

        let mut socket = client_socket(&transport, &host, port);
        // more unknown functions than the deck can hold
        for i in 0..12 {
            request(&mut socket, &format!("unknown_{}", i), b"");
        }

        let reply = request(&mut socket, "description", b"");
        let document: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        let deck = document["function_deck"].as_array().unwrap();
        assert_eq!(10, deck.len());
        // most-recent-first, oldest evicted
        assert_eq!("default", deck[1]);
        let stats = &document["stats"];
        // the description request itself is counted but not yet recorded
        assert_eq!(13, stats["num_messages"]);
        assert_eq!(12, stats["num_success"]);
        assert_eq!(0, stats["num_error"]);

        request(&mut socket, "stop", b"");
        handle.join().unwrap();
    }

    #[test]
    fn test_stats_record_orders_min_avg_max() {
        let mut stats = ServiceStats::default();
        for (elapsed, success) in &[(200u64, true), (100, true), (600, false)] {
            stats.num_messages += 1;
            stats.record(*elapsed, *success);
        }

        assert_eq!(3, stats.num_messages);
        assert_eq!(2, stats.num_success);
        assert_eq!(1, stats.num_error);
        assert_eq!(100, stats.min_response_time);
        assert_eq!(600, stats.max_response_time);
        assert_eq!(600, stats.last_response_time);
        assert!(stats.avg_response_time >= stats.min_response_time as f64);
        assert!(stats.avg_response_time <= stats.max_response_time as f64);
        assert!((stats.avg_response_time - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pid_file_written_and_removed() {
        let pid_dir = TempDir::new("courier-pid").unwrap();
        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();

        let mut settings = test_settings("piddy");
        settings.pid_dir = Some(pid_dir.path().to_path_buf());

        let mut service = ServiceBuilder::new(settings)
            .with_registry(ServiceRegistry::new(Box::new(directory.clone())))
            .with_transport(Box::new(transport.clone()))
            .start()
            .unwrap();

        let pid_file = pid_dir
            .path()
            .join("piddy")
            .join(process::id().to_string());
        let contents = fs::read_to_string(&pid_file).unwrap();
        let document: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!("piddy", document["name"]);
        assert_eq!(9000, document["port"]);

        service.running_flag().store(false, Ordering::SeqCst);
        service.run().unwrap();
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_user_handler_overrides_built_in() {
        struct LoudHeartbeat;
        impl MessageHandler for LoudHeartbeat {
            fn handle(
                &mut self,
                _payload: &[u8],
                _context: &ServiceContext<'_>,
            ) -> Result<Vec<u8>, HandlerError> {
                Ok(b"PONG!".to_vec())
            }
        }

        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();
        let mut service = ServiceBuilder::new(test_settings("loud"))
            .with_registry(ServiceRegistry::new(Box::new(directory.clone())))
            .with_transport(Box::new(transport.clone()))
            .with_handler("heartbeat", Box::new(LoudHeartbeat))
            .start()
            .unwrap();
        let (host, port) = (service.identity().host.clone(), service.identity().port);

        let handle = thread::spawn(move || {
            service.run().unwrap();
        });

        let mut socket = client_socket(&transport, &host, port);
        assert_eq!(b"PONG!".to_vec(), request(&mut socket, "heartbeat", b""));
        request(&mut socket, "stop", b"");
        handle.join().unwrap();
    }
}
