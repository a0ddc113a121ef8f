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

//! The method caller: a per-process façade over per-service pools of
//! clients.
//!
//! At construction, each managed service is resolved to a handful of
//! discovered instances, multiplied by a per-instance client count, and the
//! resulting clients are pooled.  Calls acquire a client, invoke it, and
//! release it; clients killed by an error are dropped by the pool's
//! liveness probe at the next acquisition.

pub mod error;

use log::{debug, error, info};
use uuid::Uuid;

use std::collections::HashMap;
use std::time::Duration;

use crate::client::{ClientOptions, RequestOptions, ServiceClient};
use crate::message::{RpcRequest, RpcResponse};
use crate::pool::{PoolResource, ResourcePool};
use crate::registry::ServiceRegistry;
use crate::transport::Transport;

pub use error::{CallerError, ClientResourceNotAvailableError, UnknownServiceError};

pub const DEFAULT_POOL_SIZE: usize = 5;
pub const CLIENTS_PER_SERVICE_CONFIG: usize = 5;

const RESOURCE_ACQUIRING_TIMEOUT: Duration = Duration::from_secs(2);

/// One managed service and the number of instances to discover for it.
#[derive(Clone, Debug)]
pub struct PoolSpec {
    pub service: String,
    pub pool_size: usize,
}

impl PoolSpec {
    pub fn new(service: &str, pool_size: usize) -> Self {
        PoolSpec {
            service: service.into(),
            pool_size,
        }
    }
}

impl From<&str> for PoolSpec {
    fn from(service: &str) -> Self {
        PoolSpec::new(service, DEFAULT_POOL_SIZE)
    }
}

/// A pooled client.  `good_to_use` forwards the client's liveness flag, so
/// dead clients are silently dropped at acquire time.
pub struct ClientResource {
    pub service: String,
    pub client: ServiceClient,
}

impl PoolResource for ClientResource {
    fn good_to_use(&self) -> bool {
        self.client.alive()
    }
}

pub struct MethodCaller {
    managed_services: HashMap<String, ResourcePool<ClientResource>>,
}

impl MethodCaller {
    /// Discovers and pools clients for every named service.
    ///
    /// Pooled clients run with no heartbeat thread and a blocking timeout;
    /// each call supplies its own timeout through [`RequestOptions`].
    pub fn new(
        registry: &mut ServiceRegistry,
        transport: Box<dyn Transport>,
        services: &[PoolSpec],
    ) -> Result<Self, CallerError> {
        Self::with_clients_per_config(registry, transport, services, CLIENTS_PER_SERVICE_CONFIG)
    }

    pub fn with_clients_per_config(
        registry: &mut ServiceRegistry,
        transport: Box<dyn Transport>,
        services: &[PoolSpec],
        clients_per_config: usize,
    ) -> Result<Self, CallerError> {
        let mut managed_services = HashMap::new();
        for spec in services {
            let service_configs = registry.discover_service(&spec.service, spec.pool_size)?;
            let mut resources = Vec::with_capacity(service_configs.len() * clients_per_config);
            for config in service_configs {
                for i in 0..clients_per_config {
                    debug!(
                        "creating client resource {} for {} instance {}",
                        i + 1,
                        spec.service,
                        config.guid
                    );
                    let client = ServiceClient::from_config(
                        config.clone(),
                        transport.clone(),
                        ClientOptions {
                            default_timeout: None,
                            heartbeat: false,
                            ..ClientOptions::default()
                        },
                    )?;
                    resources.push(ClientResource {
                        service: spec.service.clone(),
                        client,
                    });
                }
            }
            managed_services.insert(spec.service.clone(), ResourcePool::new(resources));
        }
        debug!("created service method caller");
        Ok(MethodCaller { managed_services })
    }

    pub fn manages(&self, service: &str) -> bool {
        self.managed_services.contains_key(service)
    }

    /// Calls `method` on `service` with a raw payload.
    pub fn call(
        &self,
        method: &str,
        service: &str,
        payload: &[u8],
        options: &RequestOptions,
    ) -> Result<Vec<u8>, CallerError> {
        let pool = self
            .managed_services
            .get(service)
            .ok_or_else(|| UnknownServiceError(service.into()))?;

        let mut resource = pool
            .acquire(Some(RESOURCE_ACQUIRING_TIMEOUT))
            .map_err(|_| {
                error!("no client to call method: {} on service: {}", method, service);
                ClientResourceNotAvailableError(service.into())
            })?;
        debug!("using client: {}", resource.client.guid());

        match resource.client.request(method, payload, options) {
            Ok(response) => {
                info!(
                    "received response for {} method from {} service",
                    method, service
                );
                Ok(response)
            }
            Err(err) => {
                error!(
                    "error while calling method: {} on service: {}: {}",
                    method, service, err
                );
                Err(err.into())
            }
        }
    }

    /// Calls `method` on `service` with a structured request: stamps a
    /// fresh request guid, serializes, and decodes the structured response.
    pub fn call_message<Req: RpcRequest, Res: RpcResponse>(
        &self,
        method: &str,
        service: &str,
        request: &mut Req,
        options: &RequestOptions,
    ) -> Result<Res, CallerError> {
        request.header_mut().request_guid = Uuid::new_v4().to_string();
        info!(
            "calling {} method on {} service with request guid: {}",
            method,
            service,
            request.header().request_guid
        );
        let payload =
            serde_json::to_vec(request).map_err(|err| CallerError::Encode(err.to_string()))?;

        let reply = self.call(method, service, &payload, options)?;
        let response: Res = serde_json::from_slice(&reply)
            .map_err(|err| CallerError::Client(crate::client::ClientError::Decode(err.to_string())))?;

        let response_type = if response.header().success { "good" } else { "bad" };
        info!(
            "received {} response for {} method from {} service for request guid: {} in {} \
             microseconds",
            response_type,
            method,
            service,
            response.header().request_guid,
            response.header().response_time
        );
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    use crate::directory::memory::MemoryDirectory;
    use crate::registry::ServiceConfig;
    use crate::transport::inproc::InprocTransport;
    use crate::transport::{ConnectMethod, MessageSocket, SocketType, Transport};

    fn service_side_config(name: &str, guid: &str, port: u16) -> ServiceConfig {
        ServiceConfig {
            name: name.into(),
            env: "test".into(),
            guid: guid.into(),
            pid: 42,
            host: "localhost".into(),
            port,
            socket_type: SocketType::Rep,
            connect_method: ConnectMethod::Bind,
            functions: vec!["echo".to_string(), "heartbeat".to_string()]
                .into_iter()
                .collect(),
            start_time: 0,
            alive: true,
        }
    }

    // binds a rep socket and echoes request payloads until it is torn down
    fn spawn_echo_server(transport: &InprocTransport, port: u16) -> thread::JoinHandle<()> {
        let mut transport = transport.clone();
        let mut socket = transport
            .open(
                SocketType::Rep,
                ConnectMethod::Bind,
                &format!("tcp://*:{}", port),
            )
            .expect("failed to bind echo server");
        thread::spawn(move || echo_loop(&mut socket))
    }

    fn echo_loop(socket: &mut Box<dyn MessageSocket>) {
        while let Ok(request) = socket.recv(Some(Duration::from_millis(500))) {
            let payload = request.into_iter().nth(1).unwrap_or_default();
            if payload == b"slow" {
                thread::sleep(Duration::from_millis(3000));
            }
            if socket.send(&[payload]).is_err() {
                break;
            }
        }
    }

    fn caller_for(
        directory: &MemoryDirectory,
        transport: &InprocTransport,
        service: &str,
        clients: usize,
    ) -> MethodCaller {
        let mut registry = ServiceRegistry::new(Box::new(directory.clone()));
        MethodCaller::with_clients_per_config(
            &mut registry,
            Box::new(transport.clone()),
            &[PoolSpec::new(service, 1)],
            clients,
        )
        .expect("failed to build method caller")
    }

    #[test]
    fn test_call_round_trip() {
        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();
        let server = spawn_echo_server(&transport, 9200);

        let mut registry = ServiceRegistry::new(Box::new(directory.clone()));
        registry
            .register_service(&service_side_config("echo", "e1", 9200))
            .unwrap();

        let caller = caller_for(&directory, &transport, "echo", 2);
        let reply = caller
            .call("echo", "echo", b"hello", &RequestOptions::default())
            .unwrap();
        assert_eq!(b"hello".to_vec(), reply);

        server.join().unwrap();
    }

    #[test]
    fn test_unknown_service_is_rejected() {
        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();
        let server = spawn_echo_server(&transport, 9201);

        let mut registry = ServiceRegistry::new(Box::new(directory.clone()));
        registry
            .register_service(&service_side_config("echo", "e1", 9201))
            .unwrap();

        let caller = caller_for(&directory, &transport, "echo", 1);
        match caller.call("echo", "unmanaged", b"hello", &RequestOptions::default()) {
            Err(CallerError::UnknownService(err)) => assert_eq!("unmanaged", err.0),
            other => panic!("Expected Err(UnknownService), got {:?}", other.is_ok()),
        }

        server.join().unwrap();
    }

    #[test]
    fn test_pool_exhaustion_times_out_after_two_seconds() {
        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();
        let server = spawn_echo_server(&transport, 9202);

        let mut registry = ServiceRegistry::new(Box::new(directory.clone()));
        registry
            .register_service(&service_side_config("echo", "e1", 9202))
            .unwrap();

        // a single pooled client shared by two concurrent calls
        let caller = Arc::new(caller_for(&directory, &transport, "echo", 1));

        let slow_caller = Arc::clone(&caller);
        let slow = thread::spawn(move || {
            slow_caller
                .call("echo", "echo", b"slow", &RequestOptions::default())
                .unwrap()
        });

        // let the slow call win the only client
        thread::sleep(Duration::from_millis(200));

        let attempted = Instant::now();
        match caller.call("echo", "echo", b"fast", &RequestOptions::default()) {
            Err(CallerError::ResourceNotAvailable(_)) => (),
            other => panic!("Expected Err(ResourceNotAvailable), got {:?}", other.is_ok()),
        }
        let waited = attempted.elapsed();
        assert!(waited >= Duration::from_millis(1900));
        assert!(waited < Duration::from_millis(3500));

        assert_eq!(b"slow".to_vec(), slow.join().unwrap());
        server.join().unwrap();
    }

    #[test]
    fn test_call_message_stamps_request_guid() {
        use serde_derive::{Deserialize, Serialize};

        use crate::message::{RequestHeader, ResponseHeader};

        #[derive(Debug, Default, Deserialize, Serialize)]
        struct RawRequest {
            header: RequestHeader,
            body: String,
        }

        impl RpcRequest for RawRequest {
            fn header(&self) -> &RequestHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut RequestHeader {
                &mut self.header
            }
        }

        #[derive(Debug, Default, Deserialize, Serialize)]
        struct RawResponse {
            header: ResponseHeader,
            #[serde(default)]
            body: String,
        }

        impl RpcResponse for RawResponse {
            fn header(&self) -> &ResponseHeader {
                &self.header
            }

            fn header_mut(&mut self) -> &mut ResponseHeader {
                &mut self.header
            }
        }

        let directory = MemoryDirectory::new();
        let transport = InprocTransport::default();

        // echoes the request document back, so the response header carries
        // whatever guid the caller stamped
        let server = spawn_echo_server(&transport, 9203);

        let mut registry = ServiceRegistry::new(Box::new(directory.clone()));
        registry
            .register_service(&service_side_config("echo", "e1", 9203))
            .unwrap();

        let caller = caller_for(&directory, &transport, "echo", 1);
        let mut request = RawRequest::default();
        request.body = "hello".into();

        let response: RawResponse = caller
            .call_message("echo", "echo", &mut request, &RequestOptions::default())
            .unwrap();
        assert!(!request.header.request_guid.is_empty());
        assert_eq!(request.header.request_guid, response.header.request_guid);

        server.join().unwrap();
    }
}
