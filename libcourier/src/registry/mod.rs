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

//! The service registry: a shared catalogue of live service instances and a
//! per-host pool of allocatable ports, stored in a [`Directory`].
//!
//! Key layout (interop across instances depends on it staying bit-exact):
//!
//! - `se:s`: set of known service names
//! - `se:s:<name>:g`: set of instance guids for a service
//! - `hm:s:<name>:g:<guid>`: the instance record
//! - `zs:h:<host>:p`: scored set of free ports on a host

mod error;

use log::{debug, warn};
use rand::seq::SliceRandom;

use std::collections::{HashMap, HashSet};

use crate::directory::{Directory, DirectoryOp};
use crate::transport::{ConnectMethod, SocketType};

pub use error::{RegistryError, ServiceNotAvailableError, ServiceRegistrationError};

const STARTING_PORT: u16 = 9000;
const PORT_BATCH_SIZE: u16 = 100;

pub(crate) mod keys {
    /// Key for the set of available services.
    pub fn services() -> String {
        "se:s".into()
    }

    /// Key for the set of available providers of a service.
    pub fn service_guids(service_name: &str) -> String {
        format!("se:s:{}:g", service_name)
    }

    /// Key for the map describing a particular provider of a service.
    pub fn service_instance(service_name: &str, service_guid: &str) -> String {
        format!("hm:s:{}:g:{}", service_name, service_guid)
    }

    /// Key for the scored set of available ports on a host.
    pub fn host_ports(host: &str) -> String {
        format!("zs:h:{}:p", host)
    }
}

/// A record describing one live service instance.
///
/// The `socket_type` and `connect_method` fields denote the *service* side
/// of the duplex pair; [`ServiceConfig::client_view`] flips them to the side
/// a client must take.  Records are created atomically at registration,
/// never mutated, and destroyed at deregistration.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    pub env: String,
    pub guid: String,
    pub pid: u32,
    pub host: String,
    pub port: u16,
    pub socket_type: SocketType,
    pub connect_method: ConnectMethod,
    pub functions: HashSet<String>,
    pub start_time: u64,
    pub alive: bool,
}

impl ServiceConfig {
    /// The view of this config a client should use: socket type and connect
    /// method flipped to their counterparts.
    pub fn client_view(mut self) -> ServiceConfig {
        self.socket_type = self.socket_type.pair();
        self.connect_method = self.connect_method.pair();
        self
    }

    fn validate(&self) -> Result<(), ServiceRegistrationError> {
        let missing = |field: &str| {
            ServiceRegistrationError(format!("mandatory field: {} not provided", field))
        };
        if self.name.is_empty() {
            return Err(missing("name"));
        }
        if self.host.is_empty() {
            return Err(missing("host"));
        }
        if self.port == 0 {
            return Err(missing("port"));
        }
        if self.guid.is_empty() {
            return Err(missing("guid"));
        }
        if self.functions.is_empty() {
            return Err(missing("functions"));
        }
        Ok(())
    }

    /// The string entries persisted for this record.  Collection-typed
    /// fields are JSON-encoded; everything else is stored verbatim.
    fn to_entries(&self) -> Vec<(String, String)> {
        let mut functions: Vec<&String> = self.functions.iter().collect();
        functions.sort();
        vec![
            ("name".into(), self.name.clone()),
            ("env".into(), self.env.clone()),
            ("guid".into(), self.guid.clone()),
            ("pid".into(), self.pid.to_string()),
            ("host".into(), self.host.clone()),
            ("port".into(), self.port.to_string()),
            ("socket_type".into(), self.socket_type.as_str().into()),
            (
                "connect_method".into(),
                self.connect_method.as_str().into(),
            ),
            (
                "functions".into(),
                serde_json::to_string(&functions).unwrap_or_else(|_| "[]".into()),
            ),
            ("start_time".into(), self.start_time.to_string()),
            ("alive".into(), self.alive.to_string()),
        ]
    }

    fn from_entries(entries: &HashMap<String, String>) -> Result<ServiceConfig, RegistryError> {
        let field = |name: &str| -> Result<&String, RegistryError> {
            entries
                .get(name)
                .ok_or_else(|| RegistryError::InvalidRecord(format!("missing field: {}", name)))
        };
        let invalid = |name: &str, err: &dyn std::fmt::Display| {
            RegistryError::InvalidRecord(format!("field {}: {}", name, err))
        };

        let functions: Vec<String> = serde_json::from_str(field("functions")?)
            .map_err(|err| invalid("functions", &err))?;

        Ok(ServiceConfig {
            name: field("name")?.clone(),
            env: field("env")?.clone(),
            guid: field("guid")?.clone(),
            pid: serde_json::from_str(field("pid")?).map_err(|err| invalid("pid", &err))?,
            host: field("host")?.clone(),
            port: serde_json::from_str(field("port")?).map_err(|err| invalid("port", &err))?,
            socket_type: field("socket_type")?
                .parse()
                .map_err(|err| invalid("socket_type", &err))?,
            connect_method: field("connect_method")?
                .parse()
                .map_err(|err| invalid("connect_method", &err))?,
            functions: functions.into_iter().collect(),
            start_time: serde_json::from_str(field("start_time")?)
                .map_err(|err| invalid("start_time", &err))?,
            alive: serde_json::from_str(field("alive")?).map_err(|err| invalid("alive", &err))?,
        })
    }
}

/// Registry of live service instances, backed by a shared directory.
///
/// Every holder opens its own directory handle; cross-process coordination
/// happens entirely through the watched directory transactions.
pub struct ServiceRegistry {
    directory: Box<dyn Directory>,
}

impl ServiceRegistry {
    pub fn new(directory: Box<dyn Directory>) -> Self {
        ServiceRegistry { directory }
    }

    /// Adds the instance described by `config` to the catalogue.
    pub fn register_service(&mut self, config: &ServiceConfig) -> Result<(), RegistryError> {
        config.validate()?;

        let services_key = keys::services();
        let service_guids_key = keys::service_guids(&config.name);
        let service_instance_key = keys::service_instance(&config.name, &config.guid);

        let watch = vec![
            services_key.clone(),
            service_guids_key.clone(),
            service_instance_key.clone(),
        ];
        self.directory.update(&watch, &mut |_| {
            Ok(vec![
                DirectoryOp::AddToSet {
                    key: services_key.clone(),
                    member: config.name.clone(),
                },
                DirectoryOp::AddToSet {
                    key: service_guids_key.clone(),
                    member: config.guid.clone(),
                },
                DirectoryOp::PutMap {
                    key: service_instance_key.clone(),
                    entries: config.to_entries(),
                },
            ])
        })?;
        debug!(
            "registered {} service instance {} at {}:{}",
            config.name, config.guid, config.host, config.port
        );
        Ok(())
    }

    /// Allocates the smallest free port on `host`.
    ///
    /// An empty pool is seeded with a batch of sequential ports starting at
    /// 9000; a pool down to its last port gets a fresh batch appended
    /// starting just above it.
    pub fn next_available_port(
        &mut self,
        _service_name: &str,
        _service_guid: &str,
        host: &str,
    ) -> Result<u16, RegistryError> {
        let host_ports_key = keys::host_ports(host);

        let mut allocated: Option<u16> = None;
        self.directory
            .update(&[host_ports_key.clone()], &mut |reader| {
                let mut ops = Vec::new();
                let count = reader.scored_set_len(&host_ports_key)?;

                let smallest = if count == 0 {
                    ops.push(port_batch(&host_ports_key, STARTING_PORT));
                    STARTING_PORT
                } else {
                    let smallest = parse_port(reader.scored_set_first(&host_ports_key)?)?;
                    if count == 1 {
                        ops.push(port_batch(&host_ports_key, smallest + 1));
                    }
                    smallest
                };

                ops.push(DirectoryOp::RemoveScored {
                    key: host_ports_key.clone(),
                    member: smallest.to_string(),
                });
                allocated = Some(smallest);
                Ok(ops)
            })?;

        allocated.ok_or_else(|| {
            RegistryError::InvalidRecord(format!("no port allocated for host {}", host))
        })
    }

    /// Removes the instance from the catalogue and returns its port to the
    /// host pool.  The last instance of a service evicts the service from
    /// the services set; the last service removes the set itself.
    pub fn deregister_service(
        &mut self,
        service_name: &str,
        service_guid: &str,
        host: &str,
    ) -> Result<(), RegistryError> {
        let services_key = keys::services();
        let service_guids_key = keys::service_guids(service_name);
        let service_instance_key = keys::service_instance(service_name, service_guid);
        let host_ports_key = keys::host_ports(host);

        let watch = vec![
            services_key.clone(),
            service_guids_key.clone(),
            service_instance_key.clone(),
            host_ports_key.clone(),
        ];
        self.directory.update(&watch, &mut |reader| {
            let services_card = reader.set_len(&services_key)?;
            let service_guids_card = reader.set_len(&service_guids_key)?;
            let instance = reader.map_entries(&service_instance_key)?;

            let mut ops = vec![
                DirectoryOp::DeleteKey {
                    key: service_instance_key.clone(),
                },
                DirectoryOp::RemoveFromSet {
                    key: service_guids_key.clone(),
                    member: service_guid.into(),
                },
            ];
            if service_guids_card == 1 {
                ops.push(DirectoryOp::DeleteKey {
                    key: service_guids_key.clone(),
                });
                ops.push(DirectoryOp::RemoveFromSet {
                    key: services_key.clone(),
                    member: service_name.into(),
                });
                if services_card == 1 {
                    ops.push(DirectoryOp::DeleteKey {
                        key: services_key.clone(),
                    });
                }
            }

            // A record without a port is tolerated; the pool is left as-is.
            match instance.get("port").map(|port| port.parse::<u16>()) {
                Some(Ok(port)) => ops.push(DirectoryOp::AddScored {
                    key: host_ports_key.clone(),
                    entries: vec![(u64::from(port), port.to_string())],
                }),
                Some(Err(_)) => warn!(
                    "not returning unparseable port for {} instance {}",
                    service_name, service_guid
                ),
                None => (),
            }
            Ok(ops)
        })?;
        debug!(
            "deregistered {} service instance {}",
            service_name, service_guid
        );
        Ok(())
    }

    /// Returns up to `num` randomly sampled configs for live instances of
    /// the named service, each flipped to the client view.
    pub fn discover_service(
        &mut self,
        service_name: &str,
        num: usize,
    ) -> Result<Vec<ServiceConfig>, RegistryError> {
        if !self
            .directory
            .set_contains(&keys::services(), service_name)?
        {
            return Err(ServiceNotAvailableError(service_name.into()).into());
        }

        let mut available_guids = self
            .directory
            .set_members(&keys::service_guids(service_name))?;
        available_guids.sort();

        let mut rng = rand::thread_rng();
        let sample_guids: Vec<String> = if available_guids.len() > num {
            available_guids
                .choose_multiple(&mut rng, num)
                .cloned()
                .collect()
        } else {
            available_guids
        };

        let mut configs = Vec::with_capacity(sample_guids.len());
        for guid in sample_guids {
            let entries = self
                .directory
                .map_entries(&keys::service_instance(service_name, &guid))?;
            if entries.is_empty() {
                // the instance deregistered between the sample and the read
                continue;
            }
            configs.push(ServiceConfig::from_entries(&entries)?.client_view());
        }
        Ok(configs)
    }
}

fn port_batch(key: &str, starting_port: u16) -> DirectoryOp {
    DirectoryOp::AddScored {
        key: key.into(),
        entries: (starting_port..starting_port + PORT_BATCH_SIZE)
            .map(|port| (u64::from(port), port.to_string()))
            .collect(),
    }
}

fn parse_port(member: Option<String>) -> Result<u16, crate::directory::DirectoryError> {
    let member = member.ok_or_else(|| {
        crate::directory::DirectoryError::OperationError("port pool unexpectedly empty".into())
    })?;
    member.parse().map_err(|_| {
        crate::directory::DirectoryError::OperationError(format!(
            "port pool member is not a port: {}",
            member
        ))
    })
}
