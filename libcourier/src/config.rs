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

//! Service configuration, loaded from a toml file.
//!
//! ```toml
//! [global]
//! description = "greets people"
//! name = "greeter"
//! env = "dev"
//! version = "1.0"
//! # socket_type = "REP"
//! # connect_method = "bind"
//! # host = "greeter-1.example.com"
//! # pid_dir = "/var/lib/courier"
//!
//! [redis_service_registry]
//! host = "127.0.0.1"
//! port = 6379
//! db = 9
//! ```

use serde_derive::Deserialize;

use std::error::Error;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::directory::redis::RedisConfig;
use crate::transport::{ConnectMethod, SocketType};

/// Returned for invalid or missing configuration at startup.
#[derive(Debug)]
pub struct BadServiceConfigError(pub String);

impl Error for BadServiceConfigError {}

impl fmt::Display for BadServiceConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bad service config: {}", self.0)
    }
}

/// Holds configuration values defined in a toml file.
#[derive(Debug, Default, Deserialize)]
pub struct ServiceToml {
    global: Option<TomlGlobalSection>,
    redis_service_registry: Option<TomlRedisSection>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlGlobalSection {
    description: Option<String>,
    name: Option<String>,
    env: Option<String>,
    version: Option<String>,
    socket_type: Option<String>,
    connect_method: Option<String>,
    host: Option<String>,
    pid_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TomlRedisSection {
    host: Option<String>,
    port: Option<u16>,
    db: Option<i64>,
}

impl ServiceToml {
    pub fn from_file(path: &Path) -> Result<ServiceToml, BadServiceConfigError> {
        let contents = fs::read_to_string(path).map_err(|err| {
            BadServiceConfigError(format!("unable to read {}: {}", path.display(), err))
        })?;
        toml::from_str(&contents).map_err(|err| {
            BadServiceConfigError(format!("unable to parse {}: {}", path.display(), err))
        })
    }

    /// Validates the `[global]` section into runtime settings.
    pub fn settings(&self) -> Result<ServiceSettings, BadServiceConfigError> {
        let global = self
            .global
            .as_ref()
            .ok_or_else(|| BadServiceConfigError("missing [global] section".into()))?;

        let required = |value: &Option<String>, field: &str| {
            value.clone().filter(|value| !value.is_empty()).ok_or_else(|| {
                BadServiceConfigError(format!("missing global.{}", field))
            })
        };

        let socket_type = match &global.socket_type {
            Some(socket_type) => socket_type
                .parse()
                .map_err(|err| BadServiceConfigError(format!("{}", err)))?,
            None => SocketType::Rep,
        };
        let connect_method = match &global.connect_method {
            Some(connect_method) => connect_method
                .parse()
                .map_err(|err| BadServiceConfigError(format!("{}", err)))?,
            None => ConnectMethod::Bind,
        };

        Ok(ServiceSettings {
            description: required(&global.description, "description")?,
            name: required(&global.name, "name")?,
            env: required(&global.env, "env")?,
            version: required(&global.version, "version")?,
            socket_type,
            connect_method,
            host: global.host.clone(),
            pid_dir: global.pid_dir.as_ref().map(PathBuf::from),
        })
    }

    /// The `[redis_service_registry]` section, with defaults filled in.
    pub fn redis_config(&self) -> RedisConfig {
        let defaults = RedisConfig::default();
        match &self.redis_service_registry {
            Some(section) => RedisConfig {
                host: section.host.clone().unwrap_or(defaults.host),
                port: section.port.unwrap_or(defaults.port),
                db: section.db.unwrap_or(defaults.db),
            },
            None => defaults,
        }
    }
}

/// The validated settings a service is built from.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    pub description: String,
    pub name: String,
    pub env: String,
    pub version: String,
    pub socket_type: SocketType,
    pub connect_method: ConnectMethod,
    pub host: Option<String>,
    pub pid_dir: Option<PathBuf>,
}

impl ServiceSettings {
    /// Settings with the default socket configuration, no host override,
    /// and no pid file.
    pub fn new(name: &str, env: &str, version: &str, description: &str) -> Self {
        ServiceSettings {
            description: description.into(),
            name: name.into(),
            env: env.into(),
            version: version.into(),
            socket_type: SocketType::Rep,
            connect_method: ConnectMethod::Bind,
            host: None,
            pid_dir: None,
        }
    }
}
