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

//! Errors that can occur in a service client
use std::error::Error;
use std::fmt;
use std::time::Duration;

use crate::registry::RegistryError;

/// Returned when a client asks for a function the instance does not
/// advertise.  No send is attempted.
#[derive(Debug)]
pub struct ServiceFunctionNotAvailableError {
    pub service: String,
    pub function: String,
}

impl Error for ServiceFunctionNotAvailableError {}

impl fmt::Display for ServiceFunctionNotAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "function: {} not available for service: {}",
            self.function, self.service
        )
    }
}

/// Returned when every send attempt ran out its receive timeout.
#[derive(Debug)]
pub struct ServiceClientTimeoutError {
    pub service: String,
    pub function: String,
    pub timeout: Option<Duration>,
    pub max_tries: u32,
    pub sleep_before_retry: Duration,
}

impl Error for ServiceClientTimeoutError {}

impl fmt::Display for ServiceClientTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "can not complete function: {} of service: {} in {} tries (timeout: {:?}, \
             sleep_before_retry: {:?})",
            self.function, self.service, self.max_tries, self.timeout, self.sleep_before_retry
        )
    }
}

#[derive(Debug)]
pub enum ClientError {
    FunctionNotAvailable(ServiceFunctionNotAvailableError),
    /// A receive timeout; retried with exponential backoff until terminal
    Timeout(ServiceClientTimeoutError),
    /// A transport-level or unexpected error; terminal for the call and for
    /// the client
    Transport(String),
    /// The client was already shut down or marked dead
    Dead(String),
    Registry(RegistryError),
    Encode(String),
    Decode(String),
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::FunctionNotAvailable(err) => Some(err),
            ClientError::Timeout(err) => Some(err),
            ClientError::Registry(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClientError::FunctionNotAvailable(err) => write!(f, "{}", err),
            ClientError::Timeout(err) => write!(f, "{}", err),
            ClientError::Transport(msg) => write!(f, "client transport error: {}", msg),
            ClientError::Dead(msg) => write!(f, "client is not alive: {}", msg),
            ClientError::Registry(err) => write!(f, "{}", err),
            ClientError::Encode(msg) => write!(f, "unable to encode request: {}", msg),
            ClientError::Decode(msg) => write!(f, "unable to decode response: {}", msg),
        }
    }
}

impl From<ServiceFunctionNotAvailableError> for ClientError {
    fn from(err: ServiceFunctionNotAvailableError) -> Self {
        ClientError::FunctionNotAvailable(err)
    }
}

impl From<ServiceClientTimeoutError> for ClientError {
    fn from(err: ServiceClientTimeoutError) -> Self {
        ClientError::Timeout(err)
    }
}

impl From<RegistryError> for ClientError {
    fn from(err: RegistryError) -> Self {
        ClientError::Registry(err)
    }
}
