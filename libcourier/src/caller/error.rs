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

//! Errors that can occur in the method caller
use std::error::Error;
use std::fmt;

use crate::client::ClientError;
use crate::registry::RegistryError;

/// Returned when the caller is asked about a service it does not manage.
#[derive(Debug)]
pub struct UnknownServiceError(pub String);

impl Error for UnknownServiceError {}

impl fmt::Display for UnknownServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "service: {} unknown", self.0)
    }
}

/// Returned when no pooled client became available in time.
#[derive(Debug)]
pub struct ClientResourceNotAvailableError(pub String);

impl Error for ClientResourceNotAvailableError {}

impl fmt::Display for ClientResourceNotAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "no client available for service: {}", self.0)
    }
}

#[derive(Debug)]
pub enum CallerError {
    UnknownService(UnknownServiceError),
    ResourceNotAvailable(ClientResourceNotAvailableError),
    Client(ClientError),
    Registry(RegistryError),
    Encode(String),
}

impl Error for CallerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CallerError::UnknownService(err) => Some(err),
            CallerError::ResourceNotAvailable(err) => Some(err),
            CallerError::Client(err) => Some(err),
            CallerError::Registry(err) => Some(err),
            CallerError::Encode(_) => None,
        }
    }
}

impl fmt::Display for CallerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CallerError::UnknownService(err) => write!(f, "{}", err),
            CallerError::ResourceNotAvailable(err) => write!(f, "{}", err),
            CallerError::Client(err) => write!(f, "{}", err),
            CallerError::Registry(err) => write!(f, "{}", err),
            CallerError::Encode(msg) => write!(f, "unable to encode request: {}", msg),
        }
    }
}

impl From<UnknownServiceError> for CallerError {
    fn from(err: UnknownServiceError) -> Self {
        CallerError::UnknownService(err)
    }
}

impl From<ClientResourceNotAvailableError> for CallerError {
    fn from(err: ClientResourceNotAvailableError) -> Self {
        CallerError::ResourceNotAvailable(err)
    }
}

impl From<ClientError> for CallerError {
    fn from(err: ClientError) -> Self {
        CallerError::Client(err)
    }
}

impl From<RegistryError> for CallerError {
    fn from(err: RegistryError) -> Self {
        CallerError::Registry(err)
    }
}
