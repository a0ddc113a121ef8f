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

//! Errors that can occur while registering or discovering services
use std::error::Error;
use std::fmt;

use crate::directory::DirectoryError;

#[derive(Debug)]
pub struct ServiceRegistrationError(pub String);

impl Error for ServiceRegistrationError {}

impl fmt::Display for ServiceRegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unable to register service: {}", self.0)
    }
}

#[derive(Debug)]
pub struct ServiceNotAvailableError(pub String);

impl Error for ServiceNotAvailableError {}

impl fmt::Display for ServiceNotAvailableError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "service: {} not available", self.0)
    }
}

#[derive(Debug)]
pub enum RegistryError {
    Registration(ServiceRegistrationError),
    NotAvailable(ServiceNotAvailableError),
    /// Returned when a stored instance record cannot be decoded
    InvalidRecord(String),
    Store(DirectoryError),
}

impl Error for RegistryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RegistryError::Registration(err) => Some(err),
            RegistryError::NotAvailable(err) => Some(err),
            RegistryError::InvalidRecord(_) => None,
            RegistryError::Store(err) => Some(err),
        }
    }
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::Registration(err) => write!(f, "{}", err),
            RegistryError::NotAvailable(err) => write!(f, "{}", err),
            RegistryError::InvalidRecord(msg) => {
                write!(f, "invalid service instance record: {}", msg)
            }
            RegistryError::Store(err) => write!(f, "{}", err),
        }
    }
}

impl From<ServiceRegistrationError> for RegistryError {
    fn from(err: ServiceRegistrationError) -> Self {
        RegistryError::Registration(err)
    }
}

impl From<ServiceNotAvailableError> for RegistryError {
    fn from(err: ServiceNotAvailableError) -> Self {
        RegistryError::NotAvailable(err)
    }
}

impl From<DirectoryError> for RegistryError {
    fn from(err: DirectoryError) -> Self {
        RegistryError::Store(err)
    }
}
