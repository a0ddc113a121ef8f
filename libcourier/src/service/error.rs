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

//! Errors that can occur in a service
use std::error::Error;
use std::fmt;

use crate::config::BadServiceConfigError;
use crate::registry::RegistryError;
use crate::transport::{OpenError, RecvError, SendError};

/// Returned when a structured request cannot be decoded or validated.
#[derive(Debug)]
pub struct BadServiceRequestError(pub String);

impl Error for BadServiceRequestError {}

impl fmt::Display for BadServiceRequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bad service request: {}", self.0)
    }
}

/// Returned when a message handler is misconfigured.
#[derive(Debug)]
pub struct BadServiceMessageHandlerError(pub String);

impl Error for BadServiceMessageHandlerError {}

impl fmt::Display for BadServiceMessageHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "bad service message handler: {}", self.0)
    }
}

/// An error produced while handling a single message.  Handler errors do not
/// stop the dispatch loop; the loop substitutes an error reply and carries
/// on.
#[derive(Debug)]
pub enum HandlerError {
    /// The request payload could not be decoded or validated
    BadRequest(BadServiceRequestError),
    /// The business logic failed
    Uncaught(String),
    /// The response could not be serialized
    Encode(String),
}

impl HandlerError {
    /// The error type name stamped into a structured response header.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::BadRequest(_) => "BadServiceRequestError",
            HandlerError::Uncaught(_) => "ServiceHandlerUncaughtError",
            HandlerError::Encode(_) => "ResponseEncodeError",
        }
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HandlerError::BadRequest(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::BadRequest(err) => write!(f, "{}", err),
            HandlerError::Uncaught(msg) => write!(f, "uncaught handler error: {}", msg),
            HandlerError::Encode(msg) => write!(f, "unable to encode response: {}", msg),
        }
    }
}

impl From<BadServiceRequestError> for HandlerError {
    fn from(err: BadServiceRequestError) -> Self {
        HandlerError::BadRequest(err)
    }
}

/// A fatal service runtime error.
#[derive(Debug)]
pub enum ServiceError {
    Config(BadServiceConfigError),
    Registry(RegistryError),
    Socket(OpenError),
    Send(SendError),
    Recv(RecvError),
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServiceError::Config(err) => Some(err),
            ServiceError::Registry(err) => Some(err),
            ServiceError::Socket(err) => Some(err),
            ServiceError::Send(err) => Some(err),
            ServiceError::Recv(err) => Some(err),
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceError::Config(err) => write!(f, "{}", err),
            ServiceError::Registry(err) => write!(f, "{}", err),
            ServiceError::Socket(err) => write!(f, "unable to open service socket: {}", err),
            ServiceError::Send(err) => write!(f, "unable to send reply: {}", err),
            ServiceError::Recv(err) => write!(f, "unable to receive request: {}", err),
        }
    }
}

impl From<BadServiceConfigError> for ServiceError {
    fn from(err: BadServiceConfigError) -> Self {
        ServiceError::Config(err)
    }
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        ServiceError::Registry(err)
    }
}

impl From<OpenError> for ServiceError {
    fn from(err: OpenError) -> Self {
        ServiceError::Socket(err)
    }
}
