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

//! Duplex messaging transports.
//!
//! A transport opens message-oriented sockets of a given socket type, either
//! bound to a local endpoint or connected to a remote one.  Messages are
//! multipart: a request travels as the two frames `[function_name, payload]`
//! and a reply travels as a single frame.

pub mod inproc;
pub mod raw;
#[cfg(feature = "zmq-transport")]
pub mod zmq;

use std::fmt;
use std::io::Error as IoError;
use std::str::FromStr;
use std::time::Duration;

/// The socket types understood by the framework.
///
/// A service declares the type of the socket it opened; clients open the
/// paired type (see [`SocketType::pair`]).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SocketType {
    Req,
    Rep,
    Pub,
    Sub,
    Push,
    Pull,
}

impl SocketType {
    /// Returns the counterpart a client must open to talk to a socket of
    /// this type.  Applying `pair` twice yields the original type.
    pub fn pair(self) -> SocketType {
        match self {
            SocketType::Req => SocketType::Rep,
            SocketType::Rep => SocketType::Req,
            SocketType::Pub => SocketType::Sub,
            SocketType::Sub => SocketType::Pub,
            SocketType::Push => SocketType::Pull,
            SocketType::Pull => SocketType::Push,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SocketType::Req => "REQ",
            SocketType::Rep => "REP",
            SocketType::Pub => "PUB",
            SocketType::Sub => "SUB",
            SocketType::Push => "PUSH",
            SocketType::Pull => "PULL",
        }
    }
}

impl fmt::Display for SocketType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SocketType {
    type Err = UnknownSocketTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "REQ" => Ok(SocketType::Req),
            "REP" => Ok(SocketType::Rep),
            "PUB" => Ok(SocketType::Pub),
            "SUB" => Ok(SocketType::Sub),
            "PUSH" => Ok(SocketType::Push),
            "PULL" => Ok(SocketType::Pull),
            _ => Err(UnknownSocketTypeError(format!(
                "no corresponding socket pair for socket type: {}",
                s
            ))),
        }
    }
}

/// Whether a socket binds to a local endpoint or connects to a remote one.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectMethod {
    Bind,
    Connect,
}

impl ConnectMethod {
    /// The method a client must use given the method the service used.
    pub fn pair(self) -> ConnectMethod {
        match self {
            ConnectMethod::Bind => ConnectMethod::Connect,
            ConnectMethod::Connect => ConnectMethod::Bind,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectMethod::Bind => "bind",
            ConnectMethod::Connect => "connect",
        }
    }
}

impl fmt::Display for ConnectMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectMethod {
    type Err = UnknownSocketTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bind" => Ok(ConnectMethod::Bind),
            "connect" => Ok(ConnectMethod::Connect),
            _ => Err(UnknownSocketTypeError(format!(
                "connect method {} is not one of [bind, connect]",
                s
            ))),
        }
    }
}

/// Builds the endpoint string for a host/port pair: bound sockets listen on
/// every interface, connected sockets address the host directly.
pub fn endpoint(method: ConnectMethod, host: &str, port: u16) -> String {
    match method {
        ConnectMethod::Bind => format!("tcp://*:{}", port),
        ConnectMethod::Connect => format!("tcp://{}:{}", host, port),
    }
}

/// A single duplex messaging socket.
///
/// Sockets are owned by exactly one task; they are `Send` so they can be
/// moved into a thread, but they are never shared.
pub trait MessageSocket: Send {
    /// Send one multipart message.
    fn send(&mut self, frames: &[Vec<u8>]) -> Result<(), SendError>;

    /// Receive one multipart message, waiting up to `timeout`; `None` blocks
    /// until a message arrives.
    fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<Vec<u8>>, RecvError>;

    fn endpoint(&self) -> String;

    /// Release the underlying endpoint resources.  The socket must not be
    /// used afterwards.
    fn close(&mut self) -> Result<(), DisconnectError>;
}

/// Factory-pattern based type for creating messaging sockets.
pub trait Transport: Send {
    fn open(
        &mut self,
        socket_type: SocketType,
        connect_method: ConnectMethod,
        endpoint: &str,
    ) -> Result<Box<dyn MessageSocket>, OpenError>;

    /// Clone this instance into a boxed, dynamic trait
    fn clone_box(&self) -> Box<dyn Transport>;
}

impl Clone for Box<dyn Transport> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

// -- Errors --

macro_rules! impl_from_io_error {
    ($err:ident) => {
        impl From<IoError> for $err {
            fn from(io_error: IoError) -> Self {
                $err::IoError(io_error)
            }
        }
    };
}

#[derive(Debug)]
pub struct UnknownSocketTypeError(pub String);

impl std::error::Error for UnknownSocketTypeError {}

impl fmt::Display for UnknownSocketTypeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unknown socket type: {}", self.0)
    }
}

#[derive(Debug)]
pub enum SendError {
    IoError(IoError),
    ProtocolError(String),
    Disconnected,
}

impl_from_io_error!(SendError);

impl std::error::Error for SendError {}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SendError::IoError(err) => write!(f, "io error while sending: {}", err),
            SendError::ProtocolError(err) => write!(f, "protocol error while sending: {}", err),
            SendError::Disconnected => f.write_str("peer disconnected"),
        }
    }
}

#[derive(Debug)]
pub enum RecvError {
    IoError(IoError),
    ProtocolError(String),
    Timeout,
    Disconnected,
}

impl_from_io_error!(RecvError);

impl std::error::Error for RecvError {}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecvError::IoError(err) => write!(f, "io error while receiving: {}", err),
            RecvError::ProtocolError(err) => write!(f, "protocol error while receiving: {}", err),
            RecvError::Timeout => f.write_str("timed out waiting for a message"),
            RecvError::Disconnected => f.write_str("peer disconnected"),
        }
    }
}

#[derive(Debug)]
pub enum DisconnectError {
    IoError(IoError),
    ProtocolError(String),
}

impl_from_io_error!(DisconnectError);

impl std::error::Error for DisconnectError {}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DisconnectError::IoError(err) => write!(f, "io error while disconnecting: {}", err),
            DisconnectError::ProtocolError(err) => {
                write!(f, "protocol error while disconnecting: {}", err)
            }
        }
    }
}

#[derive(Debug)]
pub enum OpenError {
    IoError(IoError),
    ProtocolError(String),
    Unsupported(String),
}

impl_from_io_error!(OpenError);

impl std::error::Error for OpenError {}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OpenError::IoError(err) => write!(f, "io error while opening socket: {}", err),
            OpenError::ProtocolError(err) => {
                write!(f, "protocol error while opening socket: {}", err)
            }
            OpenError::Unsupported(err) => write!(f, "unsupported socket configuration: {}", err),
        }
    }
}
