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

//! A ZeroMQ transport, available behind the `zmq-transport` feature.
//!
//! This is the only backend that supports all six socket types.  Sockets are
//! opened with linger 0 so a closed socket never blocks process shutdown on
//! unsent messages.

use std::time::Duration;

use crate::transport::{
    ConnectMethod, DisconnectError, MessageSocket, OpenError, RecvError, SendError, SocketType,
    Transport,
};

#[derive(Clone)]
pub struct ZmqTransport {
    context: zmq::Context,
}

impl Default for ZmqTransport {
    fn default() -> Self {
        ZmqTransport {
            context: zmq::Context::new(),
        }
    }
}

impl Transport for ZmqTransport {
    fn open(
        &mut self,
        socket_type: SocketType,
        connect_method: ConnectMethod,
        endpoint: &str,
    ) -> Result<Box<dyn MessageSocket>, OpenError> {
        let socket = self
            .context
            .socket(zmq_socket_type(socket_type))
            .map_err(|err| OpenError::ProtocolError(err.to_string()))?;
        socket
            .set_linger(0)
            .map_err(|err| OpenError::ProtocolError(err.to_string()))?;
        match connect_method {
            ConnectMethod::Bind => socket
                .bind(endpoint)
                .map_err(|err| OpenError::ProtocolError(err.to_string()))?,
            ConnectMethod::Connect => socket
                .connect(endpoint)
                .map_err(|err| OpenError::ProtocolError(err.to_string()))?,
        }
        Ok(Box::new(ZmqSocket {
            endpoint: endpoint.into(),
            socket,
        }))
    }

    fn clone_box(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

fn zmq_socket_type(socket_type: SocketType) -> zmq::SocketType {
    match socket_type {
        SocketType::Req => zmq::REQ,
        SocketType::Rep => zmq::REP,
        SocketType::Pub => zmq::PUB,
        SocketType::Sub => zmq::SUB,
        SocketType::Push => zmq::PUSH,
        SocketType::Pull => zmq::PULL,
    }
}

pub struct ZmqSocket {
    endpoint: String,
    socket: zmq::Socket,
}

impl MessageSocket for ZmqSocket {
    fn send(&mut self, frames: &[Vec<u8>]) -> Result<(), SendError> {
        self.socket
            .send_multipart(frames.iter().map(|frame| &frame[..]), 0)
            .map_err(|err| SendError::ProtocolError(err.to_string()))
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<Vec<u8>>, RecvError> {
        let timeout_ms = match timeout {
            Some(timeout) => timeout.as_millis() as i32,
            None => -1,
        };
        self.socket
            .set_rcvtimeo(timeout_ms)
            .map_err(|err| RecvError::ProtocolError(err.to_string()))?;
        match self.socket.recv_multipart(0) {
            Ok(frames) => Ok(frames),
            Err(zmq::Error::EAGAIN) => Err(RecvError::Timeout),
            Err(err) => Err(RecvError::ProtocolError(err.to_string())),
        }
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn close(&mut self) -> Result<(), DisconnectError> {
        // zmq sockets are closed when dropped; linger 0 makes that immediate
        Ok(())
    }
}
