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

//! An in-process transport, primarily used for testing and local wiring.
//!
//! Only REQ/REP sockets are supported.  Endpoints are normalized so that a
//! service bound to `tcp://*:<port>` meets a client connected to
//! `tcp://localhost:<port>`.

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use std::collections::HashMap;
use std::io::{Error as IoError, ErrorKind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::transport::{
    ConnectMethod, DisconnectError, MessageSocket, OpenError, RecvError, SendError, SocketType,
    Transport,
};

struct InprocRequest {
    frames: Vec<Vec<u8>>,
    reply_tx: Sender<Vec<Vec<u8>>>,
}

type EndpointMap = Arc<Mutex<HashMap<String, Sender<InprocRequest>>>>;

#[derive(Clone, Default)]
pub struct InprocTransport {
    endpoints: EndpointMap,
}

impl Transport for InprocTransport {
    fn open(
        &mut self,
        socket_type: SocketType,
        connect_method: ConnectMethod,
        endpoint: &str,
    ) -> Result<Box<dyn MessageSocket>, OpenError> {
        let address = normalize(endpoint);
        match (socket_type, connect_method) {
            (SocketType::Rep, ConnectMethod::Bind) => {
                let (request_tx, request_rx) = unbounded();
                self.endpoints
                    .lock()
                    .expect("endpoint map lock poisoned")
                    .insert(address.clone(), request_tx);
                Ok(Box::new(InprocReplySocket {
                    endpoint: endpoint.into(),
                    address,
                    endpoints: Arc::clone(&self.endpoints),
                    request_rx,
                    pending_reply: None,
                }))
            }
            (SocketType::Req, ConnectMethod::Connect) => {
                let request_tx = self
                    .endpoints
                    .lock()
                    .expect("endpoint map lock poisoned")
                    .get(&address)
                    .cloned()
                    .ok_or_else(|| {
                        OpenError::IoError(IoError::new(ErrorKind::ConnectionRefused, "no listener"))
                    })?;
                Ok(Box::new(InprocRequestSocket {
                    endpoint: endpoint.into(),
                    request_tx,
                    awaiting: None,
                }))
            }
            _ => Err(OpenError::Unsupported(format!(
                "inproc transport does not support {} sockets with method {}",
                socket_type, connect_method
            ))),
        }
    }

    fn clone_box(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

fn normalize(endpoint: &str) -> String {
    let stripped = endpoint.trim_start_matches("tcp://");
    if let Some(port) = stripped.strip_prefix("*:") {
        format!("localhost:{}", port)
    } else {
        stripped.to_string()
    }
}

pub struct InprocReplySocket {
    endpoint: String,
    address: String,
    endpoints: EndpointMap,
    request_rx: Receiver<InprocRequest>,
    pending_reply: Option<Sender<Vec<Vec<u8>>>>,
}

impl MessageSocket for InprocReplySocket {
    fn send(&mut self, frames: &[Vec<u8>]) -> Result<(), SendError> {
        let reply_tx = self
            .pending_reply
            .take()
            .ok_or_else(|| SendError::ProtocolError("no request awaiting a reply".into()))?;
        reply_tx
            .send(frames.to_vec())
            .map_err(|_| SendError::Disconnected)
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<Vec<u8>>, RecvError> {
        let request = match timeout {
            Some(timeout) => self.request_rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => RecvError::Timeout,
                RecvTimeoutError::Disconnected => RecvError::Disconnected,
            })?,
            None => self.request_rx.recv().map_err(|_| RecvError::Disconnected)?,
        };
        self.pending_reply = Some(request.reply_tx);
        Ok(request.frames)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn close(&mut self) -> Result<(), DisconnectError> {
        self.endpoints
            .lock()
            .expect("endpoint map lock poisoned")
            .remove(&self.address);
        Ok(())
    }
}

pub struct InprocRequestSocket {
    endpoint: String,
    request_tx: Sender<InprocRequest>,
    awaiting: Option<Receiver<Vec<Vec<u8>>>>,
}

impl MessageSocket for InprocRequestSocket {
    fn send(&mut self, frames: &[Vec<u8>]) -> Result<(), SendError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.request_tx
            .send(InprocRequest {
                frames: frames.to_vec(),
                reply_tx,
            })
            .map_err(|_| SendError::Disconnected)?;
        self.awaiting = Some(reply_rx);
        Ok(())
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<Vec<u8>>, RecvError> {
        let reply_rx = self
            .awaiting
            .take()
            .ok_or_else(|| RecvError::ProtocolError("no request in flight".into()))?;
        match timeout {
            Some(timeout) => reply_rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => RecvError::Timeout,
                RecvTimeoutError::Disconnected => RecvError::Disconnected,
            }),
            None => reply_rx.recv().map_err(|_| RecvError::Disconnected),
        }
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn close(&mut self) -> Result<(), DisconnectError> {
        self.awaiting = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests;

    #[test]
    fn test_request_reply() {
        let transport = InprocTransport::default();
        tests::test_request_reply(
            Box::new(transport),
            "tcp://*:9000",
            "tcp://localhost:9000",
        );
    }

    #[test]
    fn test_recv_timeout() {
        let transport = InprocTransport::default();
        tests::test_recv_timeout(Box::new(transport), "tcp://*:9001", "tcp://localhost:9001");
    }

    #[test]
    fn test_connect_without_listener() {
        let mut transport = InprocTransport::default();
        match transport.open(
            SocketType::Req,
            ConnectMethod::Connect,
            "tcp://localhost:9002",
        ) {
            Err(OpenError::IoError(_)) => (),
            other => panic!(
                "Expected Err(IoError), got {:?}",
                other.map(|socket| socket.endpoint())
            ),
        }
    }
}
