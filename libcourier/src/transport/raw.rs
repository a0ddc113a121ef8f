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

//! A TCP transport with big-endian length-prefixed multipart framing.
//!
//! Only REQ/REP sockets are supported.  A REP socket accepts any number of
//! connections; each connection alternates strictly between one request and
//! one reply, and requests are queued to the socket owner in arrival order.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::debug;

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::transport::{
    ConnectMethod, DisconnectError, MessageSocket, OpenError, RecvError, SendError, SocketType,
    Transport,
};

// Granularity of the acceptor poll and of connection reads, so threads can
// observe the socket shutting down.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CONNECTION_READ_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Default)]
pub struct RawTransport {}

impl Transport for RawTransport {
    fn open(
        &mut self,
        socket_type: SocketType,
        connect_method: ConnectMethod,
        endpoint: &str,
    ) -> Result<Box<dyn MessageSocket>, OpenError> {
        match (socket_type, connect_method) {
            (SocketType::Rep, ConnectMethod::Bind) => {
                Ok(Box::new(RawReplySocket::bind(endpoint)?))
            }
            (SocketType::Req, ConnectMethod::Connect) => {
                let stream = TcpStream::connect(strip_scheme(endpoint))?;
                Ok(Box::new(RawRequestSocket {
                    endpoint: endpoint.into(),
                    stream,
                }))
            }
            _ => Err(OpenError::Unsupported(format!(
                "raw transport does not support {} sockets with method {}",
                socket_type, connect_method
            ))),
        }
    }

    fn clone_box(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }
}

fn strip_scheme(endpoint: &str) -> String {
    let stripped = endpoint.trim_start_matches("tcp://");
    if let Some(port) = stripped.strip_prefix("*:") {
        format!("0.0.0.0:{}", port)
    } else {
        stripped.to_string()
    }
}

pub struct RawRequestSocket {
    endpoint: String,
    stream: TcpStream,
}

impl MessageSocket for RawRequestSocket {
    fn send(&mut self, frames: &[Vec<u8>]) -> Result<(), SendError> {
        write_frames(&mut self.stream, frames)
    }

    fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<Vec<u8>>, RecvError> {
        self.stream.set_read_timeout(timeout)?;
        read_frames(&mut self.stream)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn close(&mut self) -> Result<(), DisconnectError> {
        Ok(self.stream.shutdown(Shutdown::Both)?)
    }
}

struct IncomingRequest {
    frames: Vec<Vec<u8>>,
    reply_tx: Sender<Vec<Vec<u8>>>,
}

pub struct RawReplySocket {
    endpoint: String,
    incoming_rx: Receiver<IncomingRequest>,
    pending_reply: Option<Sender<Vec<Vec<u8>>>>,
    running: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl RawReplySocket {
    fn bind(endpoint: &str) -> Result<RawReplySocket, OpenError> {
        let listener = TcpListener::bind(strip_scheme(endpoint))?;
        listener.set_nonblocking(true)?;

        let (incoming_tx, incoming_rx) = unbounded();
        let running = Arc::new(AtomicBool::new(true));

        let acceptor_running = Arc::clone(&running);
        let acceptor = thread::Builder::new()
            .name(format!("raw-acceptor {}", endpoint))
            .spawn(move || {
                while acceptor_running.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            let incoming_tx = incoming_tx.clone();
                            let connection_running = Arc::clone(&acceptor_running);
                            if let Err(err) = thread::Builder::new()
                                .name("raw-connection".into())
                                .spawn(move || {
                                    handle_connection(stream, incoming_tx, connection_running)
                                })
                            {
                                debug!("unable to spawn connection thread: {}", err);
                            }
                        }
                        Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                            thread::sleep(POLL_INTERVAL);
                        }
                        Err(err) => {
                            debug!("acceptor stopping: {}", err);
                            break;
                        }
                    }
                }
            })?;

        Ok(RawReplySocket {
            endpoint: endpoint.into(),
            incoming_rx,
            pending_reply: None,
            running,
            acceptor: Some(acceptor),
        })
    }
}

fn handle_connection(
    mut stream: TcpStream,
    incoming_tx: Sender<IncomingRequest>,
    running: Arc<AtomicBool>,
) {
    if stream
        .set_read_timeout(Some(CONNECTION_READ_TIMEOUT))
        .is_err()
    {
        return;
    }

    while running.load(Ordering::SeqCst) {
        let frames = match read_frames(&mut stream) {
            Ok(frames) => frames,
            Err(RecvError::Timeout) => continue,
            Err(_) => break,
        };

        let (reply_tx, reply_rx) = bounded(1);
        if incoming_tx
            .send(IncomingRequest { frames, reply_tx })
            .is_err()
        {
            break;
        }

        // Strict request/reply alternation: the next read waits until the
        // socket owner has replied, or the socket has been closed.
        match reply_rx.recv() {
            Ok(reply) => {
                if write_frames(&mut stream, &reply).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

impl MessageSocket for RawReplySocket {
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
            Some(timeout) => self
                .incoming_rx
                .recv_timeout(timeout)
                .map_err(|err| match err {
                    RecvTimeoutError::Timeout => RecvError::Timeout,
                    RecvTimeoutError::Disconnected => RecvError::Disconnected,
                })?,
            None => self
                .incoming_rx
                .recv()
                .map_err(|_| RecvError::Disconnected)?,
        };
        self.pending_reply = Some(request.reply_tx);
        Ok(request.frames)
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    fn close(&mut self) -> Result<(), DisconnectError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                return Err(DisconnectError::ProtocolError(
                    "acceptor thread panicked".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Drop for RawReplySocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn read_frames<T: Read>(reader: &mut T) -> Result<Vec<Vec<u8>>, RecvError> {
    let count = match reader.read_u32::<BigEndian>() {
        Ok(count) => count,
        Err(ref err)
            if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
        {
            return Err(RecvError::Timeout);
        }
        Err(ref err) if err.kind() == ErrorKind::UnexpectedEof => {
            return Err(RecvError::Disconnected);
        }
        Err(err) => return Err(RecvError::IoError(err)),
    };

    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32::<BigEndian>()?;
        let mut buffer = vec![0; len as usize];
        reader.read_exact(&mut buffer[..])?;
        frames.push(buffer);
    }
    Ok(frames)
}

fn write_frames<T: Write>(writer: &mut T, frames: &[Vec<u8>]) -> Result<(), SendError> {
    writer.write_u32::<BigEndian>(frames.len() as u32)?;
    for frame in frames {
        writer.write_u32::<BigEndian>(frame.len() as u32)?;
        writer.write_all(frame)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests;

    #[test]
    fn test_request_reply() {
        let transport = RawTransport::default();
        tests::test_request_reply(
            Box::new(transport),
            "tcp://127.0.0.1:19501",
            "tcp://127.0.0.1:19501",
        );
    }

    #[test]
    fn test_recv_timeout() {
        let transport = RawTransport::default();
        tests::test_recv_timeout(
            Box::new(transport),
            "tcp://127.0.0.1:19502",
            "tcp://127.0.0.1:19502",
        );
    }

    #[test]
    fn test_sequential_clients() {
        let mut transport = RawTransport::default();
        let mut server = transport
            .open(SocketType::Rep, ConnectMethod::Bind, "tcp://127.0.0.1:19503")
            .unwrap();

        let handle = thread::spawn(move || {
            for _ in 0..2 {
                let request = server.recv(Some(Duration::from_secs(5))).unwrap();
                server.send(&[request[1].clone()]).unwrap();
            }
            server.close().unwrap();
        });

        for name in &["alice", "bob"] {
            let mut transport = RawTransport::default();
            let mut client = transport
                .open(
                    SocketType::Req,
                    ConnectMethod::Connect,
                    "tcp://127.0.0.1:19503",
                )
                .unwrap();
            client
                .send(&[b"echo".to_vec(), name.as_bytes().to_vec()])
                .unwrap();
            let reply = client.recv(Some(Duration::from_secs(5))).unwrap();
            assert_eq!(name.as_bytes(), &reply[0][..]);
        }

        handle.join().unwrap();
    }
}
