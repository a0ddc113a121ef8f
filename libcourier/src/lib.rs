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

//! Courier is a lightweight RPC micro-service framework.
//!
//! A service instance advertises itself in a shared directory and serves
//! named functions over a duplex messaging socket; clients reach it by
//! logical name, with discovery, pooling, retries, timeouts, and liveness
//! supervision handled by the framework.
//!
//! The pieces:
//!
//! - [`registry`]: the shared catalogue of live instances and the per-host
//!   port pool, on top of a [`directory`] store (Redis or in-memory).
//! - [`service`]: the service runtime, covering registration, socket
//!   lifecycle, the dispatch loop, and per-function message handlers.
//! - [`client`]: a synchronous client to one instance, with retry/backoff
//!   and an optional heartbeat supervisor.
//! - [`caller`]: a multi-service client pool with scoped acquisition.
//! - [`transport`]: the socket abstraction and its backends (in-process,
//!   raw TCP, and ZeroMQ behind the `zmq-transport` feature).

pub mod caller;
pub mod client;
pub mod config;
pub mod directory;
mod hex;
pub mod message;
pub mod pool;
pub mod registry;
pub mod service;
pub mod transport;
pub mod utils;
