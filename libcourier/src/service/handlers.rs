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

//! Message handlers.
//!
//! Every function a service exposes is backed by a [`MessageHandler`].  The
//! built-ins (`heartbeat`, `healthcheck`, `description`, `stop`, `default`)
//! define the observability and liveness protocol; user handlers are
//! installed next to them and may override any of them.
//!
//! Opaque handlers reply with a short fixed string.  Structured handlers go
//! through [`FunctionHandler`], which decodes the request, runs the business
//! callback, and always produces a well-formed response with the outcome
//! stamped in its header.

use log::{error, info};
use serde_json::json;

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Instant;

use crate::message::{ErrorDetail, ResponseHeader, RpcRequest, RpcResponse};
use crate::service::error::{BadServiceRequestError, HandlerError};
use crate::service::ServiceContext;

/// A handler for one named function: consumes a request payload, produces a
/// response payload.  The context is a read-only view of the hosting
/// service's identity and statistics.
pub trait MessageHandler: Send {
    fn handle(
        &mut self,
        payload: &[u8],
        context: &ServiceContext<'_>,
    ) -> Result<Vec<u8>, HandlerError>;
}

/// The handler map every service starts from.
pub fn built_in_handlers(pid: u32) -> HashMap<String, Box<dyn MessageHandler>> {
    let mut handlers: HashMap<String, Box<dyn MessageHandler>> = HashMap::new();
    handlers.insert("heartbeat".into(), Box::new(HeartbeatHandler));
    handlers.insert("healthcheck".into(), Box::new(HealthcheckHandler::new(pid)));
    handlers.insert("description".into(), Box::new(DescriptionHandler));
    handlers.insert("stop".into(), Box::new(StopHandler));
    handlers.insert("default".into(), Box::new(DefaultHandler));
    handlers
}

pub struct HeartbeatHandler;

impl MessageHandler for HeartbeatHandler {
    fn handle(
        &mut self,
        _payload: &[u8],
        _context: &ServiceContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        Ok(b"PONG".to_vec())
    }
}

pub struct StopHandler;

impl MessageHandler for StopHandler {
    fn handle(
        &mut self,
        _payload: &[u8],
        _context: &ServiceContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        Ok(b"STOPPED".to_vec())
    }
}

/// Catch-all for function names the service does not know.
pub struct DefaultHandler;

impl MessageHandler for DefaultHandler {
    fn handle(
        &mut self,
        _payload: &[u8],
        context: &ServiceContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        Ok(format!(
            "Function not available for service: {}",
            context.identity.name
        )
        .into_bytes())
    }
}

pub struct DescriptionHandler;

impl MessageHandler for DescriptionHandler {
    fn handle(
        &mut self,
        _payload: &[u8],
        context: &ServiceContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let document = identity_document(context)?;
        serde_json::to_vec(&document).map_err(|err| HandlerError::Encode(err.to_string()))
    }
}

pub struct HealthcheckHandler {
    pid: u32,
    process: Option<psutil::process::Process>,
}

impl HealthcheckHandler {
    pub fn new(pid: u32) -> Self {
        // keep the probe across calls so cpu sampling has a reference point
        HealthcheckHandler {
            pid,
            process: psutil::process::Process::new(pid).ok(),
        }
    }
}

impl MessageHandler for HealthcheckHandler {
    fn handle(
        &mut self,
        _payload: &[u8],
        context: &ServiceContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let mut document = identity_document(context)?;
        document["start_datetime"] =
            json!(crate::utils::format_timestamp(context.identity.start_time));
        document["cmdline"] = json!(process_cmdline(self.pid));

        // probe failures degrade to "?" rather than failing the healthcheck
        let unknown = json!("?");
        let (cpu_percent, vms, rss, memory_percent) = match self.process.as_mut() {
            Some(process) => {
                let cpu_percent = process
                    .cpu_percent()
                    .map(|percent| json!(percent))
                    .unwrap_or_else(|_| unknown.clone());
                let (vms, rss) = match process.memory_info() {
                    Ok(memory) => (json!(memory.vms() / 1024), json!(memory.rss() / 1024)),
                    Err(_) => (unknown.clone(), unknown.clone()),
                };
                let memory_percent = process
                    .memory_percent()
                    .map(|percent| json!((f64::from(percent) * 10.0).round() / 10.0))
                    .unwrap_or_else(|_| unknown.clone());
                (cpu_percent, vms, rss, memory_percent)
            }
            None => (
                unknown.clone(),
                unknown.clone(),
                unknown.clone(),
                unknown,
            ),
        };
        document["stats"]["cpu_percent"] = cpu_percent;
        document["stats"]["vms"] = vms;
        document["stats"]["rss"] = rss;
        document["stats"]["memory_percent"] = memory_percent;

        serde_json::to_vec(&document).map_err(|err| HandlerError::Encode(err.to_string()))
    }
}

fn identity_document(context: &ServiceContext<'_>) -> Result<serde_json::Value, HandlerError> {
    let identity = context.identity;
    let deck: Vec<&String> = context.deck.iter().collect();
    Ok(json!({
        "name": identity.name,
        "env": identity.env,
        "version": identity.version,
        "pid": identity.pid,
        "guid": identity.guid,
        "host": identity.host,
        "port": identity.port,
        "socket_type": identity.socket_type.as_str(),
        "connect_method": identity.connect_method.as_str(),
        "functions": context.functions,
        "start_time": identity.start_time,
        "function_deck": deck,
        "stats": serde_json::to_value(context.stats)
            .map_err(|err| HandlerError::Encode(err.to_string()))?,
    }))
}

pub(crate) fn process_cmdline(pid: u32) -> Vec<String> {
    psutil::process::Process::new(pid)
        .and_then(|process| process.cmdline_vec())
        .ok()
        .and_then(|cmdline| cmdline)
        .unwrap_or_default()
}

/// A structured handler: decode the request, run the business callback,
/// encode the response.
///
/// The callback fills in the response body; the handler owns the header.  A
/// decode failure or callback error is stamped into the header and still
/// yields a well-formed response, so clients always get the schema they
/// asked for.  `response_time` is the microsecond delta from handler entry.
pub struct FunctionHandler<Req, Res, F> {
    callback: F,
    _request: PhantomData<Req>,
    _response: PhantomData<Res>,
}

impl<Req, Res, F> FunctionHandler<Req, Res, F>
where
    Req: RpcRequest + 'static,
    Res: RpcResponse + 'static,
    F: FnMut(&Req, &mut Res, &ServiceContext<'_>) -> Result<(), HandlerError> + Send + 'static,
{
    pub fn new(callback: F) -> Self {
        FunctionHandler {
            callback,
            _request: PhantomData,
            _response: PhantomData,
        }
    }

    pub fn boxed(callback: F) -> Box<dyn MessageHandler> {
        Box::new(Self::new(callback))
    }
}

impl<Req, Res, F> MessageHandler for FunctionHandler<Req, Res, F>
where
    Req: RpcRequest + 'static,
    Res: RpcResponse + 'static,
    F: FnMut(&Req, &mut Res, &ServiceContext<'_>) -> Result<(), HandlerError> + Send + 'static,
{
    fn handle(
        &mut self,
        payload: &[u8],
        context: &ServiceContext<'_>,
    ) -> Result<Vec<u8>, HandlerError> {
        let handling_started = Instant::now();
        let mut response = Res::default();

        match serde_json::from_slice::<Req>(payload) {
            Ok(request) => {
                response.header_mut().request_guid = request.header().request_guid.clone();
                info!(
                    "{} service got request guid: {}, from client: {}",
                    context.identity.name,
                    request.header().request_guid,
                    request.header().client
                );
                match (self.callback)(&request, &mut response, context) {
                    Ok(()) => response.header_mut().success = true,
                    Err(err) => {
                        error!("error while handling request: {}", err);
                        stamp_error(response.header_mut(), &err);
                    }
                }
            }
            Err(err) => {
                let err = HandlerError::from(BadServiceRequestError(err.to_string()));
                error!("unable to decode request: {}", err);
                stamp_error(response.header_mut(), &err);
            }
        }

        response.header_mut().response_time = handling_started.elapsed().as_micros() as u64;
        serde_json::to_vec(&response).map_err(|err| HandlerError::Encode(err.to_string()))
    }
}

fn stamp_error(header: &mut ResponseHeader, err: &HandlerError) {
    header.success = false;
    header.error = Some(ErrorDetail {
        error_type: err.kind().into(),
        message: err.to_string(),
        args: format!("[{}]", err),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use serde_derive::{Deserialize, Serialize};

    use crate::message::RequestHeader;
    use crate::service::{ServiceIdentity, ServiceStats};
    use crate::transport::{ConnectMethod, SocketType};

    #[derive(Debug, Default, Deserialize, Serialize)]
    struct EchoRequest {
        header: RequestHeader,
        text: String,
    }

    impl RpcRequest for EchoRequest {
        fn header(&self) -> &RequestHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut RequestHeader {
            &mut self.header
        }
    }

    #[derive(Debug, Default, Deserialize, Serialize)]
    struct EchoResponse {
        header: ResponseHeader,
        text: String,
    }

    impl RpcResponse for EchoResponse {
        fn header(&self) -> &ResponseHeader {
            &self.header
        }

        fn header_mut(&mut self) -> &mut ResponseHeader {
            &mut self.header
        }
    }

    fn test_identity() -> ServiceIdentity {
        ServiceIdentity {
            description: "a test service".into(),
            name: "echo".into(),
            env: "test".into(),
            version: "1.0".into(),
            guid: "abc123".into(),
            pid: std::process::id(),
            host: "localhost".into(),
            port: 9000,
            socket_type: SocketType::Rep,
            connect_method: ConnectMethod::Bind,
            start_time: 1_571_738_000_000_000,
        }
    }

    fn with_context<T>(test: impl FnOnce(&ServiceContext<'_>) -> T) -> T {
        let identity = test_identity();
        let functions = vec!["echo".to_string(), "heartbeat".to_string()];
        let mut deck = VecDeque::new();
        deck.push_front("heartbeat".to_string());
        let stats = ServiceStats::default();
        test(&ServiceContext {
            identity: &identity,
            functions: &functions,
            deck: &deck,
            stats: &stats,
        })
    }

    #[test]
    fn test_heartbeat_replies_pong() {
        with_context(|context| {
            let reply = HeartbeatHandler.handle(b"ping", context).unwrap();
            assert_eq!(b"PONG".to_vec(), reply);
        });
    }

    #[test]
    fn test_stop_replies_stopped() {
        with_context(|context| {
            let reply = StopHandler.handle(b"stop", context).unwrap();
            assert_eq!(b"STOPPED".to_vec(), reply);
        });
    }

    #[test]
    fn test_default_names_the_service() {
        with_context(|context| {
            let reply = DefaultHandler.handle(b"anything", context).unwrap();
            assert_eq!(
                "Function not available for service: echo",
                String::from_utf8(reply).unwrap()
            );
        });
    }

    #[test]
    fn test_description_document() {
        with_context(|context| {
            let reply = DescriptionHandler.handle(b"", context).unwrap();
            let document: serde_json::Value = serde_json::from_slice(&reply).unwrap();
            assert_eq!("echo", document["name"]);
            assert_eq!("REP", document["socket_type"]);
            assert_eq!(0, document["stats"]["num_messages"]);
            assert_eq!("heartbeat", document["function_deck"][0]);
            // no OS sampling in the description document
            assert!(document["stats"].get("rss").is_none());
        });
    }

    #[test]
    fn test_healthcheck_document_carries_os_samples() {
        with_context(|context| {
            let mut handler = HealthcheckHandler::new(std::process::id());
            let reply = handler.handle(b"", context).unwrap();
            let document: serde_json::Value = serde_json::from_slice(&reply).unwrap();
            assert_eq!("echo", document["name"]);
            assert_eq!(19, document["start_datetime"].as_str().unwrap().len());
            // sampled or degraded to "?", but always present
            assert!(document["stats"].get("cpu_percent").is_some());
            assert!(document["stats"].get("rss").is_some());
            assert!(document["stats"].get("vms").is_some());
            assert!(document["stats"].get("memory_percent").is_some());
        });
    }

    #[test]
    fn test_function_handler_round_trip_preserves_request_guid() {
        with_context(|context| {
            let mut handler = FunctionHandler::new(
                |request: &EchoRequest, response: &mut EchoResponse, _: &ServiceContext<'_>| {
                    response.text = request.text.clone();
                    Ok(())
                },
            );

            let mut request = EchoRequest::default();
            request.header.request_guid = "guid-1".into();
            request.header.client = "client-1".into();
            request.text = "hello".into();

            let reply = handler
                .handle(&serde_json::to_vec(&request).unwrap(), context)
                .unwrap();
            let response: EchoResponse = serde_json::from_slice(&reply).unwrap();
            assert!(response.header.success);
            assert_eq!("guid-1", response.header.request_guid);
            assert_eq!("hello", response.text);
        });
    }

    #[test]
    fn test_function_handler_stamps_decode_errors() {
        with_context(|context| {
            let mut handler = FunctionHandler::new(
                |_: &EchoRequest, _: &mut EchoResponse, _: &ServiceContext<'_>| Ok(()),
            );

            let reply = handler.handle(b"not json", context).unwrap();
            let response: EchoResponse = serde_json::from_slice(&reply).unwrap();
            assert!(!response.header.success);
            let error = response.header.error.unwrap();
            assert_eq!("BadServiceRequestError", error.error_type);
        });
    }

    #[test]
    fn test_function_handler_stamps_callback_errors() {
        with_context(|context| {
            let mut handler = FunctionHandler::new(
                |_: &EchoRequest, _: &mut EchoResponse, _: &ServiceContext<'_>| {
                    Err(HandlerError::Uncaught("boom".into()))
                },
            );

            let request = EchoRequest::default();
            let reply = handler
                .handle(&serde_json::to_vec(&request).unwrap(), context)
                .unwrap();
            let response: EchoResponse = serde_json::from_slice(&reply).unwrap();
            assert!(!response.header.success);
            let error = response.header.error.unwrap();
            assert_eq!("ServiceHandlerUncaughtError", error.error_type);
            assert!(error.message.contains("boom"));
        });
    }
}
