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

//! The structured request/response schema.
//!
//! Structured payloads are JSON documents carrying a header next to the
//! message body.  A request header identifies the request and the calling
//! client; the response header echoes the request guid and reports success,
//! handler latency, and any stamped error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RequestHeader {
    #[serde(default)]
    pub request_guid: String,
    #[serde(default)]
    pub client: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    pub args: String,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ResponseHeader {
    #[serde(default)]
    pub request_guid: String,
    #[serde(default)]
    pub success: bool,
    /// Handler latency in microseconds, measured from handler entry.
    #[serde(default)]
    pub response_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

/// A structured request message.
pub trait RpcRequest: Serialize + DeserializeOwned + Send {
    fn header(&self) -> &RequestHeader;

    fn header_mut(&mut self) -> &mut RequestHeader;
}

/// A structured response message.
///
/// Responses are `Default`-constructed by the handler machinery and filled
/// in by the business logic, so every field outside the header should have a
/// sensible default.
pub trait RpcResponse: Serialize + DeserializeOwned + Default + Send {
    fn header(&self) -> &ResponseHeader;

    fn header_mut(&mut self) -> &mut ResponseHeader;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_serializes_type_field() {
        let detail = ErrorDetail {
            error_type: "BadServiceRequestError".into(),
            message: "not json".into(),
            args: "[not json]".into(),
        };
        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!("BadServiceRequestError", json["type"]);
    }

    #[test]
    fn test_response_header_defaults() {
        let header: ResponseHeader = serde_json::from_str("{}").unwrap();
        assert!(!header.success);
        assert!(header.error.is_none());
        assert_eq!(0, header.response_time);
    }
}
