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

//! The greeting service message schema, shared by the service and client
//! binaries.

use serde_derive::{Deserialize, Serialize};

use courier::message::{RequestHeader, ResponseHeader, RpcRequest, RpcResponse};

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GreetRequest {
    pub header: RequestHeader,
    #[serde(default)]
    pub name: String,
}

impl RpcRequest for GreetRequest {
    fn header(&self) -> &RequestHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut RequestHeader {
        &mut self.header
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct GreetResponse {
    pub header: ResponseHeader,
    #[serde(default)]
    pub message: String,
}

impl RpcResponse for GreetResponse {
    fn header(&self) -> &ResponseHeader {
        &self.header
    }

    fn header_mut(&mut self) -> &mut ResponseHeader {
        &mut self.header
    }
}
