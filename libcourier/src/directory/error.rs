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

use std::error::Error;
use std::fmt;

#[derive(Debug)]
pub enum DirectoryError {
    /// Returned when the backing store cannot be reached
    ConnectionError(String),
    /// Returned when a read or an update against the store fails
    OperationError(String),
}

impl Error for DirectoryError {}

impl fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DirectoryError::ConnectionError(msg) => {
                write!(f, "unable to connect to directory: {}", msg)
            }
            DirectoryError::OperationError(msg) => {
                write!(f, "directory operation failed: {}", msg)
            }
        }
    }
}
