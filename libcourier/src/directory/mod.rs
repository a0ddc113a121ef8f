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

//! The shared key-value directory backing the service registry.
//!
//! The directory exposes three key shapes: sets of strings, string-to-string
//! maps, and scored sets ordered by an integer score.  Mutations are grouped
//! into [`DirectoryOp`] batches and applied atomically by [`Directory::update`]
//! under optimistic concurrency on a watched key set; a batch that loses the
//! race is re-planned and retried by the store.

mod error;
pub mod memory;
pub mod redis;

use std::collections::HashMap;

pub use error::DirectoryError;

/// One mutation in an atomic directory update.
#[derive(Clone, Debug, PartialEq)]
pub enum DirectoryOp {
    AddToSet { key: String, member: String },
    RemoveFromSet { key: String, member: String },
    PutMap { key: String, entries: Vec<(String, String)> },
    DeleteKey { key: String },
    AddScored { key: String, entries: Vec<(u64, String)> },
    RemoveScored { key: String, member: String },
}

/// Read operations against the directory.
///
/// During an [`Directory::update`], reads go through the same watched view
/// that the resulting ops will be validated against.
pub trait DirectoryReader {
    fn set_members(&mut self, key: &str) -> Result<Vec<String>, DirectoryError>;

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, DirectoryError>;

    fn set_len(&mut self, key: &str) -> Result<u64, DirectoryError>;

    fn map_entries(&mut self, key: &str) -> Result<HashMap<String, String>, DirectoryError>;

    fn scored_set_len(&mut self, key: &str) -> Result<u64, DirectoryError>;

    /// The member with the smallest score, if any.  Ties are broken by the
    /// natural ordering of the members themselves.
    fn scored_set_first(&mut self, key: &str) -> Result<Option<String>, DirectoryError>;
}

/// Plans a batch of ops from the current directory state.
pub type UpdatePlan<'a> =
    &'a mut dyn FnMut(&mut dyn DirectoryReader) -> Result<Vec<DirectoryOp>, DirectoryError>;

pub trait Directory: DirectoryReader + Send {
    /// Runs `plan` against the watched keys and atomically applies the ops
    /// it returns.  If another writer touches a watched key between the plan
    /// and the apply, the plan is re-run against the fresh state.
    fn update(&mut self, watch: &[String], plan: UpdatePlan) -> Result<(), DirectoryError>;
}
