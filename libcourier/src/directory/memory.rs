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

//! An in-memory directory, primarily used for testing and single-process
//! deployments.  Clones share the same underlying state, so every handle
//! created from the same instance observes the same directory.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::directory::{Directory, DirectoryError, DirectoryOp, DirectoryReader, UpdatePlan};

#[derive(Default)]
struct MemoryState {
    sets: HashMap<String, HashSet<String>>,
    maps: HashMap<String, HashMap<String, String>>,
    scored: HashMap<String, BTreeSet<(u64, String)>>,
}

impl MemoryState {
    fn apply(&mut self, op: &DirectoryOp) {
        match op {
            DirectoryOp::AddToSet { key, member } => {
                self.sets
                    .entry(key.clone())
                    .or_insert_with(HashSet::new)
                    .insert(member.clone());
            }
            DirectoryOp::RemoveFromSet { key, member } => {
                if let Some(set) = self.sets.get_mut(key) {
                    set.remove(member);
                    if set.is_empty() {
                        self.sets.remove(key);
                    }
                }
            }
            DirectoryOp::PutMap { key, entries } => {
                let map = self.maps.entry(key.clone()).or_insert_with(HashMap::new);
                for (field, value) in entries {
                    map.insert(field.clone(), value.clone());
                }
            }
            DirectoryOp::DeleteKey { key } => {
                self.sets.remove(key);
                self.maps.remove(key);
                self.scored.remove(key);
            }
            DirectoryOp::AddScored { key, entries } => {
                let scored = self.scored.entry(key.clone()).or_insert_with(BTreeSet::new);
                for (score, member) in entries {
                    scored.insert((*score, member.clone()));
                }
            }
            DirectoryOp::RemoveScored { key, member } => {
                if let Some(scored) = self.scored.get_mut(key) {
                    scored.retain(|(_, m)| m != member);
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

struct StateReader<'a> {
    state: &'a MemoryState,
}

impl<'a> DirectoryReader for StateReader<'a> {
    fn set_members(&mut self, key: &str) -> Result<Vec<String>, DirectoryError> {
        Ok(self
            .state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .state
            .sets
            .get(key)
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    fn set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        Ok(self.state.sets.get(key).map(|set| set.len() as u64).unwrap_or(0))
    }

    fn map_entries(&mut self, key: &str) -> Result<HashMap<String, String>, DirectoryError> {
        Ok(self.state.maps.get(key).cloned().unwrap_or_default())
    }

    fn scored_set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        Ok(self
            .state
            .scored
            .get(key)
            .map(|scored| scored.len() as u64)
            .unwrap_or(0))
    }

    fn scored_set_first(&mut self, key: &str) -> Result<Option<String>, DirectoryError> {
        Ok(self
            .state
            .scored
            .get(key)
            .and_then(|scored| scored.iter().next())
            .map(|(_, member)| member.clone()))
    }
}

impl DirectoryReader for MemoryDirectory {
    fn set_members(&mut self, key: &str) -> Result<Vec<String>, DirectoryError> {
        let state = self.state.lock().expect("directory lock poisoned");
        StateReader { state: &state }.set_members(key)
    }

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, DirectoryError> {
        let state = self.state.lock().expect("directory lock poisoned");
        StateReader { state: &state }.set_contains(key, member)
    }

    fn set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        let state = self.state.lock().expect("directory lock poisoned");
        StateReader { state: &state }.set_len(key)
    }

    fn map_entries(&mut self, key: &str) -> Result<HashMap<String, String>, DirectoryError> {
        let state = self.state.lock().expect("directory lock poisoned");
        StateReader { state: &state }.map_entries(key)
    }

    fn scored_set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        let state = self.state.lock().expect("directory lock poisoned");
        StateReader { state: &state }.scored_set_len(key)
    }

    fn scored_set_first(&mut self, key: &str) -> Result<Option<String>, DirectoryError> {
        let state = self.state.lock().expect("directory lock poisoned");
        StateReader { state: &state }.scored_set_first(key)
    }
}

impl Directory for MemoryDirectory {
    fn update(&mut self, _watch: &[String], plan: UpdatePlan) -> Result<(), DirectoryError> {
        // The state lock is held for the whole plan-and-apply, so the watch
        // set needs no separate validation here.
        let mut state = self.state.lock().expect("directory lock poisoned");
        let ops = plan(&mut StateReader { state: &state })?;
        for op in &ops {
            state.apply(op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let mut directory = MemoryDirectory::new();
        let mut other = directory.clone();

        directory
            .update(&["se:s".to_string()], &mut |_| {
                Ok(vec![DirectoryOp::AddToSet {
                    key: "se:s".into(),
                    member: "greeter".into(),
                }])
            })
            .unwrap();

        assert!(other.set_contains("se:s", "greeter").unwrap());
    }

    #[test]
    fn test_scored_set_orders_by_score() {
        let mut directory = MemoryDirectory::new();
        directory
            .update(&[], &mut |_| {
                Ok(vec![DirectoryOp::AddScored {
                    key: "zs:h:localhost:p".into(),
                    entries: vec![(9002, "9002".into()), (9000, "9000".into()), (9001, "9001".into())],
                }])
            })
            .unwrap();

        assert_eq!(
            Some("9000".to_string()),
            directory.scored_set_first("zs:h:localhost:p").unwrap()
        );
        assert_eq!(3, directory.scored_set_len("zs:h:localhost:p").unwrap());

        directory
            .update(&[], &mut |_| {
                Ok(vec![DirectoryOp::RemoveScored {
                    key: "zs:h:localhost:p".into(),
                    member: "9000".into(),
                }])
            })
            .unwrap();

        assert_eq!(
            Some("9001".to_string()),
            directory.scored_set_first("zs:h:localhost:p").unwrap()
        );
    }

    #[test]
    fn test_update_reads_see_current_state() {
        let mut directory = MemoryDirectory::new();
        directory
            .update(&[], &mut |_| {
                Ok(vec![DirectoryOp::PutMap {
                    key: "hm:s:greeter:g:abc".into(),
                    entries: vec![("port".into(), "9000".into())],
                }])
            })
            .unwrap();

        let mut seen = None;
        directory
            .update(&[], &mut |reader| {
                seen = reader.map_entries("hm:s:greeter:g:abc")?.remove("port");
                Ok(vec![])
            })
            .unwrap();
        assert_eq!(Some("9000".to_string()), seen);
    }
}
