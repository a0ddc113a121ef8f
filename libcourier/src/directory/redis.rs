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

//! A Redis-backed directory.
//!
//! Updates use the WATCH/MULTI/EXEC pattern: the watched keys are pinned,
//! the plan closure reads through the watched connection, and the resulting
//! ops are queued into an atomic pipeline.  An aborted EXEC (another writer
//! touched a watched key) re-runs the plan against the fresh state.

use log::debug;

use std::collections::HashMap;

use crate::directory::{Directory, DirectoryError, DirectoryOp, DirectoryReader, UpdatePlan};

/// Connection settings for the Redis directory.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "127.0.0.1".into(),
            port: 6379,
            db: 9,
        }
    }
}

pub struct RedisDirectory {
    connection: redis::Connection,
}

impl RedisDirectory {
    pub fn open(config: &RedisConfig) -> Result<Self, DirectoryError> {
        let url = format!("redis://{}:{}/{}", config.host, config.port, config.db);
        let client = redis::Client::open(url.as_str())
            .map_err(|err| DirectoryError::ConnectionError(err.to_string()))?;
        let connection = client
            .get_connection()
            .map_err(|err| DirectoryError::ConnectionError(err.to_string()))?;
        Ok(RedisDirectory { connection })
    }
}

fn operation_error(err: redis::RedisError) -> DirectoryError {
    DirectoryError::OperationError(err.to_string())
}

fn read_set_members(
    connection: &mut redis::Connection,
    key: &str,
) -> Result<Vec<String>, DirectoryError> {
    redis::cmd("SMEMBERS")
        .arg(key)
        .query(connection)
        .map_err(operation_error)
}

fn read_set_contains(
    connection: &mut redis::Connection,
    key: &str,
    member: &str,
) -> Result<bool, DirectoryError> {
    redis::cmd("SISMEMBER")
        .arg(key)
        .arg(member)
        .query(connection)
        .map_err(operation_error)
}

fn read_set_len(connection: &mut redis::Connection, key: &str) -> Result<u64, DirectoryError> {
    redis::cmd("SCARD")
        .arg(key)
        .query(connection)
        .map_err(operation_error)
}

fn read_map_entries(
    connection: &mut redis::Connection,
    key: &str,
) -> Result<HashMap<String, String>, DirectoryError> {
    redis::cmd("HGETALL")
        .arg(key)
        .query(connection)
        .map_err(operation_error)
}

fn read_scored_set_len(
    connection: &mut redis::Connection,
    key: &str,
) -> Result<u64, DirectoryError> {
    redis::cmd("ZCARD")
        .arg(key)
        .query(connection)
        .map_err(operation_error)
}

fn read_scored_set_first(
    connection: &mut redis::Connection,
    key: &str,
) -> Result<Option<String>, DirectoryError> {
    let members: Vec<String> = redis::cmd("ZRANGE")
        .arg(key)
        .arg(0)
        .arg(0)
        .query(connection)
        .map_err(operation_error)?;
    Ok(members.into_iter().next())
}

fn append_op(pipe: &mut redis::Pipeline, op: &DirectoryOp) {
    match op {
        DirectoryOp::AddToSet { key, member } => {
            pipe.cmd("SADD").arg(key).arg(member).ignore();
        }
        DirectoryOp::RemoveFromSet { key, member } => {
            pipe.cmd("SREM").arg(key).arg(member).ignore();
        }
        DirectoryOp::PutMap { key, entries } => {
            let cmd = pipe.cmd("HMSET").arg(key);
            for (field, value) in entries {
                cmd.arg(field).arg(value);
            }
            cmd.ignore();
        }
        DirectoryOp::DeleteKey { key } => {
            pipe.cmd("DEL").arg(key).ignore();
        }
        DirectoryOp::AddScored { key, entries } => {
            let cmd = pipe.cmd("ZADD").arg(key);
            for (score, member) in entries {
                cmd.arg(*score).arg(member);
            }
            cmd.ignore();
        }
        DirectoryOp::RemoveScored { key, member } => {
            pipe.cmd("ZREM").arg(key).arg(member).ignore();
        }
    }
}

struct WatchedReader<'a> {
    connection: &'a mut redis::Connection,
}

impl<'a> DirectoryReader for WatchedReader<'a> {
    fn set_members(&mut self, key: &str) -> Result<Vec<String>, DirectoryError> {
        read_set_members(self.connection, key)
    }

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, DirectoryError> {
        read_set_contains(self.connection, key, member)
    }

    fn set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        read_set_len(self.connection, key)
    }

    fn map_entries(&mut self, key: &str) -> Result<HashMap<String, String>, DirectoryError> {
        read_map_entries(self.connection, key)
    }

    fn scored_set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        read_scored_set_len(self.connection, key)
    }

    fn scored_set_first(&mut self, key: &str) -> Result<Option<String>, DirectoryError> {
        read_scored_set_first(self.connection, key)
    }
}

impl DirectoryReader for RedisDirectory {
    fn set_members(&mut self, key: &str) -> Result<Vec<String>, DirectoryError> {
        read_set_members(&mut self.connection, key)
    }

    fn set_contains(&mut self, key: &str, member: &str) -> Result<bool, DirectoryError> {
        read_set_contains(&mut self.connection, key, member)
    }

    fn set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        read_set_len(&mut self.connection, key)
    }

    fn map_entries(&mut self, key: &str) -> Result<HashMap<String, String>, DirectoryError> {
        read_map_entries(&mut self.connection, key)
    }

    fn scored_set_len(&mut self, key: &str) -> Result<u64, DirectoryError> {
        read_scored_set_len(&mut self.connection, key)
    }

    fn scored_set_first(&mut self, key: &str) -> Result<Option<String>, DirectoryError> {
        read_scored_set_first(&mut self.connection, key)
    }
}

impl Directory for RedisDirectory {
    fn update(&mut self, watch: &[String], plan: UpdatePlan) -> Result<(), DirectoryError> {
        loop {
            if !watch.is_empty() {
                let mut watch_cmd = redis::cmd("WATCH");
                for key in watch {
                    watch_cmd.arg(key);
                }
                watch_cmd
                    .query::<()>(&mut self.connection)
                    .map_err(operation_error)?;
            }

            let ops = match plan(&mut WatchedReader {
                connection: &mut self.connection,
            }) {
                Ok(ops) => ops,
                Err(err) => {
                    let _ = redis::cmd("UNWATCH").query::<()>(&mut self.connection);
                    return Err(err);
                }
            };

            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &ops {
                append_op(&mut pipe, op);
            }

            let result: Option<redis::Value> =
                pipe.query(&mut self.connection).map_err(operation_error)?;
            match result {
                Some(_) => return Ok(()),
                // Nil EXEC reply: a watched key changed under us
                None => debug!("directory update conflicted; replanning"),
            }
        }
    }
}
