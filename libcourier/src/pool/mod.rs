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

//! A thread-safe bounded pool of reusable resources.
//!
//! Resources are handed out wrapped in a [`PoolGuard`] that returns them to
//! the pool on release or on drop.  At acquire time each candidate is
//! probed with [`PoolResource::good_to_use`]; dead resources are discarded
//! silently and the wait continues against the remaining deadline.

use crossbeam_channel::{bounded, Receiver, Sender};
use log::debug;

use std::cmp;
use std::error::Error;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// A resource that can live in a [`ResourcePool`].
///
/// The liveness probe must be side-effect free; it is called on every
/// acquisition.
pub trait PoolResource: Send {
    fn good_to_use(&self) -> bool {
        true
    }
}

/// Returned when no live resource became available in time.
#[derive(Debug)]
pub struct PoolEmptyError;

impl Error for PoolEmptyError {}

impl fmt::Display for PoolEmptyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("no resource available")
    }
}

pub struct ResourcePool<T: PoolResource> {
    queue_tx: Sender<T>,
    queue_rx: Receiver<T>,
}

impl<T: PoolResource> ResourcePool<T> {
    pub fn new(resources: Vec<T>) -> Self {
        let (queue_tx, queue_rx) = bounded(cmp::max(resources.len(), 1));
        for resource in resources {
            // the channel was sized for exactly these resources
            let _ = queue_tx.try_send(resource);
        }
        ResourcePool { queue_tx, queue_rx }
    }

    /// Pops the next live resource, blocking up to `timeout`; `None` blocks
    /// until one is released.
    pub fn acquire(&self, timeout: Option<Duration>) -> Result<PoolGuard<T>, PoolEmptyError> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            let resource = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    self.queue_rx
                        .recv_timeout(remaining)
                        .map_err(|_| PoolEmptyError)?
                }
                None => self.queue_rx.recv().map_err(|_| PoolEmptyError)?,
            };

            if !resource.good_to_use() {
                debug!("discarding dead pool resource");
                continue;
            }

            return Ok(PoolGuard {
                resource: Some(resource),
                pool: Some(self.queue_tx.clone()),
            });
        }
    }

    /// Returns a resource to the pool unconditionally.
    pub fn release(&self, resource: T) {
        let _ = self.queue_tx.try_send(resource);
    }
}

/// Owning handle for an acquired resource.  Dropping the guard releases the
/// resource back to its pool.
pub struct PoolGuard<T: PoolResource> {
    resource: Option<T>,
    pool: Option<Sender<T>>,
}

impl<T: PoolResource> PoolGuard<T> {
    /// Returns the resource to the pool.  A second release is a no-op; the
    /// backing pool pointer is nulled by the first.
    pub fn release(&mut self) {
        if let (Some(resource), Some(pool)) = (self.resource.take(), self.pool.take()) {
            let _ = pool.try_send(resource);
        }
    }
}

impl<T: PoolResource> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource.as_ref().expect("resource already released")
    }
}

impl<T: PoolResource> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("resource already released")
    }
}

impl<T: PoolResource> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        self.release();
    }
}
