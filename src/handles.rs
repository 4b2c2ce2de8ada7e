// Copyright 2022 Ryan Seipp
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

//! Process-wide connection handle table.
//!
//! Every accepted connection gets a unique string handle, registered by the
//! accept dispatcher before the connection is posted to its worker. Handler
//! code refers to connections only through these handles; raw connection
//! state never crosses the table. Entries carry the owning worker, the slot
//! in that worker's arena, and a generation number so stale handles are
//! detected instead of resolving to a recycled slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Failure to resolve a connection handle.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandleError {
    /// No live connection is registered under this handle.
    #[error("unknown connection handle {0}")]
    Unknown(String),
}

/// What the table records per live connection.
#[derive(Debug, Clone)]
pub struct HandleEntry {
    /// Worker that owns the connection.
    pub worker: usize,
    /// Slot in the worker's connection arena; `None` until admission.
    pub key: Option<usize>,
    /// Generation number distinguishing reuses of the same slot.
    pub generation: u64,
    /// Peer address in IPv6 textual form.
    pub client_ip: String,
    /// Listener port the connection arrived on.
    pub port: u16,
}

/// The mutex-protected handle map, shared by the accept dispatcher and every
/// worker of a server.
#[derive(Debug, Default)]
pub struct HandleTable {
    entries: Mutex<HashMap<String, HandleEntry>>,
    generation: AtomicU64,
}

impl HandleTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a fresh connection and returns its handle. Called by the
    /// accept dispatcher before the NewConn event is posted, so the handle
    /// resolves by the time any worker sees the connection.
    pub(crate) fn register(&self, worker: usize, client_ip: &str, port: u16) -> (String, u64) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let handle = format!("conn{generation}");
        let entry = HandleEntry {
            worker,
            key: None,
            generation,
            client_ip: client_ip.to_owned(),
            port,
        };
        self.entries
            .lock()
            .expect("handle table lock poisoned")
            .insert(handle.clone(), entry);
        (handle, generation)
    }

    /// Records the arena slot a worker admitted the connection into.
    pub(crate) fn bind(&self, handle: &str, key: usize) {
        if let Some(entry) = self
            .entries
            .lock()
            .expect("handle table lock poisoned")
            .get_mut(handle)
        {
            entry.key = Some(key);
        }
    }

    /// Drops a handle when its connection closes.
    pub(crate) fn remove(&self, handle: &str) {
        self.entries
            .lock()
            .expect("handle table lock poisoned")
            .remove(handle);
    }

    /// Resolves a handle to its entry.
    pub fn lookup(&self, handle: &str) -> Result<HandleEntry, HandleError> {
        self.entries
            .lock()
            .expect("handle table lock poisoned")
            .get(handle)
            .cloned()
            .ok_or_else(|| HandleError::Unknown(handle.to_owned()))
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("handle table lock poisoned").len()
    }

    /// Whether any connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_bind_lookup_remove() {
        let table = HandleTable::new();
        let (handle, generation) = table.register(3, "::ffff:127.0.0.1", 8080);
        assert!(handle.starts_with("conn"));

        table.bind(&handle, 17);
        let entry = table.lookup(&handle).unwrap();
        assert_eq!(entry.worker, 3);
        assert_eq!(entry.key, Some(17));
        assert_eq!(entry.generation, generation);
        assert_eq!(entry.client_ip, "::ffff:127.0.0.1");

        table.remove(&handle);
        assert_eq!(
            table.lookup(&handle).unwrap_err(),
            HandleError::Unknown(handle.clone())
        );
        assert!(table.is_empty());
    }

    #[test]
    fn generations_are_unique() {
        let table = HandleTable::new();
        let (a, ga) = table.register(0, "::1", 80);
        let (b, gb) = table.register(0, "::1", 80);
        assert_ne!(a, b);
        assert_ne!(ga, gb);
    }
}
