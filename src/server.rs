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

//! The server: shared configuration, the handle table, the executor factory,
//! and the listeners attached by `listen`.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::handler::ExecutorFactory;
use crate::handles::{HandleEntry, HandleError, HandleTable};
use crate::listener::Listener;
use crate::options::{Scheme, ServerOptions};

/// Startup failures. All of these are fatal to the listen call that hit
/// them; nothing is retried.
#[derive(Debug, Error)]
pub enum ServerError {
    /// `listen` was called with zero worker threads.
    #[error("listener needs at least one worker thread")]
    NoWorkers,
    /// Host resolution produced no usable address.
    #[error("could not resolve {host}:{port}")]
    Resolve {
        /// Host that failed to resolve.
        host: String,
        /// Port the listener was meant for.
        port: u16,
    },
    /// Socket setup or bind failed.
    #[error("could not bind {host}:{port}")]
    Bind {
        /// Host the bind was for.
        host: String,
        /// Port the bind was for.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// Readiness notifier setup failed.
    #[error("readiness notifier setup failed")]
    Poll(#[source] io::Error),
    /// A worker or accept thread could not be spawned.
    #[error("thread spawn failed")]
    Spawn(#[source] io::Error),
    /// A worker thread died before signalling initialization.
    #[error("worker failed to initialize")]
    WorkerInit,
}

/// The server owns everything its listeners share: options, the handle
/// table, and the factory workers build their executors from.
pub struct Server {
    opts: Arc<ServerOptions>,
    handles: Arc<HandleTable>,
    factory: ExecutorFactory,
    listeners: Mutex<Vec<Listener>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("opts", &self.opts)
            .field("handles", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Creates a server from its immutable configuration and the embedder's
    /// executor factory.
    pub fn new(opts: ServerOptions, factory: ExecutorFactory) -> Self {
        Self {
            opts: Arc::new(opts),
            handles: Arc::new(HandleTable::new()),
            factory,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Binds `host:port`, spawns `num_threads` workers, and attaches the
    /// listener. Blocks until every worker has signalled initialization.
    /// Returns the locally bound address (useful with port 0).
    pub fn listen(
        &self,
        scheme: Scheme,
        num_threads: usize,
        host: &str,
        port: u16,
    ) -> Result<std::net::SocketAddr, ServerError> {
        if num_threads == 0 {
            return Err(ServerError::NoWorkers);
        }

        let listener = Listener::spawn(
            self.opts.clone(),
            self.handles.clone(),
            self.factory.clone(),
            scheme,
            num_threads,
            host,
            port,
        )?;
        let addr = listener.local_addr();

        self.listeners
            .lock()
            .expect("listener list lock poisoned")
            .push(listener);
        Ok(addr)
    }

    /// The configuration shared by all listeners.
    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    /// Resolves a connection handle to its registration entry.
    pub fn info_handle(&self, handle: &str) -> Result<HandleEntry, HandleError> {
        self.handles.lookup(handle)
    }

    /// Connections currently owned by all workers of all listeners.
    pub fn open_connections(&self) -> usize {
        self.listeners
            .lock()
            .expect("listener list lock poisoned")
            .iter()
            .map(Listener::open_connections)
            .sum()
    }

    /// Drains and joins every listener. New connections are rejected from
    /// the moment this is called; in-flight requests finish or time out.
    pub fn shutdown(&self) {
        let mut listeners = self
            .listeners
            .lock()
            .expect("listener list lock poisoned");
        for listener in listeners.iter_mut() {
            listener.shutdown();
        }
        listeners.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
