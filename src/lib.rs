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

#![deny(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! lytt is a multi-threaded, event-driven HTTP/HTTPS connection server.
//!
//! The crate accepts TCP connections on one or more listeners, negotiates TLS
//! when required, parses HTTP/1.x requests incrementally across readiness
//! events, dispatches completed requests to an embedder-supplied [`Executor`],
//! writes the response, and either recycles the connection (keep-alive) or
//! closes it. Each connection is pinned to one worker thread for its whole
//! life, so no per-connection locking is needed.
//!
//! Routing, response formatting and TLS certificate policy are the embedder's
//! business; they only appear here through the [`Executor`] contract and the
//! `rustls::ServerConfig` handed to [`Scheme::Https`].

pub mod conn;
pub mod handler;
pub mod handles;
pub mod listener;
pub mod net;
pub mod options;
pub mod parser;
pub mod poll;
mod response;
pub mod server;
pub mod worker;

pub use conn::{Conn, IoOutcome, Step};
pub use handler::{ConnInfo, Context, Executor, ExecutorFactory, HandlerError, Request, Response};
pub use handles::{HandleEntry, HandleError, HandleTable};
pub use listener::Listener;
pub use options::{Scheme, ServerOptions, TcpKeepaliveOptions};
pub use server::{Server, ServerError};

use net::Stream;

/// A queued unit of work targeting a specific worker.
///
/// `NewConn` and `Terminate` arrive over the worker's event queue; `Resume`
/// and `KeepaliveWake` are synthesized by the worker itself when the readiness
/// notifier reports activity on a parked socket. Events posted to one worker
/// are delivered FIFO, so events within one connection are strictly ordered.
#[derive(Debug)]
pub enum Event<S>
where
    S: Stream,
{
    /// A freshly accepted connection, subject to the admission check.
    NewConn(Box<Conn<S>>),
    /// Step the state machine of the connection stored under this key.
    Resume(usize),
    /// Bytes arrived on an idle keep-alive connection; restart its timers.
    KeepaliveWake(usize),
    /// Stop admitting work and drain.
    Terminate,
}
