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

//! The contract between the connection core and the embedder's request
//! handling engine.
//!
//! Each worker thread owns one [`Executor`] built from the embedder's
//! factory; this is where an embedded interpreter, a router, or a plain
//! closure lives. The core only ever hands it a completed [`Request`] and
//! writes back the [`Response`] bytes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::handles::HandleError;
use crate::options::ServerOptions;
use crate::parser::{Method, Version};

/// A completed, parsed request as the handler sees it.
///
/// Bodies travel as strings: textual payloads verbatim, binary payloads
/// base64-encoded with `is_base64` set. An absent body is the empty string
/// with `is_base64` false.
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method.
    pub method: Method,
    /// Request target, exactly as sent.
    pub path: String,
    /// Protocol version.
    pub version: Version,
    /// Header fields, names lowercased.
    pub headers: HashMap<String, String>,
    /// Request body, possibly base64-encoded.
    pub body: String,
    /// Whether `body` is base64-encoded binary.
    pub is_base64: bool,
    /// Peer address in IPv6 textual form; IPv4 peers appear v4-mapped
    /// (`::ffff:a.b.c.d`).
    pub client_ip: String,
    /// Whether the client advertised gzip in Accept-Encoding.
    pub accepts_gzip: bool,
}

/// A response mapping returned by the handler. The core synthesizes
/// Content-Length and Connection on emission; everything else is emitted
/// as given.
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code.
    pub status: u16,
    /// Response header fields, emitted in order.
    pub headers: Vec<(String, String)>,
    /// Response body, possibly base64-encoded.
    pub body: String,
    /// Whether `body` is base64 that must be decoded before emission.
    pub is_base64: bool,
}

impl Response {
    /// An empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: String::new(),
            is_base64: false,
        }
    }

    /// A textual response body with the given status.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
            is_base64: false,
        }
    }

    /// Appends a header field.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A handler failure, mapped to a response with `status` and the connection
/// closed afterwards.
#[derive(Debug, Error)]
#[error("handler failed with status {status}: {message}")]
pub struct HandlerError {
    /// Status code to answer with.
    pub status: u16,
    /// Short diagnostic, logged and used as the response body.
    pub message: String,
}

impl HandlerError {
    /// A plain 500 with a message.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: 500,
            message: message.into(),
        }
    }
}

/// What a handler can see of the connection and server while it runs.
///
/// The context is only valid during the invocation; the connection is
/// semantically owned by the handler for exactly that window.
#[derive(Debug)]
pub struct Context<'a> {
    pub(crate) handle: &'a str,
    pub(crate) options: &'a ServerOptions,
    pub(crate) request: &'a Request,
}

impl<'a> Context<'a> {
    /// Handle naming the connection this request arrived on.
    pub fn handle(&self) -> &str {
        self.handle
    }

    /// The server configuration.
    pub fn options(&self) -> &ServerOptions {
        self.options
    }

    /// Looks up a connection handle and returns its request and server
    /// configuration. Fails for unknown handles. Connections are pinned to
    /// their worker, so only the handle of the current invocation resolves
    /// here; anything else is unknown by construction.
    pub fn info_conn(&self, handle: &str) -> Result<ConnInfo<'a>, HandleError> {
        if handle == self.handle {
            Ok(ConnInfo {
                request: self.request,
                options: self.options,
            })
        } else {
            Err(HandleError::Unknown(handle.to_owned()))
        }
    }
}

/// The `{ request, server }` view returned by [`Context::info_conn`].
#[derive(Debug)]
pub struct ConnInfo<'a> {
    /// The request currently being handled on the connection.
    pub request: &'a Request,
    /// The server configuration.
    pub options: &'a ServerOptions,
}

/// The embedder's request handling engine, one per worker thread.
///
/// Workers bracket every invocation with [`save_state`](Self::save_state) and
/// [`restore_state`](Self::restore_state), call
/// [`enter`](Self::enter) first to let middleware short-circuit, and call
/// [`maintain`](Self::maintain) every `gc_threshold` handled requests.
/// Executors are built inside their worker thread and never leave it, so they
/// may hold thread-bound state (an embedded interpreter, say).
pub trait Executor {
    /// Snapshot interpreter state before an invocation.
    fn save_state(&mut self) {}

    /// Restore interpreter state after an invocation.
    fn restore_state(&mut self) {}

    /// Middleware gate: a `Some` response short-circuits
    /// [`invoke`](Self::invoke) entirely.
    fn enter(&mut self, cx: &Context<'_>, request: &Request) -> Option<Response> {
        let _ = (cx, request);
        None
    }

    /// Handles one request.
    fn invoke(&mut self, cx: &Context<'_>, request: &Request) -> Result<Response, HandlerError>;

    /// Periodic maintenance hook (interpreter garbage collection and the
    /// like).
    fn maintain(&mut self) {}
}

impl fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Executor")
    }
}

// A bare closure is a complete executor; state hooks stay no-ops.
impl<F> Executor for F
where
    F: FnMut(&Context<'_>, &Request) -> Result<Response, HandlerError>,
{
    fn invoke(&mut self, cx: &Context<'_>, request: &Request) -> Result<Response, HandlerError> {
        self(cx, request)
    }
}

/// Builds one [`Executor`] per worker thread. The factory crosses threads;
/// the executors it builds do not.
pub type ExecutorFactory = Arc<dyn Fn() -> Box<dyn Executor> + Send + Sync>;
