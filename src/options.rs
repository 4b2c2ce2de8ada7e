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

//! Server configuration shared by all listeners.

use std::sync::Arc;
use std::time::Duration;

use rustls::ServerConfig;

/// Scheme a listener speaks. An https listener carries the TLS configuration
/// its connections are built from; certificate selection policy lives inside
/// the `rustls::ServerConfig` and is not this crate's business.
#[derive(Debug, Clone)]
pub enum Scheme {
    /// Plaintext HTTP/1.x.
    Http,
    /// HTTP/1.x over TLS.
    Https(Arc<ServerConfig>),
}

impl Scheme {
    /// Lowercase scheme name, for logging and handle bookkeeping.
    pub fn name(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https(_) => "https",
        }
    }
}

/// TCP keepalive probe tunables applied to the listening socket.
#[derive(Debug, Clone)]
pub struct TcpKeepaliveOptions {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Probes sent before the peer is declared dead.
    pub retries: u32,
}

/// Immutable configuration shared by every listener and worker of a
/// [`Server`](crate::Server). Created once at startup.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Admission cap: connections owned by one worker at any moment. A worker
    /// at the cap closes incoming connections immediately.
    pub max_conns_per_worker: usize,
    /// Time budget from the first byte of a request until it parses complete.
    /// Exceeding it fails the connection with a 400.
    pub read_timeout: Duration,
    /// Idle budget for a keep-alive connection between requests.
    pub conn_timeout: Duration,
    /// TCP keepalive probing, when configured.
    pub keepalive: Option<TcpKeepaliveOptions>,
    /// Listen backlog.
    pub backlog: i32,
    /// Worker thread stack size; `None` leaves the platform default.
    pub thread_stack_size: Option<usize>,
    /// Requests handled between [`Executor::maintain`](crate::Executor::maintain)
    /// calls on a worker. An externally-tuned maintenance interval.
    pub gc_threshold: usize,
    /// How long a terminating worker keeps processing in-flight connections
    /// before it gives up and closes them.
    pub drain_grace: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_conns_per_worker: 1024,
            read_timeout: Duration::from_secs(30),
            conn_timeout: Duration::from_secs(60),
            keepalive: None,
            backlog: 1024,
            thread_stack_size: None,
            gc_threshold: 512,
            drain_grace: Duration::from_secs(10),
        }
    }
}
