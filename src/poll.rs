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

//! Readiness multiplexer.
//!
//! A thin seam over the host's readiness facility (`mio::Poll`): register a
//! descriptor with a token, wait for events with a timeout, get the token
//! back. A registered descriptor fires whenever it becomes readable, or
//! writable when that interest was requested. The accept dispatcher parks its
//! listening socket here; each worker parks its mid-request and keep-alive
//! client sockets here.

use std::io::Result;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// One readiness notifier instance.
#[derive(Debug)]
pub struct Poller {
    inner: Poll,
}

impl Poller {
    /// Creates an empty poll set.
    pub fn new() -> Result<Self> {
        Ok(Self { inner: Poll::new()? })
    }

    /// Adds a descriptor to the set.
    pub fn register(&self, source: &mut impl Source, token: Token, interest: Interest) -> Result<()> {
        self.inner.registry().register(source, token, interest)
    }

    /// Changes the interest of an already-registered descriptor.
    pub fn reregister(
        &self,
        source: &mut impl Source,
        token: Token,
        interest: Interest,
    ) -> Result<()> {
        self.inner.registry().reregister(source, token, interest)
    }

    /// Removes a descriptor from the set.
    pub fn deregister(&self, source: &mut impl Source) -> Result<()> {
        self.inner.registry().deregister(source)
    }

    /// Creates a waker that makes `wait` return with `token`, usable from any
    /// thread. This is what folds the event queue into the readiness wait.
    pub fn waker(&self, token: Token) -> Result<Arc<Waker>> {
        Ok(Arc::new(Waker::new(self.inner.registry(), token)?))
    }

    /// Blocks until readiness fires or the timeout elapses.
    pub fn wait(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<()> {
        self.inner.poll(events, timeout)
    }
}
