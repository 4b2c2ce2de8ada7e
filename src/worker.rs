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

//! Workers drive the entire request pipeline besides accepting the TCP
//! connection: TLS handshakes, incremental parsing, handler dispatch, and
//! response writes.
//!
//! Each worker is a single-threaded cooperative loop. Its poll set holds the
//! parked client sockets plus a waker that folds the event queue into the
//! same wait, so dequeue and readiness are one primitive. Connections are
//! pinned to their worker for life; nothing here is shared except the handle
//! table, the connection counter, and the queue itself.

use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, TryRecvError};
use log::{debug, error, warn};
use mio::{Events, Token};
use slab::Slab;

use crate::conn::{Conn, Step};
use crate::handler::{Context, Executor};
use crate::handles::HandleTable;
use crate::net::Stream;
use crate::options::ServerOptions;
use crate::poll::Poller;
use crate::response;
use crate::Event;

/// Token the queue waker fires under; never collides with arena keys.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX - 1);

/// Capacity of each worker's event queue.
pub(crate) const QUEUE_DEPTH: usize = 1024;

const EVENT_CAPACITY: usize = 1024;
const POLL_QUANTUM: Duration = Duration::from_millis(100);
const DRAIN_QUANTUM: Duration = Duration::from_millis(10);

/// One worker thread: an executor, a poll set for parked sockets, an arena of
/// owned connections, and the event queue its run loop consumes.
pub struct Worker<S>
where
    S: Stream,
{
    id: usize,
    opts: Arc<ServerOptions>,
    executor: Box<dyn Executor>,
    poller: Poller,
    conns: Slab<Box<Conn<S>>>,
    num_conns: Arc<AtomicUsize>,
    queue: Receiver<Event<S>>,
    handles: Arc<HandleTable>,
    terminate: bool,
    drain_deadline: Option<Instant>,
    handled: usize,
}

impl<S> fmt::Debug for Worker<S>
where
    S: Stream,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("num_conns", &self.conns.len())
            .field("terminate", &self.terminate)
            .finish_non_exhaustive()
    }
}

impl<S> Worker<S>
where
    S: Stream,
{
    /// Assembles a worker around an already-created poll set and queue. The
    /// waker for `queue` must be registered under [`WAKE_TOKEN`] on `poller`.
    pub fn new(
        id: usize,
        opts: Arc<ServerOptions>,
        executor: Box<dyn Executor>,
        poller: Poller,
        queue: Receiver<Event<S>>,
        num_conns: Arc<AtomicUsize>,
        handles: Arc<HandleTable>,
    ) -> Self {
        Self {
            id,
            opts,
            executor,
            poller,
            conns: Slab::new(),
            num_conns,
            queue,
            handles,
            terminate: false,
            drain_deadline: None,
            handled: 0,
        }
    }

    /// Main loop of the worker. Blocks the thread until a terminate event
    /// arrives and the connection list drains (or the grace period expires).
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(EVENT_CAPACITY);

        loop {
            let quantum = if self.terminate {
                DRAIN_QUANTUM
            } else {
                POLL_QUANTUM
            };

            if let Err(e) = self.poller.wait(&mut events, Some(quantum)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("worker {}: poll failed: {}", self.id, e);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    WAKE_TOKEN => {}
                    Token(key) => {
                        let event = match self.conns.get(key) {
                            Some(conn) if conn.is_idle() => Event::KeepaliveWake(key),
                            Some(_) => Event::Resume(key),
                            None => continue,
                        };
                        self.dispatch(event);
                    }
                }
            }

            // drain the queue on every turn, not only after a wake: a waker
            // racing the quantum must not stall an event
            loop {
                match self.queue.try_recv() {
                    Ok(event) => self.dispatch(event),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.dispatch(Event::Terminate);
                        break;
                    }
                }
            }

            self.sweep();

            if self.terminate {
                let expired = self
                    .drain_deadline
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if self.conns.is_empty() || expired {
                    break;
                }
            }
        }

        self.teardown();
    }

    fn dispatch(&mut self, event: Event<S>) {
        match event {
            Event::NewConn(conn) => self.admit(conn),
            Event::Resume(key) => self.resume(key),
            Event::KeepaliveWake(key) => {
                if let Some(conn) = self.conns.get_mut(key) {
                    conn.wake_from_idle();
                    self.resume(key);
                }
            }
            Event::Terminate => {
                if !self.terminate {
                    debug!("worker {}: terminate received, draining", self.id);
                    self.terminate = true;
                    self.drain_deadline = Some(Instant::now() + self.opts.drain_grace);
                }
            }
        }
    }

    /// Admission gate: the worker's only back-pressure mechanism. A rejected
    /// connection never enters the list and never sees a response.
    fn admit(&mut self, mut conn: Box<Conn<S>>) {
        if self.terminate || self.conns.len() >= self.opts.max_conns_per_worker {
            warn!(
                "worker {}: rejecting {} ({} connections)",
                self.id,
                conn.handle(),
                self.conns.len()
            );
            self.handles.remove(conn.handle());
            conn.shutdown_now();
            return;
        }

        let key = self.conns.insert(conn);
        self.handles.bind(self.conns[key].handle(), key);
        self.sync_count();
        self.resume(key);
    }

    /// Steps a connection and routes it by what the step produced: close,
    /// recycle, dispatch to the handler, or park for more readiness.
    fn resume(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if conn.is_inprogress() {
            return;
        }

        conn.drive(&self.opts);

        let failed = conn.in_error() || conn.marked_for_delete();
        let flushed = conn.step() == Step::Done;
        let ready = conn.is_ready();

        if failed {
            self.close(key);
        } else if flushed {
            self.finish(key);
        } else if ready {
            self.handle_request(key);
        } else {
            self.park(key);
        }
    }

    /// Dispatches a completed request to the executor and queues the
    /// serialized response. An empty parse means the request never made it
    /// through the parser and is owed a 400.
    fn handle_request(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };

        conn.begin_dispatch();
        let handle = conn.handle().to_owned();

        let bytes = match conn.take_request() {
            None => {
                conn.force_keepalive(false);
                response::canned(400)
            }
            Some(request) => {
                self.executor.save_state();
                let cx = Context {
                    handle: &handle,
                    options: &self.opts,
                    request: &request,
                };
                let result = match self.executor.enter(&cx, &request) {
                    Some(response) => Ok(response),
                    None => self.executor.invoke(&cx, &request),
                };
                self.executor.restore_state();

                match result {
                    Ok(response) => {
                        let keepalive =
                            conn.wants_keepalive() && !response::closes_connection(&response);
                        conn.force_keepalive(keepalive);
                        match response::serialize(&response, keepalive) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!("{handle}: response body not decodable: {e}");
                                conn.force_keepalive(false);
                                response::canned(500)
                            }
                        }
                    }
                    Err(e) => {
                        warn!("{handle}: {e}");
                        conn.force_keepalive(false);
                        response::canned(e.status)
                    }
                }
            }
        };

        conn.set_response(bytes);
        conn.end_dispatch();

        self.handled += 1;
        if self.opts.gc_threshold > 0 && self.handled >= self.opts.gc_threshold {
            self.executor.maintain();
            self.handled = 0;
        }

        // common case: the response flushes synchronously right here
        self.resume(key);
    }

    /// A response finished flushing: recycle a keep-alive connection or
    /// close.
    fn finish(&mut self, key: usize) {
        let recycle = {
            let Some(conn) = self.conns.get_mut(key) else {
                return;
            };
            conn.wants_keepalive() && !conn.in_error()
        } && !self.terminate;

        if !recycle {
            self.close(key);
            return;
        }

        let buffered = match self.conns.get_mut(key) {
            Some(conn) => conn.reset_for_next(),
            None => return,
        };

        if buffered {
            // bytes already in hand will never fire readiness again
            self.dispatch(Event::KeepaliveWake(key));
        } else {
            self.park(key);
        }
    }

    /// Parks the connection in the poll set until its socket is ready again.
    fn park(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };

        let token = Token(key);
        let interest = conn.interest();
        let result = if conn.is_registered() {
            self.poller.reregister(conn.source_mut(), token, interest)
        } else {
            let registered = self.poller.register(conn.source_mut(), token, interest);
            if registered.is_ok() {
                conn.mark_registered();
            }
            registered
        };

        if let Err(e) = result {
            warn!("worker {}: could not park connection: {}", self.id, e);
            self.close(key);
        }
    }

    fn close(&mut self, key: usize) {
        if !self.conns.contains(key) {
            return;
        }
        let mut conn = self.conns.remove(key);
        if conn.is_registered() {
            let _ = self.poller.deregister(conn.source_mut());
        }
        self.handles.remove(conn.handle());
        conn.shutdown_now();
        self.sync_count();
    }

    /// Timeout sweep, run once per loop turn. Mid-request connections past
    /// the read timeout are resumed so the receive gate fails them with a
    /// 400; idle and otherwise-stalled connections are closed outright.
    fn sweep(&mut self) {
        let now = Instant::now();
        let mut resume = Vec::new();
        let mut close = Vec::new();

        for (key, conn) in self.conns.iter() {
            if conn.is_inprogress() {
                continue;
            }
            if conn.is_idle() {
                if now.duration_since(conn.last_activity()) >= self.opts.conn_timeout {
                    close.push(key);
                }
            } else if conn.step() == Step::Recv && !conn.is_ready() {
                if now.duration_since(conn.started()) >= self.opts.read_timeout {
                    resume.push(key);
                }
            } else if now.duration_since(conn.last_activity())
                >= self.opts.read_timeout + self.opts.conn_timeout
            {
                // stalled handshake or write
                close.push(key);
            }
        }

        for key in resume {
            self.resume(key);
        }
        for key in close {
            debug!("worker {}: expiring connection", self.id);
            self.close(key);
        }
    }

    fn teardown(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();
        if !keys.is_empty() {
            debug!(
                "worker {}: closing {} connections at exit",
                self.id,
                keys.len()
            );
        }
        for key in keys {
            self.close(key);
        }
        debug!("worker {}: exited", self.id);
    }

    fn sync_count(&self) {
        self.num_conns.store(self.conns.len(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;

    use super::*;
    use crate::conn::test_support::{Io, MockStream};
    use crate::handler::{HandlerError, Request, Response};

    fn worker_with_cap(cap: usize) -> Worker<MockStream> {
        let opts = Arc::new(ServerOptions {
            max_conns_per_worker: cap,
            ..ServerOptions::default()
        });
        let executor = Box::new(|_: &Context<'_>, request: &Request| {
            Ok(Response::text(200, format!("echo:{}", request.body)))
        }) as Box<dyn Executor>;
        let (_tx, rx) = bounded(QUEUE_DEPTH);

        Worker::new(
            0,
            opts,
            executor,
            Poller::new().unwrap(),
            rx,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(HandleTable::new()),
        )
    }

    fn mock_conn(script: Vec<Io>) -> Box<Conn<MockStream>> {
        Box::new(Conn::new(
            MockStream::new(script),
            None,
            0,
            "conn0".to_owned(),
            0,
            "::1".to_owned(),
        ))
    }

    #[test]
    fn serves_request_and_recycles_keepalive() {
        let mut worker = worker_with_cap(4);
        worker.dispatch(Event::NewConn(mock_conn(vec![Io::Data(
            b"POST / HTTP/1.1\r\nContent-Length: 2\r\n\r\nhi".to_vec(),
        )])));

        assert_eq!(worker.conns.len(), 1);
        let conn = worker.conns.get_mut(0).unwrap();
        let written = String::from_utf8(conn.source_mut().written.clone()).unwrap();
        assert!(written.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(written.ends_with("echo:hi"));
        assert!(written.contains("Connection: keep-alive\r\n"));
        // recycled, not closed
        assert!(conn.is_idle());
        assert_eq!(worker.num_conns.load(Ordering::Acquire), 1);
    }

    #[test]
    fn connection_close_requests_are_closed_after_response() {
        let mut worker = worker_with_cap(4);
        worker.dispatch(Event::NewConn(mock_conn(vec![Io::Data(
            b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n".to_vec(),
        )])));

        assert!(worker.conns.is_empty());
        assert_eq!(worker.num_conns.load(Ordering::Acquire), 0);
    }

    #[test]
    fn malformed_requests_are_answered_400_and_closed() {
        let mut worker = worker_with_cap(4);
        worker.dispatch(Event::NewConn(mock_conn(vec![Io::Data(
            b"BOGUS\r\n\r\n".to_vec(),
        )])));

        // the 400 flushed and the connection left the arena
        assert!(worker.conns.is_empty());
        assert_eq!(worker.num_conns.load(Ordering::Acquire), 0);
    }

    #[test]
    fn admission_cap_is_never_exceeded() {
        let mut worker = worker_with_cap(1);

        // first connection parks mid-request and stays admitted
        worker.dispatch(Event::NewConn(mock_conn(vec![Io::Data(
            b"GET / HT".to_vec(),
        )])));
        assert_eq!(worker.conns.len(), 1);

        // second is shut down without ever entering the list
        worker.dispatch(Event::NewConn(mock_conn(vec![Io::Data(
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        )])));
        assert_eq!(worker.conns.len(), 1);
        assert_eq!(worker.num_conns.load(Ordering::Acquire), 1);
    }

    #[test]
    fn terminating_workers_reject_new_connections() {
        let mut worker = worker_with_cap(4);
        worker.dispatch(Event::Terminate);
        assert!(worker.terminate);

        worker.dispatch(Event::NewConn(mock_conn(vec![Io::Data(
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        )])));
        assert!(worker.conns.is_empty());
    }

    #[test]
    fn handler_errors_map_to_their_status() {
        let opts = Arc::new(ServerOptions::default());
        let executor = Box::new(|_: &Context<'_>, _: &Request| {
            Err::<Response, _>(HandlerError {
                status: 503,
                message: "overloaded".to_owned(),
            })
        }) as Box<dyn Executor>;
        let (_tx, rx) = bounded(QUEUE_DEPTH);
        let mut worker: Worker<MockStream> = Worker::new(
            0,
            opts,
            executor,
            Poller::new().unwrap(),
            rx,
            Arc::new(AtomicUsize::new(0)),
            Arc::new(HandleTable::new()),
        );

        worker.dispatch(Event::NewConn(mock_conn(vec![Io::Data(
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        )])));

        // errored handlers close the connection after the canned response
        assert!(worker.conns.is_empty());
    }
}
