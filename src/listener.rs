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

//! The listener: one bound (host, port, scheme) triple, its accept thread,
//! and the worker threads it spawned.
//!
//! The accept thread does as little as possible: accept, capture the peer
//! address, build the connection record (including the TLS session for
//! https), register the handle, pick a worker by descriptor modulo thread
//! count, post NewConn. Everything else happens on the owning worker.

use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};
use log::{debug, error, info, warn};
use mio::net::{TcpListener as MioListener, TcpStream};
use mio::{Events, Interest, Token, Waker};
use rustls::ServerConnection;

use crate::conn::Conn;
use crate::handler::ExecutorFactory;
use crate::handles::HandleTable;
use crate::net::{self, Stream};
use crate::options::{Scheme, ServerOptions};
use crate::poll::Poller;
use crate::server::ServerError;
use crate::worker::{Worker, QUEUE_DEPTH, WAKE_TOKEN};
use crate::Event;

const LISTEN_TOKEN: Token = Token(usize::MAX);
const ACCEPT_WAKE_TOKEN: Token = Token(usize::MAX - 1);
const ACCEPT_EVENTS: usize = 256;

/// Handle to one spawned worker, kept by the listener for event posting and
/// the final join.
#[derive(Debug)]
struct WorkerHandle {
    tx: Sender<Event<TcpStream>>,
    waker: Arc<Waker>,
    num_conns: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

/// A bound listener with its accept thread and workers.
#[derive(Debug)]
pub struct Listener {
    addr: SocketAddr,
    scheme: &'static str,
    stop: Arc<AtomicBool>,
    accept_waker: Arc<Waker>,
    accept_thread: Option<JoinHandle<()>>,
    workers: Vec<WorkerHandle>,
}

/// Per-listener state shared read-only by the accept loop.
struct AcceptCtx {
    tls: Option<Arc<rustls::ServerConfig>>,
    port: u16,
    handles: Arc<HandleTable>,
    posts: Vec<WorkerPost>,
    stop: Arc<AtomicBool>,
}

struct WorkerPost {
    tx: Sender<Event<TcpStream>>,
    waker: Arc<Waker>,
}

impl Listener {
    /// Binds the socket, spawns `num_threads` workers (blocking until each
    /// acks initialization), and starts the accept thread.
    pub(crate) fn spawn(
        opts: Arc<ServerOptions>,
        handles: Arc<HandleTable>,
        factory: ExecutorFactory,
        scheme: Scheme,
        num_threads: usize,
        host: &str,
        port: u16,
    ) -> Result<Self, ServerError> {
        let mut socket = net::bind_listener(host, port, opts.backlog, opts.keepalive.as_ref())
            .map_err(|source| {
                if source.kind() == ErrorKind::NotFound {
                    ServerError::Resolve {
                        host: host.to_owned(),
                        port,
                    }
                } else {
                    ServerError::Bind {
                        host: host.to_owned(),
                        port,
                        source,
                    }
                }
            })?;
        let addr = socket.local_addr().map_err(ServerError::Poll)?;

        let mut workers = Vec::with_capacity(num_threads);
        for id in 0..num_threads {
            let (tx, rx) = bounded(QUEUE_DEPTH);
            let num_conns = Arc::new(AtomicUsize::new(0));
            let (ack_tx, ack_rx) = mpsc::channel();

            let worker_opts = opts.clone();
            let worker_handles = handles.clone();
            let worker_factory = factory.clone();
            let counter = num_conns.clone();

            let mut builder = thread::Builder::new().name(format!("lytt-worker-{id}"));
            if let Some(stack_size) = opts.thread_stack_size {
                builder = builder.stack_size(stack_size);
            }

            let thread = builder
                .spawn(move || {
                    let poller = match Poller::new() {
                        Ok(poller) => poller,
                        Err(e) => {
                            error!("worker {id}: poll setup failed: {e}");
                            return;
                        }
                    };
                    let waker = match poller.waker(WAKE_TOKEN) {
                        Ok(waker) => waker,
                        Err(e) => {
                            error!("worker {id}: waker setup failed: {e}");
                            return;
                        }
                    };
                    // the ack unblocks the listen call
                    if ack_tx.send(waker).is_err() {
                        return;
                    }

                    let executor = worker_factory();
                    let mut worker = Worker::new(
                        id,
                        worker_opts,
                        executor,
                        poller,
                        rx,
                        counter,
                        worker_handles,
                    );
                    worker.run();
                })
                .map_err(ServerError::Spawn)?;

            let waker = ack_rx.recv().map_err(|_| ServerError::WorkerInit)?;
            workers.push(WorkerHandle {
                tx,
                waker,
                num_conns,
                thread: Some(thread),
            });
        }

        let stop = Arc::new(AtomicBool::new(false));
        let accept_poller = Poller::new().map_err(ServerError::Poll)?;
        let accept_waker = accept_poller
            .waker(ACCEPT_WAKE_TOKEN)
            .map_err(ServerError::Poll)?;
        accept_poller
            .register(&mut socket, LISTEN_TOKEN, Interest::READABLE)
            .map_err(ServerError::Poll)?;

        let ctx = AcceptCtx {
            tls: match &scheme {
                Scheme::Https(config) => Some(config.clone()),
                Scheme::Http => None,
            },
            port: addr.port(),
            handles,
            posts: workers
                .iter()
                .map(|worker| WorkerPost {
                    tx: worker.tx.clone(),
                    waker: worker.waker.clone(),
                })
                .collect(),
            stop: stop.clone(),
        };

        let scheme_name = scheme.name();
        let accept_thread = thread::Builder::new()
            .name(format!("lytt-accept-{}", addr.port()))
            .spawn(move || accept_loop(accept_poller, socket, ctx))
            .map_err(ServerError::Spawn)?;

        info!("listening on {scheme_name}://{addr} with {num_threads} workers");
        Ok(Self {
            addr,
            scheme: scheme_name,
            stop,
            accept_waker,
            accept_thread: Some(accept_thread),
            workers,
        })
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Scheme name this listener speaks.
    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    /// Connections currently owned by this listener's workers.
    pub fn open_connections(&self) -> usize {
        self.workers
            .iter()
            .map(|worker| worker.num_conns.load(Ordering::Acquire))
            .sum()
    }

    /// Stops accepting, terminates the workers, and joins every thread.
    /// Workers drain in-flight connections first.
    pub(crate) fn shutdown(&mut self) {
        // stop the accept side first so no NewConn races the drain
        self.stop.store(true, Ordering::Release);
        let _ = self.accept_waker.wake();
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }

        for worker in &self.workers {
            let _ = worker.tx.send(Event::Terminate);
            let _ = worker.waker.wake();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(mut poller: Poller, mut socket: MioListener, ctx: AcceptCtx) {
    let mut events = Events::with_capacity(ACCEPT_EVENTS);

    loop {
        if ctx.stop.load(Ordering::Acquire) {
            break;
        }

        if let Err(e) = poller.wait(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("accept loop on port {} failed to poll: {}", ctx.port, e);
            break;
        }

        for event in events.iter() {
            if event.token() == LISTEN_TOKEN {
                accept_ready(&mut socket, &ctx);
            }
            // anything else is the shutdown waker, handled at the loop top
        }
    }

    debug!("accept loop on port {} exited", ctx.port);
}

fn accept_ready(socket: &mut MioListener, ctx: &AcceptCtx) {
    loop {
        match socket.accept() {
            Ok((stream, peer)) => accept_one(stream, peer, ctx),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("accept on port {} failed: {}", ctx.port, e);
                return;
            }
        }
    }
}

/// Builds the connection record for one accepted socket and posts it to its
/// worker. TLS allocation failure or a full worker queue closes the socket
/// immediately.
fn accept_one(stream: TcpStream, peer: SocketAddr, ctx: &AcceptCtx) {
    let _ = stream.set_nodelay(true);
    // the listening socket is dual-stack IPv6, so IPv4 peers surface here
    // already in v4-mapped form
    let client_ip = peer.ip().to_string();
    let worker = stream.as_raw_fd() as usize % ctx.posts.len();

    let tls = match ctx.tls.as_ref() {
        Some(config) => match ServerConnection::new(config.clone()) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("tls session for {client_ip} failed: {e}");
                let _ = Stream::shutdown(&stream, Shutdown::Both);
                return;
            }
        },
        None => None,
    };

    let (handle, generation) = ctx.handles.register(worker, &client_ip, ctx.port);
    debug!("{handle}: accepted {client_ip} for worker {worker}");
    let conn = Box::new(Conn::new(
        stream,
        tls,
        worker,
        handle.clone(),
        generation,
        client_ip,
    ));

    let post = &ctx.posts[worker];
    match post.tx.try_send(Event::NewConn(conn)) {
        Ok(()) => {
            let _ = post.waker.wake();
        }
        Err(TrySendError::Full(event)) | Err(TrySendError::Disconnected(event)) => {
            // a full queue is the same admission pressure as a full worker
            warn!("{handle}: worker {worker} unavailable, dropping connection");
            ctx.handles.remove(&handle);
            if let Event::NewConn(mut conn) = event {
                conn.shutdown_now();
            }
        }
    }
}
