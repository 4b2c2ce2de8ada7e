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

//! Per-connection state and the drivers that advance it.
//!
//! A connection is a small state machine stepped by its owning worker on
//! every readiness event: TLS handshake, incremental request receive, and
//! response write. Every driver is restartable at any yield point; all
//! progress lives in offset fields, so a request split into arbitrary chunks
//! with arbitrary would-block pauses parses exactly like its concatenation.

use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::net::Shutdown;
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::{debug, warn};
use mio::Interest;
use rustls::ServerConnection;

use crate::handler::Request;
use crate::net::Stream;
use crate::options::ServerOptions;
use crate::parser::{self, RequestHead, Scan, MAX_TOP_PART};

const READ_CHUNK: usize = 4096;

/// Result contract of the non-blocking I/O adapters: the operation made all
/// the progress it could, would block, or failed unrecoverably.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// For reads: at least one byte arrived, the requested count is in, or
    /// the peer closed. For writes: all queued bytes flushed.
    Done,
    /// The socket would block; park until readiness fires.
    Again,
    /// Unrecoverable failure; the connection must close.
    Error,
}

/// Current step of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// TLS accept in progress.
    Handshake,
    /// Reading and parsing the request.
    Recv,
    /// Flushing the response.
    Write,
    /// Response flushed; awaiting recycle or close.
    Done,
}

/// One client connection, pinned to a single worker for its whole life.
#[derive(Debug)]
pub struct Conn<S>
where
    S: Stream,
{
    stream: S,
    tls: Option<Box<ServerConnection>>,
    worker: usize,
    handle: String,
    generation: u64,
    client_ip: String,

    step: Step,
    /// Raw bytes in, pending response bytes out.
    inout: Vec<u8>,
    /// Bytes received beyond the current request, restored on recycle.
    carry: Vec<u8>,
    parse: Option<RequestHead>,
    top_part_offset: usize,
    write_offset: usize,
    scan: Scan,
    content_length: usize,
    start_read: Instant,
    latest: Instant,

    registered: bool,
    ready: bool,
    handshaked: bool,
    inprogress: bool,
    todelete: bool,
    keepalive: bool,
    idle: bool,
    error: bool,
    peer_closed: bool,
    compression: bool,
}

impl<S> Conn<S>
where
    S: Stream,
{
    /// Creates the record for a freshly accepted socket. An https connection
    /// starts in the handshake step, plaintext goes straight to receive.
    pub fn new(
        stream: S,
        tls: Option<ServerConnection>,
        worker: usize,
        handle: String,
        generation: u64,
        client_ip: String,
    ) -> Self {
        let now = Instant::now();
        let handshaked = tls.is_none();
        Self {
            stream,
            tls: tls.map(Box::new),
            worker,
            handle,
            generation,
            client_ip,
            step: if handshaked { Step::Recv } else { Step::Handshake },
            inout: Vec::new(),
            carry: Vec::new(),
            parse: None,
            top_part_offset: 0,
            write_offset: 0,
            scan: Scan::Searching { from: 0 },
            content_length: 0,
            start_read: now,
            latest: now,
            registered: false,
            ready: false,
            handshaked,
            inprogress: false,
            todelete: false,
            keepalive: false,
            idle: false,
            error: false,
            peer_closed: false,
            compression: false,
        }
    }

    /// Handle naming this connection in the process-wide table.
    pub fn handle(&self) -> &str {
        &self.handle
    }

    /// Index of the owning worker.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Generation number backing stale-handle detection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Peer address in IPv6 textual form.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Current state machine step.
    pub fn step(&self) -> Step {
        self.step
    }

    /// Whether a complete request (or a parse failure owed a 400) is pending.
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    /// Whether the connection failed and must be closed without a response.
    pub fn in_error(&self) -> bool {
        self.error
    }

    /// Whether the connection is marked for removal.
    pub fn marked_for_delete(&self) -> bool {
        self.todelete
    }

    /// Whether the connection is parked between keep-alive requests.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Whether a handler currently owns the connection.
    pub fn is_inprogress(&self) -> bool {
        self.inprogress
    }

    /// Whether the client asked for the connection to survive the response.
    pub fn wants_keepalive(&self) -> bool {
        self.keepalive
    }

    /// Whether the client advertised gzip acceptance.
    pub fn accepts_compression(&self) -> bool {
        self.compression
    }

    /// When the current request started arriving.
    pub(crate) fn started(&self) -> Instant {
        self.start_read
    }

    /// Last time the state machine touched this connection.
    pub(crate) fn last_activity(&self) -> Instant {
        self.latest
    }

    pub(crate) fn source_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered
    }

    pub(crate) fn mark_registered(&mut self) {
        self.registered = true;
    }

    pub(crate) fn force_keepalive(&mut self, keepalive: bool) {
        self.keepalive = keepalive;
    }

    /// Marks the handler as owning the connection; no state machine step may
    /// run until the matching [`end_dispatch`](Self::end_dispatch).
    pub(crate) fn begin_dispatch(&mut self) {
        self.inprogress = true;
    }

    pub(crate) fn end_dispatch(&mut self) {
        self.inprogress = false;
    }

    /// Steps the state machine as far as it can go right now.
    pub(crate) fn drive(&mut self, opts: &ServerOptions) -> IoOutcome {
        self.latest = Instant::now();
        loop {
            match self.step {
                Step::Handshake => match self.handshake_step() {
                    IoOutcome::Done => self.step = Step::Recv,
                    IoOutcome::Again => return IoOutcome::Again,
                    IoOutcome::Error => {
                        debug!("{}: tls handshake failed", self.handle);
                        self.error = true;
                        self.todelete = true;
                        return IoOutcome::Error;
                    }
                },
                Step::Recv => return self.recv_step(opts),
                Step::Write => return self.write_step(),
                Step::Done => return IoOutcome::Done,
            }
        }
    }

    /// Incremental TLS accept. `WouldBlock` parks the connection for the
    /// next readiness event; any real error closes it. A no-op once the
    /// handshake is complete.
    fn handshake_step(&mut self) -> IoOutcome {
        if self.handshaked {
            return IoOutcome::Done;
        }
        let Some(tls) = self.tls.as_mut() else {
            self.handshaked = true;
            return IoOutcome::Done;
        };

        while tls.is_handshaking() {
            if tls.wants_write() {
                match tls.write_tls(&mut self.stream) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return IoOutcome::Again,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => return IoOutcome::Error,
                }
            }

            match tls.read_tls(&mut self.stream) {
                Ok(0) => return IoOutcome::Error,
                Ok(_) => {
                    if tls.process_new_packets().is_err() {
                        // best effort: push the alert out before closing
                        let _ = tls.write_tls(&mut self.stream);
                        return IoOutcome::Error;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return IoOutcome::Again,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return IoOutcome::Error,
            }
        }

        // flush the final flight before declaring the handshake done
        while tls.wants_write() {
            match tls.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return IoOutcome::Again,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return IoOutcome::Error,
            }
        }

        self.handshaked = true;
        IoOutcome::Done
    }

    /// Drives the request across any number of readiness events without
    /// blocking. Gates run in order: parse the top part if the blank line is
    /// in, check the read timeout, read exactly what is still missing, parse
    /// again, and finally mark the request ready.
    fn recv_step(&mut self, opts: &ServerOptions) -> IoOutcome {
        self.try_parse_top();
        if self.ready {
            return IoOutcome::Done;
        }
        if self.request_complete() {
            self.ready = true;
            return IoOutcome::Done;
        }

        if self.start_read.elapsed() >= opts.read_timeout {
            warn!("{}: read timeout, failing request", self.handle);
            self.fail_request();
            return IoOutcome::Done;
        }

        // 0 means "whatever is available": the blank line is still missing
        let want = if self.parse.is_some() {
            self.content_length - (self.inout.len() - self.top_part_offset)
        } else {
            0
        };

        match self.read_some(want) {
            IoOutcome::Again => return IoOutcome::Again,
            IoOutcome::Error => {
                debug!("{}: read failed", self.handle);
                self.error = true;
                self.todelete = true;
                return IoOutcome::Error;
            }
            IoOutcome::Done => {}
        }

        self.try_parse_top();
        if self.ready {
            return IoOutcome::Done;
        }
        if self.request_complete() {
            self.ready = true;
            return IoOutcome::Done;
        }

        if self.peer_closed {
            // EOF before the request completed; a bare close between
            // keep-alive requests is not an error
            if !self.inout.is_empty() {
                self.error = true;
            }
            self.todelete = true;
            return IoOutcome::Error;
        }

        IoOutcome::Again
    }

    fn write_step(&mut self) -> IoOutcome {
        let outcome = if self.tls.is_some() {
            self.write_tls_adapter()
        } else {
            self.write_plain()
        };

        match outcome {
            IoOutcome::Done => {
                self.step = Step::Done;
                IoOutcome::Done
            }
            IoOutcome::Again => IoOutcome::Again,
            IoOutcome::Error => {
                debug!("{}: write failed", self.handle);
                self.error = true;
                self.todelete = true;
                IoOutcome::Error
            }
        }
    }

    /// Locates the blank line and parses the top part into `parse`. A parse
    /// failure leaves `parse` empty with `ready` set, which the worker turns
    /// into a 400.
    fn try_parse_top(&mut self) {
        if self.ready || self.parse.is_some() || self.inout.is_empty() {
            return;
        }

        if let Scan::Searching { from } = self.scan {
            match parser::scan_blank_line(&self.inout, from) {
                found @ Scan::Found { .. } => self.scan = found,
                Scan::Searching { from: next } => {
                    self.scan = Scan::Searching { from: next };
                    if self.inout.len() > MAX_TOP_PART {
                        warn!("{}: {}", self.handle, parser::ParseError::TooLarge);
                        self.fail_request();
                    }
                    return;
                }
            }
        }

        if let Scan::Found { body_start } = self.scan {
            match parser::parse_top_part(&self.inout[..body_start]) {
                Ok(head) => {
                    self.content_length = head.content_length;
                    self.keepalive = head.keepalive;
                    self.compression = head.accepts_gzip;
                    self.top_part_offset = body_start;
                    self.parse = Some(head);
                }
                Err(e) => {
                    warn!("{}: malformed request: {}", self.handle, e);
                    self.fail_request();
                }
            }
        }
    }

    /// Whether the top part parsed and the whole announced body is in.
    fn request_complete(&self) -> bool {
        self.parse.is_some() && self.inout.len() - self.top_part_offset >= self.content_length
    }

    /// Gives up on the current request: empty parse plus `ready` signals the
    /// worker to answer 400 and close.
    fn fail_request(&mut self) {
        self.parse = None;
        self.ready = true;
        self.keepalive = false;
    }

    fn read_some(&mut self, want: usize) -> IoOutcome {
        if self.tls.is_some() {
            self.read_tls_adapter(want)
        } else {
            self.read_plain(want)
        }
    }

    /// Plaintext read adapter. Appends to `inout`; `want = 0` drains whatever
    /// the socket has, a positive `want` stops at that many new bytes.
    fn read_plain(&mut self, want: usize) -> IoOutcome {
        let mut read = 0usize;
        loop {
            if want != 0 && read >= want {
                return IoOutcome::Done;
            }
            let cap = match want {
                0 => READ_CHUNK,
                w => (w - read).min(READ_CHUNK),
            };

            let mut chunk = [0u8; READ_CHUNK];
            match self.stream.read(&mut chunk[..cap]) {
                Ok(0) => {
                    self.peer_closed = true;
                    return IoOutcome::Done;
                }
                Ok(n) => {
                    self.inout.extend_from_slice(&chunk[..n]);
                    read += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return if read == 0 {
                        IoOutcome::Again
                    } else {
                        IoOutcome::Done
                    };
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return IoOutcome::Error,
            }
        }
    }

    /// TLS read adapter: pump ciphertext, decrypt, append plaintext to
    /// `inout`. Suspensions surface as `Again`; a closed TLS session is an
    /// error the caller turns into a close.
    fn read_tls_adapter(&mut self, want: usize) -> IoOutcome {
        let Some(tls) = self.tls.as_mut() else {
            return IoOutcome::Error;
        };

        let mut got = 0usize;
        loop {
            // drain plaintext already decrypted (the handshake tail may have
            // carried application data)
            match tls.process_new_packets() {
                Ok(state) => {
                    let pending = state.plaintext_bytes_to_read();
                    if pending > 0 {
                        let start = self.inout.len();
                        self.inout.resize(start + pending, 0);
                        if tls.reader().read_exact(&mut self.inout[start..]).is_err() {
                            self.inout.truncate(start);
                            return IoOutcome::Error;
                        }
                        got += pending;
                    }
                    if state.peer_has_closed() {
                        self.peer_closed = true;
                        return if got == 0 {
                            IoOutcome::Error
                        } else {
                            IoOutcome::Done
                        };
                    }
                }
                Err(_) => return IoOutcome::Error,
            }

            if want != 0 && got >= want {
                return IoOutcome::Done;
            }

            match tls.read_tls(&mut self.stream) {
                Ok(0) => {
                    self.peer_closed = true;
                    return IoOutcome::Error;
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return if got == 0 {
                        IoOutcome::Again
                    } else {
                        IoOutcome::Done
                    };
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return IoOutcome::Error,
            }
        }
    }

    /// Plaintext write adapter: drain `inout[write_offset..]` to the socket.
    fn write_plain(&mut self) -> IoOutcome {
        while self.write_offset < self.inout.len() {
            match self.stream.write(&self.inout[self.write_offset..]) {
                Ok(0) => return IoOutcome::Error,
                Ok(n) => self.write_offset += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return IoOutcome::Again,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(_) => return IoOutcome::Error,
            }
        }
        let _ = self.stream.flush();
        IoOutcome::Done
    }

    /// TLS write adapter: feed plaintext into the session, flush ciphertext
    /// records until nothing is queued.
    fn write_tls_adapter(&mut self) -> IoOutcome {
        let Some(tls) = self.tls.as_mut() else {
            return IoOutcome::Error;
        };

        loop {
            while tls.wants_write() {
                match tls.write_tls(&mut self.stream) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return IoOutcome::Again,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(_) => return IoOutcome::Error,
                }
            }

            if self.write_offset >= self.inout.len() {
                return IoOutcome::Done;
            }

            match tls.writer().write(&self.inout[self.write_offset..]) {
                // session buffer full while the socket blocks
                Ok(0) => return IoOutcome::Again,
                Ok(n) => self.write_offset += n,
                Err(_) => return IoOutcome::Error,
            }
        }
    }

    /// Interest the connection should be parked with, derived from the TLS
    /// session wants or the current step.
    pub(crate) fn interest(&self) -> Interest {
        if let Some(tls) = self.tls.as_ref() {
            match (tls.wants_read(), tls.wants_write()) {
                (true, true) => Interest::READABLE | Interest::WRITABLE,
                (false, true) => Interest::WRITABLE,
                _ => Interest::READABLE,
            }
        } else if self.step == Step::Write {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Materializes the request mapping for the handler and sets aside any
    /// bytes received beyond it. Returns `None` when the request failed to
    /// parse, in which case a 400 is owed.
    pub(crate) fn take_request(&mut self) -> Option<Request> {
        let head = self.parse.take()?;

        let end = (self.top_part_offset + self.content_length).min(self.inout.len());
        self.carry = self.inout.split_off(end);
        let raw = &self.inout[self.top_part_offset.min(self.inout.len())..];

        let (body, is_base64) = match std::str::from_utf8(raw) {
            Ok(text) => (text.to_owned(), false),
            Err(_) => (BASE64.encode(raw), true),
        };

        Some(Request {
            method: head.method,
            path: head.target,
            version: head.version,
            headers: head.headers,
            body,
            is_base64,
            client_ip: self.client_ip.clone(),
            accepts_gzip: head.accepts_gzip,
        })
    }

    /// Queues serialized response bytes and switches to the write step.
    pub(crate) fn set_response(&mut self, bytes: Vec<u8>) {
        self.inout = bytes;
        self.write_offset = 0;
        self.ready = false;
        self.step = Step::Write;
    }

    /// Recycles the connection for the next keep-alive request. Returns true
    /// when carried-over bytes are already buffered, in which case the owner
    /// must wake the connection itself: edge-triggered readiness will not
    /// re-fire for bytes that already arrived.
    pub(crate) fn reset_for_next(&mut self) -> bool {
        self.inout = mem::take(&mut self.carry);
        self.parse = None;
        self.ready = false;
        self.inprogress = false;
        self.top_part_offset = 0;
        self.write_offset = 0;
        self.scan = Scan::Searching { from: 0 };
        self.content_length = 0;
        self.step = Step::Recv;
        self.idle = true;
        self.start_read = Instant::now();
        self.latest = self.start_read;
        !self.inout.is_empty()
    }

    /// Bytes arrived on an idle connection: restart the request clock and
    /// fall back into the receive step.
    pub(crate) fn wake_from_idle(&mut self) {
        self.idle = false;
        self.step = Step::Recv;
        self.start_read = Instant::now();
        self.latest = self.start_read;
    }

    /// Immediate teardown: polite TLS close when possible, then SHUT_RDWR.
    pub(crate) fn shutdown_now(&mut self) {
        if let Some(tls) = self.tls.as_mut() {
            tls.send_close_notify();
            let _ = tls.write_tls(&mut self.stream);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::io::{Error, Read, Result as IoResult, Write};
    use std::net::{Shutdown, SocketAddr};
    use std::rc::Rc;
    use std::sync::Arc;
    use std::time::Duration;

    use mio::event::Source;
    use mio::{Interest, Registry, Token};
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
    use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, SignatureScheme};

    use super::test_support::{Io, MockStream};
    use super::*;
    use crate::parser::Method;

    fn opts() -> ServerOptions {
        ServerOptions::default()
    }

    fn conn_with(script: Vec<Io>) -> Conn<MockStream> {
        Conn::new(
            MockStream::new(script),
            None,
            0,
            "conn0".to_owned(),
            0,
            "::1".to_owned(),
        )
    }

    fn drive_until_settled(conn: &mut Conn<MockStream>, opts: &ServerOptions) {
        for _ in 0..256 {
            conn.drive(opts);
            if conn.is_ready() || conn.marked_for_delete() {
                return;
            }
        }
        panic!("connection never settled");
    }

    #[test]
    fn parses_single_chunk_get() {
        let mut conn = conn_with(vec![Io::Data(
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(),
        )]);
        drive_until_settled(&mut conn, &opts());

        assert!(conn.is_ready());
        let request = conn.take_request().unwrap();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.path, "/");
        assert_eq!(request.body, "");
        assert!(!request.is_base64);
        assert!(request.headers.contains_key("host"));
    }

    #[test]
    fn chunked_delivery_with_pauses_matches_concatenation() {
        let full = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world";

        let mut whole = conn_with(vec![Io::Data(full.to_vec())]);
        drive_until_settled(&mut whole, &opts());
        let expected = whole.take_request().unwrap();

        // one byte per poll cycle, a pause injected after every byte
        let mut script = Vec::new();
        for &b in full.iter() {
            script.push(Io::Data(vec![b]));
            script.push(Io::Block);
        }
        let mut split = conn_with(script);
        drive_until_settled(&mut split, &opts());
        let got = split.take_request().unwrap();

        assert_eq!(got.method, expected.method);
        assert_eq!(got.path, expected.path);
        assert_eq!(got.headers, expected.headers);
        assert_eq!(got.body, expected.body);
        assert_eq!(got.body, "hello world");
    }

    #[test]
    fn body_split_across_pauses() {
        let mut conn = conn_with(vec![
            Io::Data(b"POST /u HTTP/1.1\r\nContent-Length: 5\r\n\r\n".to_vec()),
            Io::Data(b"hel".to_vec()),
            Io::Block,
            Io::Data(b"lo".to_vec()),
        ]);
        drive_until_settled(&mut conn, &opts());

        let request = conn.take_request().unwrap();
        assert_eq!(request.body, "hello");
        assert!(!request.is_base64);
    }

    #[test]
    fn binary_bodies_travel_base64() {
        let mut payload = b"POST /u HTTP/1.1\r\nContent-Length: 4\r\n\r\n".to_vec();
        payload.extend_from_slice(&[0u8, 159, 146, 150]);
        let mut conn = conn_with(vec![Io::Data(payload)]);
        drive_until_settled(&mut conn, &opts());

        let request = conn.take_request().unwrap();
        assert!(request.is_base64);
        assert_eq!(
            BASE64.decode(request.body.as_bytes()).unwrap(),
            [0u8, 159, 146, 150]
        );
    }

    #[test]
    fn eof_mid_request_closes_without_response() {
        let mut conn = conn_with(vec![
            Io::Data(b"GET / HTTP/1.1\r\nHos".to_vec()),
            Io::Eof,
        ]);
        drive_until_settled(&mut conn, &opts());

        assert!(conn.marked_for_delete());
        assert!(conn.in_error());
        assert!(!conn.is_ready());
    }

    #[test]
    fn read_timeout_fails_with_empty_parse() {
        let mut options = opts();
        options.read_timeout = Duration::from_millis(0);

        let mut conn = conn_with(vec![Io::Data(b"GET / HT".to_vec()), Io::Block]);
        conn.drive(&options);

        assert!(conn.is_ready());
        assert!(conn.take_request().is_none());
        assert!(!conn.wants_keepalive());
    }

    #[test]
    fn oversized_top_part_fails() {
        let mut conn = conn_with(vec![Io::Data(vec![b'A'; MAX_TOP_PART + 1])]);
        drive_until_settled(&mut conn, &opts());

        assert!(conn.is_ready());
        assert!(conn.take_request().is_none());
        assert!(!conn.wants_keepalive());
    }

    #[test]
    fn recycle_carries_overread_bytes() {
        let two = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b".to_vec();
        let mut conn = conn_with(vec![Io::Data(two)]);
        drive_until_settled(&mut conn, &opts());

        let first = conn.take_request().unwrap();
        assert_eq!(first.path, "/a");

        conn.set_response(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec());
        assert_eq!(conn.drive(&opts()), IoOutcome::Done);
        assert_eq!(conn.step(), Step::Done);

        // the recycled connection must self-wake: the leftover bytes will
        // never fire readiness again
        assert!(conn.reset_for_next());
        conn.wake_from_idle();

        conn.source_mut().script.push_back(Io::Data(
            b" HTTP/1.1\r\nHost: x\r\n\r\n".to_vec(),
        ));
        drive_until_settled(&mut conn, &opts());
        let second = conn.take_request().unwrap();
        assert_eq!(second.path, "/b");
    }

    #[test]
    fn response_bytes_reach_the_wire() {
        let mut conn = conn_with(vec![Io::Data(b"GET / HTTP/1.1\r\n\r\n".to_vec())]);
        drive_until_settled(&mut conn, &opts());
        let _ = conn.take_request().unwrap();

        let payload = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok";
        conn.set_response(payload.to_vec());
        assert_eq!(conn.drive(&opts()), IoOutcome::Done);
        assert_eq!(conn.source_mut().written, payload);
    }

    // ------------------------------- TLS -------------------------------

    #[derive(Debug, Clone, Default)]
    struct SharedBuf(Rc<RefCell<VecDeque<u8>>>);

    impl Read for SharedBuf {
        fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
            let mut inner = self.0.borrow_mut();
            if inner.is_empty() {
                return Err(Error::from(ErrorKind::WouldBlock));
            }
            let n = buf.len().min(inner.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inner.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
            self.0.borrow_mut().extend(buf.iter().copied());
            Ok(buf.len())
        }

        fn flush(&mut self) -> IoResult<()> {
            Ok(())
        }
    }

    /// In-memory duplex transport wiring a rustls client to the connection.
    #[derive(Debug)]
    struct PipeStream {
        rd: SharedBuf,
        wr: SharedBuf,
    }

    impl Read for PipeStream {
        fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
            self.rd.read(buf)
        }
    }

    impl Write for PipeStream {
        fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
            self.wr.write(buf)
        }

        fn flush(&mut self) -> IoResult<()> {
            Ok(())
        }
    }

    impl Source for PipeStream {
        fn register(&mut self, _: &Registry, _: Token, _: Interest) -> IoResult<()> {
            Ok(())
        }

        fn reregister(&mut self, _: &Registry, _: Token, _: Interest) -> IoResult<()> {
            Ok(())
        }

        fn deregister(&mut self, _: &Registry) -> IoResult<()> {
            Ok(())
        }
    }

    impl Stream for PipeStream {
        fn peer_addr(&self) -> IoResult<SocketAddr> {
            Ok("[::1]:40001".parse().unwrap())
        }

        fn shutdown(&self, _: Shutdown) -> IoResult<()> {
            Ok(())
        }

        fn set_nodelay(&self, _: bool) -> IoResult<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct AcceptAnyCert(rustls::crypto::WebPkiSupportedAlgorithms);

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.supported_schemes()
        }
    }

    fn tls_pair() -> (Arc<rustls::ServerConfig>, Arc<ClientConfig>) {
        let signed = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        let cert = signed.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(signed.key_pair.serialize_der().into());

        let server = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();

        let verifier = AcceptAnyCert(
            rustls::crypto::ring::default_provider().signature_verification_algorithms,
        );
        let client = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        (Arc::new(server), Arc::new(client))
    }

    #[test]
    fn tls_handshake_suspends_and_completes() {
        let (server_cfg, client_cfg) = tls_pair();

        let to_server = SharedBuf::default();
        let to_client = SharedBuf::default();
        let stream = PipeStream {
            rd: to_server.clone(),
            wr: to_client.clone(),
        };

        let session = ServerConnection::new(server_cfg).unwrap();
        let mut conn = Conn::new(
            stream,
            Some(session),
            0,
            "conn0".to_owned(),
            0,
            "::1".to_owned(),
        );
        let server_name = ServerName::try_from("localhost".to_owned()).unwrap();
        let mut client = ClientConnection::new(client_cfg, server_name).unwrap();

        let options = opts();
        let mut sent_request = false;

        for _ in 0..64 {
            while client.wants_write() {
                client.write_tls(&mut to_server.clone()).unwrap();
            }

            // every pass is a separate readiness event for the server side
            conn.drive(&options);

            loop {
                match client.read_tls(&mut to_client.clone()) {
                    Ok(0) => break,
                    Ok(_) => {
                        client.process_new_packets().unwrap();
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }

            if !client.is_handshaking() && !sent_request {
                client
                    .writer()
                    .write_all(b"GET /secure HTTP/1.1\r\nHost: localhost\r\n\r\n")
                    .unwrap();
                sent_request = true;
            }

            if conn.is_ready() {
                break;
            }
        }

        assert!(conn.is_ready(), "request never became ready over TLS");
        let request = conn.take_request().unwrap();
        assert_eq!(request.path, "/secure");
        assert_eq!(request.client_ip, "::1");
    }
}
