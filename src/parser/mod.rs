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

//! HTTP/1.x request-head parsing.
//!
//! The connection state machine owns the byte accumulation; this module owns
//! the pure parsing: locating the end-of-headers blank line without ever
//! rescanning consumed bytes, and turning the top part (request line plus
//! header fields) into a [`RequestHead`]. Framing is CRLF per RFC 9112, but
//! bare LF line endings and an LFLF end-of-headers are tolerated.

use std::collections::HashMap;
use std::fmt::Display;

use thiserror::Error;

/// Top-part bytes allowed before the blank line must have been found.
pub const MAX_TOP_PART: usize = 8 * 1024;

/// Represents possible failures while parsing a request head.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// Invalid or unknown method token.
    #[error("invalid token in method")]
    Method,
    /// Invalid byte in the request target.
    #[error("invalid token in target")]
    Target,
    /// Invalid or unsupported HTTP version.
    #[error("invalid version")]
    Version,
    /// Invalid byte in a header name.
    #[error("invalid token in header name")]
    HeaderName,
    /// Invalid byte in a header value.
    #[error("invalid token in header value")]
    HeaderValue,
    /// Missing request line.
    #[error("invalid or missing new line")]
    NewLine,
    /// Content-Length was present but not a length.
    #[error("invalid content-length")]
    ContentLength,
    /// No blank line within [`MAX_TOP_PART`] bytes.
    #[error("top part exceeds {} bytes", MAX_TOP_PART)]
    TooLarge,
}

/// Representation of the requested HTTP method.
/// [IETF RFC 9110 Section 9](https://www.rfc-editor.org/rfc/rfc9110#section-9)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.2
    Head,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.4
    Put,
    /// RFC 9110 9.3.5
    Delete,
    /// RFC 9110 9.3.6
    Connect,
    /// RFC 9110 9.3.7
    Options,
    /// RFC 9110 9.3.8
    Trace,
}

impl Method {
    fn from_bytes(token: &[u8]) -> Result<Self, ParseError> {
        match token {
            b"GET" => Ok(Self::Get),
            b"HEAD" => Ok(Self::Head),
            b"POST" => Ok(Self::Post),
            b"PUT" => Ok(Self::Put),
            b"DELETE" => Ok(Self::Delete),
            b"CONNECT" => Ok(Self::Connect),
            b"OPTIONS" => Ok(Self::Options),
            b"TRACE" => Ok(Self::Trace),
            _ => Err(ParseError::Method),
        }
    }
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
        })
    }
}

/// Representation of the requested HTTP version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    /// HTTP/1.0
    H1_0,
    /// HTTP/1.1
    H1_1,
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::H1_0 => "HTTP/1.0",
            Self::H1_1 => "HTTP/1.1",
        })
    }
}

/// Blank-line scan cursor. The cursor only ever advances, so bytes are
/// scanned at most once no matter how many reads a request is split across.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// End-of-headers not located yet; the next scan resumes at `from`.
    Searching {
        /// First byte not yet ruled out as the start of the terminator.
        from: usize,
    },
    /// Terminator located; the body starts at `body_start`.
    Found {
        /// Offset of the first body byte.
        body_start: usize,
    },
}

/// Scans `buf` from `from` for the end-of-headers marker: CRLFCRLF or LFLF
/// (a lone LF terminating the last header line is tolerated either way).
///
/// When the marker is not found, the returned cursor backs up just enough to
/// catch a terminator straddling the next read.
pub fn scan_blank_line(buf: &[u8], from: usize) -> Scan {
    let mut i = from;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match buf.get(i + 1) {
                Some(b'\n') => return Scan::Found { body_start: i + 2 },
                Some(b'\r') if buf.get(i + 2) == Some(&b'\n') => {
                    return Scan::Found { body_start: i + 3 }
                }
                _ => {}
            }
        }
        i += 1;
    }

    Scan::Searching {
        from: from.max(buf.len().saturating_sub(2)),
    }
}

/// The parsed top part of a request, plus the framing facts derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request target, exactly as sent.
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Header fields, names lowercased; repeated fields joined with `", "`.
    pub headers: HashMap<String, String>,
    /// Body length announced by Content-Length; absent means 0.
    pub content_length: usize,
    /// Whether the client wants the connection kept open after the response.
    pub keepalive: bool,
    /// Whether Accept-Encoding names gzip.
    pub accepts_gzip: bool,
}

// RFC 9110 tchar
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), ParseError> {
    let mut parts = line.split(|&b| b == b' ');

    let method = Method::from_bytes(parts.next().unwrap_or(b""))?;

    let target = parts.next().ok_or(ParseError::Target)?;
    if target.is_empty() || !target.iter().all(|&b| (0x21..=0x7e).contains(&b)) {
        return Err(ParseError::Target);
    }
    // printable ASCII checked above
    let target = String::from_utf8(target.to_vec()).map_err(|_| ParseError::Target)?;

    let version = match parts.next() {
        Some(b"HTTP/1.1") => Version::H1_1,
        Some(b"HTTP/1.0") => Version::H1_0,
        _ => return Err(ParseError::Version),
    };

    if parts.next().is_some() {
        return Err(ParseError::Version);
    }

    Ok((method, target, version))
}

fn parse_header(line: &[u8]) -> Result<(String, String), ParseError> {
    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::HeaderName)?;

    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token_char(b)) {
        return Err(ParseError::HeaderName);
    }

    let value = &line[colon + 1..];
    if value.iter().any(|&b| b < 0x20 && b != b'\t') {
        return Err(ParseError::HeaderValue);
    }
    let value = std::str::from_utf8(value).map_err(|_| ParseError::HeaderValue)?;

    let mut name = String::from_utf8(name.to_vec()).map_err(|_| ParseError::HeaderName)?;
    name.make_ascii_lowercase();

    Ok((name, value.trim_matches([' ', '\t']).to_owned()))
}

/// Parses the top part of a request: everything up to and including the blank
/// line located by [`scan_blank_line`].
pub fn parse_top_part(buf: &[u8]) -> Result<RequestHead, ParseError> {
    let mut lines = buf
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let (method, target, version) = parse_request_line(lines.next().ok_or(ParseError::NewLine)?)?;

    let mut headers: HashMap<String, String> = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = parse_header(line)?;
        headers
            .entry(name)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    let content_length = match headers.get("content-length") {
        Some(v) => v.parse::<usize>().map_err(|_| ParseError::ContentLength)?,
        None => 0,
    };

    let connection = headers.get("connection").map(|v| v.to_ascii_lowercase());
    let keepalive = match version {
        Version::H1_1 => !connection.as_deref().is_some_and(|v| v.contains("close")),
        Version::H1_0 => connection.as_deref().is_some_and(|v| v.contains("keep-alive")),
    };

    let accepts_gzip = headers
        .get("accept-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("gzip"));

    Ok(RequestHead {
        method,
        target,
        version,
        headers,
        content_length,
        keepalive,
        accepts_gzip,
    })
}
