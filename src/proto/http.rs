// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::Ipv4Addr, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{debug, warn};

pub const REQUESTLINE_MAX: usize = 1024;
pub const HEADER_LINE_MAX: usize = 256;
pub const HEADERS_MAX: usize = 65536;

/// Body the client sends with a poll request.
pub const POLL_BODY: &[u8] = b":)";
/// Body the client sends with a finish request.
pub const FINISH_BODY: &[u8] = b":(";

#[derive(Debug, Error)]
pub enum HttpError {
    /// No request arrived within the idle window; the peer is presumed gone.
    #[error("idle timeout waiting for a request")]
    IdleTimeout,
    #[error("peer closed the connection")]
    Disconnected,
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("header block exceeds {HEADERS_MAX} bytes")]
    HeadersTooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The request shapes this protocol recognises on a channel socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Browser/scanner traffic; triggers the proxy redirect.
    Get,
    Cp1,
    Cp2,
    Cr,
    S,
    R,
    P,
    F,
}

impl RequestKind {
    pub fn token(self) -> &'static str {
        match self {
            RequestKind::Get => "GET",
            RequestKind::Cp1 => "CP1",
            RequestKind::Cp2 => "CP2",
            RequestKind::Cr => "CR",
            RequestKind::S => "S",
            RequestKind::R => "R",
            RequestKind::P => "P",
            RequestKind::F => "F",
        }
    }

    fn from_uri(uri: &str) -> Option<Self> {
        // The proxy may hand us an absolute URI; strip down to the token.
        let mut path = uri;
        if let Some(rest) = path
            .strip_prefix("http://")
            .or_else(|| path.strip_prefix("https://"))
        {
            path = rest.split_once('/').map(|(_, p)| p).unwrap_or("");
        } else {
            path = path.strip_prefix('/').unwrap_or(path);
        }
        match path.to_ascii_uppercase().as_str() {
            "CP1" => Some(RequestKind::Cp1),
            "CP2" => Some(RequestKind::Cp2),
            "CR" => Some(RequestKind::Cr),
            "S" => Some(RequestKind::S),
            "R" => Some(RequestKind::R),
            "P" => Some(RequestKind::P),
            "F" => Some(RequestKind::F),
            _ => None,
        }
    }
}

/// Reads one LF-terminated line, stripping the terminator. Lines longer than
/// `cap` are truncated (the excess is consumed and dropped).
async fn read_line<R>(r: &mut R, cap: usize) -> Result<String, HttpError>
where R: AsyncRead + Unpin {
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    let mut overflow = 0usize;
    loop {
        let n = r.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Err(HttpError::Disconnected);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if line.len() < cap {
            line.push(byte[0]);
        } else {
            overflow += 1;
        }
    }
    if overflow > 0 {
        warn!("line exceeded buffer space by {overflow} bytes");
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

/// Waits up to `idle` for a request line, then parses it. Returns the kind
/// and the raw line (the redirect path replays the latter verbatim).
pub async fn read_request_line<R>(
    r: &mut R,
    idle: Duration,
) -> Result<(RequestKind, String), HttpError>
where
    R: AsyncRead + Unpin,
{
    let line = match timeout(idle, read_line(r, REQUESTLINE_MAX)).await {
        Ok(res) => res?,
        Err(_) => return Err(HttpError::IdleTimeout),
    };
    debug!("parsing request: {line}");

    let mut words = line.split_ascii_whitespace();
    let method = words
        .next()
        .ok_or_else(|| HttpError::BadRequest(line.clone()))?;

    if method.eq_ignore_ascii_case("get") {
        return Ok((RequestKind::Get, line));
    }
    if !method.eq_ignore_ascii_case("post") {
        return Err(HttpError::BadRequest(line.clone()));
    }

    let uri = words
        .next()
        .ok_or_else(|| HttpError::BadRequest(line.clone()))?;
    match RequestKind::from_uri(uri) {
        Some(kind) => Ok((kind, line)),
        None => Err(HttpError::BadRequest(line)),
    }
}

/// Reads header lines up to the blank separator into one flat block whose
/// trailer is normalised to `\r\n\r\n`.
pub async fn read_headers<R>(r: &mut R) -> Result<String, HttpError>
where R: AsyncRead + Unpin {
    let mut block = String::new();
    loop {
        let line = read_line(r, HEADER_LINE_MAX).await?;
        if line.is_empty() {
            break;
        }
        if block.len() + line.len() + 4 > HEADERS_MAX {
            return Err(HttpError::HeadersTooLarge);
        }
        block.push_str(&line);
        block.push_str("\r\n");
    }
    block.push_str("\r\n");
    Ok(block)
}

/// Value of the named header, or `None`. Names match case-sensitively and
/// only at line starts.
pub fn header_value<'a>(headers: &'a str, name: &str) -> Option<&'a str> {
    headers.split("\r\n").find_map(|line| {
        line.strip_prefix(name)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(|v| v.trim_start_matches(' '))
    })
}

/// Body length announced by the headers: `-1` when absent or invalid, `0`
/// only for a literal zero.
pub fn content_length(headers: &str) -> i64 {
    let Some(v) = header_value(headers, "Content-Length") else {
        return -1;
    };
    let digits: &str = v.split_ascii_whitespace().next().unwrap_or("");
    if digits == "0" {
        return 0;
    }
    match digits.parse::<i64>() {
        Ok(n) if n > 0 => n,
        _ => -1,
    }
}

/// Reads exactly `Content-Length` bytes. `None` when the headers announce no
/// body.
pub async fn read_body<R>(r: &mut R, headers: &str) -> Result<Option<Bytes>, HttpError>
where R: AsyncRead + Unpin {
    let len = content_length(headers);
    if len < 1 {
        return Ok(None);
    }
    let mut buf = BytesMut::zeroed(len as usize);
    r.read_exact(&mut buf).await?;
    Ok(Some(buf.freeze()))
}

/// True when the status line carries the given code (HTTP/1.0 or 1.1 — the
/// proxy may rewrite the version).
pub fn is_status(headers: &str, code: u16) -> bool {
    let Some(line) = headers.split("\r\n").next() else {
        return false;
    };
    line.strip_prefix("HTTP/1.0 ")
        .or_else(|| line.strip_prefix("HTTP/1.1 "))
        .and_then(|rest| rest.split(' ').next())
        .and_then(|c| c.parse::<u16>().ok())
        == Some(code)
}

// ---------------------------------------------------------------------------
// Server-side responses

const BODY_400: &str = "Your user agent sent an invalid request.\n";
const BODY_412: &str = "That MAC address has no registered send channel up. \
                        Connect the send channel before the receive channel\n";
const BODY_500_BUSY: &str = "Sorry, the server is too busy to process your \
                             request, or the client limit has been reached. \
                             Try again later.\n";
const BODY_500_ERR: &str = "A server error occurred while processing your \
                            request. Please contact the system administrator.\n";
const BODY_503: &str = "Sorry, could not assign IP address within range.\n";

async fn respond_error<W>(w: &mut W, status: &str, body: &str) -> Result<(), HttpError>
where W: AsyncWrite + Unpin {
    let msg = format!(
        "HTTP/1.0 {status}\r\nConnection: Close\r\nContent-Length: {}\r\n\
         Content-Type: text/plain\r\n\r\n{body}",
        body.len()
    );
    w.write_all(msg.as_bytes()).await?;
    Ok(())
}

pub async fn respond_400<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), HttpError> {
    respond_error(w, "400 Bad Request", BODY_400).await
}

pub async fn respond_412<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), HttpError> {
    respond_error(w, "412 Precondition Failed", BODY_412).await
}

pub async fn respond_500_busy<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), HttpError> {
    respond_error(w, "500 Busy", BODY_500_BUSY).await
}

pub async fn respond_500_err<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), HttpError> {
    respond_error(w, "500 Internal Server Error", BODY_500_ERR).await
}

pub async fn respond_503<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), HttpError> {
    respond_error(w, "503 Service Unavailable", BODY_503).await
}

/// The "no data" nack.
pub async fn respond_204<W: AsyncWrite + Unpin>(w: &mut W) -> Result<(), HttpError> {
    w.write_all(
        b"HTTP/1.0 204 No Data\r\nConnection: Keep-Alive\r\nContent-Length: 0\r\n\r\n",
    )
    .await?;
    Ok(())
}

/// 200 with a complete body.
pub async fn respond_200<W>(w: &mut W, body: &[u8]) -> Result<(), HttpError>
where W: AsyncWrite + Unpin {
    respond_200_head(w, body.len()).await?;
    w.write_all(body).await?;
    Ok(())
}

/// 200 headers only; the caller streams `len` body bytes afterwards.
pub async fn respond_200_head<W>(w: &mut W, len: usize) -> Result<(), HttpError>
where W: AsyncWrite + Unpin {
    let head = format!(
        "HTTP/1.0 200 OK\r\nConnection: Keep-Alive\r\nContent-Length: {len}\r\n\r\n"
    );
    w.write_all(head.as_bytes()).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Client-side requests

/// `Proxy-Authorization: Basic` credential value.
pub fn basic_auth(user: &str, pass: &str) -> String {
    BASE64.encode(format!("{user}:{pass}"))
}

/// Writes one tunnel request through the proxy: request line with absolute
/// URI, keep-alive (except on F), optional proxy credentials, and the exact
/// `Content-Length`. A short inline body (the poll/finish markers) rides
/// along; frame bodies are streamed by the caller.
pub async fn write_request<W>(
    w: &mut W,
    server: Ipv4Addr,
    port: u16,
    kind: RequestKind,
    content_len: usize,
    auth: Option<&str>,
) -> Result<(), HttpError>
where
    W: AsyncWrite + Unpin,
{
    let (len, body): (usize, &[u8]) = match kind {
        RequestKind::P => (POLL_BODY.len(), POLL_BODY),
        RequestKind::F => (FINISH_BODY.len(), FINISH_BODY),
        _ => (content_len, b""),
    };
    let connection = if kind == RequestKind::F { "Close" } else { "Keep-Alive" };

    let mut msg = format!(
        "POST http://{server}:{port}/{} HTTP/1.0\r\n",
        kind.token()
    );
    if let Some(cred) = auth {
        msg.push_str(&format!("Proxy-Authorization: Basic {cred}\r\n"));
    }
    msg.push_str(&format!(
        "Proxy-Connection: {connection}\r\nContent-Length: {len}\r\n\r\n"
    ));
    w.write_all(msg.as_bytes()).await?;
    if !body.is_empty() {
        w.write_all(body).await?;
    }
    Ok(())
}
