// Copyright 2020 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HTTP/1.1 message framing for the relay.
//!
//! Requests and responses are passed through byte for byte.  Heads are parsed only to find out
//! where each message ends: every request has to be terminated with a short packet on the USB
//! side, and every response has to be read from the device completely before the channel can
//! carry the next exchange.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};

use log::{debug, info, trace};

use crate::connection::{is_transport_lost, UsbConnection};
use crate::io_adapters::{ClientWriter, TeeReader};

const MAX_HEADERS: usize = 64;
const MAX_HEAD_SIZE: u64 = 64 * 1024;

#[derive(Debug)]
pub enum Error {
    /// Reading from the client failed, or the client closed the connection in the middle of a
    /// request.
    ReadRequest(io::Error),
    MalformedRequest(String),
    MalformedResponse(String),
    /// A request or response head didn't end within `MAX_HEAD_SIZE` bytes.
    HeadTooLarge,
    /// The USB side failed.  The value wraps a `TransportLost`.
    Transport(io::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;
        match self {
            ReadRequest(err) => write!(f, "Reading request failed: {}", err),
            MalformedRequest(why) => write!(f, "HTTP request is malformed: {}", why),
            MalformedResponse(why) => write!(f, "HTTP response is malformed: {}", why),
            HeadTooLarge => write!(f, "HTTP head exceeds {} bytes", MAX_HEAD_SIZE),
            Transport(err) => write!(f, "{}", err),
        }
    }
}

impl Error {
    /// True if the device, not the client, caused the failure.
    pub fn is_transport_lost(&self) -> bool {
        matches!(self, Error::Transport(err) if is_transport_lost(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn request_side(err: io::Error) -> Error {
    if is_transport_lost(&err) {
        Error::Transport(err)
    } else {
        Error::ReadRequest(err)
    }
}

fn response_side(err: io::Error) -> Error {
    if is_transport_lost(&err) {
        Error::Transport(err)
    } else {
        Error::MalformedResponse(err.to_string())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BodyLength {
    Exactly(u64),
    Chunked,
    /// No framing header.  Only possible for responses, whose body then lasts until the end of
    /// the USB message and can't be followed by another exchange.
    UntilMessageEnd,
}

/// The framing-relevant parts of a request head.
#[derive(Debug, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub minor_version: u8,
    pub body: BodyLength,
    pub keep_alive: bool,
}

/// The framing-relevant parts of a response head.
#[derive(Debug, PartialEq, Eq)]
pub struct ResponseHead {
    pub code: u16,
    pub minor_version: u8,
    body: BodyLength,
    keep_alive: bool,
}

impl ResponseHead {
    /// An interim response that is followed by another head for the same request.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code) && self.code != 101
    }

    /// Length of the body that follows this head when it answers `request`.
    pub fn body_length(&self, request: &RequestHead) -> BodyLength {
        if request.method == "HEAD"
            || self.is_informational()
            || self.code == 204
            || self.code == 304
        {
            return BodyLength::Exactly(0);
        }
        if self.code == 101 {
            return BodyLength::UntilMessageEnd;
        }
        self.body
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive && self.code != 101
    }
}

fn header_tokens<'h>(
    headers: &'h [httparse::Header<'h>],
    name: &'h str,
) -> impl Iterator<Item = String> + 'h {
    headers
        .iter()
        .filter(move |h| h.name.eq_ignore_ascii_case(name))
        .flat_map(|h| {
            String::from_utf8_lossy(h.value)
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
}

// Connection persistence per RFC 7230 section 6.3.
fn keep_alive(headers: &[httparse::Header], minor_version: u8) -> bool {
    let tokens: Vec<String> = header_tokens(headers, "Connection").collect();
    if tokens.iter().any(|t| t == "close") {
        return false;
    }
    minor_version >= 1 || tokens.iter().any(|t| t == "keep-alive")
}

// Message body length per RFC 7230 section 3.3.3.  `None` means that neither Transfer-Encoding
// nor Content-Length is present.
fn framed_length(headers: &[httparse::Header]) -> std::result::Result<Option<BodyLength>, String> {
    let codings: Vec<String> = header_tokens(headers, "Transfer-Encoding").collect();
    if let Some(last) = codings.last() {
        if last == "chunked" {
            return Ok(Some(BodyLength::Chunked));
        }
        return Ok(Some(BodyLength::UntilMessageEnd));
    }

    let mut length = None;
    for header in headers
        .iter()
        .filter(|h| h.name.eq_ignore_ascii_case("Content-Length"))
    {
        let value = std::str::from_utf8(header.value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| "invalid Content-Length".to_owned())?;
        match length {
            Some(previous) if previous != value => {
                return Err("conflicting Content-Length headers".to_owned())
            }
            _ => length = Some(value),
        }
    }
    Ok(length.map(BodyLength::Exactly))
}

pub fn parse_request_head(head: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    match request.parse(head) {
        Ok(httparse::Status::Complete(n)) if n == head.len() => {}
        Ok(_) => return Err(Error::MalformedRequest("incomplete head".to_owned())),
        Err(e) => return Err(Error::MalformedRequest(e.to_string())),
    }

    let minor_version = request.version.unwrap_or(1);
    let body = match framed_length(request.headers).map_err(Error::MalformedRequest)? {
        // A request without framing headers has no body.
        None => BodyLength::Exactly(0),
        Some(BodyLength::UntilMessageEnd) => {
            return Err(Error::MalformedRequest(
                "unsupported Transfer-Encoding".to_owned(),
            ))
        }
        Some(length) => length,
    };

    Ok(RequestHead {
        method: request.method.unwrap_or_default().to_owned(),
        path: request.path.unwrap_or_default().to_owned(),
        minor_version,
        body,
        keep_alive: keep_alive(request.headers, minor_version),
    })
}

pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(n)) if n == head.len() => {}
        Ok(_) => return Err(Error::MalformedResponse("incomplete head".to_owned())),
        Err(e) => return Err(Error::MalformedResponse(e.to_string())),
    }

    let code = response
        .code
        .ok_or_else(|| Error::MalformedResponse("missing status code".to_owned()))?;
    let minor_version = response.version.unwrap_or(1);
    let body = framed_length(response.headers)
        .map_err(Error::MalformedResponse)?
        .unwrap_or(BodyLength::UntilMessageEnd);
    Ok(ResponseHead {
        code,
        minor_version,
        body,
        keep_alive: keep_alive(response.headers, minor_version),
    })
}

/// Read one message head, up to and including the empty line that ends it.
///
/// Returns `None` if `reader` is at EOF before the first byte.  Empty lines in front of a head
/// are skipped.
fn read_head(reader: &mut dyn BufRead) -> io::Result<Option<Vec<u8>>> {
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let first = buf.first().copied();
        match first {
            None => return Ok(None),
            Some(b'\r') | Some(b'\n') => reader.consume(1),
            Some(_) => break,
        }
    }

    let head = read_until_delimiter(&mut reader.take(MAX_HEAD_SIZE), b"\r\n\r\n")?;
    Ok(Some(head))
}

fn check_head_complete(head: &[u8]) -> std::result::Result<(), Option<Error>> {
    if head.ends_with(b"\r\n\r\n") {
        Ok(())
    } else if head.len() as u64 >= MAX_HEAD_SIZE {
        Err(Some(Error::HeadTooLarge))
    } else {
        Err(None)
    }
}

fn log_head(prefix: &str, head: &[u8]) {
    for line in String::from_utf8_lossy(head).lines() {
        if !line.is_empty() {
            debug!("{} {}", prefix, line);
        }
    }
}

/// Copy a body of known framing from `reader` to `writer`.  The encoded bytes are copied
/// unchanged.  Fails with `UnexpectedEof` if `reader` ends before the body does.
///
/// Trailer fields after the last chunk are not supported.
pub fn copy_body<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    length: BodyLength,
) -> io::Result<u64> {
    match length {
        BodyLength::Exactly(0) => Ok(0),
        BodyLength::Exactly(len) => {
            let copied = io::copy(&mut reader.take(len), writer)?;
            if copied < len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("body ended after {} of {} bytes", copied, len),
                ));
            }
            Ok(copied)
        }
        BodyLength::Chunked => {
            let mut tee = TeeReader::new(reader, writer);
            io::copy(&mut chunked_transfer::Decoder::new(&mut tee), &mut io::sink())?;
            if tee.reached_eof() {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "chunked body ended before its last chunk",
                ));
            }
            Ok(tee.copied())
        }
        BodyLength::UntilMessageEnd => io::copy(reader, writer),
    }
}

/// How a relayed connection ended.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Relayed {
    /// Number of complete request/response exchanges.
    pub exchanges: usize,
    /// True if the client stopped reading before the last response was complete.
    pub client_gone: bool,
    /// True if the client sent nothing within its read timeout and the connection was closed.
    pub idle: bool,
}

// The client socket's read timeout fired.  Depending on the platform this shows up as either
// kind.
fn is_idle_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    ) && !is_transport_lost(err)
}

/// Relay HTTP exchanges between a client and a device until either side closes the
/// connection.
///
/// Every request is forwarded unchanged and terminated as one USB message.  Every response is
/// forwarded unchanged and always read completely from the device, even when the client is no
/// longer there to receive it.
pub fn relay<R: Read, W: Write>(
    verbose_log: bool,
    client_in: R,
    client_out: W,
    usb: &mut UsbConnection,
) -> Result<Relayed> {
    let mut client_in = BufReader::new(client_in);
    let mut client_out = ClientWriter::new(client_out);
    let mut relayed = Relayed::default();

    loop {
        let head = match read_head(&mut client_in) {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!("{}: client closed connection", usb.addr());
                break;
            }
            Err(err) if is_idle_timeout(&err) => {
                debug!("{}: closing idle client connection", usb.addr());
                relayed.idle = true;
                break;
            }
            Err(err) => return Err(request_side(err)),
        };
        if let Err(err) = check_head_complete(&head) {
            return Err(err.unwrap_or_else(|| {
                Error::ReadRequest(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside request head",
                ))
            }));
        }
        let request = parse_request_head(&head)?;
        if verbose_log {
            log_head(">", &head);
        } else {
            debug!(
                "{}: {} {} HTTP/1.{}",
                usb.addr(),
                request.method,
                request.path,
                request.minor_version
            );
        }

        usb.write_all(&head).map_err(Error::Transport)?;
        copy_body(&mut client_in, usb, request.body).map_err(request_side)?;
        usb.end_message().map_err(Error::Transport)?;

        let response = loop {
            let head = read_head(usb)
                .map_err(response_side)?
                .unwrap_or_default();
            if let Err(err) = check_head_complete(&head) {
                return Err(err.unwrap_or_else(|| {
                    Error::MalformedResponse("device sent an incomplete head".to_owned())
                }));
            }
            let response = match parse_response_head(&head) {
                Ok(response) => response,
                Err(err) => {
                    discard_message(usb);
                    return Err(err);
                }
            };
            if verbose_log {
                log_head("<", &head);
            }
            client_out.write_all(&head).map_err(request_side)?;
            if !response.is_informational() {
                break response;
            }
            trace!("{}: interim response {}", usb.addr(), response.code);
        };
        info!(
            "{}: Response: HTTP/1.{} {} to {} {}",
            usb.addr(),
            response.minor_version,
            response.code,
            request.method,
            request.path
        );

        let body = response.body_length(&request);
        match body {
            BodyLength::UntilMessageEnd => {
                io::copy(&mut usb.message_reader(), &mut client_out).map_err(response_side)?;
            }
            length => {
                copy_body(usb, &mut client_out, length).map_err(response_side)?;
            }
        }
        client_out.flush().map_err(request_side)?;
        relayed.exchanges += 1;

        if client_out.is_gone() {
            debug!(
                "{}: client went away ({}), discarded {} response bytes",
                usb.addr(),
                client_out
                    .error()
                    .map_or_else(String::new, |e| e.to_string()),
                client_out.discarded()
            );
            relayed.client_gone = true;
            break;
        }
        if body == BodyLength::UntilMessageEnd || !request.keep_alive || !response.keep_alive() {
            break;
        }
    }

    Ok(relayed)
}

// Best effort: drop whatever is left of the current device message so it can't be mistaken for
// the answer to another request.
fn discard_message(usb: &mut UsbConnection) {
    match io::copy(&mut usb.message_reader(), &mut io::sink()) {
        Ok(n) => trace!("{}: discarded {} bytes", usb.addr(), n),
        Err(e) => debug!("{}: failed to discard response: {}", usb.addr(), e),
    }
}

/// Read from `reader` until `delimiter` has been read or EOF is reached.  The delimiter is
/// included in the result.
fn read_until_delimiter(reader: &mut dyn BufRead, delimiter: &[u8]) -> io::Result<Vec<u8>> {
    let mut result: Vec<u8> = Vec::new();
    loop {
        let buf = match reader.fill_buf() {
            Ok(buf) => buf,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        if buf.is_empty() {
            return Ok(result);
        }

        // First check if our delimiter spans the old buffer and the new buffer.
        for split in 1..delimiter.len() {
            let (first_delimiter, second_delimiter) = delimiter.split_at(split);
            if first_delimiter.len() > result.len() || second_delimiter.len() > buf.len() {
                continue;
            }

            let first = result.get(result.len() - first_delimiter.len()..);
            let second = buf.get(..second_delimiter.len());
            if let (Some(first), Some(second)) = (first, second) {
                if first == first_delimiter && second == second_delimiter {
                    result.extend_from_slice(second);
                    reader.consume(second_delimiter.len());
                    return Ok(result);
                }
            }
        }

        // Then check if our delimiter occurs in the new buffer.
        if let Some(i) = buf
            .windows(delimiter.len())
            .position(|window| window == delimiter)
        {
            result.extend_from_slice(&buf[..i + delimiter.len()]);
            reader.consume(i + delimiter.len());
            return Ok(result);
        }

        // Otherwise just copy the entire buffer into result.
        let consumed = buf.len();
        result.extend_from_slice(buf);
        reader.consume(consumed);
    }
}
