//! HTTP/1.0 relay of non-HTTP URLs through a proxy
//!
//! reqwest only accepts `http`/`https` request targets, so an `ftp:` (or any
//! other) URL routed to a proxy is sent here as an absolute-form request.

use bytes::Bytes;
use std::fmt::Write as _;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

use super::error::AccessError;
use super::http::add_header;
use super::traits::ProtocolAccess;
use super::types::{
    HeadersMap, Meta, PollStatus, RawHandle, Request, Stage, Transport, expect_read_size,
    expect_stage, split_host, split_scheme,
};

const SCHEME: &str = "http";
const RELAY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// Whether reqwest can carry `url` itself
pub fn is_http_url(url: &str) -> bool {
    split_scheme(url).is_some_and(|(scheme, _)| {
        scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")
    })
}

/// Absolute-form `HTTP/1.0` request for `url`, headers from `request.params`.
pub fn relay_request(
    url: &str,
    request: &Request,
    user_agent: &str,
) -> Result<Vec<u8>, AccessError> {
    let unsafe_text = |text: &str| text.contains(['\r', '\n']);
    if unsafe_text(url) {
        return Err(AccessError::Malformed(format!("line break in URL: {url:?}")));
    }

    let mut head = format!("{} {url} HTTP/1.0\r\n", request.method);
    if let Some(host) = split_scheme(url).and_then(|(_, rest)| split_host(rest)) {
        let _ = write!(head, "Host: {host}\r\n");
    }
    let _ = write!(head, "User-Agent: {user_agent}\r\n");
    for (name, value) in &request.params {
        if unsafe_text(name) || unsafe_text(value) {
            return Err(AccessError::Malformed(format!("line break in header {name:?}")));
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }
    if let Some(body) = &request.body {
        let _ = write!(head, "Content-Length: {}\r\n", body.len());
    }
    head.push_str("\r\n");

    let mut bytes = head.into_bytes();
    if let Some(body) = &request.body {
        bytes.extend_from_slice(body);
    }
    Ok(bytes)
}

/// One request relayed by a proxy; the exchange happens in `getmeta`
#[derive(Debug)]
pub struct RelayAccess {
    proxy: String,
    stage: Stage,
    outgoing: Option<Vec<u8>>,
    stream: Option<BufReader<TcpStream>>,
}

impl RelayAccess {
    /// `proxy` is `host:port`; `outgoing` the full request bytes.
    pub fn new(proxy: impl Into<String>, outgoing: Vec<u8>) -> Self {
        Self {
            proxy: proxy.into(),
            stage: Stage::Meta,
            outgoing: Some(outgoing),
            stream: None,
        }
    }

    fn exchange(&mut self, outgoing: &[u8]) -> Result<Meta, AccessError> {
        let wire = |e: io::Error| AccessError::transport(SCHEME, e);

        let addr = self
            .proxy
            .to_socket_addrs()
            .map_err(wire)?
            .next()
            .ok_or_else(|| {
                AccessError::transport(SCHEME, format!("{}: no address", self.proxy))
            })?;
        let mut stream = TcpStream::connect_timeout(&addr, RELAY_TIMEOUT).map_err(wire)?;
        stream.set_read_timeout(Some(RELAY_TIMEOUT)).map_err(wire)?;
        stream.write_all(outgoing).map_err(wire)?;

        let mut reader = BufReader::new(stream);
        let head = read_head(&mut reader)?;
        let meta = parse_head(&head)?;
        self.stream = Some(reader);
        Ok(meta)
    }
}

impl ProtocolAccess for RelayAccess {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn pollmeta(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "pollmeta")?;
        Ok(PollStatus::ready())
    }

    fn getmeta(&mut self) -> Result<Meta, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "getmeta")?;
        let outgoing = self.outgoing.take().ok_or(AccessError::InvalidStage {
            operation: "getmeta",
            stage: self.stage,
        })?;

        match self.exchange(&outgoing) {
            Ok(meta) => {
                debug!(proxy = %self.proxy, status = meta.status, "Proxy answered");
                self.stage = Stage::Data;
                Ok(meta)
            }
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    fn polldata(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "polldata")?;
        Ok(PollStatus::ready())
    }

    fn getdata(&mut self, max_bytes: usize) -> Result<Bytes, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "getdata")?;
        expect_read_size(max_bytes)?;
        let Some(reader) = self.stream.as_mut() else {
            self.stage = Stage::Done;
            return Ok(Bytes::new());
        };

        let mut buf = vec![0u8; max_bytes];
        let n = reader
            .read(&mut buf)
            .map_err(|e| AccessError::transport(SCHEME, e))?;
        if n == 0 {
            self.close();
            return Ok(Bytes::new());
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn close(&mut self) {
        self.outgoing = None;
        self.stream = None;
        self.stage = Stage::Done;
    }

    fn fileno(&self) -> Option<RawHandle> {
        self.stream.as_ref().and_then(|reader| reader.get_ref().fileno())
    }
}

impl Drop for RelayAccess {
    fn drop(&mut self) {
        self.close();
    }
}

/// Status line and headers, up to and including the blank line.
fn read_head(reader: &mut impl BufRead) -> Result<Vec<u8>, AccessError> {
    let mut head = Vec::new();
    loop {
        let start = head.len();
        let n = reader
            .read_until(b'\n', &mut head)
            .map_err(|e| AccessError::transport(SCHEME, e))?;
        if n == 0 {
            return Err(AccessError::transport(
                SCHEME,
                "proxy closed the connection before the response head",
            ));
        }
        if matches!(&head[start..], b"\r\n" | b"\n") {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(AccessError::transport(SCHEME, "proxy response head too large"));
        }
    }
}

fn parse_head(head: &[u8]) -> Result<Meta, AccessError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(AccessError::transport(SCHEME, "incomplete proxy response head"));
        }
        Err(e) => return Err(AccessError::transport(SCHEME, e)),
    }

    let mut map = HeadersMap::new();
    for header in response.headers.iter() {
        add_header(
            &mut map,
            header.name,
            String::from_utf8_lossy(header.value).into_owned(),
        );
    }
    Ok(Meta {
        status: response.code.unwrap_or_default(),
        reason: response.reason.unwrap_or_default().to_string(),
        headers: map,
    })
}
