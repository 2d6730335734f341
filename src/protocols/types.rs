use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::str::FromStr;

use super::error::AccessError;

pub type HeadersMap = BTreeMap<String, String>;

#[cfg(unix)]
pub type RawHandle = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawHandle = std::os::windows::io::RawSocket;

/// Request method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = AccessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            other => Err(AccessError::Malformed(format!("unknown method {other}"))),
        }
    }
}

/// One fetch: what to get and how.
///
/// ```
/// use grail_access::protocols::{Method, Request};
///
/// let request = Request::builder()
///     .url("http://example.com/search")
///     .method(Method::Post)
///     .body("q=grail")
///     .build();
/// assert_eq!(request.body.as_deref(), Some(&b"q=grail"[..]));
/// ```
#[derive(Debug, Clone, bon::Builder)]
pub struct Request {
    #[builder(into)]
    pub url: String,
    #[builder(default)]
    pub method: Method,
    /// Sent as request headers by schemes that have them
    #[builder(default)]
    pub params: HeadersMap,
    #[builder(into)]
    pub body: Option<Bytes>,
}

impl Request {
    pub fn get(url: impl Into<String>) -> Self {
        Request::builder().url(url).build()
    }
}

/// Split `scheme:rest`; a `/` before the first `:` means there is no scheme.
pub fn split_scheme(url: &str) -> Option<(&str, &str)> {
    let colon = url.find(':')?;
    let (scheme, rest) = (&url[..colon], &url[colon + 1..]);
    if scheme.is_empty() || scheme.contains('/') {
        return None;
    }
    Some((scheme, rest))
}

/// Authority part of a `//authority/path` remainder, userinfo removed.
pub fn split_host(rest: &str) -> Option<&str> {
    let authority = rest.strip_prefix("//")?;
    let end = authority.find(['/', '?', '#']).unwrap_or(authority.len());
    let authority = &authority[..end];
    let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    (!host.is_empty()).then_some(host)
}

/// What a handler is asked to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The URL with its `scheme:` prefix removed
    Direct(String),
    /// Relay `url` through the proxy at `proxy` (`host:port`)
    Proxied { proxy: String, url: String },
}

/// Session stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Meta,
    Data,
    /// One more `getdata` is allowed, and it returns the end of stream
    Eof,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Meta => "META",
            Stage::Data => "DATA",
            Stage::Eof => "EOF",
            Stage::Done => "DONE",
        };
        f.write_str(name)
    }
}

/// Fail with [`AccessError::InvalidStage`] unless `current` is allowed.
pub fn expect_stage(
    current: Stage,
    allowed: &[Stage],
    operation: &'static str,
) -> Result<(), AccessError> {
    if allowed.contains(&current) {
        Ok(())
    } else {
        Err(AccessError::InvalidStage {
            operation,
            stage: current,
        })
    }
}

/// Fail with [`AccessError::Malformed`] for a zero-byte read; an empty
/// `getdata` result is reserved for end of stream.
pub fn expect_read_size(max_bytes: usize) -> Result<(), AccessError> {
    if max_bytes == 0 {
        return Err(AccessError::Malformed("getdata needs max_bytes > 0".to_string()));
    }
    Ok(())
}

/// Answer to a `pollmeta`/`polldata` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollStatus {
    pub message: String,
    pub ready: bool,
}

impl PollStatus {
    pub fn ready() -> Self {
        Self {
            message: "Ready".to_string(),
            ready: true,
        }
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ready: false,
        }
    }
}

/// Protocol status plus headers, keyed by lowercased name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub status: u16,
    pub reason: String,
    pub headers: HeadersMap,
}

impl Meta {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.parse().ok()
    }
}

/// Readable byte stream behind a session
pub trait Transport: Read {
    /// OS handle for external multiplexed waiting, when there is one
    fn fileno(&self) -> Option<RawHandle> {
        None
    }
}

/// In-memory stream, no OS handle
impl Transport for std::io::Cursor<Vec<u8>> {}

impl Transport for std::net::TcpStream {
    #[cfg(unix)]
    fn fileno(&self) -> Option<RawHandle> {
        use std::os::fd::AsRawFd;
        Some(self.as_raw_fd())
    }

    #[cfg(windows)]
    fn fileno(&self) -> Option<RawHandle> {
        use std::os::windows::io::AsRawSocket;
        Some(self.as_raw_socket())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_scheme() {
        assert_eq!(split_scheme("http://host/"), Some(("http", "//host/")));
        assert_eq!(split_scheme("data:,x"), Some(("data", ",x")));
        assert_eq!(split_scheme("/relative/path:colon"), None);
        assert_eq!(split_scheme(":nothing"), None);
        assert_eq!(split_scheme("no-colon-here"), None);
    }

    #[test]
    fn test_split_host_strips_userinfo() {
        assert_eq!(split_host("//user:pw@ftp.example.com:21/pub"), Some("ftp.example.com:21"));
        assert_eq!(split_host("//example.com"), Some("example.com"));
        assert_eq!(split_host("//example.com?q=1"), Some("example.com"));
        assert_eq!(split_host("opaque"), None);
        assert_eq!(split_host("///path"), None);
    }

    #[test]
    fn test_request_builder_defaults() {
        let request = Request::builder().url("HTTP://Example.com/").build();

        assert_eq!(request.method, Method::Get);
        assert!(request.params.is_empty());
        assert!(request.body.is_none());
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("post".parse::<Method>().unwrap(), Method::Post);
        assert!("BREW".parse::<Method>().is_err());
    }

    #[test]
    fn test_expect_stage() {
        assert!(expect_stage(Stage::Data, &[Stage::Data, Stage::Eof], "getdata").is_ok());
        let err = expect_stage(Stage::Meta, &[Stage::Data], "getdata").unwrap_err();
        assert_eq!(err.to_string(), "getdata is not valid in stage META");
    }

    #[test]
    fn test_expect_read_size() {
        assert!(expect_read_size(1).is_ok());
        assert!(matches!(expect_read_size(0), Err(AccessError::Malformed(_))));
    }
}
