use bytes::Bytes;
use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;
use tracing::debug;
use url::Url;

use super::cache::{FtpCache, FtpLease};
use super::client::{FTP_PORT, TransferType};
use super::listing::ListingTranscoder;
use crate::protocols::error::AccessError;
use crate::protocols::traits::{ProtocolAccess, SchemeHandler};
use crate::protocols::types::{
    HeadersMap, Meta, Method, PollStatus, RawHandle, Request, Stage, Target, Transport,
    expect_read_size, expect_stage,
};

const SCHEME: &str = "ftp";

/// `ftp:` handler; owns the connection cache its sessions share
#[derive(Debug, Clone)]
pub struct FtpHandler {
    cache: Rc<RefCell<FtpCache>>,
}

impl FtpHandler {
    pub fn new(cache: Rc<RefCell<FtpCache>>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Rc<RefCell<FtpCache>> {
        &self.cache
    }
}

impl SchemeHandler for FtpHandler {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn open(
        &self,
        target: Target,
        request: &Request,
    ) -> Result<Box<dyn ProtocolAccess>, AccessError> {
        if request.method != Method::Get {
            return Err(AccessError::UnsupportedMethod {
                scheme: SCHEME.to_string(),
                method: request.method.to_string(),
            });
        }
        let Target::Direct(rest) = target else {
            return Err(AccessError::Malformed(
                "ftp: handler does not relay through proxies".to_string(),
            ));
        };

        let location = FtpLocation::parse(&rest)?;
        let session = FtpAccess::open(Rc::clone(&self.cache), location)?;
        Ok(Box::new(session))
    }
}

/// Everything an `ftp://` URL says about the transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpLocation {
    pub url: String,
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub dirs: Vec<String>,
    pub file: String,
    pub kind: TransferType,
    pub content_type: Option<String>,
    pub content_encoding: Option<&'static str>,
}

impl FtpLocation {
    /// Parse the part of an `ftp:` URL after the scheme.
    pub fn parse(rest: &str) -> Result<Self, AccessError> {
        if !rest.starts_with("//") {
            return Err(AccessError::Malformed("ftp error: no host given".to_string()));
        }
        let mut url = Url::parse(&format!("{SCHEME}:{rest}"))
            .map_err(|e| AccessError::Malformed(format!("ftp:{rest}: {e}")))?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AccessError::Malformed("ftp error: no host given".to_string()))?
            .to_string();
        let port = url.port().unwrap_or(FTP_PORT);
        let user = url.username().to_string();
        let password = url.password().unwrap_or_default().to_string();

        let full_path = url.path().to_string();
        let mut parts = full_path.split(';');
        let path = parts.next().unwrap_or_default().to_string();
        let attrs: Vec<&str> = parts.collect();

        let mut segments: Vec<String> = path.split('/').map(str::to_string).collect();
        let file = segments.pop().unwrap_or_default();
        if segments.first().is_some_and(String::is_empty) {
            segments.remove(0);
        }

        let (content_type, content_encoding) = if file.is_empty() {
            (None, None)
        } else {
            guess_type(&file)
        };
        let mut kind = if file.is_empty() {
            TransferType::Directory
        } else if content_encoding.is_some() {
            TransferType::Image
        } else if content_type
            .as_deref()
            .and_then(|t| t.parse::<mime::Mime>().ok())
            .is_some_and(|m| m.type_() == mime::TEXT)
        {
            TransferType::Ascii
        } else {
            TransferType::Image
        };

        for attr in attrs {
            let Some((name, value)) = attr.split_once('=') else {
                continue;
            };
            if name.eq_ignore_ascii_case("type") {
                if let Some(requested) = TransferType::from_attr(value) {
                    kind = requested;
                }
            }
        }

        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        let _ = url.set_password(None);

        Ok(Self {
            url: url.into(),
            user,
            password,
            host,
            port,
            dirs: segments,
            file,
            kind,
            content_type,
            content_encoding,
        })
    }
}

/// Content type and encoding from a file name, the way a browser guesses
pub fn guess_type(name: &str) -> (Option<String>, Option<&'static str>) {
    let (stem, encoding) = [(".gz", "gzip"), (".Z", "compress"), (".bz2", "bzip2")]
        .iter()
        .find_map(|&(suffix, encoding)| {
            name.strip_suffix(suffix)
                .map(|stem| (stem, Some(encoding)))
        })
        .unwrap_or((name, None));

    let extension = stem
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    let content_type = match extension.as_str() {
        "txt" | "text" | "c" | "h" | "py" | "rs" | "pl" | "sh" | "diff" | "patch" => {
            Some(mime::TEXT_PLAIN)
        }
        "html" | "htm" => Some(mime::TEXT_HTML),
        "css" => Some(mime::TEXT_CSS),
        "csv" => Some(mime::TEXT_CSV),
        "xml" => Some(mime::TEXT_XML),
        "js" => Some(mime::TEXT_JAVASCRIPT),
        "gif" => Some(mime::IMAGE_GIF),
        "jpg" | "jpeg" => Some(mime::IMAGE_JPEG),
        "png" => Some(mime::IMAGE_PNG),
        "bmp" => Some(mime::IMAGE_BMP),
        "svg" => Some(mime::IMAGE_SVG),
        "pdf" => Some(mime::APPLICATION_PDF),
        "json" => Some(mime::APPLICATION_JSON),
        "tar" | "zip" | "bin" | "exe" => Some(mime::APPLICATION_OCTET_STREAM),
        _ => None,
    };

    (content_type.map(|m| m.to_string()), encoding)
}

/// One FTP retrieval holding a cache lease until closed
pub struct FtpAccess {
    cache: Rc<RefCell<FtpCache>>,
    lease: Option<FtpLease>,
    transport: Option<Box<dyn Transport>>,
    stage: Stage,
    url: String,
    is_dir: bool,
    content_type: Option<String>,
    content_encoding: Option<&'static str>,
    content_length: Option<u64>,
    listing: Option<ListingTranscoder>,
}

impl FtpAccess {
    fn open(cache: Rc<RefCell<FtpCache>>, location: FtpLocation) -> Result<Self, AccessError> {
        let (lease, retrieval) = {
            let mut guard = cache.borrow_mut();
            let lease = guard
                .acquire(
                    &location.user,
                    &location.password,
                    &location.host,
                    location.port,
                    &location.dirs,
                )
                .map_err(|e| AccessError::transport(SCHEME, e))?;

            match guard.retrieve(&lease, &location.file, location.kind) {
                Ok(retrieval) => (lease, retrieval),
                Err(err) => {
                    guard.release(lease);
                    return Err(AccessError::transport(SCHEME, err));
                }
            }
        };

        debug!(url = %location.url, is_dir = retrieval.is_dir, "Opened FTP session");
        Ok(Self {
            cache,
            lease: Some(lease),
            transport: Some(retrieval.transport),
            stage: Stage::Meta,
            url: location.url,
            is_dir: retrieval.is_dir,
            content_type: location.content_type,
            content_encoding: location.content_encoding,
            content_length: retrieval.content_length,
            listing: None,
        })
    }
}

impl ProtocolAccess for FtpAccess {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn pollmeta(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "pollmeta")?;
        Ok(PollStatus::ready())
    }

    fn getmeta(&mut self) -> Result<Meta, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "getmeta")?;
        self.stage = Stage::Data;

        if self.is_dir {
            if !self.url.ends_with('/') {
                self.url.push('/');
            }
            self.content_type = Some(mime::TEXT_HTML.to_string());
            self.content_encoding = None;
            self.listing = Some(ListingTranscoder::new(self.url.clone()));
        }

        let mut headers = HeadersMap::new();
        if let Some(content_type) = &self.content_type {
            headers.insert("content-type".to_string(), content_type.clone());
        }
        if let Some(encoding) = self.content_encoding {
            headers.insert("content-encoding".to_string(), encoding.to_string());
        }
        if let Some(length) = self.content_length.filter(|n| *n > 0) {
            headers.insert("content-length".to_string(), length.to_string());
        }

        Ok(Meta {
            status: 200,
            reason: "OK".to_string(),
            headers,
        })
    }

    fn polldata(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Data, Stage::Eof], "polldata")?;
        Ok(PollStatus::ready())
    }

    fn getdata(&mut self, max_bytes: usize) -> Result<Bytes, AccessError> {
        expect_stage(self.stage, &[Stage::Data, Stage::Eof], "getdata")?;
        expect_read_size(max_bytes)?;
        if self.stage == Stage::Eof {
            self.stage = Stage::Done;
            return Ok(Bytes::new());
        }

        let mut buf = vec![0u8; max_bytes];
        loop {
            let Some(transport) = self.transport.as_mut() else {
                self.stage = Stage::Done;
                return Ok(Bytes::new());
            };
            let n = transport
                .read(&mut buf)
                .map_err(|e| AccessError::transport(SCHEME, e))?;
            if n == 0 {
                self.transport = None;
            }

            let Some(listing) = self.listing.as_mut() else {
                if n == 0 {
                    self.stage = Stage::Done;
                }
                return Ok(Bytes::copy_from_slice(&buf[..n]));
            };

            if n == 0 {
                let tail = listing.finish();
                self.stage = if tail.is_empty() { Stage::Done } else { Stage::Eof };
                return Ok(tail);
            }
            let html = listing.push(&buf[..n]);
            if !html.is_empty() {
                return Ok(html);
            }
        }
    }

    fn close(&mut self) {
        self.transport = None;
        if let Some(lease) = self.lease.take() {
            self.cache.borrow_mut().release(lease);
        }
        self.stage = Stage::Done;
    }

    fn fileno(&self) -> Option<RawHandle> {
        self.transport.as_ref().and_then(|t| t.fileno())
    }
}

impl Drop for FtpAccess {
    fn drop(&mut self) {
        self.close();
    }
}
