//! `http:` and `https:` sessions over the blocking reqwest client

use bytes::Bytes;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::Proxy;
use std::io::Read;
use tracing::debug;

use super::error::AccessError;
use super::relay::{RelayAccess, is_http_url, relay_request};
use super::traits::{ProtocolAccess, SchemeHandler};
use super::types::{
    HeadersMap, Meta, Method, PollStatus, Request, Stage, Target, expect_read_size, expect_stage,
};

#[derive(Debug)]
pub struct HttpHandler {
    scheme: String,
    user_agent: String,
    client: Client,
}

impl HttpHandler {
    pub fn new(scheme: &str, user_agent: &str) -> Result<Self, AccessError> {
        let client = Self::client_builder(user_agent)
            .build()
            .map_err(|e| AccessError::transport(scheme, e))?;

        Ok(Self {
            scheme: scheme.to_string(),
            user_agent: user_agent.to_string(),
            client,
        })
    }

    /// Routing is decided by the proxy resolver, so system proxies are ignored.
    fn client_builder(user_agent: &str) -> reqwest::blocking::ClientBuilder {
        Client::builder()
            .user_agent(user_agent)
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
    }

    /// Client relaying every request through `proxy` (`host:port`)
    fn proxied_client(&self, proxy: &str) -> Result<Client, AccessError> {
        let proxy = Proxy::all(format!("http://{proxy}"))
            .map_err(|e| AccessError::InvalidProxy(format!("{proxy}: {e}")))?;
        Self::client_builder(&self.user_agent)
            .proxy(proxy)
            .build()
            .map_err(|e| AccessError::transport(&self.scheme, e))
    }
}

impl SchemeHandler for HttpHandler {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn supports_proxy(&self) -> bool {
        true
    }

    fn open(
        &self,
        target: Target,
        request: &Request,
    ) -> Result<Box<dyn ProtocolAccess>, AccessError> {
        let (client, url) = match target {
            Target::Direct(rest) => (self.client.clone(), format!("{}:{rest}", self.scheme)),
            Target::Proxied { proxy, url } if !is_http_url(&url) => {
                let outgoing = relay_request(&url, request, &self.user_agent)?;
                debug!(proxy = %proxy, url = %url, "Relaying non-HTTP URL through proxy");
                return Ok(Box::new(RelayAccess::new(proxy, outgoing)));
            }
            Target::Proxied { proxy, url } => (self.proxied_client(&proxy)?, url),
        };

        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Head => reqwest::Method::HEAD,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = client.request(method, &url);
        for (name, value) in &request.params {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.to_vec());
        }

        debug!(scheme = %self.scheme, url = %url, "Opened HTTP session");
        Ok(Box::new(HttpAccess {
            scheme: self.scheme.clone(),
            stage: Stage::Meta,
            pending: Some(builder),
            response: None,
        }))
    }
}

/// One HTTP exchange; the request is sent by `getmeta`
pub struct HttpAccess {
    scheme: String,
    stage: Stage,
    pending: Option<RequestBuilder>,
    response: Option<Response>,
}

impl ProtocolAccess for HttpAccess {
    fn stage(&self) -> Stage {
        self.stage
    }

    fn pollmeta(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "pollmeta")?;
        Ok(PollStatus::ready())
    }

    fn getmeta(&mut self) -> Result<Meta, AccessError> {
        expect_stage(self.stage, &[Stage::Meta], "getmeta")?;
        let builder = self
            .pending
            .take()
            .ok_or(AccessError::InvalidStage { operation: "getmeta", stage: self.stage })?;

        let response = match builder.send() {
            Ok(response) => response,
            Err(e) => {
                self.stage = Stage::Done;
                return Err(AccessError::transport(&self.scheme, e));
            }
        };

        let status = response.status();
        let meta = Meta {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers: collect_headers(response.headers()),
        };

        self.response = Some(response);
        self.stage = Stage::Data;
        Ok(meta)
    }

    fn polldata(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "polldata")?;
        Ok(PollStatus::ready())
    }

    fn getdata(&mut self, max_bytes: usize) -> Result<Bytes, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "getdata")?;
        expect_read_size(max_bytes)?;
        let Some(response) = self.response.as_mut() else {
            self.stage = Stage::Done;
            return Ok(Bytes::new());
        };

        let mut buf = vec![0u8; max_bytes];
        let n = response
            .read(&mut buf)
            .map_err(|e| AccessError::transport(&self.scheme, e))?;
        if n == 0 {
            self.close();
            return Ok(Bytes::new());
        }
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    fn close(&mut self) {
        self.pending = None;
        self.response = None;
        self.stage = Stage::Done;
    }
}

impl Drop for HttpAccess {
    fn drop(&mut self) {
        self.close();
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HeadersMap {
    let mut map = HeadersMap::new();
    for (name, value) in headers {
        add_header(
            &mut map,
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }
    map
}

/// Store under the lowercased name; a repeated header is joined with `, `.
pub(crate) fn add_header(map: &mut HeadersMap, name: &str, value: String) {
    map.entry(name.to_ascii_lowercase())
        .and_modify(|existing: &mut String| {
            existing.push_str(", ");
            existing.push_str(&value);
        })
        .or_insert(value);
}
