//! `data:` URLs (RFC 2397)

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::Bytes;
use percent_encoding::percent_decode_str;

use super::error::AccessError;
use super::traits::{ProtocolAccess, SchemeHandler};
use super::types::{
    HeadersMap, Meta, Method, PollStatus, Request, Stage, Target, expect_read_size, expect_stage,
};

const DEFAULT_CONTENT_TYPE: &str = "text/plain";

#[derive(Debug, Clone, Copy, Default)]
pub struct DataHandler;

impl SchemeHandler for DataHandler {
    fn scheme(&self) -> &str {
        "data"
    }

    fn open(
        &self,
        target: Target,
        request: &Request,
    ) -> Result<Box<dyn ProtocolAccess>, AccessError> {
        if request.method != Method::Get {
            return Err(AccessError::UnsupportedMethod {
                scheme: "data".to_string(),
                method: request.method.to_string(),
            });
        }
        let Target::Direct(rest) = target else {
            return Err(AccessError::Malformed("data: URLs cannot be proxied".to_string()));
        };
        let (content_type, payload) = parse(&rest)?;
        Ok(Box::new(DataAccess::new(content_type, payload)))
    }
}

/// Session over an in-memory payload
#[derive(Debug)]
pub struct DataAccess {
    stage: Stage,
    content_type: String,
    payload: Bytes,
}

impl DataAccess {
    pub fn new(content_type: String, payload: Bytes) -> Self {
        Self {
            stage: Stage::Meta,
            content_type,
            payload,
        }
    }
}

impl ProtocolAccess for DataAccess {
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

        let mut headers = HeadersMap::new();
        headers.insert("content-type".to_string(), self.content_type.clone());
        headers.insert("content-length".to_string(), self.payload.len().to_string());

        let (status, reason) = if self.payload.is_empty() {
            (204, "No content")
        } else {
            (200, "Ready")
        };
        Ok(Meta {
            status,
            reason: reason.to_string(),
            headers,
        })
    }

    fn polldata(&mut self) -> Result<PollStatus, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "polldata")?;
        Ok(PollStatus::ready())
    }

    fn getdata(&mut self, max_bytes: usize) -> Result<Bytes, AccessError> {
        expect_stage(self.stage, &[Stage::Data], "getdata")?;
        expect_read_size(max_bytes)?;
        let take = max_bytes.min(self.payload.len());
        let chunk = self.payload.split_to(take);
        if chunk.is_empty() {
            self.stage = Stage::Done;
        }
        Ok(chunk)
    }

    fn close(&mut self) {
        self.payload.clear();
        self.stage = Stage::Done;
    }
}

/// Split `[<mediatype>][;base64],<payload>` into content type and bytes.
pub fn parse(rest: &str) -> Result<(String, Bytes), AccessError> {
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| AccessError::Malformed("data: URL without ','".to_string()))?;

    let mut params: Vec<&str> = header.split(';').map(str::trim).collect();
    let is_base64 = params
        .last()
        .is_some_and(|last| last.eq_ignore_ascii_case("base64"));
    if is_base64 {
        params.pop();
    }

    let media = params.join(";").to_ascii_lowercase();
    let content_type = if media.is_empty() || media.starts_with(';') {
        format!("{DEFAULT_CONTENT_TYPE}{media}")
    } else {
        media
    };

    let decoded: Vec<u8> = percent_decode_str(payload).collect();
    let bytes = if is_base64 {
        let compact: Vec<u8> = decoded
            .into_iter()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        STANDARD
            .decode(compact)
            .map_err(|e| AccessError::Malformed(format!("bad base64 payload: {e}")))?
    } else {
        decoded
    };

    Ok((content_type, Bytes::from(bytes)))
}
