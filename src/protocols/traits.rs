use bytes::Bytes;
use url::Url;

use super::error::AccessError;
use super::types::{Meta, PollStatus, RawHandle, Request, Stage, Target};

/// A single in-flight request, driven by polling.
///
/// The caller walks the session through its stages:
///
/// ```text
/// META --getmeta--> DATA --getdata (non-empty)--> DATA
///                   DATA --getdata (empty)------> DONE
///                   DATA --getdata (last data)--> EOF --getdata--> DONE
/// any  --close--> DONE
/// ```
///
/// An empty `getdata` result means end of stream. Calling an operation in a
/// stage that forbids it returns [`AccessError::InvalidStage`].
pub trait ProtocolAccess {
    fn stage(&self) -> Stage;

    /// Non-blocking check whether the metadata can be read
    fn pollmeta(&mut self) -> Result<PollStatus, AccessError>;

    /// Status and headers; moves META to DATA
    fn getmeta(&mut self) -> Result<Meta, AccessError>;

    /// Non-blocking check whether payload can be read
    fn polldata(&mut self) -> Result<PollStatus, AccessError>;

    /// Up to `max_bytes` of payload; empty at end of stream
    fn getdata(&mut self, max_bytes: usize) -> Result<Bytes, AccessError>;

    /// Release the transport. Idempotent, valid in every stage.
    fn close(&mut self);

    fn fileno(&self) -> Option<RawHandle> {
        None
    }
}

/// Capabilities registered for one scheme
pub trait SchemeHandler {
    /// Canonical scheme token this handler was built for
    fn scheme(&self) -> &str;

    /// Start a session. Wire failures come back as
    /// [`AccessError::Transport`].
    fn open(
        &self,
        target: Target,
        request: &Request,
    ) -> Result<Box<dyn ProtocolAccess>, AccessError>;

    /// Whether `open` understands [`Target::Proxied`]
    fn supports_proxy(&self) -> bool {
        false
    }

    /// Resolve `relative` against `base`
    fn join(&self, base: &str, relative: &str) -> Result<String, AccessError> {
        let base = Url::parse(base).map_err(|e| AccessError::Malformed(format!("{base}: {e}")))?;
        let joined = base
            .join(relative)
            .map_err(|e| AccessError::Malformed(format!("{relative}: {e}")))?;
        Ok(joined.into())
    }
}
