//! Scheme handlers and the session state machine they share

pub mod data;
pub mod error;
pub mod ftp;
pub mod http;
pub mod registry;
pub mod relay;
pub mod traits;
pub mod types;

pub use data::{DataAccess, DataHandler};
pub use error::{AccessError, BoxError};
pub use http::{HttpAccess, HttpHandler};
pub use registry::{RegistryError, SchemeRegistry, normalize_scheme};
pub use relay::RelayAccess;
pub use traits::{ProtocolAccess, SchemeHandler};
pub use types::{
    HeadersMap, Meta, Method, PollStatus, RawHandle, Request, Stage, Target, Transport,
    expect_read_size, expect_stage, split_host, split_scheme,
};
