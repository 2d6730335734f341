pub mod access;
pub mod config;
pub mod fetch;
pub mod humanize;
pub mod observability;
pub mod protocols;
pub mod proxy;
pub mod queue;

pub use access::ProtocolApi;
pub use protocols::{AccessError, ProtocolAccess, Request, SchemeHandler};
