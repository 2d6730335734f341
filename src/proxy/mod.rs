//! Per-request proxy routing and first-run seeding

pub mod resolver;
pub mod seed;

pub use resolver::{ProxyDecision, ProxyResolver, proxy_exception, valid_proxy};
pub use seed::{SEEDED_PROXIES, seed_from_env, seed_from_process_env};
