use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;

use super::data::DataHandler;
use super::error::AccessError;
use super::ftp::{FtpCache, FtpHandler, TcpFtpConnector};
use super::http::HttpHandler;
use super::traits::SchemeHandler;
use crate::config::Config;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler not found: {0}")]
    NotFound(String),
}

impl From<RegistryError> for AccessError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(scheme) => AccessError::NoHandler(scheme),
        }
    }
}

/// Canonical registry token for a scheme: lowercase, and every character
/// that is not ASCII alphanumeric replaced by `_`.
pub fn normalize_scheme(scheme: &str) -> String {
    scheme
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Registry mapping scheme tokens to handler instances
#[derive(Clone, Default)]
pub struct SchemeRegistry {
    handlers: BTreeMap<String, Rc<dyn SchemeHandler>>,
}

impl SchemeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scheme: &str, handler: Rc<dyn SchemeHandler>) {
        let token = normalize_scheme(scheme);
        tracing::debug!(scheme = %token, "Registered scheme handler");
        self.handlers.insert(token, handler);
    }

    pub fn get(&self, scheme: &str) -> Result<Rc<dyn SchemeHandler>, RegistryError> {
        let token = normalize_scheme(scheme);
        self.handlers
            .get(&token)
            .cloned()
            .ok_or(RegistryError::NotFound(token))
    }

    pub fn has_handler(&self, scheme: &str) -> bool {
        self.handlers.contains_key(&normalize_scheme(scheme))
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Registry with the built-in `data`, `ftp`, `http` and `https` handlers
    pub fn with_defaults(config: &Config) -> Self {
        let mut registry = Self::new();

        registry.register("data", Rc::new(DataHandler));

        let connector = Rc::new(TcpFtpConnector::new(config.ftp.connect_timeout()));
        let cache = FtpCache::shared(connector, &config.ftp);
        registry.register("ftp", Rc::new(FtpHandler::new(cache)));

        for scheme in ["http", "https"] {
            match HttpHandler::new(scheme, &config.fetch.user_agent) {
                Ok(handler) => registry.register(scheme, Rc::new(handler)),
                Err(err) => tracing::warn!(scheme, error = %err, "HTTP handler unavailable"),
            }
        }

        registry
    }
}

impl std::fmt::Debug for SchemeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.handlers.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scheme() {
        assert_eq!(normalize_scheme("HTTP"), "http");
        assert_eq!(normalize_scheme("x-exec"), "x_exec");
        assert_eq!(normalize_scheme("svn+ssh"), "svn_ssh");
    }

    #[test]
    fn test_lookup_is_normalized() {
        let mut registry = SchemeRegistry::new();
        registry.register("Data", Rc::new(DataHandler));

        assert!(registry.has_handler("DATA"));
        assert!(registry.get("data").is_ok());
        assert_eq!(registry.schemes().collect::<Vec<_>>(), vec!["data"]);
    }

    #[test]
    fn test_missing_handler_maps_to_no_handler() {
        let registry = SchemeRegistry::new();
        let err: AccessError = match registry.get("gopher") {
            Ok(_) => panic!("gopher should not be registered"),
            Err(err) => err.into(),
        };
        assert!(matches!(err, AccessError::NoHandler(ref s) if s == "gopher"));
    }

    #[test]
    fn test_defaults_cover_builtin_schemes() {
        let registry = SchemeRegistry::with_defaults(&Config::default());
        for scheme in ["data", "ftp", "http", "https"] {
            assert!(registry.has_handler(scheme), "missing {scheme}");
        }
    }
}
