//! Entry point: turns a request into an open protocol session

use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::config::{Config, ProxiesConfig};
use crate::observability::AccessMetrics;
use crate::protocols::{
    AccessError, ProtocolAccess, Request, SchemeHandler, SchemeRegistry, normalize_scheme,
    split_scheme,
};
use crate::proxy::{ProxyDecision, ProxyResolver};
use crate::queue::AdmissionQueue;

/// URL join function of one scheme
pub type Joiner = Box<dyn Fn(&str, &str) -> Result<String, AccessError>>;

/// Scheme registry, proxy routing and the socket admission queue
#[derive(Debug)]
pub struct ProtocolApi {
    registry: SchemeRegistry,
    resolver: ProxyResolver,
    sockets: AdmissionQueue,
    metrics: AccessMetrics,
}

impl ProtocolApi {
    pub fn new(registry: SchemeRegistry, proxies: ProxiesConfig, max_sockets: usize) -> Self {
        Self {
            registry,
            resolver: ProxyResolver::new(proxies),
            sockets: AdmissionQueue::new(max_sockets),
            metrics: AccessMetrics::new(),
        }
    }

    /// Built-in handlers, proxies and socket limit from `config`
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            SchemeRegistry::with_defaults(config),
            config.proxies.clone(),
            config.sockets.number,
        )
    }

    pub fn registry(&self) -> &SchemeRegistry {
        &self.registry
    }

    pub fn resolver(&self) -> &ProxyResolver {
        &self.resolver
    }

    pub fn sockets(&self) -> &AdmissionQueue {
        &self.sockets
    }

    pub fn sockets_mut(&mut self) -> &mut AdmissionQueue {
        &mut self.sockets
    }

    pub fn metrics(&self) -> &AccessMetrics {
        &self.metrics
    }

    /// How `url` would be routed
    pub fn route(&self, url: &str) -> Result<ProxyDecision, AccessError> {
        let (scheme, rest) = split_scheme(url)
            .ok_or_else(|| AccessError::Malformed(format!("no scheme identifier in URL: {url}")))?;
        self.resolver.resolve(&normalize_scheme(scheme), rest, url)
    }

    /// Open a session for `request`.
    ///
    /// Fails before any I/O when the URL has no scheme, the proxy setting is
    /// invalid or no handler is registered.
    pub fn protocol_access(
        &self,
        request: &Request,
    ) -> Result<Box<dyn ProtocolAccess>, AccessError> {
        let result = self.open(request);
        match &result {
            Ok(_) => self.metrics.session_opened(),
            Err(err) => {
                self.metrics.session_failed();
                warn!(url = %request.url, error = %err, "Protocol access failed");
            }
        }
        result
    }

    fn open(&self, request: &Request) -> Result<Box<dyn ProtocolAccess>, AccessError> {
        let decision = self.route(&request.url)?;
        let handler = self.registry.get(&decision.dispatch_scheme)?;

        if decision.use_proxy {
            if !handler.supports_proxy() {
                return Err(AccessError::Malformed(format!(
                    "'{}' handler cannot relay through a proxy",
                    decision.dispatch_scheme
                )));
            }
        }

        debug!(
            url = %request.url,
            scheme = %decision.dispatch_scheme,
            proxied = decision.use_proxy,
            "Opening session"
        );
        let session = handler.open(decision.target(), request)?;
        if decision.use_proxy {
            self.metrics.session_proxied();
        }
        Ok(session)
    }

    /// Join function for `scheme`, if a handler is registered for it
    pub fn protocol_joiner(&self, scheme: &str) -> Option<Joiner> {
        let handler: Rc<dyn SchemeHandler> = self.registry.get(scheme).ok()?;
        Some(Box::new(move |base: &str, relative: &str| handler.join(base, relative)))
    }

    /// Resolve `relative` against `base` with the joiner of the base's scheme
    pub fn join(&self, base: &str, relative: &str) -> Result<String, AccessError> {
        let (scheme, _) = split_scheme(base)
            .ok_or_else(|| AccessError::Malformed(format!("no scheme identifier in URL: {base}")))?;
        let joiner = self
            .protocol_joiner(scheme)
            .ok_or_else(|| AccessError::NoHandler(normalize_scheme(scheme)))?;
        joiner(base, relative)
    }

    /// Apply changed preferences: socket limit and proxy settings.
    /// Returns the number of waiters admitted by a larger limit.
    pub fn apply_config(&mut self, config: &Config) -> usize {
        self.resolver.set_settings(config.proxies.clone());
        let admitted = self.sockets.resize(config.sockets.number);
        info!(
            sockets = config.sockets.number,
            admitted, "Applied configuration"
        );
        admitted
    }
}
