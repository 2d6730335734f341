use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::config::ProxiesConfig;
use crate::protocols::{AccessError, Target, split_host, split_scheme};

/// How one request is routed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxyDecision {
    pub use_proxy: bool,
    /// `host:port` of the proxy when `use_proxy` is set
    pub proxy_target: Option<String>,
    /// Scheme whose handler opens the request
    pub dispatch_scheme: String,
    /// Rest of the URL when direct, the full URL when proxied
    pub original_selector: String,
}

impl ProxyDecision {
    pub fn direct(scheme: &str, rest: &str) -> Self {
        Self {
            use_proxy: false,
            proxy_target: None,
            dispatch_scheme: scheme.to_string(),
            original_selector: rest.to_string(),
        }
    }

    /// Selector handed to the handler's `open`
    pub fn target(&self) -> Target {
        match (&self.proxy_target, self.use_proxy) {
            (Some(proxy), true) => Target::Proxied {
                proxy: proxy.clone(),
                url: self.original_selector.clone(),
            },
            _ => Target::Direct(self.original_selector.clone()),
        }
    }
}

/// Decides per request whether to go through a configured proxy
#[derive(Debug, Clone, Default)]
pub struct ProxyResolver {
    settings: ProxiesConfig,
}

impl ProxyResolver {
    pub fn new(settings: ProxiesConfig) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProxiesConfig {
        &self.settings
    }

    pub fn set_settings(&mut self, settings: ProxiesConfig) {
        self.settings = settings;
    }

    /// Route a request for `scheme` (normalised), whose URL is `url` and
    /// whose text after `scheme:` is `rest`.
    pub fn resolve(
        &self,
        scheme: &str,
        rest: &str,
        url: &str,
    ) -> Result<ProxyDecision, AccessError> {
        if self.settings.manual_proxy_enabled != Some(true) {
            return Ok(ProxyDecision::direct(scheme, rest));
        }
        let Some(proxy) = self.settings.proxy_for(scheme) else {
            return Ok(ProxyDecision::direct(scheme, rest));
        };
        let proxy_url = valid_proxy(proxy)?;

        let exceptions = self.settings.no_proxy_list();
        if !exceptions.is_empty() {
            let host = split_host(rest).unwrap_or_default().to_ascii_lowercase();
            if proxy_exception(&host, &exceptions)
                || proxy_exception(strip_port(&host), &exceptions)
            {
                debug!(scheme, host = %host, "Host is a proxy exception, going direct");
                return Ok(ProxyDecision::direct(scheme, rest));
            }
        }

        let proxy_host = proxy_url
            .host_str()
            .ok_or_else(|| AccessError::InvalidProxy(format!("{proxy}: no host")))?;
        let proxy_port = proxy_url.port_or_known_default().unwrap_or(80);
        let decision = ProxyDecision {
            use_proxy: true,
            proxy_target: Some(format!("{proxy_host}:{proxy_port}")),
            dispatch_scheme: proxy_url.scheme().to_string(),
            original_selector: url.to_string(),
        };
        debug!(scheme, url, proxy = ?decision.proxy_target, "Routing through proxy");
        Ok(decision)
    }
}

/// True when `host` equals an entry, or ends with an entry that starts with `.`
pub fn proxy_exception(host: &str, exceptions: &[String]) -> bool {
    exceptions
        .iter()
        .any(|entry| host == entry || (entry.starts_with('.') && host.ends_with(entry.as_str())))
}

/// Parse a proxy setting, which must be a plain `http:` URL.
pub fn valid_proxy(proxy: &str) -> Result<Url, AccessError> {
    let invalid = || AccessError::InvalidProxy(proxy.to_string());

    match split_scheme(proxy) {
        Some(("http", _)) => {}
        _ => return Err(invalid()),
    }
    let url = Url::parse(proxy).map_err(|_| invalid())?;
    if url.query().is_some() || url.fragment().is_some() || url.path().contains(';') {
        return Err(invalid());
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid());
    }
    Ok(url)
}

/// `host:1234` to `host`; anything else unchanged
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((bare, port)) if port.bytes().all(|b| b.is_ascii_digit()) => bare,
        _ => host,
    }
}
