//! First-run import of proxy settings from the environment

use tracing::info;

use crate::config::ProxiesConfig;

/// `<scheme>_proxy` variables considered when seeding
pub const SEEDED_PROXIES: [&str; 2] = ["http_proxy", "ftp_proxy"];

/// Fill unconfigured proxy preferences from `lookup` (normally the process
/// environment).
///
/// Does nothing once `manual_proxy_enabled` has a value. Otherwise every
/// known `<scheme>_proxy` is taken from the preferences or, failing that,
/// from the lower- then upper-case variable; `manual_proxy_enabled` records
/// whether any was found. Returns whether the settings changed and need
/// to be persisted.
pub fn seed_from_env<F>(proxies: &mut ProxiesConfig, lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    if proxies.manual_proxy_enabled.is_some() {
        return false;
    }

    let mut found = Vec::new();
    for name in SEEDED_PROXIES {
        let value = proxies
            .schemes
            .get(name)
            .filter(|value| !value.trim().is_empty())
            .cloned()
            .or_else(|| lookup_either_case(&lookup, name));
        if let Some(value) = value {
            proxies.schemes.insert(name.to_string(), value);
            found.push(name);
        }
    }
    proxies.manual_proxy_enabled = Some(!found.is_empty());

    if proxies.no_proxy_enabled.is_none() {
        let no_proxy = proxies
            .no_proxy
            .clone()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| lookup_either_case(&lookup, "no_proxy"));
        proxies.no_proxy_enabled = Some(no_proxy.is_some());
        if no_proxy.is_some() {
            proxies.no_proxy = no_proxy;
        }
    }

    info!(
        proxies = ?found,
        no_proxy_enabled = ?proxies.no_proxy_enabled,
        "Seeded proxy preferences from the environment"
    );
    true
}

/// [`seed_from_env`] over the process environment
pub fn seed_from_process_env(proxies: &mut ProxiesConfig) -> bool {
    seed_from_env(proxies, |name| std::env::var(name).ok())
}

fn lookup_either_case<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .or_else(|| lookup(&name.to_ascii_uppercase()))
        .filter(|value| !value.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_seeds_unconfigured_preferences() {
        let mut proxies = ProxiesConfig::default();
        let changed = seed_from_env(
            &mut proxies,
            env(&[("FTP_PROXY", "http://cache:3128"), ("no_proxy", "localhost")]),
        );

        assert!(changed);
        assert_eq!(proxies.manual_proxy_enabled, Some(true));
        assert_eq!(proxies.proxy_for("ftp"), Some("http://cache:3128"));
        assert_eq!(proxies.proxy_for("http"), None);
        assert_eq!(proxies.no_proxy_enabled, Some(true));
        assert_eq!(proxies.no_proxy_list(), vec!["localhost"]);
    }

    #[test]
    fn test_runs_once() {
        let mut proxies = ProxiesConfig::default();
        assert!(seed_from_env(&mut proxies, env(&[])));
        assert_eq!(proxies.manual_proxy_enabled, Some(false));
        assert_eq!(proxies.no_proxy_enabled, Some(false));

        let before = proxies.clone();
        assert!(!seed_from_env(&mut proxies, env(&[("http_proxy", "http://p:1")])));
        assert_eq!(proxies, before);
    }

    #[test]
    fn test_preference_wins_over_environment() {
        let mut proxies = ProxiesConfig::default();
        proxies.set_proxy("http", "http://pref:8080");
        seed_from_env(&mut proxies, env(&[("http_proxy", "http://env:8080")]));

        assert_eq!(proxies.proxy_for("http"), Some("http://pref:8080"));
        assert_eq!(proxies.manual_proxy_enabled, Some(true));
    }

    #[test]
    fn test_existing_no_proxy_flag_is_kept() {
        let mut proxies = ProxiesConfig {
            no_proxy_enabled: Some(false),
            ..ProxiesConfig::default()
        };
        seed_from_env(&mut proxies, env(&[("no_proxy", "localhost")]));

        assert_eq!(proxies.no_proxy_enabled, Some(false));
        assert_eq!(proxies.no_proxy, None);
    }
}
