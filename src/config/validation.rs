use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("sockets.number must be at least 1 (got {0})")]
    InvalidSocketCount(usize),

    #[error("fetch.chunk_size must be positive")]
    EmptyChunkSize,

    #[error("Unknown proxies key '{0}', expected '<scheme>_proxy'")]
    UnknownProxyKey(String),

    #[error("ftp.connect_timeout_secs must be positive")]
    InvalidConnectTimeout,
}

/// Validate the entire configuration
///
/// Proxy URLs are not checked here; a malformed proxy fails the request
/// that would use it.
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_sockets(config)?;
    validate_fetch(config)?;
    validate_proxies(config)?;
    validate_ftp(config)?;
    Ok(())
}

fn validate_sockets(config: &Config) -> Result<(), ValidationError> {
    if config.sockets.number == 0 {
        return Err(ValidationError::InvalidSocketCount(config.sockets.number));
    }
    Ok(())
}

fn validate_fetch(config: &Config) -> Result<(), ValidationError> {
    if config.fetch.chunk_size.as_u64() == 0 {
        return Err(ValidationError::EmptyChunkSize);
    }
    Ok(())
}

fn validate_proxies(config: &Config) -> Result<(), ValidationError> {
    for key in config.proxies.schemes.keys() {
        let scheme = key.strip_suffix("_proxy").unwrap_or_default();
        if scheme.is_empty() {
            return Err(ValidationError::UnknownProxyKey(key.clone()));
        }
    }
    Ok(())
}

fn validate_ftp(config: &Config) -> Result<(), ValidationError> {
    if config.ftp.connect_timeout_secs == 0 {
        return Err(ValidationError::InvalidConnectTimeout);
    }
    Ok(())
}
