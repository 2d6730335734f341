//! Reusable FTP control connections keyed by login and directory

use percent_encoding::percent_decode_str;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::client::{FtpConnector, FtpControl, FtpError, FtpResult, TransferType};
use crate::config::FtpConfig;
use crate::protocols::types::Transport;

/// `(user, host, port, directory chain)` as they appear in the URL
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub dirs: String,
}

impl CacheKey {
    pub fn new(user: &str, host: &str, port: u16, dirs: &[String]) -> Self {
        Self {
            user: user.to_string(),
            host: host.to_ascii_lowercase(),
            port,
            dirs: dirs.join("/"),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.dirs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FtpCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub resets: u64,
}

/// Busy hold on one cached connection. Hand it back with [`FtpCache::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct FtpLease {
    key: CacheKey,
    id: u64,
}

impl FtpLease {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

/// Result of a retrieval: the data stream and what it turned out to be
pub struct Retrieval {
    pub transport: Box<dyn Transport>,
    pub is_dir: bool,
    pub content_length: Option<u64>,
}

impl fmt::Debug for Retrieval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retrieval")
            .field("is_dir", &self.is_dir)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Decoded login and navigation, kept so a connection can be rebuilt
#[derive(Debug, Clone)]
struct Login {
    host: String,
    port: u16,
    user: String,
    password: String,
    dirs: Vec<String>,
}

impl Login {
    fn open(&self, connector: &dyn FtpConnector) -> FtpResult<Box<dyn FtpControl>> {
        let mut control = connector.connect(&self.host, self.port)?;
        control.login(&self.user, &self.password)?;
        for dir in &self.dirs {
            control.cwd(dir)?;
        }
        Ok(control)
    }
}

/// One cache entry
pub struct FtpConnection {
    id: u64,
    login: Login,
    control: Box<dyn FtpControl>,
    busy: bool,
    transferring: bool,
    healthy: bool,
    idle_since: Instant,
}

impl FtpConnection {
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    fn reset(&mut self, connector: &dyn FtpConnector) -> FtpResult<()> {
        let _ = self.control.quit();
        match self.login.open(connector) {
            Ok(control) => {
                self.control = control;
                self.healthy = true;
                Ok(())
            }
            Err(err) => {
                self.healthy = false;
                Err(err)
            }
        }
    }
}

impl Drop for FtpConnection {
    fn drop(&mut self) {
        if let Err(err) = self.control.quit() {
            debug!(host = %self.login.host, error = %err, "QUIT failed");
        }
    }
}

impl fmt::Debug for FtpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConnection")
            .field("id", &self.id)
            .field("busy", &self.busy)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

/// Connection cache owned by the FTP handler and shared with its sessions
pub struct FtpCache {
    connector: Rc<dyn FtpConnector>,
    entries: BTreeMap<CacheKey, Vec<FtpConnection>>,
    idle_timeout: Duration,
    max_idle_per_host: usize,
    next_id: u64,
    stats: FtpCacheStats,
}

impl FtpCache {
    pub fn new(connector: Rc<dyn FtpConnector>, config: &FtpConfig) -> Self {
        Self {
            connector,
            entries: BTreeMap::new(),
            idle_timeout: config.idle_timeout(),
            max_idle_per_host: config.max_idle_per_host,
            next_id: 0,
            stats: FtpCacheStats::default(),
        }
    }

    pub fn shared(connector: Rc<dyn FtpConnector>, config: &FtpConfig) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(connector, config)))
    }

    /// Take a non-busy connection for the key, or open a new one.
    ///
    /// `user`, `password` and `dirs` are the raw (percent-encoded) URL parts.
    pub fn acquire(
        &mut self,
        user: &str,
        password: &str,
        host: &str,
        port: u16,
        dirs: &[String],
    ) -> FtpResult<FtpLease> {
        self.prune(Instant::now());
        let key = CacheKey::new(user, host, port, dirs);

        let idle = self
            .entries
            .get_mut(&key)
            .and_then(|list| list.iter_mut().find(|conn| !conn.busy));
        if let Some(conn) = idle {
            conn.busy = true;
            self.stats.hits += 1;
            debug!(key = %key, id = conn.id, "FTP cache hit");
            return Ok(FtpLease { key, id: conn.id });
        }

        self.stats.misses += 1;
        let login = Login {
            host: host.to_string(),
            port,
            user: unquote(user),
            password: unquote(password),
            dirs: dirs.iter().map(|d| unquote(d)).collect(),
        };
        let control = match login.open(self.connector.as_ref()) {
            Ok(control) => control,
            Err(err) if err.is_transient() => {
                warn!(key = %key, error = %err, "FTP connect failed, retrying once");
                login.open(self.connector.as_ref())?
            }
            Err(err) => return Err(err),
        };

        let id = self.next_id;
        self.next_id += 1;
        debug!(key = %key, id, "FTP cache miss, opened connection");
        self.entries.entry(key.clone()).or_default().push(FtpConnection {
            id,
            login,
            control,
            busy: true,
            transferring: false,
            healthy: true,
            idle_since: Instant::now(),
        });

        Ok(FtpLease { key, id })
    }

    /// Start the transfer of `file` on the leased connection.
    ///
    /// A failing `TYPE` gets one reset of the connection. `RETR` answered
    /// with 550 falls back to a listing.
    pub fn retrieve(
        &mut self,
        lease: &FtpLease,
        file: &str,
        kind: TransferType,
    ) -> FtpResult<Retrieval> {
        let connector = Rc::clone(&self.connector);
        let conn = self
            .entries
            .get_mut(&lease.key)
            .and_then(|list| list.iter_mut().find(|conn| conn.id == lease.id))
            .ok_or_else(|| FtpError::Protocol(format!("lease {} is not cached", lease.key)))?;

        let type_cmd = kind.type_command();
        if let Err(err) = conn.control.voidcmd(type_cmd) {
            info!(key = %lease.key, error = %err, "Stale FTP connection, resetting");
            self.stats.resets += 1;
            conn.reset(connector.as_ref())?;
            conn.control.voidcmd(type_cmd)?;
        }

        let result = Self::start_transfer(conn, &lease.key, file, kind);
        match &result {
            Ok(_) => conn.transferring = true,
            Err(FtpError::Io(_) | FtpError::Protocol(_)) => conn.healthy = false,
            Err(_) => {}
        }
        result
    }

    fn start_transfer(
        conn: &mut FtpConnection,
        key: &CacheKey,
        file: &str,
        kind: TransferType,
    ) -> FtpResult<Retrieval> {
        if !file.is_empty() && kind != TransferType::Directory {
            match conn.control.transfer(&format!("RETR {}", unquote(file))) {
                Ok((transport, content_length)) => {
                    return Ok(Retrieval {
                        transport,
                        is_dir: false,
                        content_length,
                    });
                }
                Err(err) if err.is_file_unavailable() => {
                    info!(key = %key, file, "RETR refused with 550, trying a listing");
                }
                Err(err) => return Err(err),
            }
        }

        let cmd = if file.is_empty() {
            "LIST".to_string()
        } else {
            format!("LIST {file}")
        };
        let (transport, _) = conn.control.transfer(&cmd)?;
        Ok(Retrieval {
            transport,
            is_dir: true,
            content_length: None,
        })
    }

    /// Finish the leased transfer and make the connection reusable.
    pub fn release(&mut self, lease: FtpLease) {
        let Some(list) = self.entries.get_mut(&lease.key) else {
            return;
        };
        let Some(pos) = list.iter().position(|conn| conn.id == lease.id) else {
            return;
        };

        let conn = &mut list[pos];
        if conn.transferring {
            conn.transferring = false;
            if let Err(err) = conn.control.voidresp() {
                warn!(key = %lease.key, error = %err, "FTP transfer did not complete cleanly");
                if !matches!(err, FtpError::Reply { .. }) {
                    conn.healthy = false;
                }
            }
        }
        conn.busy = false;
        conn.idle_since = Instant::now();

        if !conn.healthy {
            debug!(key = %lease.key, id = lease.id, "Dropping unhealthy FTP connection");
            self.evict(&lease.key, lease.id);
        }
        self.enforce_host_cap(&lease.key.host);
    }

    /// Evict idle connections older than the idle timeout.
    pub fn prune(&mut self, now: Instant) -> usize {
        let expired: Vec<(CacheKey, u64)> = self
            .entries
            .iter()
            .flat_map(|(key, list)| list.iter().map(move |conn| (key, conn)))
            .filter(|(_, conn)| {
                !conn.busy && now.saturating_duration_since(conn.idle_since) >= self.idle_timeout
            })
            .map(|(key, conn)| (key.clone(), conn.id))
            .collect();

        for (key, id) in &expired {
            debug!(key = %key, id, "Evicting idle FTP connection");
            self.evict(key, *id);
        }
        expired.len()
    }

    fn enforce_host_cap(&mut self, host: &str) {
        let mut idle: Vec<(Instant, CacheKey, u64)> = self
            .entries
            .iter()
            .filter(|(key, _)| key.host == host)
            .flat_map(|(key, list)| {
                list.iter()
                    .filter(|conn| !conn.busy)
                    .map(move |conn| (conn.idle_since, key.clone(), conn.id))
            })
            .collect();
        if idle.len() <= self.max_idle_per_host {
            return;
        }

        idle.sort_by_key(|(since, _, id)| (*since, *id));
        let excess = idle.len() - self.max_idle_per_host;
        for (_, key, id) in idle.into_iter().take(excess) {
            debug!(key = %key, id, host, "Idle FTP connections over the per-host cap");
            self.evict(&key, id);
        }
    }

    fn evict(&mut self, key: &CacheKey, id: u64) {
        let Some(list) = self.entries.get_mut(key) else {
            return;
        };
        list.retain(|conn| conn.id != id);
        if list.is_empty() {
            self.entries.remove(key);
        }
        self.stats.evictions += 1;
    }

    pub fn stats(&self) -> FtpCacheStats {
        self.stats
    }

    /// Number of cached connections, busy or idle
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn busy_count(&self) -> usize {
        self.entries
            .values()
            .flatten()
            .filter(|conn| conn.is_busy())
            .count()
    }
}

impl fmt::Debug for FtpCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpCache")
            .field("entries", &self.entries)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

fn unquote(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}
