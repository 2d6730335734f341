//! `ftp:` scheme: wire client, connection cache, sessions, listing HTML

pub mod access;
pub mod cache;
pub mod client;
pub mod listing;

pub use access::{FtpAccess, FtpHandler, FtpLocation, guess_type};
pub use cache::{CacheKey, FtpCache, FtpCacheStats, FtpConnection, FtpLease, Retrieval};
pub use client::{
    FTP_PORT, FtpClient, FtpConnector, FtpControl, FtpError, FtpResult, TcpFtpConnector,
    TransferType,
};
pub use listing::ListingTranscoder;
