//! # sorng-ftpfs: FTP server as a file system
//!
//! Architecture:
//! - `types`: config, entries, attributes, replies, pool statistics
//! - `error`: FTP file system error type
//! - `mapper`: refused replies → typed errors, per operation
//! - `path`: remote paths bound to a file system
//! - `options`: open / copy option resolution
//! - `wire`: the per-session command contract
//! - `connection`: pooled sessions, leases, transfer option caching
//! - `pool`: bounded connection pool with overflow and keep-alive
//! - `stream`: read / write streams and channels
//! - `dialect`: Unix / non-Unix listing semantics, auto-detection
//! - `filesystem`: the path-addressed file store
//! - `protocol`: control-channel codec
//! - `tls`: FTPS
//! - `transfer`: data channels (PASV/EPSV/PORT/EPRT)
//! - `parser`: LIST / MLSD parsing
//! - `client`: network session and factory
//! - `simulated`: in-memory server

pub mod types;
pub mod error;
pub mod mapper;
pub mod path;
pub mod options;
pub mod wire;
pub mod connection;
pub mod pool;
pub mod stream;
pub mod dialect;
pub mod filesystem;
pub mod protocol;
pub mod tls;
pub mod transfer;
pub mod parser;
pub mod client;
pub mod simulated;

pub use client::{FtpClientFactory, FtpWireClient};
pub use connection::PooledConnection;
pub use dialect::{Dialect, FileSystemStrategy};
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use filesystem::{glob_filter, FtpFileSystem};
pub use mapper::{DefaultErrorMapper, ErrorMapper};
pub use options::{CopyOption, CopyOptions, OpenOption, OpenOptions, TransferOptions};
pub use path::{FtpPath, RemotePath};
pub use pool::ConnectionPool;
pub use simulated::SimulatedServer;
pub use stream::{FtpChannel, FtpReadStream, FtpWriteStream};
pub use types::*;
pub use wire::{WireClient, WireClientFactory};
