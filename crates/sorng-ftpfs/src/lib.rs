//! # SortOfRemote NG – FTP File System
//!
//! Path-addressed remote file store backed by an FTP / FTPS server:
//!
//! - **Connection Pool** – bounded set of authenticated sessions with
//!   wait-with-timeout acquisition, overflow sessions, liveness probes and
//!   keep-alive sweeps
//! - **Streams** – reference-counted read / write streams and channels that
//!   finalize the transfer before the session is recycled
//! - **Server Dialects** – Unix, non-Unix and auto-detected directory listing
//!   semantics for existence checks, directories and symbolic links
//! - **File Store** – open, list, create, delete, copy, move, attributes and
//!   access checks on remote paths
//! - **Wire Client** – FTP / FTPS control and data channels (PASV, EPSV,
//!   PORT, EPRT) plus an in-memory simulated server for tests

pub mod ftpfs;
