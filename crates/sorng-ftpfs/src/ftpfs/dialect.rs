//! Server listing dialects.
//!
//! Servers disagree on what `LIST <path>` returns. Unix-style servers
//! include a `.` row for directories, so a directory can be inspected by
//! listing it directly. Other servers omit it, so an entry can only be
//! found by listing its parent. `FileSystemStrategy` picks one behaviour
//! (or detects it once from the root listing) and applies it to every
//! lookup.
//!
//! All paths handed in must be absolute and normalized.

use crate::ftpfs::connection::PooledConnection;
use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::path::RemotePath;
use crate::ftpfs::types::{FtpEntry, StrategyKind};

/// Upper bound on symbolic-link hops followed in one lookup.
pub(crate) const MAX_LINK_HOPS: usize = 40;

/// A concrete dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Unix,
    NonUnix,
}

/// Directory semantics used by a file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSystemStrategy {
    Unix,
    NonUnix,
    /// Resolved by `initialize` from the root listing.
    AutoDetect { delegate: Option<Dialect> },
}

/// Where a symbolic link at `link` points; relative targets resolve
/// against the link's directory.
pub(crate) fn resolve_link_target(link: &RemotePath, target: &str) -> RemotePath {
    let parent = link.parent().unwrap_or_else(RemotePath::root);
    RemotePath::parse(target).to_absolute(&parent)
}

fn split_children(entries: Vec<FtpEntry>) -> (bool, Vec<FtpEntry>) {
    let mut has_self = false;
    let mut children = Vec::with_capacity(entries.len());
    for entry in entries {
        if entry.is_self_entry() {
            has_self = true;
        } else if !entry.is_parent_entry() {
            children.push(entry);
        }
    }
    (has_self, children)
}

impl FileSystemStrategy {
    pub fn from_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Unix => FileSystemStrategy::Unix,
            StrategyKind::NonUnix => FileSystemStrategy::NonUnix,
            StrategyKind::AutoDetect => FileSystemStrategy::AutoDetect { delegate: None },
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            FileSystemStrategy::Unix => StrategyKind::Unix,
            FileSystemStrategy::NonUnix => StrategyKind::NonUnix,
            FileSystemStrategy::AutoDetect { .. } => StrategyKind::AutoDetect,
        }
    }

    /// The dialect lookups will use, if known yet.
    pub fn resolved(&self) -> Option<Dialect> {
        match self {
            FileSystemStrategy::Unix => Some(Dialect::Unix),
            FileSystemStrategy::NonUnix => Some(Dialect::NonUnix),
            FileSystemStrategy::AutoDetect { delegate } => *delegate,
        }
    }

    /// Auto-detection probes `/` once for a `.` row. Fixed dialects have
    /// nothing to do. Initializing an auto-detecting strategy twice is an
    /// error.
    pub async fn initialize(&mut self, conn: &PooledConnection) -> FtpResult<()> {
        let delegate = match self {
            FileSystemStrategy::AutoDetect { delegate } => delegate,
            _ => return Ok(()),
        };
        if delegate.is_some() {
            return Err(FtpError::illegal_state(
                "Auto-detecting file system strategy is already initialized",
            ));
        }
        let entries = conn.list_files("/").await?;
        let detected = if entries.iter().any(FtpEntry::is_self_entry) {
            Dialect::Unix
        } else {
            Dialect::NonUnix
        };
        log::info!("FTP server listing dialect detected as {:?}", detected);
        *delegate = Some(detected);
        Ok(())
    }

    fn dialect(&self) -> FtpResult<Dialect> {
        self.resolved().ok_or_else(|| {
            FtpError::illegal_state("Auto-detecting file system strategy used before initialization")
        })
    }

    /// Children of a directory, without `.` and `..`.
    pub async fn children(&self, conn: &PooledConnection, path: &RemotePath) -> FtpResult<Vec<FtpEntry>> {
        match self.dialect()? {
            Dialect::Unix => unix_children(conn, path).await,
            Dialect::NonUnix => non_unix_children(conn, path).await,
        }
    }

    /// The listing entry for `path`.
    pub async fn entry(&self, conn: &PooledConnection, path: &RemotePath) -> FtpResult<FtpEntry> {
        match self.dialect()? {
            Dialect::Unix => unix_entry(conn, path).await,
            Dialect::NonUnix => non_unix_entry(conn, path).await,
        }
    }

    /// The entry describing `path` as a symbolic link, or `None` when it is
    /// not one. `entry` must come from `entry(conn, path)`.
    pub async fn link(
        &self,
        conn: &PooledConnection,
        entry: &FtpEntry,
        path: &RemotePath,
    ) -> FtpResult<Option<FtpEntry>> {
        match self.dialect()? {
            Dialect::Unix => unix_link(conn, entry, path).await,
            Dialect::NonUnix => Ok(entry.link_target.as_ref().map(|_| entry.clone())),
        }
    }
}

// ─── Unix ────────────────────────────────────────────────────────────

async fn unix_children(conn: &PooledConnection, path: &RemotePath) -> FtpResult<Vec<FtpEntry>> {
    let listing = conn.list_files(&path.to_string()).await?;
    if listing.is_empty() {
        return Err(FtpError::not_found(path.to_string()));
    }
    let (has_self, children) = split_children(listing);
    if !has_self {
        return Err(FtpError::not_directory(path.to_string()));
    }
    Ok(children)
}

async fn unix_entry(conn: &PooledConnection, path: &RemotePath) -> FtpResult<FtpEntry> {
    let name = path.file_name();
    let mut matches: Vec<FtpEntry> = conn
        .list_files(&path.to_string())
        .await?
        .into_iter()
        .filter(|e| e.is_self_entry() || Some(e.file_name()) == name)
        .collect();
    match matches.len() {
        0 => Err(FtpError::not_found(path.to_string())),
        1 => Ok(matches.remove(0)),
        _ => matches
            .into_iter()
            .find(FtpEntry::is_self_entry)
            .ok_or_else(|| FtpError::illegal_state(format!("Ambiguous listing for {}", path))),
    }
}

/// A directory found through its own `.` row hides whether the name is a
/// link; only the parent listing shows that.
async fn unix_link(conn: &PooledConnection, entry: &FtpEntry, path: &RemotePath) -> FtpResult<Option<FtpEntry>> {
    if entry.link_target.is_some() {
        return Ok(Some(entry.clone()));
    }
    if !(entry.is_directory() && entry.is_self_entry()) {
        return Ok(None);
    }
    let (parent, name) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => (parent, name),
        _ => return Ok(None),
    };
    let mut matches: Vec<FtpEntry> = conn
        .list_files(&parent.to_string())
        .await?
        .into_iter()
        .filter(|e| (e.is_directory() || e.is_symbolic_link()) && e.file_name() == name)
        .collect();
    match matches.len() {
        0 => Err(FtpError::not_found(path.to_string())),
        1 => {
            let found = matches.remove(0);
            Ok(found.link_target.is_some().then_some(found))
        }
        _ => Err(FtpError::illegal_state(format!(
            "Multiple entries named {} in {}",
            name, parent
        ))),
    }
}

// ─── Non-Unix ────────────────────────────────────────────────────────

async fn non_unix_children(conn: &PooledConnection, path: &RemotePath) -> FtpResult<Vec<FtpEntry>> {
    let listing = conn.list_files(&path.to_string()).await?;
    let (has_self, children) = split_children(listing);

    // Zero or one row is no proof of a directory: it could be the file
    // itself, or an empty listing for a missing path.
    if !has_self && children.len() <= 1 {
        let mut current = path.clone();
        let mut entry = non_unix_entry(conn, &current).await?;
        let mut hops = 0;
        while entry.is_symbolic_link() {
            let target = match entry.link_target.as_deref() {
                Some(target) => target,
                None => break,
            };
            hops += 1;
            if hops > MAX_LINK_HOPS {
                return Err(FtpError::illegal_state(format!(
                    "Too many levels of symbolic links: {}",
                    path
                )));
            }
            current = resolve_link_target(&current, target);
            entry = non_unix_entry(conn, &current).await?;
        }
        if !entry.is_directory() {
            return Err(FtpError::not_directory(path.to_string()));
        }
    }
    Ok(children)
}

async fn non_unix_entry(conn: &PooledConnection, path: &RemotePath) -> FtpResult<FtpEntry> {
    let (parent, name) = match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => (parent, name),
        _ => return Ok(FtpEntry::directory("/")),
    };
    let mut matches: Vec<FtpEntry> = conn
        .list_files(&parent.to_string())
        .await?
        .into_iter()
        .filter(|e| e.file_name() == name)
        .collect();
    match matches.len() {
        0 => Err(FtpError::not_found(path.to_string())),
        1 => Ok(matches.remove(0)),
        _ => Err(FtpError::illegal_state(format!(
            "Multiple entries named {} in {}",
            name, parent
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ftpfs::error::FtpErrorKind;
    use crate::ftpfs::mapper::DefaultErrorMapper;
    use crate::ftpfs::pool::ConnectionPool;
    use crate::ftpfs::simulated::SimulatedServer;
    use crate::ftpfs::types::FtpFileSystemConfig;
    use std::sync::Arc;

    async fn connect(server: &SimulatedServer) -> (ConnectionPool, PooledConnection) {
        let mut config = FtpFileSystemConfig::new("sim");
        config.client_connection_count = 1;
        let pool = ConnectionPool::new(config, Arc::new(server.clone()), Arc::new(DefaultErrorMapper))
            .await
            .unwrap();
        let conn = pool.acquire().await.unwrap();
        (pool, conn)
    }

    fn names(entries: &[FtpEntry]) -> Vec<String> {
        entries.iter().map(|e| e.file_name().to_string()).collect()
    }

    fn populated(server: &SimulatedServer) {
        server.add_file("/dir/a.txt", b"a");
        server.add_file("/dir/b.txt", b"bb");
        server.add_file("/single/only.txt", b"");
        server.add_directory("/empty");
        server.add_symlink("/link", "dir");
    }

    #[tokio::test]
    async fn unix_children_filter_self_rows() {
        let server = SimulatedServer::new();
        populated(&server);
        let (_pool, conn) = connect(&server).await;
        let s = FileSystemStrategy::Unix;
        let children = s.children(&conn, &RemotePath::parse("/dir")).await.unwrap();
        assert_eq!(names(&children), vec!["a.txt", "b.txt"]);
        assert!(s.children(&conn, &RemotePath::parse("/empty")).await.unwrap().is_empty());

        let err = s.children(&conn, &RemotePath::parse("/nope")).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotFound);
        let err = s.children(&conn, &RemotePath::parse("/dir/a.txt")).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotDirectory);
    }

    #[tokio::test]
    async fn unix_entry_prefers_self_row() {
        let server = SimulatedServer::new();
        populated(&server);
        let (_pool, conn) = connect(&server).await;
        let s = FileSystemStrategy::Unix;
        let dir = s.entry(&conn, &RemotePath::parse("/dir")).await.unwrap();
        assert!(dir.is_directory() && dir.is_self_entry());
        let file = s.entry(&conn, &RemotePath::parse("/dir/b.txt")).await.unwrap();
        assert_eq!(file.size, 2);
        let root = s.entry(&conn, &RemotePath::root()).await.unwrap();
        assert!(root.is_directory());
        let err = s.entry(&conn, &RemotePath::parse("/dir/zzz")).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotFound);
    }

    #[tokio::test]
    async fn unix_link_lists_parent_for_directories() {
        let server = SimulatedServer::new();
        populated(&server);
        let (_pool, conn) = connect(&server).await;
        let s = FileSystemStrategy::Unix;

        let path = RemotePath::parse("/link");
        let entry = s.entry(&conn, &path).await.unwrap();
        assert!(entry.is_self_entry());
        server.clear_commands();
        let link = s.link(&conn, &entry, &path).await.unwrap().unwrap();
        assert_eq!(link.link_target.as_deref(), Some("dir"));
        assert_eq!(server.commands(), vec!["LIST /"]);

        let path = RemotePath::parse("/dir");
        let entry = s.entry(&conn, &path).await.unwrap();
        assert!(s.link(&conn, &entry, &path).await.unwrap().is_none());
        let root = s.entry(&conn, &RemotePath::root()).await.unwrap();
        assert!(s.link(&conn, &root, &RemotePath::root()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_unix_children_verify_sparse_listings() {
        let server = SimulatedServer::non_unix();
        populated(&server);
        let (_pool, conn) = connect(&server).await;
        let s = FileSystemStrategy::NonUnix;

        server.clear_commands();
        let children = s.children(&conn, &RemotePath::parse("/dir")).await.unwrap();
        assert_eq!(names(&children), vec!["a.txt", "b.txt"]);
        assert_eq!(server.commands(), vec!["LIST /dir"]);

        server.clear_commands();
        let children = s.children(&conn, &RemotePath::parse("/single")).await.unwrap();
        assert_eq!(names(&children), vec!["only.txt"]);
        assert_eq!(server.commands(), vec!["LIST /single", "LIST /"]);

        assert!(s.children(&conn, &RemotePath::parse("/empty")).await.unwrap().is_empty());
        let children = s.children(&conn, &RemotePath::parse("/link")).await.unwrap();
        assert_eq!(children.len(), 2);

        let err = s.children(&conn, &RemotePath::parse("/dir/a.txt")).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotDirectory);
        let err = s.children(&conn, &RemotePath::parse("/missing")).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::NotFound);
    }

    #[tokio::test]
    async fn non_unix_entry_comes_from_parent() {
        let server = SimulatedServer::non_unix();
        populated(&server);
        let (_pool, conn) = connect(&server).await;
        let s = FileSystemStrategy::NonUnix;

        let root = s.entry(&conn, &RemotePath::root()).await.unwrap();
        assert_eq!(root.name, "/");
        assert!(root.is_directory());

        let link_path = RemotePath::parse("/link");
        let link = s.entry(&conn, &link_path).await.unwrap();
        assert!(link.is_symbolic_link());
        server.clear_commands();
        assert!(s.link(&conn, &link, &link_path).await.unwrap().is_some());
        assert!(server.commands().is_empty());
    }

    #[tokio::test]
    async fn auto_detect_resolves_once() {
        let unix = SimulatedServer::new();
        let (_pool, conn) = connect(&unix).await;
        let mut s = FileSystemStrategy::from_kind(StrategyKind::AutoDetect);
        let err = s.children(&conn, &RemotePath::root()).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::IllegalState);
        s.initialize(&conn).await.unwrap();
        assert_eq!(s.resolved(), Some(Dialect::Unix));
        let err = s.initialize(&conn).await.unwrap_err();
        assert_eq!(err.kind, FtpErrorKind::IllegalState);

        let other = SimulatedServer::non_unix();
        let (_pool2, conn2) = connect(&other).await;
        let mut s = FileSystemStrategy::from_kind(StrategyKind::AutoDetect);
        s.initialize(&conn2).await.unwrap();
        assert_eq!(s.resolved(), Some(Dialect::NonUnix));
        assert_eq!(s.kind(), StrategyKind::AutoDetect);
    }

    #[test]
    fn link_targets_resolve_against_parent() {
        let link = RemotePath::parse("/a/b/link");
        assert_eq!(resolve_link_target(&link, "../c").to_string(), "/a/c");
        assert_eq!(resolve_link_target(&link, "/etc").to_string(), "/etc");
    }
}
