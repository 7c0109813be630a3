//! In-memory FTP server for tests and offline use.
//!
//! `SimulatedServer` holds a directory tree shared by every
//! `SimulatedWireClient` it hands out. Listings follow either the Unix
//! convention (`.` and `..` rows present) or the non-Unix one (no self
//! rows). Failures can be injected per operation.

use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::path::RemotePath;
use crate::ftpfs::types::{FileStructure, FileTransferMode, FileType, FtpEntry, FtpFileSystemConfig, FtpReply};
use crate::ftpfs::wire::{DataReader, DataWriter, WireClient, WireClientFactory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::{Cursor, Error as IoError};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use tokio::time::Duration;

const MAX_LINK_HOPS: usize = 40;

#[derive(Debug, Clone)]
enum Node {
    File {
        data: Vec<u8>,
        modified: DateTime<Utc>,
        permissions: u32,
    },
    Directory {
        modified: DateTime<Utc>,
        permissions: u32,
    },
    Symlink {
        target: String,
    },
}

impl Node {
    fn directory() -> Self {
        Node::Directory {
            modified: Utc::now(),
            permissions: 0o755,
        }
    }
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    working_directory: String,
    commands: Vec<String>,
}

fn key(path: &str) -> String {
    RemotePath::parse(path).to_absolute(&RemotePath::root()).to_string()
}

fn parent_key(path: &str) -> Option<String> {
    RemotePath::parse(path).normalize().parent().map(|p| p.to_string())
}

fn base_name(path: &str) -> String {
    RemotePath::parse(path)
        .file_name()
        .map(str::to_string)
        .unwrap_or_else(|| "/".into())
}

impl Tree {
    fn is_directory(&self, path: &str) -> bool {
        matches!(self.nodes.get(path), Some(Node::Directory { .. }))
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .any(|(k, _)| k != "/")
    }

    fn children(&self, path: &str) -> Vec<(String, Node)> {
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| k.as_str() != "/" && !k[prefix.len()..].contains('/'))
            .map(|(k, n)| (k.clone(), n.clone()))
            .collect()
    }

    /// Follow symbolic links from `path` to a non-link node.
    fn resolve(&self, path: &str) -> Option<(String, Node)> {
        let mut current = path.to_string();
        for _ in 0..MAX_LINK_HOPS {
            match self.nodes.get(&current)? {
                Node::Symlink { target } => {
                    let parent = parent_key(&current).unwrap_or_else(|| "/".into());
                    current = RemotePath::parse(target)
                        .to_absolute(&RemotePath::parse(&parent))
                        .to_string();
                }
                node => return Some((current, node.clone())),
            }
        }
        None
    }

    fn ensure_directories(&mut self, path: &str) {
        let mut current = RemotePath::root();
        for seg in RemotePath::parse(path).normalize().segments() {
            current = current.join(seg);
            self.nodes
                .entry(current.to_string())
                .or_insert_with(Node::directory);
        }
    }

    fn entry(&self, name: String, node: &Node) -> FtpEntry {
        let entry = match node {
            Node::File {
                data,
                modified,
                permissions,
            } => {
                let mut e = FtpEntry::file(name, data.len() as u64).with_permissions(*permissions);
                e.modified = Some(*modified);
                e
            }
            Node::Directory {
                modified,
                permissions,
            } => {
                let mut e = FtpEntry::directory(name).with_permissions(*permissions);
                e.modified = Some(*modified);
                e
            }
            Node::Symlink { target } => FtpEntry::symlink(name, target.clone()).with_permissions(0o777),
        };
        FtpEntry {
            owner: Some("ftp".into()),
            group: Some("ftp".into()),
            ..entry
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug)]
struct Shared {
    tree: Mutex<Tree>,
    unix_listing: AtomicBool,
    fail_connect: AtomicBool,
    connect_limit: AtomicUsize,
    fail_noop: AtomicBool,
    noop_delay_ms: AtomicU64,
    fail_completion: AtomicBool,
    fail_disconnect: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    completions: AtomicUsize,
}

/// In-memory server. Cloning shares the same tree and counters.
#[derive(Debug, Clone)]
pub struct SimulatedServer {
    shared: Arc<Shared>,
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedServer {
    /// Unix-style server: listings include `.` and `..`.
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::directory());
        Self {
            shared: Arc::new(Shared {
                tree: Mutex::new(Tree {
                    nodes,
                    working_directory: "/".into(),
                    commands: Vec::new(),
                }),
                unix_listing: AtomicBool::new(true),
                fail_connect: AtomicBool::new(false),
                connect_limit: AtomicUsize::new(usize::MAX),
                fail_noop: AtomicBool::new(false),
                noop_delay_ms: AtomicU64::new(0),
                fail_completion: AtomicBool::new(false),
                fail_disconnect: AtomicBool::new(false),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                completions: AtomicUsize::new(0),
            }),
        }
    }

    /// Server whose listings never contain `.` or `..`.
    pub fn non_unix() -> Self {
        let server = Self::new();
        server.set_unix_listing(false);
        server
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.shared.tree.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_unix_listing(&self, enabled: bool) {
        self.shared.unix_listing.store(enabled, Ordering::SeqCst);
    }

    pub fn set_working_directory(&self, path: &str) {
        self.tree().working_directory = key(path);
    }

    /// Create a directory and any missing parents.
    pub fn add_directory(&self, path: &str) {
        self.tree().ensure_directories(path);
    }

    /// Create or replace a file; missing parents are created.
    pub fn add_file(&self, path: &str, data: &[u8]) {
        let path = key(path);
        let mut tree = self.tree();
        if let Some(parent) = parent_key(&path) {
            tree.ensure_directories(&parent);
        }
        tree.nodes.insert(
            path,
            Node::File {
                data: data.to_vec(),
                modified: Utc::now(),
                permissions: 0o644,
            },
        );
    }

    /// Create a symbolic link; `target` is resolved against the link's
    /// directory when relative.
    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = key(path);
        let mut tree = self.tree();
        if let Some(parent) = parent_key(&path) {
            tree.ensure_directories(&parent);
        }
        tree.nodes.insert(
            path,
            Node::Symlink {
                target: target.to_string(),
            },
        );
    }

    pub fn set_permissions(&self, path: &str, mode: u32) {
        let mut tree = self.tree();
        match tree.nodes.get_mut(&key(path)) {
            Some(Node::File { permissions, .. }) | Some(Node::Directory { permissions, .. }) => {
                *permissions = mode & 0o777;
            }
            _ => {}
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.tree().nodes.contains_key(&key(path))
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.tree().is_directory(&key(path))
    }

    pub fn file_contents(&self, path: &str) -> Option<Vec<u8>> {
        match self.tree().nodes.get(&key(path)) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    // ── Failure injection ────────────────────────────────────────

    pub fn set_fail_connect(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Allow only `limit` successful connects in total.
    pub fn set_connect_limit(&self, limit: usize) {
        self.shared.connect_limit.store(limit, Ordering::SeqCst);
    }

    pub fn set_fail_noop(&self, fail: bool) {
        self.shared.fail_noop.store(fail, Ordering::SeqCst);
    }

    /// NOOP replies arrive only after `delay`.
    pub fn set_noop_delay(&self, delay: Duration) {
        self.shared.noop_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Completion replies become `451` (data is still stored).
    pub fn set_fail_completion(&self, fail: bool) {
        self.shared.fail_completion.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.shared.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    /// Sessions connected and not yet disconnected.
    pub fn live_sessions(&self) -> usize {
        self.connect_count().saturating_sub(self.disconnect_count())
    }

    pub fn completion_count(&self) -> usize {
        self.shared.completions.load(Ordering::SeqCst)
    }

    /// Every command received so far, e.g. `"LIST /pub"`.
    pub fn commands(&self) -> Vec<String> {
        self.tree().commands.clone()
    }

    /// Count of received commands starting with `prefix`.
    pub fn count_commands(&self, prefix: &str) -> usize {
        self.tree()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_commands(&self) {
        self.tree().commands.clear();
    }

    /// A fresh session against this server.
    pub fn client(&self) -> SimulatedWireClient {
        SimulatedWireClient {
            server: self.clone(),
            connected: true,
            pending: None,
        }
    }
}

#[async_trait]
impl WireClientFactory for SimulatedServer {
    async fn connect(&self, _config: &FtpFileSystemConfig) -> FtpResult<Box<dyn WireClient>> {
        let shared = &self.shared;
        if shared.fail_connect.load(Ordering::SeqCst)
            || shared.connects.load(Ordering::SeqCst) >= shared.connect_limit.load(Ordering::SeqCst)
        {
            return Err(FtpError::connection_failed("Simulated server refused the connection"));
        }
        shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.client()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum Pending {
    Read,
    Write {
        path: String,
        buffer: Arc<Mutex<Vec<u8>>>,
        append: bool,
    },
}

/// A session on a `SimulatedServer`.
pub struct SimulatedWireClient {
    server: SimulatedServer,
    connected: bool,
    pending: Option<Pending>,
}

struct BufferWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl AsyncWrite for BufferWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, IoError>> {
        let mut data = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        data.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        Poll::Ready(Ok(()))
    }
}

fn ok(code: u16, text: &str) -> FtpResult<FtpReply> {
    Ok(FtpReply::new(code, text))
}

fn no_such_file() -> FtpReply {
    FtpReply::new(550, "No such file or directory")
}

impl SimulatedWireClient {
    fn check(&self) -> FtpResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(FtpError::disconnected("Simulated session is closed"))
        }
    }

    /// Log `cmd` and return the tree plus the absolute key of `path`.
    fn command(&self, cmd: &str, path: &str) -> FtpResult<(MutexGuard<'_, Tree>, String)> {
        self.check()?;
        let mut tree = self.server.tree();
        tree.commands.push(format!("{} {}", cmd, path).trim_end().to_string());
        let abs = RemotePath::parse(path)
            .to_absolute(&RemotePath::parse(&tree.working_directory))
            .to_string();
        Ok((tree, abs))
    }

    fn open_write(&mut self, cmd: &str, path: &str, append: bool) -> FtpResult<Result<DataWriter, FtpReply>> {
        if self.pending.is_some() {
            return Err(FtpError::protocol_error("A transfer is already in progress"));
        }
        let (mut tree, abs) = self.command(cmd, path)?;
        match parent_key(&abs) {
            Some(parent) if tree.is_directory(&parent) => {}
            _ => return Ok(Err(no_such_file())),
        }
        match tree.nodes.get(&abs) {
            Some(Node::Directory { .. }) => return Ok(Err(FtpReply::new(550, "Is a directory"))),
            Some(Node::File { .. }) if append => {}
            _ => {
                tree.nodes.insert(
                    abs.clone(),
                    Node::File {
                        data: Vec::new(),
                        modified: Utc::now(),
                        permissions: 0o644,
                    },
                );
            }
        }
        drop(tree);
        let buffer = Arc::new(Mutex::new(Vec::new()));
        self.pending = Some(Pending::Write {
            path: abs,
            buffer: buffer.clone(),
            append,
        });
        Ok(Ok(Box::new(BufferWriter { buffer })))
    }
}

#[async_trait]
impl WireClient for SimulatedWireClient {
    async fn file_type(&mut self, file_type: FileType) -> FtpResult<FtpReply> {
        let _ = self.command(&file_type.command(), "")?;
        ok(200, "Type set")
    }

    async fn file_structure(&mut self, structure: FileStructure) -> FtpResult<FtpReply> {
        let _ = self.command(structure.command(), "")?;
        ok(200, "Structure set")
    }

    async fn transfer_mode(&mut self, mode: FileTransferMode) -> FtpResult<FtpReply> {
        let _ = self.command(mode.command(), "")?;
        ok(200, "Mode set")
    }

    async fn noop(&mut self) -> FtpResult<FtpReply> {
        let _ = self.command("NOOP", "")?;
        let delay = self.server.shared.noop_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.server.shared.fail_noop.load(Ordering::SeqCst) {
            return Err(FtpError::disconnected("Simulated control connection lost"));
        }
        ok(200, "NOOP ok")
    }

    async fn pwd(&mut self) -> FtpResult<FtpReply> {
        let (tree, _) = self.command("PWD", "")?;
        let text = format!("\"{}\" is the current directory", tree.working_directory);
        ok(257, &text)
    }

    async fn make_directory(&mut self, path: &str) -> FtpResult<FtpReply> {
        let (mut tree, abs) = self.command("MKD", path)?;
        if tree.nodes.contains_key(&abs) {
            return ok(550, "File exists");
        }
        match parent_key(&abs) {
            Some(parent) if tree.is_directory(&parent) => {
                tree.nodes.insert(abs.clone(), Node::directory());
                let text = format!("\"{}\" created", abs);
                ok(257, &text)
            }
            _ => Ok(no_such_file()),
        }
    }

    async fn remove_file(&mut self, path: &str) -> FtpResult<FtpReply> {
        let (mut tree, abs) = self.command("DELE", path)?;
        match tree.nodes.get(&abs) {
            Some(Node::Directory { .. }) => ok(550, "Is a directory"),
            Some(_) => {
                tree.nodes.remove(&abs);
                ok(250, "File deleted")
            }
            None => Ok(no_such_file()),
        }
    }

    async fn remove_directory(&mut self, path: &str) -> FtpResult<FtpReply> {
        let (mut tree, abs) = self.command("RMD", path)?;
        match tree.nodes.get(&abs) {
            Some(Node::Directory { .. }) if abs == "/" => ok(550, "Permission denied"),
            Some(Node::Directory { .. }) => {
                if tree.has_children(&abs) {
                    return ok(550, "Directory not empty");
                }
                tree.nodes.remove(&abs);
                ok(250, "Directory removed")
            }
            Some(_) => ok(550, "Not a directory"),
            None => Ok(no_such_file()),
        }
    }

    async fn rename(&mut self, from: &str, to: &str) -> FtpResult<FtpReply> {
        let (mut tree, src) = self.command("RNFR", from)?;
        tree.commands.push(format!("RNTO {}", to));
        let dst = RemotePath::parse(to)
            .to_absolute(&RemotePath::parse(&tree.working_directory))
            .to_string();
        if !tree.nodes.contains_key(&src) || src == "/" {
            return Ok(no_such_file());
        }
        match parent_key(&dst) {
            Some(parent) if tree.is_directory(&parent) => {}
            _ => return Ok(no_such_file()),
        }
        if tree.is_directory(&dst) && tree.has_children(&dst) {
            return ok(550, "Directory not empty");
        }
        let prefix = format!("{}/", src);
        let moved: Vec<String> = tree
            .nodes
            .keys()
            .filter(|k| **k == src || k.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = tree.nodes.remove(&old) {
                let new_key = format!("{}{}", dst, &old[src.len()..]);
                tree.nodes.insert(new_key, node);
            }
        }
        ok(250, "Rename successful")
    }

    async fn modification_time(&mut self, path: &str) -> FtpResult<FtpReply> {
        let (tree, abs) = self.command("MDTM", path)?;
        match tree.resolve(&abs) {
            Some((_, Node::File { modified, .. })) => {
                let text = modified.format("%Y%m%d%H%M%S").to_string();
                ok(213, &text)
            }
            _ => Ok(no_such_file()),
        }
    }

    async fn retrieve(&mut self, path: &str) -> FtpResult<Result<DataReader, FtpReply>> {
        if self.pending.is_some() {
            return Err(FtpError::protocol_error("A transfer is already in progress"));
        }
        let (tree, abs) = self.command("RETR", path)?;
        let data = match tree.resolve(&abs) {
            Some((_, Node::File { data, .. })) => data,
            _ => return Ok(Err(no_such_file())),
        };
        drop(tree);
        self.pending = Some(Pending::Read);
        Ok(Ok(Box::new(Cursor::new(data))))
    }

    async fn store(&mut self, path: &str) -> FtpResult<Result<DataWriter, FtpReply>> {
        self.open_write("STOR", path, false)
    }

    async fn append(&mut self, path: &str) -> FtpResult<Result<DataWriter, FtpReply>> {
        self.open_write("APPE", path, true)
    }

    async fn complete_pending_command(&mut self) -> FtpResult<FtpReply> {
        self.check()?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| FtpError::protocol_error("No transfer in progress"))?;
        self.server.shared.completions.fetch_add(1, Ordering::SeqCst);

        if let Pending::Write {
            path,
            buffer,
            append,
        } = pending
        {
            let written = buffer.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let mut tree = self.server.tree();
            if let Some(Node::File { data, modified, .. }) = tree.nodes.get_mut(&path) {
                if !append {
                    data.clear();
                }
                data.extend_from_slice(&written);
                *modified = Utc::now();
            }
        }

        if self.server.shared.fail_completion.load(Ordering::SeqCst) {
            return ok(451, "Transfer aborted: local error in processing");
        }
        ok(226, "Transfer complete")
    }

    async fn list(&mut self, path: &str) -> FtpResult<Result<Vec<FtpEntry>, FtpReply>> {
        let unix = self.server.shared.unix_listing.load(Ordering::SeqCst);
        let (tree, abs) = self.command("LIST", path)?;
        let node = match tree.nodes.get(&abs) {
            Some(node) => node.clone(),
            None => return Ok(Ok(Vec::new())),
        };
        let (dir, dir_node) = match node {
            Node::Directory { .. } => (abs.clone(), node),
            Node::Symlink { .. } => match tree.resolve(&abs) {
                Some((target, target_node @ Node::Directory { .. })) => (target, target_node),
                _ => return Ok(Ok(vec![tree.entry(path.to_string(), &node)])),
            },
            Node::File { .. } => return Ok(Ok(vec![tree.entry(path.to_string(), &node)])),
        };

        let mut entries = Vec::new();
        if unix {
            entries.push(tree.entry(".".into(), &dir_node));
            let parent = parent_key(&dir).unwrap_or_else(|| "/".into());
            let parent_node = tree.nodes.get(&parent).cloned().unwrap_or_else(Node::directory);
            entries.push(tree.entry("..".into(), &parent_node));
        }
        for (child, child_node) in tree.children(&dir) {
            entries.push(tree.entry(base_name(&child), &child_node));
        }
        Ok(Ok(entries))
    }

    async fn disconnect(&mut self) -> FtpResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.server.tree().commands.push("QUIT".into());
        self.connected = false;
        self.pending = None;
        self.server.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.server.shared.fail_disconnect.load(Ordering::SeqCst) {
            return Err(FtpError::disconnected("Simulated QUIT failed"));
        }
        Ok(())
    }
}
