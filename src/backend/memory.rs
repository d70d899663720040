//! In-memory backend with replica hosts and fault injection
//!
//! Holds a whole namespace (directories, files with replica host lists,
//! symlinks) plus per-host free space, behind one mutex shared by every
//! session. Tests use it to drive the walker and dispatcher through exact
//! scenarios: injected connection errors, busy replicas, minimum replica
//! counts, slow operations.

use super::types::{DirEntry, EntryType, FileStat, Timespec};
use super::{Connector, FileSink, MetadataClient, Session, StorageBackend};
use crate::error::{BackendError, BackendErrorKind, BackendResult};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone)]
enum NodeKind {
    Dir,
    File {
        data: Arc<Vec<u8>>,
        replicas: Vec<String>,
    },
    Symlink {
        target: String,
    },
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    perm: u32,
    atime: Timespec,
    mtime: Timespec,
}

impl Node {
    fn dir() -> Self {
        Self {
            kind: NodeKind::Dir,
            perm: DEFAULT_DIR_MODE,
            atime: Timespec::default(),
            mtime: Timespec::default(),
        }
    }

    fn symlink(target: &str) -> Self {
        Self {
            kind: NodeKind::Symlink {
                target: target.to_string(),
            },
            perm: 0o777,
            atime: Timespec::default(),
            mtime: Timespec::default(),
        }
    }

    fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir)
    }

    fn stat(&self) -> FileStat {
        let (ty, size, nlink) = match &self.kind {
            NodeKind::Dir => (EntryType::Directory, 4096, 2),
            NodeKind::File { data, .. } => (EntryType::File, data.len() as u64, 1),
            NodeKind::Symlink { target } => (EntryType::Symlink, target.len() as u64, 1),
        };
        FileStat {
            mode: ty.mode_bits() | self.perm,
            nlink,
            size,
            atime: self.atime,
            mtime: self.mtime,
        }
    }
}

#[derive(Debug)]
struct Fault {
    op: String,
    path: Option<String>,
    kind: BackendErrorKind,
    remaining: usize,
}

#[derive(Debug, Default)]
struct MemoryFs {
    nodes: BTreeMap<String, Node>,
    hosts: BTreeMap<String, u64>,
    busy: HashSet<(String, String)>,
    min_replicas: usize,
    faults: Vec<Fault>,
    delay: Option<Duration>,
    connections: usize,
    active: usize,
    max_active: usize,
}

impl MemoryFs {
    fn take_fault(&mut self, op: &'static str, path: &str) -> BackendResult<()> {
        let hit = self.faults.iter_mut().find(|f| {
            f.remaining > 0 && f.op == op && f.path.as_deref().map_or(true, |p| p == path)
        });
        match hit {
            Some(fault) => {
                fault.remaining -= 1;
                Err(BackendError::new(fault.kind, op, path).with_message("injected"))
            }
            None => Ok(()),
        }
    }

    fn node(&self, op: &'static str, path: &str) -> BackendResult<&Node> {
        self.nodes
            .get(path)
            .ok_or_else(|| BackendError::new(BackendErrorKind::NotFound, op, path))
    }

    fn node_mut(&mut self, op: &'static str, path: &str) -> BackendResult<&mut Node> {
        self.nodes
            .get_mut(path)
            .ok_or_else(|| BackendError::new(BackendErrorKind::NotFound, op, path))
    }

    fn check_parent(&self, op: &'static str, path: &str) -> BackendResult<()> {
        match self.nodes.get(parent_of(path)) {
            Some(Node {
                kind: NodeKind::Dir,
                ..
            }) => Ok(()),
            _ => Err(BackendError::new(BackendErrorKind::NotFound, op, path)
                .with_message("parent directory missing")),
        }
    }

    fn begin(&mut self) {
        self.active += 1;
        self.max_active = self.max_active.max(self.active);
    }

    fn finish(&mut self) {
        self.active = self.active.saturating_sub(1);
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    format!("/{}", parts.join("/"))
}

/// Shared in-memory namespace
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    fs: Arc<Mutex<MemoryFs>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An empty namespace containing only `/`
    pub fn new() -> Self {
        let mut fs = MemoryFs::default();
        fs.nodes.insert("/".to_string(), Node::dir());
        Self {
            fs: Arc::new(Mutex::new(fs)),
        }
    }

    /// Connector handing out sessions on this namespace
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            fs: Arc::clone(&self.fs),
        }
    }

    /// Create a directory and any missing parents
    pub fn mkdir_all(&self, path: &str) {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            fs.nodes.entry(current.clone()).or_insert_with(Node::dir);
        }
    }

    /// Create a file of `size` bytes, creating parents
    pub fn add_file(&self, path: &str, size: usize) {
        self.add_file_with_data(path, pattern(size));
    }

    /// Create a file with given contents, creating parents
    pub fn add_file_with_data(&self, path: &str, data: Vec<u8>) {
        self.insert_file(path, data, Vec::new());
    }

    /// Create a file whose replicas live on `hosts`
    pub fn add_replicated_file(&self, path: &str, size: usize, hosts: &[&str]) {
        let replicas = hosts.iter().map(|h| h.to_string()).collect();
        self.insert_file(path, pattern(size), replicas);
    }

    fn insert_file(&self, path: &str, data: Vec<u8>, replicas: Vec<String>) {
        let path = normalize(path);
        self.mkdir_all(parent_of(&path));
        self.fs.lock().nodes.insert(
            path,
            Node {
                kind: NodeKind::File {
                    data: Arc::new(data),
                    replicas,
                },
                perm: DEFAULT_FILE_MODE,
                atime: Timespec::default(),
                mtime: Timespec::new(1_700_000_000, 0),
            },
        );
    }

    /// Create a symlink to `target`, creating parents
    pub fn add_symlink(&self, path: &str, target: &str) {
        let path = normalize(path);
        self.mkdir_all(parent_of(&path));
        self.fs.lock().nodes.insert(path, Node::symlink(target));
    }

    pub fn set_mtime(&self, path: &str, mtime: Timespec) {
        if let Some(node) = self.fs.lock().nodes.get_mut(&normalize(path)) {
            node.mtime = mtime;
        }
    }

    /// Register a storage host with `avail` free bytes
    pub fn add_host(&self, name: &str, avail: u64) {
        self.fs.lock().hosts.insert(name.to_string(), avail);
    }

    /// Removing a replica fails with InsufficientReplicas at or below this
    pub fn set_min_replicas(&self, n: usize) {
        self.fs.lock().min_replicas = n;
    }

    /// Make replica removal of `path` on `host` report Busy
    pub fn set_busy(&self, path: &str, host: &str, busy: bool) {
        let key = (normalize(path), host.to_string());
        let mut fs = self.fs.lock();
        if busy {
            fs.busy.insert(key);
        } else {
            fs.busy.remove(&key);
        }
    }

    /// Fail the next `times` calls of `op` (on `path`, or any path) with `kind`
    ///
    /// `op` is the session method name, or `"connect"`.
    pub fn inject_fault(
        &self,
        op: &str,
        path: Option<&str>,
        kind: BackendErrorKind,
        times: usize,
    ) {
        self.fs.lock().faults.push(Fault {
            op: op.to_string(),
            path: path.map(normalize),
            kind,
            remaining: times,
        });
    }

    /// Sleep this long inside every data-moving operation
    pub fn set_delay(&self, delay: Duration) {
        self.fs.lock().delay = Some(delay);
    }

    /// Sessions opened so far
    pub fn connections(&self) -> usize {
        self.fs.lock().connections
    }

    /// Most data-moving operations observed running at once
    pub fn max_concurrent(&self) -> usize {
        self.fs.lock().max_active
    }

    pub fn exists(&self, path: &str) -> bool {
        self.fs.lock().nodes.contains_key(&normalize(path))
    }

    pub fn stat(&self, path: &str) -> Option<FileStat> {
        self.fs.lock().nodes.get(&normalize(path)).map(Node::stat)
    }

    pub fn read_link(&self, path: &str) -> Option<String> {
        match &self.fs.lock().nodes.get(&normalize(path))?.kind {
            NodeKind::Symlink { target } => Some(target.clone()),
            _ => None,
        }
    }

    pub fn read_file(&self, path: &str) -> Option<Vec<u8>> {
        match &self.fs.lock().nodes.get(&normalize(path))?.kind {
            NodeKind::File { data, .. } => Some(data.as_ref().clone()),
            _ => None,
        }
    }

    pub fn replicas(&self, path: &str) -> Vec<String> {
        match self.fs.lock().nodes.get(&normalize(path)).map(|n| &n.kind) {
            Some(NodeKind::File { replicas, .. }) => replicas.clone(),
            _ => Vec::new(),
        }
    }

    pub fn host_avail(&self, host: &str) -> Option<u64> {
        self.fs.lock().hosts.get(host).copied()
    }

    /// All paths under `prefix`, in sorted order
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let prefix = normalize(prefix);
        let dir_prefix = if prefix == "/" {
            prefix.clone()
        } else {
            format!("{}/", prefix)
        };
        self.fs
            .lock()
            .nodes
            .keys()
            .filter(|p| p.starts_with(&dir_prefix))
            .cloned()
            .collect()
    }
}

/// Deterministic file contents
fn pattern(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Connector for [`MemoryBackend`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    fs: Arc<Mutex<MemoryFs>>,
}

impl Connector for MemoryConnector {
    fn connect(&self) -> BackendResult<Box<dyn Session>> {
        let mut fs = self.fs.lock();
        fs.take_fault("connect", "")?;
        fs.connections += 1;
        Ok(Box::new(MemorySession {
            fs: Arc::clone(&self.fs),
        }))
    }
}

/// One session on a [`MemoryBackend`]
pub struct MemorySession {
    fs: Arc<Mutex<MemoryFs>>,
}

impl MemorySession {
    fn delay(&self) {
        let delay = self.fs.lock().delay;
        if let Some(d) = delay {
            thread::sleep(d);
        }
    }
}

impl MetadataClient for MemorySession {
    fn list_directory(&mut self, path: &str) -> BackendResult<Vec<DirEntry>> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("list_directory", &path)?;

        let node = fs.node("list_directory", &path)?;
        if !node.is_dir() {
            return Err(BackendError::new(
                BackendErrorKind::NotADirectory,
                "list_directory",
                &path,
            ));
        }

        let mut entries = vec![
            DirEntry {
                name: ".".into(),
                stat: node.stat(),
            },
            DirEntry {
                name: "..".into(),
                stat: fs.node("list_directory", parent_of(&path))?.stat(),
            },
        ];

        let prefix = if path == "/" {
            path.clone()
        } else {
            format!("{}/", path)
        };
        for (child, node) in fs.nodes.range(prefix.clone()..) {
            let Some(name) = child.strip_prefix(&prefix) else {
                break;
            };
            if name.is_empty() || name.contains('/') {
                continue;
            }
            entries.push(DirEntry {
                name: name.to_string(),
                stat: node.stat(),
            });
        }
        Ok(entries)
    }

    fn stat_path(&mut self, path: &str) -> BackendResult<FileStat> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("stat_path", &path)?;
        Ok(fs.node("stat_path", &path)?.stat())
    }

    fn replica_hosts(&mut self, path: &str) -> BackendResult<Vec<String>> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("replica_hosts", &path)?;
        match &fs.node("replica_hosts", &path)?.kind {
            NodeKind::File { replicas, .. } => Ok(replicas.clone()),
            _ => Ok(Vec::new()),
        }
    }

    fn schedule_hosts(&mut self, domain: Option<&str>) -> BackendResult<Vec<String>> {
        let mut fs = self.fs.lock();
        fs.take_fault("schedule_hosts", domain.unwrap_or(""))?;
        Ok(fs
            .hosts
            .keys()
            .filter(|h| domain.map_or(true, |d| h.ends_with(d)))
            .cloned()
            .collect())
    }
}

impl StorageBackend for MemorySession {
    fn replicate(
        &mut self,
        path: &str,
        src_host: Option<&str>,
        dst_host: &str,
    ) -> BackendResult<()> {
        const OP: &str = "replicate";
        let path = normalize(path);
        {
            let mut fs = self.fs.lock();
            fs.take_fault(OP, &path)?;
            let avail = *fs.hosts.get(dst_host).ok_or_else(|| {
                BackendError::new(BackendErrorKind::NotFound, OP, &path).with_host(dst_host)
            })?;
            let size = match &fs.node(OP, &path)?.kind {
                NodeKind::File { data, replicas } => {
                    if let Some(src) = src_host {
                        if !replicas.iter().any(|r| r == src) {
                            return Err(BackendError::new(BackendErrorKind::NotFound, OP, &path)
                                .with_host(src)
                                .with_message("no replica on source host"));
                        }
                    }
                    if replicas.iter().any(|r| r == dst_host) {
                        return Err(BackendError::new(BackendErrorKind::AlreadyExists, OP, &path)
                            .with_host(dst_host));
                    }
                    data.len() as u64
                }
                _ => {
                    return Err(BackendError::new(BackendErrorKind::Other, OP, &path)
                        .with_message("not a regular file"))
                }
            };
            if size > avail {
                return Err(BackendError::new(BackendErrorKind::NoSpace, OP, &path)
                    .with_host(dst_host));
            }
            fs.hosts.insert(dst_host.to_string(), avail - size);
            fs.begin();
        }

        self.delay();

        let mut fs = self.fs.lock();
        fs.finish();
        if let NodeKind::File { replicas, .. } = &mut fs.node_mut(OP, &path)?.kind {
            replicas.push(dst_host.to_string());
        }
        Ok(())
    }

    fn remove_replica(&mut self, path: &str, host: &str) -> BackendResult<()> {
        const OP: &str = "remove_replica";
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault(OP, &path)?;
        if fs.busy.contains(&(path.clone(), host.to_string())) {
            return Err(BackendError::new(BackendErrorKind::Busy, OP, &path).with_host(host));
        }
        let min = fs.min_replicas;
        let freed = match &mut fs.node_mut(OP, &path)?.kind {
            NodeKind::File { data, replicas } => {
                let Some(pos) = replicas.iter().position(|r| r == host) else {
                    return Err(BackendError::new(BackendErrorKind::NotFound, OP, &path)
                        .with_host(host));
                };
                if replicas.len() <= min.max(1) {
                    return Err(
                        BackendError::new(BackendErrorKind::InsufficientReplicas, OP, &path)
                            .with_host(host),
                    );
                }
                replicas.remove(pos);
                data.len() as u64
            }
            _ => {
                return Err(BackendError::new(BackendErrorKind::Other, OP, &path)
                    .with_message("not a regular file"))
            }
        };
        if let Some(avail) = fs.hosts.get_mut(host) {
            *avail += freed;
        }
        Ok(())
    }

    fn disk_avail(&mut self, host: &str) -> BackendResult<u64> {
        let mut fs = self.fs.lock();
        fs.take_fault("disk_avail", host)?;
        fs.hosts.get(host).copied().ok_or_else(|| {
            BackendError::new(BackendErrorKind::NotFound, "disk_avail", "").with_host(host)
        })
    }

    fn open_read(&mut self, path: &str, _host: Option<&str>) -> BackendResult<Box<dyn Read>> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("open_read", &path)?;
        match &fs.node("open_read", &path)?.kind {
            NodeKind::File { data, .. } => Ok(Box::new(Cursor::new(SharedBytes(Arc::clone(data))))),
            _ => Err(BackendError::new(BackendErrorKind::Other, "open_read", &path)
                .with_message("not a regular file")),
        }
    }

    fn create(
        &mut self,
        path: &str,
        mode: u32,
        exclusive: bool,
        host: Option<&str>,
    ) -> BackendResult<Box<dyn FileSink>> {
        const OP: &str = "create";
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault(OP, &path)?;
        fs.check_parent(OP, &path)?;
        if let Some(existing) = fs.nodes.get(&path) {
            if exclusive {
                return Err(BackendError::new(BackendErrorKind::AlreadyExists, OP, &path));
            }
            if existing.is_dir() {
                return Err(BackendError::new(BackendErrorKind::IsADirectory, OP, &path));
            }
        }
        let replicas = host.map(|h| vec![h.to_string()]).unwrap_or_default();
        fs.nodes.insert(
            path.clone(),
            Node {
                kind: NodeKind::File {
                    data: Arc::new(Vec::new()),
                    replicas,
                },
                perm: mode & 0o7777,
                atime: Timespec::default(),
                mtime: Timespec::default(),
            },
        );
        fs.begin();
        Ok(Box::new(MemorySink {
            fs: Arc::clone(&self.fs),
            path,
            buf: Vec::new(),
        }))
    }

    fn set_times(&mut self, path: &str, atime: Timespec, mtime: Timespec) -> BackendResult<()> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("set_times", &path)?;
        let node = fs.node_mut("set_times", &path)?;
        node.atime = atime;
        node.mtime = mtime;
        Ok(())
    }

    fn rename(&mut self, from: &str, to: &str) -> BackendResult<()> {
        let (from, to) = (normalize(from), normalize(to));
        let mut fs = self.fs.lock();
        fs.take_fault("rename", &from)?;
        fs.check_parent("rename", &to)?;
        if fs.nodes.get(&to).map_or(false, Node::is_dir) {
            return Err(BackendError::new(BackendErrorKind::IsADirectory, "rename", &to));
        }
        let node = fs
            .nodes
            .remove(&from)
            .ok_or_else(|| BackendError::new(BackendErrorKind::NotFound, "rename", &from))?;
        fs.nodes.insert(to, node);
        Ok(())
    }

    fn unlink(&mut self, path: &str) -> BackendResult<()> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("unlink", &path)?;
        if fs.node("unlink", &path)?.is_dir() {
            return Err(BackendError::new(BackendErrorKind::IsADirectory, "unlink", &path));
        }
        fs.nodes.remove(&path);
        Ok(())
    }

    fn mkdir(&mut self, path: &str, mode: u32) -> BackendResult<()> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("mkdir", &path)?;
        fs.check_parent("mkdir", &path)?;
        if fs.nodes.contains_key(&path) {
            return Err(BackendError::new(BackendErrorKind::AlreadyExists, "mkdir", &path));
        }
        let mut node = Node::dir();
        node.perm = mode & 0o7777;
        fs.nodes.insert(path, node);
        Ok(())
    }

    fn rmdir(&mut self, path: &str) -> BackendResult<()> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("rmdir", &path)?;
        if !fs.node("rmdir", &path)?.is_dir() {
            return Err(BackendError::new(BackendErrorKind::NotADirectory, "rmdir", &path));
        }
        let prefix = format!("{}/", path);
        if fs.nodes.range(prefix.clone()..).next().map_or(false, |(p, _)| p.starts_with(&prefix)) {
            return Err(BackendError::new(BackendErrorKind::Other, "rmdir", &path)
                .with_message("directory not empty"));
        }
        fs.nodes.remove(&path);
        Ok(())
    }

    fn read_link(&mut self, path: &str) -> BackendResult<String> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("read_link", &path)?;
        match &fs.node("read_link", &path)?.kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(BackendError::new(BackendErrorKind::Other, "read_link", &path)
                .with_message("not a symlink")),
        }
    }

    fn symlink(&mut self, target: &str, path: &str) -> BackendResult<()> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("symlink", &path)?;
        fs.check_parent("symlink", &path)?;
        if fs.nodes.contains_key(&path) {
            return Err(BackendError::new(BackendErrorKind::AlreadyExists, "symlink", &path));
        }
        fs.nodes.insert(path, Node::symlink(target));
        Ok(())
    }

    fn set_link_times(
        &mut self,
        path: &str,
        atime: Timespec,
        mtime: Timespec,
    ) -> BackendResult<()> {
        let path = normalize(path);
        let mut fs = self.fs.lock();
        fs.take_fault("set_link_times", &path)?;
        let node = fs.node_mut("set_link_times", &path)?;
        node.atime = atime;
        node.mtime = mtime;
        Ok(())
    }
}

#[derive(Debug)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Buffers writes and publishes them on sync or drop
struct MemorySink {
    fs: Arc<Mutex<MemoryFs>>,
    path: String,
    buf: Vec<u8>,
}

impl MemorySink {
    fn publish(&mut self) {
        let mut fs = self.fs.lock();
        if let Some(Node {
            kind: NodeKind::File { data, .. },
            ..
        }) = fs.nodes.get_mut(&self.path)
        {
            *data = Arc::new(self.buf.clone());
        }
    }
}

impl Write for MemorySink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl FileSink for MemorySink {
    fn sync(&mut self) -> io::Result<()> {
        let delay = self.fs.lock().delay;
        if let Some(d) = delay {
            thread::sleep(d);
        }
        self.publish();
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.publish();
        self.fs.lock().finish();
    }
}
