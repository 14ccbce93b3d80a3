//! In-memory [`SftpBackend`] for tests

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use russh_sftp::protocol::{FileAttributes as RemoteAttrs, OpenFlags};

use super::backend::{RemoteEntry, SftpBackend};
use super::path_utils::{normalize_remote_path, parent_remote_path};
use crate::translator::TranslatorError;

pub(crate) const HOME: &str = "/home/test";

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, mode: u32, mtime: Option<u32> },
    Dir { mode: u32, mtime: Option<u32> },
    Link { target: String },
}

enum OpenHandle {
    File(String),
    Dir { entries: Vec<RemoteEntry>, done: bool },
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    handles: HashMap<String, OpenHandle>,
    next_handle: u64,
    reads_active: usize,
    max_reads: usize,
    bytes_requested: u64,
    write_requests: usize,
    setstat_calls: usize,
}

pub(crate) struct MemoryBackend {
    state: Mutex<State>,
    max_read: u32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let backend = Self {
            state: Mutex::new(State::default()),
            max_read: u32::MAX,
        };
        backend.put_dir(HOME);
        backend
    }

    /// Serve at most `max` bytes per read request.
    pub fn with_max_read(mut self, max: u32) -> Self {
        self.max_read = max;
        self
    }

    pub fn put_dir(&self, path: &str) {
        let mut state = self.state.lock();
        let mut current = String::new();
        state.nodes.entry("/".into()).or_insert(Node::Dir { mode: 0o755, mtime: None });
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            state
                .nodes
                .entry(current.clone())
                .or_insert(Node::Dir { mode: 0o755, mtime: None });
        }
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.put_dir(&parent_remote_path(path));
        self.state.lock().nodes.insert(
            path.to_string(),
            Node::File {
                data: content.to_vec(),
                mode: 0o644,
                mtime: None,
            },
        );
    }

    pub fn put_link(&self, path: &str, target: &str) {
        self.state.lock().nodes.insert(
            path.to_string(),
            Node::Link {
                target: target.to_string(),
            },
        );
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        match self.state.lock().nodes.get(path) {
            Some(Node::File { data, .. }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn mode(&self, path: &str) -> Option<u32> {
        match self.state.lock().nodes.get(path) {
            Some(Node::File { mode, .. }) | Some(Node::Dir { mode, .. }) => Some(*mode),
            _ => None,
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().nodes.contains_key(path)
    }

    pub fn max_concurrent_reads(&self) -> usize {
        self.state.lock().max_reads
    }

    pub fn bytes_requested(&self) -> u64 {
        self.state.lock().bytes_requested
    }

    pub fn write_requests(&self) -> usize {
        self.state.lock().write_requests
    }

    pub fn setstat_calls(&self) -> usize {
        self.state.lock().setstat_calls
    }

    fn absolute(path: &str) -> String {
        if path.starts_with('/') {
            normalize_remote_path(path)
        } else {
            normalize_remote_path(&format!("{}/{}", HOME, path))
        }
    }

    fn resolve(state: &State, path: &str) -> Result<String, TranslatorError> {
        let mut path = Self::absolute(path);
        for _ in 0..8 {
            match state.nodes.get(&path) {
                Some(Node::Link { target }) => path = Self::absolute(target),
                Some(_) => return Ok(path),
                None => return Err(TranslatorError::NotFound(path)),
            }
        }
        Err(TranslatorError::Protocol(format!("too many links: {}", path)))
    }

    fn attrs(node: &Node) -> RemoteAttrs {
        let mut attrs = RemoteAttrs::empty();
        match node {
            Node::File { data, mode, mtime } => {
                attrs.permissions = Some(0o100000 | mode);
                attrs.size = Some(data.len() as u64);
                attrs.mtime = *mtime;
            }
            Node::Dir { mode, mtime } => {
                attrs.permissions = Some(0o040000 | mode);
                attrs.mtime = *mtime;
            }
            Node::Link { target } => {
                attrs.permissions = Some(0o120777);
                attrs.size = Some(target.len() as u64);
            }
        }
        attrs
    }

    fn handle(state: &mut State, open: OpenHandle) -> String {
        state.next_handle += 1;
        let handle = format!("h{}", state.next_handle);
        state.handles.insert(handle.clone(), open);
        handle
    }
}

#[async_trait]
impl SftpBackend for MemoryBackend {
    async fn realpath(&self, path: &str) -> Result<String, TranslatorError> {
        let state = self.state.lock();
        Self::resolve(&state, path)
    }

    async fn stat(&self, path: &str) -> Result<RemoteAttrs, TranslatorError> {
        let state = self.state.lock();
        let path = Self::resolve(&state, path)?;
        state
            .nodes
            .get(&path)
            .map(Self::attrs)
            .ok_or(TranslatorError::NotFound(path))
    }

    async fn lstat(&self, path: &str) -> Result<RemoteAttrs, TranslatorError> {
        let path = Self::absolute(path);
        let state = self.state.lock();
        state
            .nodes
            .get(&path)
            .map(Self::attrs)
            .ok_or(TranslatorError::NotFound(path))
    }

    async fn setstat(&self, path: &str, attrs: RemoteAttrs) -> Result<(), TranslatorError> {
        let mut state = self.state.lock();
        state.setstat_calls += 1;
        let path = Self::resolve(&state, path)?;
        match state.nodes.get_mut(&path) {
            Some(Node::File { mode, mtime, .. }) | Some(Node::Dir { mode, mtime }) => {
                if let Some(p) = attrs.permissions {
                    *mode = p & 0o7777;
                }
                if attrs.mtime.is_some() {
                    *mtime = attrs.mtime;
                }
                Ok(())
            }
            _ => Err(TranslatorError::NotFound(path)),
        }
    }

    async fn open(
        &self,
        path: &str,
        flags: OpenFlags,
        attrs: RemoteAttrs,
    ) -> Result<String, TranslatorError> {
        let path = Self::absolute(path);
        let mut state = self.state.lock();
        match state.nodes.get_mut(&path) {
            Some(Node::File { data, .. }) => {
                if flags.contains(OpenFlags::TRUNCATE) {
                    data.clear();
                }
            }
            Some(Node::Dir { .. }) => return Err(TranslatorError::IsADirectory(path)),
            Some(Node::Link { .. }) => {
                let target = Self::resolve(&state, &path)?;
                return Ok(Self::handle(&mut state, OpenHandle::File(target)));
            }
            None if flags.contains(OpenFlags::CREATE) => {
                if !matches!(state.nodes.get(&parent_remote_path(&path)), Some(Node::Dir { .. })) {
                    return Err(TranslatorError::NotFound(path));
                }
                state.nodes.insert(
                    path.clone(),
                    Node::File {
                        data: Vec::new(),
                        mode: attrs.permissions.unwrap_or(0o644) & 0o7777,
                        mtime: None,
                    },
                );
            }
            None => return Err(TranslatorError::NotFound(path)),
        }
        Ok(Self::handle(&mut state, OpenHandle::File(path)))
    }

    async fn close(&self, handle: &str) -> Result<(), TranslatorError> {
        self.state
            .lock()
            .handles
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| TranslatorError::Protocol(format!("bad handle {}", handle)))
    }

    async fn read(&self, handle: &str, offset: u64, len: u32) -> Result<Bytes, TranslatorError> {
        {
            let mut state = self.state.lock();
            state.reads_active += 1;
            state.max_reads = state.max_reads.max(state.reads_active);
            state.bytes_requested += len as u64;
        }
        tokio::task::yield_now().await;

        let mut state = self.state.lock();
        state.reads_active -= 1;
        let path = match state.handles.get(handle) {
            Some(OpenHandle::File(path)) => path.clone(),
            _ => return Err(TranslatorError::Protocol(format!("bad handle {}", handle))),
        };
        let data = match state.nodes.get(&path) {
            Some(Node::File { data, .. }) => data,
            _ => return Err(TranslatorError::NotFound(path)),
        };
        let start = (offset as usize).min(data.len());
        let end = (start + len.min(self.max_read) as usize).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write(&self, handle: &str, offset: u64, chunk: Bytes) -> Result<(), TranslatorError> {
        let mut state = self.state.lock();
        state.write_requests += 1;
        let path = match state.handles.get(handle) {
            Some(OpenHandle::File(path)) => path.clone(),
            _ => return Err(TranslatorError::Protocol(format!("bad handle {}", handle))),
        };
        match state.nodes.get_mut(&path) {
            Some(Node::File { data, .. }) => {
                let end = offset as usize + chunk.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset as usize..end].copy_from_slice(&chunk);
                Ok(())
            }
            _ => Err(TranslatorError::NotFound(path)),
        }
    }

    async fn opendir(&self, path: &str) -> Result<String, TranslatorError> {
        let mut state = self.state.lock();
        let path = Self::resolve(&state, path)?;
        if !matches!(state.nodes.get(&path), Some(Node::Dir { .. })) {
            return Err(TranslatorError::NotADirectory(path));
        }
        let mut entries = vec![
            RemoteEntry {
                filename: ".".into(),
                attrs: Self::attrs(&Node::Dir { mode: 0o755, mtime: None }),
            },
            RemoteEntry {
                filename: "..".into(),
                attrs: Self::attrs(&Node::Dir { mode: 0o755, mtime: None }),
            },
        ];
        for (child, node) in state.nodes.iter() {
            if child != "/" && parent_remote_path(child) == path {
                entries.push(RemoteEntry {
                    filename: child.rsplit('/').next().unwrap_or_default().to_string(),
                    attrs: Self::attrs(node),
                });
            }
        }
        Ok(Self::handle(&mut state, OpenHandle::Dir { entries, done: false }))
    }

    async fn readdir(&self, handle: &str) -> Result<Vec<RemoteEntry>, TranslatorError> {
        let mut state = self.state.lock();
        match state.handles.get_mut(handle) {
            Some(OpenHandle::Dir { entries, done }) => {
                if *done {
                    Ok(Vec::new())
                } else {
                    *done = true;
                    Ok(std::mem::take(entries))
                }
            }
            _ => Err(TranslatorError::Protocol(format!("bad handle {}", handle))),
        }
    }

    async fn mkdir(&self, path: &str, attrs: RemoteAttrs) -> Result<(), TranslatorError> {
        let path = Self::absolute(path);
        let mut state = self.state.lock();
        if state.nodes.contains_key(&path) {
            return Err(TranslatorError::Protocol(format!("{}: Failure", path)));
        }
        if !matches!(state.nodes.get(&parent_remote_path(&path)), Some(Node::Dir { .. })) {
            return Err(TranslatorError::NotFound(path));
        }
        state.nodes.insert(
            path,
            Node::Dir {
                mode: attrs.permissions.unwrap_or(0o755) & 0o7777,
                mtime: None,
            },
        );
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), TranslatorError> {
        let path = Self::absolute(path);
        let mut state = self.state.lock();
        if !matches!(state.nodes.get(&path), Some(Node::Dir { .. })) {
            return Err(TranslatorError::NotFound(path));
        }
        if state.nodes.keys().any(|k| k != "/" && parent_remote_path(k) == path) {
            return Err(TranslatorError::Protocol(format!("{}: directory not empty", path)));
        }
        state.nodes.remove(&path);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), TranslatorError> {
        let path = Self::absolute(path);
        let mut state = self.state.lock();
        match state.nodes.get(&path) {
            Some(Node::Dir { .. }) => Err(TranslatorError::IsADirectory(path)),
            Some(_) => {
                state.nodes.remove(&path);
                Ok(())
            }
            None => Err(TranslatorError::NotFound(path)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TranslatorError> {
        let from = Self::absolute(from);
        let to = Self::absolute(to);
        let mut state = self.state.lock();
        let node = state
            .nodes
            .remove(&from)
            .ok_or_else(|| TranslatorError::NotFound(from.clone()))?;
        let prefix = format!("{}/", from);
        let children: Vec<String> = state
            .nodes
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect();
        for child in children {
            if let Some(moved) = state.nodes.remove(&child) {
                let renamed = format!("{}/{}", to, &child[prefix.len()..]);
                state.nodes.insert(renamed, moved);
            }
        }
        state.nodes.insert(to, node);
        Ok(())
    }

    async fn readlink(&self, path: &str) -> Result<String, TranslatorError> {
        let path = Self::absolute(path);
        match self.state.lock().nodes.get(&path) {
            Some(Node::Link { target }) => Ok(target.clone()),
            Some(_) => Err(TranslatorError::Protocol(format!("{}: not a link", path))),
            None => Err(TranslatorError::NotFound(path)),
        }
    }

    async fn symlink(&self, path: &str, target: &str) -> Result<(), TranslatorError> {
        let path = Self::absolute(path);
        let mut state = self.state.lock();
        if state.nodes.contains_key(&path) {
            return Err(TranslatorError::Protocol(format!("{}: Failure", path)));
        }
        state.nodes.insert(
            path,
            Node::Link {
                target: target.to_string(),
            },
        );
        Ok(())
    }
}
