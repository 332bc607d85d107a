//! In-memory backend driver, for local development and tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{Backend, FileId, OpenFlags, ReadReply};
use crate::error::{BackendError, BackendErrorKind};
use crate::handle::{HANDLE_LEN, ObjectHandle};
use crate::models::{AttrSet, Attributes, ObjectType};

const ENOENT: i32 = 2;
const EBADF: i32 = 9;
const EEXIST: i32 = 17;
const EISDIR: i32 = 21;
const ENOTDIR: i32 = 20;
const EINVAL: i32 = 22;
const ENOTEMPTY: i32 = 39;
const EIO: i32 = 5;
const EFBIG: i32 = 27;

/// Largest file the in-memory driver will hold.
pub const MAX_FILE_SIZE: u64 = 1 << 30;

struct Node {
    attrs: Attributes,
    parent: Option<ObjectHandle>,
    children: BTreeMap<String, ObjectHandle>,
    data: Vec<u8>,
}

struct OpenFile {
    handle: ObjectHandle,
    flags: OpenFlags,
}

struct State {
    nodes: HashMap<ObjectHandle, Node>,
    files: HashMap<FileId, OpenFile>,
    next_fileid: u64,
    next_fd: u64,
}

pub struct InMemoryBackend {
    root: ObjectHandle,
    state: Mutex<State>,
    unreadable: Mutex<HashSet<ObjectHandle>>,
    getattr_calls: AtomicUsize,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn err(kind: BackendErrorKind, detail: i32) -> BackendError {
    BackendError::new(kind, detail)
}

impl InMemoryBackend {
    /// Creates a backend holding only a root directory (mode 0o755, owned by root).
    pub fn new() -> Self {
        let root = Self::handle_for(1);
        let mut attrs = Attributes::new(ObjectType::Directory, 1);
        attrs.mode = 0o755;
        attrs.numlinks = 2;
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                attrs,
                parent: None,
                children: BTreeMap::new(),
                data: Vec::new(),
            },
        );
        Self {
            root,
            state: Mutex::new(State {
                nodes,
                files: HashMap::new(),
                next_fileid: 2,
                next_fd: 1,
            }),
            unreadable: Mutex::new(HashSet::new()),
            getattr_calls: AtomicUsize::new(0),
        }
    }

    fn handle_for(fileid: u64) -> ObjectHandle {
        let mut raw = [0u8; HANDLE_LEN];
        raw[..8].copy_from_slice(b"memfs\0\0\0");
        raw[8..16].copy_from_slice(&fileid.to_be_bytes());
        ObjectHandle::from_bytes(raw)
    }

    pub fn root(&self) -> ObjectHandle {
        self.root
    }

    /// Creates an object under `parent`. `attrs.fileid` is overwritten with a
    /// fresh id.
    pub fn insert(
        &self,
        parent: &ObjectHandle,
        name: &str,
        mut attrs: Attributes,
    ) -> Result<ObjectHandle, BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let fileid = state.next_fileid;
        let handle = Self::handle_for(fileid);
        let dir = state
            .nodes
            .get_mut(parent)
            .ok_or_else(|| err(BackendErrorKind::Stale, ENOENT))?;
        if !dir.attrs.is_dir() {
            return Err(err(BackendErrorKind::NotDirectory, ENOTDIR));
        }
        if dir.children.contains_key(name) {
            return Err(err(BackendErrorKind::Invalid, EEXIST));
        }
        dir.children.insert(name.to_string(), handle);
        state.next_fileid += 1;
        attrs.fileid = fileid;
        state.nodes.insert(
            handle,
            Node {
                attrs,
                parent: Some(*parent),
                children: BTreeMap::new(),
                data: Vec::new(),
            },
        );
        Ok(handle)
    }

    pub fn mkdir(&self, parent: &ObjectHandle, name: &str) -> Result<ObjectHandle, BackendError> {
        let mut attrs = Attributes::new(ObjectType::Directory, 0);
        attrs.mode = 0o755;
        attrs.numlinks = 2;
        self.insert(parent, name, attrs)
    }

    pub fn create_file(
        &self,
        parent: &ObjectHandle,
        name: &str,
    ) -> Result<ObjectHandle, BackendError> {
        let mut attrs = Attributes::new(ObjectType::RegularFile, 0);
        attrs.mode = 0o644;
        self.insert(parent, name, attrs)
    }

    /// Makes `name` under `parent` resolve to an arbitrary existing handle,
    /// the way a buggy driver hands out duplicate identities.
    pub fn alias(&self, parent: &ObjectHandle, name: &str, target: ObjectHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dir) = state.nodes.get_mut(parent) {
            dir.children.insert(name.to_string(), target);
        }
    }

    /// Points `".."` of `dir` at `parent` without moving it.
    pub fn reparent(&self, dir: &ObjectHandle, parent: ObjectHandle) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = state.nodes.get_mut(dir) {
            node.parent = Some(parent);
        }
    }

    /// Makes every `get_attributes` call for `handle` fail.
    pub fn make_unreadable(&self, handle: ObjectHandle) {
        self.unreadable.lock().unwrap_or_else(PoisonError::into_inner).insert(handle);
    }

    /// Changes attributes behind the cache's back, as another node would.
    pub fn modify(&self, handle: &ObjectHandle, f: impl FnOnce(&mut Attributes)) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = state.nodes.get_mut(handle) {
            f(&mut node.attrs);
        }
    }

    pub fn getattr_calls(&self) -> usize {
        self.getattr_calls.load(Ordering::SeqCst)
    }

    pub fn open_files(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).files.len()
    }
}

fn file_len(size: u64) -> Result<usize, BackendError> {
    if size > MAX_FILE_SIZE {
        return Err(err(BackendErrorKind::Invalid, EFBIG));
    }
    usize::try_from(size).map_err(|_| err(BackendErrorKind::Invalid, EFBIG))
}

fn apply_attrset(node: &mut Node, set: &AttrSet) -> Result<(), BackendError> {
    if let Some(size) = set.size {
        node.data.resize(file_len(size)?, 0);
        node.attrs.size = size;
        node.attrs.space_used = size;
    }
    let attrs = &mut node.attrs;
    if let Some(acl) = &set.acl {
        attrs.acl = acl.clone();
    }
    if let Some(mode) = set.mode {
        attrs.mode = mode;
    }
    if let Some(owner) = set.owner {
        attrs.owner = owner;
    }
    if let Some(group) = set.group {
        attrs.group = group;
    }
    if let Some(atime) = set.atime {
        attrs.atime = atime;
    }
    if let Some(mtime) = set.mtime {
        attrs.mtime = mtime;
    }
    if let Some(ctime) = set.ctime {
        attrs.ctime = ctime;
    }
    if let Some(creation) = set.creation {
        attrs.creation = creation;
    }
    attrs.change += 1;
    Ok(())
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn lookup_root(&self) -> Result<ObjectHandle, BackendError> {
        Ok(self.root)
    }

    async fn lookup(
        &self,
        parent: &ObjectHandle,
        name: &str,
    ) -> Result<ObjectHandle, BackendError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = state
            .nodes
            .get(parent)
            .ok_or_else(|| err(BackendErrorKind::Stale, ENOENT))?;
        if !dir.attrs.is_dir() {
            return Err(err(BackendErrorKind::NotDirectory, ENOTDIR));
        }
        match name {
            "." => Ok(*parent),
            ".." => Ok(dir.parent.unwrap_or(*parent)),
            _ => dir
                .children
                .get(name)
                .copied()
                .ok_or_else(BackendError::not_found),
        }
    }

    async fn get_attributes(&self, handle: &ObjectHandle) -> Result<Attributes, BackendError> {
        self.getattr_calls.fetch_add(1, Ordering::SeqCst);
        if self.unreadable.lock().unwrap_or_else(PoisonError::into_inner).contains(handle) {
            return Err(err(BackendErrorKind::Io, EIO).retryable());
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .nodes
            .get(handle)
            .map(|n| n.attrs.clone())
            .ok_or_else(|| err(BackendErrorKind::Stale, ENOENT))
    }

    async fn set_attributes(
        &self,
        handle: &ObjectHandle,
        attrs: &AttrSet,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let node = state
            .nodes
            .get_mut(handle)
            .ok_or_else(|| err(BackendErrorKind::Stale, ENOENT))?;
        if attrs.size.is_some() && node.attrs.is_dir() {
            return Err(err(BackendErrorKind::Invalid, EISDIR));
        }
        apply_attrset(node, attrs)
    }

    async fn open(&self, handle: &ObjectHandle, flags: OpenFlags) -> Result<FileId, BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let node = state
            .nodes
            .get_mut(handle)
            .ok_or_else(|| err(BackendErrorKind::Stale, ENOENT))?;
        if node.attrs.object_type != ObjectType::RegularFile {
            return Err(err(BackendErrorKind::Invalid, EISDIR));
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            node.data.clear();
            node.attrs.size = 0;
            node.attrs.space_used = 0;
        }
        let fd = FileId(state.next_fd);
        state.next_fd += 1;
        state.files.insert(
            fd,
            OpenFile {
                handle: *handle,
                flags,
            },
        );
        Ok(fd)
    }

    async fn read(&self, file: FileId, offset: u64, len: usize) -> Result<ReadReply, BackendError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let open = state
            .files
            .get(&file)
            .ok_or_else(|| err(BackendErrorKind::Invalid, EBADF))?;
        if !open.flags.contains(OpenFlags::READ) {
            return Err(err(BackendErrorKind::Invalid, EBADF));
        }
        let node = state
            .nodes
            .get(&open.handle)
            .ok_or_else(|| err(BackendErrorKind::Stale, ENOENT))?;
        let start = usize::try_from(offset)
            .unwrap_or(usize::MAX)
            .min(node.data.len());
        let end = start.saturating_add(len).min(node.data.len());
        Ok(ReadReply {
            data: node.data[start..end].to_vec(),
            eof: end == node.data.len(),
        })
    }

    async fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<usize, BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let open = state
            .files
            .get(&file)
            .ok_or_else(|| err(BackendErrorKind::Invalid, EBADF))?;
        if !open.flags.contains(OpenFlags::WRITE) {
            return Err(err(BackendErrorKind::Invalid, EBADF));
        }
        let handle = open.handle;
        let node = state
            .nodes
            .get_mut(&handle)
            .ok_or_else(|| err(BackendErrorKind::Stale, ENOENT))?;
        let end = u64::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or_else(|| err(BackendErrorKind::Invalid, EFBIG))?;
        let end = file_len(end)?;
        let start = end - data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        node.attrs.size = node.data.len() as u64;
        node.attrs.space_used = node.attrs.size;
        node.attrs.change += 1;
        Ok(data.len())
    }

    async fn commit(&self, file: FileId, _offset: u64, _len: u64) -> Result<(), BackendError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.files.contains_key(&file) {
            return Err(err(BackendErrorKind::Invalid, EBADF));
        }
        Ok(())
    }

    async fn close(&self, file: FileId) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .files
            .remove(&file)
            .map(|_| ())
            .ok_or_else(|| err(BackendErrorKind::Invalid, EBADF))
    }

    async fn rename(
        &self,
        src_parent: &ObjectHandle,
        src_name: &str,
        dst_parent: &ObjectHandle,
        dst_name: &str,
    ) -> Result<(), BackendError> {
        if matches!(src_name, "." | "..") || matches!(dst_name, "." | "..") {
            return Err(err(BackendErrorKind::Invalid, EINVAL));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.nodes.get(dst_parent).is_some_and(|n| n.attrs.is_dir()) {
            return Err(err(BackendErrorKind::NotDirectory, ENOTDIR));
        }
        let child = state
            .nodes
            .get(src_parent)
            .and_then(|n| n.children.get(src_name).copied())
            .ok_or_else(BackendError::not_found)?;
        let replaced = state
            .nodes
            .get(dst_parent)
            .and_then(|n| n.children.get(dst_name).copied());
        if let Some(old) = replaced {
            if old == child {
                return Ok(());
            }
            if state.nodes.get(&old).is_some_and(|n| !n.children.is_empty()) {
                return Err(err(BackendErrorKind::Invalid, ENOTEMPTY));
            }
            state.nodes.remove(&old);
        }
        if let Some(src) = state.nodes.get_mut(src_parent) {
            src.children.remove(src_name);
        }
        if let Some(dst) = state.nodes.get_mut(dst_parent) {
            dst.children.insert(dst_name.to_string(), child);
        }
        if let Some(node) = state.nodes.get_mut(&child) {
            node.parent = Some(*dst_parent);
        }
        Ok(())
    }
}
