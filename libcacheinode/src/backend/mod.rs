//! Backend driver capability.
//!
//! Every storage backend exports its objects through [`Backend`]. Calls may
//! block on I/O and are always issued without any cache entry lock held.

pub mod memory;

use async_trait::async_trait;
use bitflags::bitflags;

use crate::error::BackendError;
use crate::handle::ObjectHandle;
use crate::models::{AttrSet, Attributes};

pub use memory::InMemoryBackend;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const TRUNCATE = 1 << 2;
    }
}

/// Backend-side descriptor of an open file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadReply {
    pub data: Vec<u8>,
    pub eof: bool,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Handle of the export's mount root.
    async fn lookup_root(&self) -> Result<ObjectHandle, BackendError>;

    /// Resolve `name` inside `parent`. Not atomic with respect to concurrent
    /// renames on the backend.
    async fn lookup(&self, parent: &ObjectHandle, name: &str)
    -> Result<ObjectHandle, BackendError>;

    async fn get_attributes(&self, handle: &ObjectHandle) -> Result<Attributes, BackendError>;

    async fn set_attributes(
        &self,
        handle: &ObjectHandle,
        attrs: &AttrSet,
    ) -> Result<(), BackendError>;

    async fn open(&self, handle: &ObjectHandle, flags: OpenFlags) -> Result<FileId, BackendError>;

    async fn read(&self, file: FileId, offset: u64, len: usize) -> Result<ReadReply, BackendError>;

    async fn write(&self, file: FileId, offset: u64, data: &[u8]) -> Result<usize, BackendError>;

    /// Make a written range stable.
    async fn commit(&self, file: FileId, offset: u64, len: u64) -> Result<(), BackendError>;

    async fn close(&self, file: FileId) -> Result<(), BackendError>;

    async fn rename(
        &self,
        src_parent: &ObjectHandle,
        src_name: &str,
        dst_parent: &ObjectHandle,
        dst_name: &str,
    ) -> Result<(), BackendError>;
}
