use std::fmt;

use thiserror::Error;

use crate::handle::ObjectHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendErrorKind {
    NotFound,
    Permission,
    Access,
    NotDirectory,
    Io,
    Stale,
    Invalid,
    NotSupported,
    Other,
}

/// Status returned by a backend driver: a kind plus the driver's raw detail
/// code (usually an errno).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("backend error {kind:?} (detail {detail})")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub detail: i32,
    pub retryable: bool,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, detail: i32) -> Self {
        BackendError {
            kind,
            detail,
            retryable: false,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn not_found() -> Self {
        Self::new(BackendErrorKind::NotFound, 2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CorruptionKind {
    /// One child handle claimed under two different (parent, name) pairs.
    DuplicateHandle,
    /// A lookup returned the parent's own handle as the child.
    SelfParent,
    /// A ".." lookup disagrees with the recorded parent of the directory.
    DotDotMismatch,
}

/// The backend violated handle identity. Serving further requests risks
/// handing one client another client's data.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub struct BackendCorruption {
    pub kind: CorruptionKind,
    pub child: ObjectHandle,
    pub cached_parent: Option<ObjectHandle>,
    pub cached_name: Option<String>,
    pub parent: Option<ObjectHandle>,
    pub name: String,
}

fn fmt_parent(parent: &Option<ObjectHandle>) -> String {
    match parent {
        Some(h) => h.to_string(),
        None => "NULL".to_string(),
    }
}

impl fmt::Display for BackendCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "backend corruption ({:?}): child {} cached parent {} cached name {:?}, presented parent {} name {:?}",
            self.kind,
            self.child,
            fmt_parent(&self.cached_parent),
            self.cached_name.as_deref().unwrap_or(""),
            fmt_parent(&self.parent),
            self.name,
        )
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("missing or contradictory argument: {0}")]
    InputFault(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("object not found")]
    NotFound,

    #[error("not a directory")]
    NotDirectory,

    #[error("size {0} exceeds the filesystem limit")]
    FileTooLarge(u64),

    #[error("crossing a junction")]
    CrossDevice,

    #[error("server fault: {0}")]
    ServerFault(String),

    #[error("operation not permitted")]
    Permission,

    #[error("access denied")]
    Access,

    #[error(transparent)]
    Corruption(#[from] BackendCorruption),

    #[error(transparent)]
    Backend(BackendError),
}

impl From<BackendError> for CacheError {
    fn from(e: BackendError) -> Self {
        match e.kind {
            BackendErrorKind::NotFound => CacheError::NotFound,
            BackendErrorKind::NotDirectory => CacheError::NotDirectory,
            BackendErrorKind::Permission => CacheError::Permission,
            BackendErrorKind::Access => CacheError::Access,
            _ => CacheError::Backend(e),
        }
    }
}

impl CacheError {
    /// Whether the caller may reasonably retry the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Backend(e) if e.retryable)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpcallError {
    #[error("invalid upcall: {0}")]
    InvalidArgument(String),

    /// The target is not cached here. Expected on multi-node deployments.
    #[error("upcall target not cached")]
    NotFound,
}
