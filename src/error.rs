//! Error kinds for the wire/session/request plane, as specified in
//! `spec.md` §7.

use std::fmt;

use thiserror::Error;

use crate::lock::FileLock;

/// Errors surfaced by the packet pool, codecs, channel handlers, request
/// handlers, the lock manager, and the RPC/MOUNT service.
#[derive(Debug, Error)]
pub enum Error {
    /// The peer closed its end of the connection (zero-byte or negative read).
    #[error("peer closed the connection")]
    PeerClosed,

    /// A framing header was malformed or a fragment was truncated.
    #[error("framing error: {0}")]
    FramingError(String),

    /// An ONC-RPC fragment reassembly exceeded the pool's over-sized ceiling.
    #[error("fragment too large: accumulated {accumulated} bytes exceeds max {max}")]
    FragmentTooLarge { accumulated: usize, max: usize },

    /// The packet pool had no tier, spill, or over-sized capacity left.
    #[error("out of pooled memory: requested {requested} bytes")]
    OutOfPooledMemory { requested: usize },

    /// RPC authentication failed.
    #[error("rpc auth failed: {code:?}")]
    AuthError { code: AuthFailureCode },

    /// A byte-range lock request conflicted with an existing lock.
    #[error("lock conflict with existing lock {existing:?}")]
    LockConflict { existing: FileLock },

    /// An unlock request did not match any held lock.
    #[error("no matching lock held for the given range")]
    NotLocked,

    /// A MOUNT path did not resolve to anything on the exported filesystem.
    #[error("path not found")]
    PathNotFound,

    /// A MOUNT path resolved to a non-directory where a directory was required.
    #[error("path exists but is not a directory")]
    PathNotDirectory,

    /// The RPC program number is not served here.
    #[error("rpc program unavailable")]
    ProgramUnavailable,

    /// The RPC program is served, but not at the requested version.
    #[error("rpc version mismatch: server supports [{lo}, {hi}]")]
    VersionMismatch { lo: u32, hi: u32 },

    /// The RPC procedure number is not implemented by the program/version pair.
    #[error("rpc procedure unsupported")]
    ProcedureUnsupported,

    /// The channel's underlying socket has already been closed.
    #[error("channel already closed")]
    ChannelClosed,

    /// An error from a collaborator the core does not own (codec body,
    /// storage driver, dispatcher).
    #[error("internal error: {cause}")]
    InternalError { cause: String },
}

impl Error {
    pub fn internal(cause: impl fmt::Display) -> Self {
        Error::InternalError { cause: cause.to_string() }
    }
}

/// RPC authentication failure codes, mirrored from the `auth_stat` enum in
/// RFC 5531 §8.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureCode {
    BadCredential,
    RejectedCredential,
    BadVerifier,
    RejectedVerifier,
    TooWeak,
    InvalidResponse,
    Failed,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            UnexpectedEof | ConnectionReset | BrokenPipe => Error::PeerClosed,
            _ => Error::InternalError { cause: err.to_string() },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
