//! Trait boundaries for the out-of-scope external collaborators named in
//! `spec.md` §1/§6: SMB dialect handlers, NFSv3 operation semantics,
//! authentication providers, and storage drivers. The core plane compiles
//! and is testable standalone against these interfaces; a real server
//! binary supplies the implementations.

use crate::codec::FramedMessage;
use crate::pool::{Buffer, PacketPool};
use crate::session::Session;

/// A handle to a session as seen by a protocol dispatcher: enough to read
/// identity and queue async responses, without exposing the core's
/// internal channel/task-scheduling machinery.
pub type SessionHandle = Session;

/// The SMB dialect state machine / NFSv3 operation dispatcher sitting
/// above the wire plane (`spec.md` §1, §6).
///
/// Takes ownership of the decoded frame so the implementation controls
/// when its backing [`Buffer`] is released to `pool`; the core plane
/// never inspects frame contents itself.
pub trait ProtocolDispatcher: Send + Sync {
    fn dispatch(&self, session: &SessionHandle, frame: FramedMessage, pool: &PacketPool) -> Option<Buffer>;
}

/// Minimal storage-driver surface consulted by the MOUNT service's
/// directory check (`spec.md` §4.9) and the change-fan-out producer
/// helpers (`spec.md` §4.8). Local-disk and database-backed drivers are
/// out of scope; only this seam is specified.
pub trait StorageDriver: Send + Sync {
    /// Returns `true` iff `path` names an existing directory under this
    /// driver's root.
    fn is_directory(&self, path: &str) -> bool;

    /// Returns a stable per-filesystem identifier used to key the
    /// change-event fan-out's per-filesystem queue.
    fn filesystem_id(&self) -> u64;
}

/// RPC authentication flavor, per RFC 5531 §8.2. Shared by the wire-level
/// [`crate::rpc::OpaqueAuth`] and by [`RpcAuthenticator::supported_flavors`]
/// so the two never drift into incompatible vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlavor {
    None,
    Sys,
    Short,
    Dh,
    RpcSecGss,
}

/// Authenticates RPC credentials and reports which flavors a MOUNT v3
/// response should advertise (`spec.md` §6).
pub trait RpcAuthenticator: Send + Sync {
    fn authenticate(&self, credential: &[u8]) -> Result<(), crate::error::AuthFailureCode>;
    fn supported_flavors(&self) -> &[AuthFlavor];
}

/// An authenticator that accepts everything and advertises `AUTH_NONE`
/// only; useful as a default/test double, not a security boundary.
pub struct PermissiveAuthenticator;

impl RpcAuthenticator for PermissiveAuthenticator {
    fn authenticate(&self, _credential: &[u8]) -> Result<(), crate::error::AuthFailureCode> {
        Ok(())
    }

    fn supported_flavors(&self) -> &[AuthFlavor] {
        &[AuthFlavor::None]
    }
}
