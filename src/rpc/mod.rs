//! ONC-RPC (RFC 5531) wire types and the MOUNT protocol exemplar
//! (`spec.md` §4.9, §6).
//!
//! Grounded in the teacher's `src/rpc.rs` scaffolding for the message
//! shapes (`rpc_msg`, `call_body`, `opaque_auth`, `auth_flavor`,
//! `accept_stat`/`auth_stat`), filled in here as plain structs/enums
//! instead of the teacher's unimplemented stubs.

pub mod mount;
pub mod portmap;

use crate::error::{AuthFailureCode, Error, Result};
use crate::external::AuthFlavor;

pub const RPC_VERSION: u32 = 2;

/// RFC 5531 §7.4.3 acceptance status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

/// RFC 5531 §7.4.4 authentication status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStat {
    Ok,
    BadCred,
    RejectedCred,
    BadVerf,
    RejectedVerf,
    TooWeak,
    InvalidResp,
    Failed,
}

impl From<AuthFailureCode> for AuthStat {
    fn from(code: AuthFailureCode) -> Self {
        match code {
            AuthFailureCode::BadCredential => AuthStat::BadCred,
            AuthFailureCode::RejectedCredential => AuthStat::RejectedCred,
            AuthFailureCode::BadVerifier => AuthStat::BadVerf,
            AuthFailureCode::RejectedVerifier => AuthStat::RejectedVerf,
            AuthFailureCode::TooWeak => AuthStat::TooWeak,
            AuthFailureCode::InvalidResponse => AuthStat::InvalidResp,
            AuthFailureCode::Failed => AuthStat::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpaqueAuth {
    pub flavor: AuthFlavor,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    pub const NONE: OpaqueAuth = OpaqueAuth { flavor: AuthFlavor::None, body: Vec::new() };
}

/// An RPC call header: program/version/procedure identification plus
/// credentials (`spec.md` §4.9 "On each RPC request: validate program and
/// version... authenticate").
#[derive(Debug, Clone)]
pub struct CallBody {
    pub rpc_version: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub credential: OpaqueAuth,
    pub verifier: OpaqueAuth,
}

/// Which transport a call arrived over, governing the "release associated
/// packet on TCP only" contract (`SPEC_FULL.md` §9 Open Question 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// One (program, version) × (UDP, TCP) registration tuple as recorded
/// with the portmapper (`spec.md` §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortmapRegistration {
    pub program: u32,
    pub version: u32,
    pub transport: Transport,
    pub port: u16,
}

/// Validates `call` against a service's supported program number and
/// version range, the first step of "On each RPC request" (`spec.md`
/// §4.9).
pub fn validate_program_and_version(call: &CallBody, program: u32, versions: &[u32]) -> Result<()> {
    if call.program != program {
        return Err(Error::ProgramUnavailable);
    }
    let lo = *versions.iter().min().expect("at least one supported version");
    let hi = *versions.iter().max().expect("at least one supported version");
    if !versions.contains(&call.version) {
        return Err(Error::VersionMismatch { lo, hi });
    }
    Ok(())
}
