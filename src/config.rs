//! Server configuration.
//!
//! Loading this from TOML/XML/CLI is the out-of-scope "configuration
//! loading" collaborator (`spec.md` §1); this module only defines the
//! shape and sane defaults, in the teacher's `serde` style.

use serde::{Deserialize, Serialize};

/// Maximum sessions multiplexed onto one request handler's selector before
/// a new handler is allocated (`spec.md` §4.4, default 50).
pub const DEFAULT_K_SESSIONS_PER_HANDLER: usize = 50;

/// Frames read and dispatched per per-session task invocation (`spec.md`
/// §4.4, default 4).
pub const DEFAULT_P_FRAMES_PER_TASK: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum sessions per request handler (`K` in §4.4).
    pub k_sessions_per_handler: usize,
    /// Frames read per per-session task (`P` in §4.4).
    pub p_frames_per_task: usize,
    /// Sessions idle longer than this are closed by the reaper.
    pub client_socket_timeout_ms: u64,
    /// How often the idle-reaper ticker fires.
    pub idle_reaper_interval_ms: u64,
    /// Packet pool tier capacities, ascending.
    pub pool_tiers: Vec<usize>,
    /// Buffers pre-allocated per tier.
    pub pool_buffers_per_tier: usize,
    /// Ceiling for over-sized (non-tiered) allocations.
    pub max_over_sized: usize,
    /// Extra headroom reserved on SMB receive buffers for future
    /// signing/sealing overhead (`spec.md` §4.3).
    pub smb_encryption_overhead: usize,
    /// TCP port for the NetBIOS-framed SMB listener.
    pub netbios_smb_port: u16,
    /// TCP port for the Direct-TCP SMB listener (445 by convention).
    pub direct_smb_port: u16,
    /// UDP/TCP port for the MOUNT service.
    pub mount_port: u16,
    /// UDP/TCP port for the portmapper.
    pub portmap_port: u16,
    /// Worker threads in the shared request-handling thread pool.
    pub thread_pool_size: usize,
    /// Minimum ready-key batch size before a mid-loop flush to the pool
    /// (`spec.md` §4.4 step 3: "in groups of ≥ 5").
    pub min_flush_batch: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            k_sessions_per_handler: DEFAULT_K_SESSIONS_PER_HANDLER,
            p_frames_per_task: DEFAULT_P_FRAMES_PER_TASK,
            client_socket_timeout_ms: 15 * 60 * 1000,
            idle_reaper_interval_ms: 10_000,
            pool_tiers: vec![4 * 1024, 16 * 1024, 64 * 1024, 128 * 1024],
            pool_buffers_per_tier: 64,
            max_over_sized: 256 * 1024,
            smb_encryption_overhead: 256,
            netbios_smb_port: 139,
            direct_smb_port: 445,
            mount_port: 645,
            portmap_port: 111,
            thread_pool_size: 8,
            min_flush_batch: 5,
        }
    }
}
