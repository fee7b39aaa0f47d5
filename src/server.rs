//! Server wiring: binds listeners, owns the shared packet pool and thread
//! pool, and runs the connections handler until shutdown
//! (`SPEC_FULL.md` §4.10).
//!
//! Grounded in the teacher's `lib.rs::handle_forever`, which is where the
//! teacher wires its listener/task-spawn loop together; this module is
//! its synchronous, `mio`/`rayon`-based counterpart.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::connections_handler::{ConnectionsHandler, ListenerKind};
use crate::external::ProtocolDispatcher;
use crate::pool::PacketPool;

/// Owns the packet pool, the connections handler, and the shared
/// work-stealing thread pool every request handler submits tasks to
/// (`SPEC_FULL.md` §4.10).
pub struct Server {
    config: Arc<ServerConfig>,
    pool: Arc<PacketPool>,
    connections: Arc<ConnectionsHandler>,
    shutdown_requested: Arc<AtomicBool>,
}

impl Server {
    /// Builds the server context from `config` and `dispatcher` (the
    /// external SMB/NFS protocol dispatcher). Binds the NetBIOS-SMB,
    /// Direct-TCP-SMB, and MOUNT-over-TCP listeners; binding the
    /// portmapper/UDP side of MOUNT is the RPC service's own concern
    /// (`src/rpc/mount.rs`), since those are connectionless and do not
    /// multiplex through the session/request-handler plane.
    pub fn new(config: ServerConfig, dispatcher: Arc<dyn ProtocolDispatcher>) -> std::io::Result<Self> {
        let config = Arc::new(config);
        let pool = Arc::new(PacketPool::new(&config));
        let thread_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(config.thread_pool_size)
                .thread_name(|i| format!("wirefiled-worker-{i}"))
                .build()
                .map_err(|err| std::io::Error::other(err.to_string()))?,
        );

        let connections =
            Arc::new(ConnectionsHandler::new(Arc::clone(&config), Arc::clone(&pool), thread_pool, dispatcher)?);

        connections.bind(
            SocketAddr::from(([0, 0, 0, 0], config.netbios_smb_port)),
            ListenerKind::NetBiosSmb,
        )?;
        connections.bind(SocketAddr::from(([0, 0, 0, 0], config.direct_smb_port)), ListenerKind::DirectSmb)?;
        connections.bind(SocketAddr::from(([0, 0, 0, 0], config.mount_port)), ListenerKind::Rpc)?;

        Ok(Self { config, pool, connections, shutdown_requested: Arc::new(AtomicBool::new(false)) })
    }

    pub fn pool(&self) -> &Arc<PacketPool> {
        &self.pool
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// The local address a listener is bound to; useful to discover an
    /// OS-assigned ephemeral port when a test binds to port 0.
    pub fn local_addr(&self, kind: ListenerKind) -> Option<SocketAddr> {
        self.connections.local_addr(kind)
    }

    /// A flag the caller can flip from a signal handler (installing one
    /// is the out-of-scope CLI concern, `spec.md` §1) to request shutdown.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_requested)
    }

    /// Starts the connections handler's accept loop and idle-reaper
    /// thread, then blocks the calling thread until
    /// [`Self::shutdown_flag`] is set, at which point every component is
    /// torn down in dependency order: reaper, request handlers,
    /// connections handler (`SPEC_FULL.md` §4.10).
    pub fn run(&self) -> std::io::Result<()> {
        let reaper_join = self.connections.spawn_idle_reaper();

        let connections = Arc::clone(&self.connections);
        let accept_join = std::thread::spawn(move || connections.run());

        while !self.shutdown_requested.load(Ordering::Acquire) {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }

        self.connections.shutdown();
        let _ = accept_join.join();
        let _ = reaper_join.join();

        tracing::info!(
            out_of_pooled_memory = self.pool.out_of_pooled_memory_count(),
            "server shut down"
        );
        Ok(())
    }
}
