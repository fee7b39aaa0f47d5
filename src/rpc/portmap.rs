//! Portmapper registration (RFC 1833): the four tuples the MOUNT service
//! registers at startup (`spec.md` §4.9: "register four portmap tuples,
//! program = 100005, versions {1,3} × protocols {UDP, TCP}").

use super::{PortmapRegistration, Transport};

pub const MOUNT_PROGRAM: u32 = 100_005;
pub const MOUNT_VERSIONS: [u32; 2] = [1, 3];

/// The registration tuples the MOUNT service advertises at startup.
pub fn mount_registrations(port: u16) -> Vec<PortmapRegistration> {
    let mut registrations = Vec::with_capacity(4);
    for version in MOUNT_VERSIONS {
        for transport in [Transport::Udp, Transport::Tcp] {
            registrations.push(PortmapRegistration { program: MOUNT_PROGRAM, version, transport, port });
        }
    }
    registrations
}

/// In-memory portmap registry; a real deployment would register with the
/// system portmapper (`rpcbind`) over its own RPC interface, which is an
/// out-of-scope host-integration concern (`spec.md` §1) — this registry
/// exists so the MOUNT service's own startup sequence and a test can
/// observe what it *would* have registered.
#[derive(Default)]
pub struct PortmapRegistry {
    entries: std::sync::Mutex<Vec<PortmapRegistration>>,
}

impl PortmapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_all(&self, registrations: &[PortmapRegistration]) {
        self.entries.lock().expect("portmap registry poisoned").extend_from_slice(registrations);
    }

    pub fn snapshot(&self) -> Vec<PortmapRegistration> {
        self.entries.lock().expect("portmap registry poisoned").clone()
    }
}
