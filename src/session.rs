//! Per-client session state (`spec.md` §4.6).
//!
//! Grounded in the teacher's `message_types.rs` channel-wrapper pattern
//! (a typed `Sender`/`Receiver` pair per direction) for the async-response
//! queue shape, reworked onto `crossbeam_queue::SegQueue` — already part
//! of the teacher's stack — instead of a tokio `mpsc` channel now that the
//! core plane is synchronous.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crossbeam_queue::SegQueue;

use crate::channel::Channel;
use crate::codec::FrameTag;
use crate::error::Result;
use crate::pool::{Buffer, PacketPool};

/// Which wire protocol a session was accepted under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    NetBiosSmb,
    DirectSmb,
    Rpc,
}

impl From<FrameTag> for ProtocolKind {
    fn from(tag: FrameTag) -> Self {
        match tag {
            FrameTag::NetBiosSmb => ProtocolKind::NetBiosSmb,
            FrameTag::DirectSmb => ProtocolKind::DirectSmb,
            FrameTag::RpcRecord => ProtocolKind::Rpc,
        }
    }
}

/// Per-client state: id, last-I/O time, remote address, packet handler,
/// an opaque protocol-specific state machine, and an async-response FIFO
/// (`spec.md` §4.6, §GLOSSARY "Session").
///
/// The inner state machine is opaque to the core (`spec.md` §1: SMB
/// dialect/NFSv3 semantics are external collaborators); it is stored as
/// `Box<dyn Any + Send>` so a protocol dispatcher can stash and downcast
/// its own continuation state between frames without the core plane
/// knowing its shape.
pub struct Session {
    id: u64,
    remote_addr: SocketAddr,
    protocol: ProtocolKind,
    last_io_time_ms: AtomicU64,
    channel: Mutex<Channel>,
    dispatcher_state: Mutex<Box<dyn Any + Send>>,
    async_responses: SegQueue<Buffer>,
    closed: AtomicBool,
    in_flight: AtomicBool,
}

impl Session {
    pub fn new(id: u64, channel: Channel, now_ms: u64) -> Self {
        let remote_addr = channel.peer_addr();
        let protocol = channel.frame_tag().into();
        Self {
            id,
            remote_addr,
            protocol,
            last_io_time_ms: AtomicU64::new(now_ms),
            channel: Mutex::new(channel),
            dispatcher_state: Mutex::new(Box::new(())),
            async_responses: SegQueue::new(),
            closed: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn last_io_time_ms(&self) -> u64 {
        self.last_io_time_ms.load(Ordering::Relaxed)
    }

    pub fn touch(&self, now_ms: u64) {
        self.last_io_time_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn is_idle_since(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_io_time_ms()) > timeout_ms
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks whether a read-and-dispatch task for this session is
    /// currently running on the thread pool; the idle reaper must not
    /// close a session out from under its own in-flight task
    /// (`spec.md` §4.4 "at most one task per session is in flight").
    pub fn set_in_flight(&self, in_flight: bool) {
        self.in_flight.store(in_flight, Ordering::Release);
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn channel(&self) -> std::sync::MutexGuard<'_, Channel> {
        self.channel.lock().expect("session channel poisoned")
    }

    /// Replaces the opaque per-session protocol state. Called by the
    /// protocol dispatcher between frames.
    pub fn set_dispatcher_state(&self, state: Box<dyn Any + Send>) {
        *self.dispatcher_state.lock().expect("dispatcher state poisoned") = state;
    }

    pub fn with_dispatcher_state<R>(&self, f: impl FnOnce(&mut Box<dyn Any + Send>) -> R) -> R {
        let mut guard = self.dispatcher_state.lock().expect("dispatcher state poisoned");
        f(&mut guard)
    }

    /// Enqueues a response buffer for out-of-band delivery (change
    /// notifications, oplock breaks). Safe to call from any thread
    /// (`spec.md` §4.6).
    pub fn queue_async_response(&self, buffer: Buffer) {
        self.async_responses.push(buffer);
    }

    pub fn has_queued_async_responses(&self) -> bool {
        !self.async_responses.is_empty()
    }

    /// Drains the async-response FIFO through the channel. Safe to call
    /// concurrently with [`Self::queue_async_response`] from another
    /// thread; not safe to call concurrently with itself (the request
    /// handler serializes per-session task execution, so this is only
    /// ever invoked by the single in-flight task for this session).
    pub fn send_queued_async_responses(&self, pool: &PacketPool) -> Result<()> {
        let mut channel = self.channel();
        while let Some(buffer) = self.async_responses.pop() {
            channel.enqueue(buffer);
        }
        channel.drain(|buffer| pool.release(buffer))?;
        Ok(())
    }

    /// Idempotent: the first call tears down the channel and marks the
    /// session closed; subsequent calls are no-ops (`spec.md` §4.6, §8
    /// invariant "close_session is idempotent").
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.channel().close();
    }
}
