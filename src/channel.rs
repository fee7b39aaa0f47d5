//! Channel packet handler: the per-connection wire endpoint sitting between
//! a non-blocking `mio` socket and a [`crate::session::Session`]
//! (`spec.md` §4.3).
//!
//! Grounded in the teacher's `read_task`/`write_task` split (one socket,
//! inbound frames decoded on one side, outbound frames queued on the
//! other), collapsed into a single struct now that the core plane is
//! synchronous and selector-driven rather than task-per-socket.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use mio::net::TcpStream;

use crate::codec::netbios::NetBiosDecoder;
use crate::codec::rpc_record::RpcRecordDecoder;
use crate::codec::{write_all_nonblocking, DecodeOutcome, FrameTag};
use crate::error::Result;
use crate::pool::PacketPool;

/// Which decoder a channel drives, matching the listener it was accepted
/// on (`spec.md` §4.2/§6: one port per framing).
enum Decoder {
    NetBios(NetBiosDecoder),
    Rpc(RpcRecordDecoder),
}

/// A pending outbound frame, already encoded with its wire header.
struct PendingWrite {
    buffer: crate::pool::Buffer,
    written: usize,
}

/// Owns one accepted socket: decodes inbound frames, queues and drains
/// outbound ones. Does not own the `mio::Poll` registration; the request
/// handler registers/deregisters and arms/disarms interest (`spec.md`
/// §4.4).
pub struct Channel {
    socket: TcpStream,
    peer_addr: SocketAddr,
    decoder: Decoder,
    outbound: VecDeque<PendingWrite>,
    extra_headroom: usize,
}

impl Channel {
    pub fn new_netbios(socket: TcpStream, direct: bool, extra_headroom: usize) -> io::Result<Self> {
        let peer_addr = socket.peer_addr()?;
        Ok(Self {
            socket,
            peer_addr,
            decoder: Decoder::NetBios(NetBiosDecoder::new(direct)),
            outbound: VecDeque::new(),
            extra_headroom,
        })
    }

    pub fn new_rpc(socket: TcpStream) -> io::Result<Self> {
        let peer_addr = socket.peer_addr()?;
        Ok(Self {
            socket,
            peer_addr,
            decoder: Decoder::Rpc(RpcRecordDecoder::new()),
            outbound: VecDeque::new(),
            extra_headroom: 0,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    /// Which framing this channel was accepted under.
    pub fn frame_tag(&self) -> FrameTag {
        match &self.decoder {
            Decoder::NetBios(decoder) if decoder.is_direct() => FrameTag::DirectSmb,
            Decoder::NetBios(_) => FrameTag::NetBiosSmb,
            Decoder::Rpc(_) => FrameTag::RpcRecord,
        }
    }

    /// Attempts to decode one frame from the socket. Non-blocking: returns
    /// `Pending` the moment the kernel has no more bytes buffered, and
    /// reflects `WouldBlock` back to callers via [`DecodeOutcome::Pending`]
    /// so they know to keep READ interest armed.
    pub fn receive(&mut self, pool: &PacketPool) -> Result<DecodeOutcome> {
        match &mut self.decoder {
            Decoder::NetBios(decoder) => decoder.decode(&mut self.socket, pool, self.extra_headroom),
            Decoder::Rpc(decoder) => decoder.decode(&mut self.socket, pool),
        }
    }

    /// Enqueues an already wire-encoded frame (see
    /// [`crate::codec::netbios::encode_message`] /
    /// [`crate::codec::rpc_record::encode_record`]) for delivery. The
    /// caller (the request handler) is expected to call [`Self::drain`]
    /// next so a buffer that completes immediately is returned to the
    /// pool rather than just dropped.
    pub fn enqueue(&mut self, buffer: crate::pool::Buffer) {
        self.outbound.push_back(PendingWrite { buffer, written: 0 });
    }

    /// Drains as much of the outbound queue as the socket currently
    /// accepts. Returns `true` once the queue is fully drained (the caller
    /// should then disarm WRITE interest); `false` means WRITE interest
    /// should stay armed.
    pub fn drain(&mut self, mut on_released: impl FnMut(crate::pool::Buffer)) -> Result<bool> {
        while let Some(pending) = self.outbound.front_mut() {
            let data = pending.buffer.as_slice();
            if !write_all_nonblocking(&mut self.socket, data, &mut pending.written)? {
                return Ok(false);
            }
            let finished = self.outbound.pop_front().expect("front just matched");
            on_released(finished.buffer);
        }
        Ok(true)
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn close(&mut self) {
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }
}
