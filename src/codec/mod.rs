//! Framed-stream codec: NetBIOS-framed SMB, Direct-TCP SMB, and ONC-RPC
//! record marking share one design (`spec.md` §4.2, §6).
//!
//! Grounded in the teacher's `parser::rpc`/`serializer::rpc` XDR helpers for
//! the big-endian primitive encoding, and in the record-marking walkthrough
//! in `7671f615_Vaiz-nfs3__crates-nfs3_server-src-rpcwire.rs.rs` (read one
//! 4-byte fragment header, accumulate until the last-fragment bit).

pub mod netbios;
pub mod rpc_record;

use std::io::{self, Read, Write};

use crate::error::{Error, Result};
use crate::pool::Buffer;

/// Which wire framing produced/consumes a [`FramedMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    NetBiosSmb,
    DirectSmb,
    RpcRecord,
}

/// A fully reassembled frame: a NetBIOS MESSAGE, a Direct-TCP SMB message,
/// or a concatenated ONC-RPC record.
#[derive(Debug)]
pub struct FramedMessage {
    pub tag: FrameTag,
    pub buffer: Buffer,
}

/// Outcome of one [`Read`]-driven decode attempt.
///
/// A decoder is resumable: on [`DecodeOutcome::Pending`] its internal state
/// has absorbed whatever bytes were available, and the caller should retry
/// once the selector reports readability again.
pub enum DecodeOutcome {
    /// Not enough bytes were available yet; internal state was retained.
    /// `progressed` is true iff this call actually read at least one byte
    /// off the socket, as opposed to hitting `WouldBlock` immediately
    /// (e.g. woken only by the channel becoming writable) — callers use it
    /// to decide whether to touch the session's last-I/O time.
    Pending { progressed: bool },
    /// A frame carrying no payload (NetBIOS KEEPALIVE).
    KeepAlive,
    /// A fully reassembled frame.
    Message(FramedMessage),
}

/// Reads into `buf[*filled..]`, advancing `*filled`.
///
/// Returns `Ok(true)` once `buf` is completely filled, `Ok(false)` if the
/// read would block having made (possibly zero) progress, and
/// `Err(Error::PeerClosed)` on an orderly close or negative read.
pub(crate) fn fill_nonblocking(
    reader: &mut impl Read,
    buf: &mut [u8],
    filled: &mut usize,
) -> Result<bool> {
    while *filled < buf.len() {
        match reader.read(&mut buf[*filled..]) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => *filled += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(true)
}

/// Writes the whole of `data`, retrying on short writes and on would-block.
///
/// `would_block` is polled in a tight loop only when the OS truly has no
/// buffer space; callers drive this from a non-blocking socket that has
/// already been reported writable by the selector; a persistent
/// `WouldBlock` beyond that point indicates the caller should re-arm WRITE
/// interest and retry later, so this function surfaces that by returning
/// `Ok(false)` without erroring, matching [`fill_nonblocking`]'s contract.
pub(crate) fn write_all_nonblocking(
    writer: &mut impl Write,
    data: &[u8],
    written: &mut usize,
) -> Result<bool> {
    while *written < data.len() {
        match writer.write(&data[*written..]) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => *written += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from(e)),
        }
    }
    Ok(true)
}
