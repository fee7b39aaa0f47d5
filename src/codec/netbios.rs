//! NetBIOS session-service framing (port 139) and Direct-TCP SMB framing
//! (port 445); both share the same 4-byte header shape (`spec.md` §4.2,
//! §6).
//!
//! ```text
//! byte 0: message type (NetBIOS only; Direct-TCP frames are always MESSAGE)
//! byte 1: flags, bit 0 = length bit 16 (17-bit length extension)
//! bytes 2-3: length bits 15-0, big-endian
//! ```
//!
//! The header is left at the front of the decoded buffer so the SMB parser
//! sees stable offsets regardless of framing.

use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::codec::{fill_nonblocking, DecodeOutcome, FrameTag, FramedMessage};
use crate::error::{Error, Result};
use crate::pool::PacketPool;

const HEADER_LEN: usize = 4;
const NETBIOS_MESSAGE: u8 = 0x00;
const NETBIOS_KEEPALIVE: u8 = 0x85;

enum State {
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { buffer: crate::pool::Buffer, filled: usize, total: usize },
}

/// Decodes one NetBIOS-framed or Direct-TCP framed stream.
///
/// `direct` selects Direct-TCP semantics (message-type byte must be zero,
/// no KEEPALIVE frames); the two share this type because the only
/// difference is that one byte's interpretation (`spec.md` §4.2).
pub struct NetBiosDecoder {
    direct: bool,
    state: State,
}

impl NetBiosDecoder {
    pub fn new(direct: bool) -> Self {
        Self { direct, state: State::Header { buf: [0; HEADER_LEN], filled: 0 } }
    }

    fn tag(&self) -> FrameTag {
        if self.direct {
            FrameTag::DirectSmb
        } else {
            FrameTag::NetBiosSmb
        }
    }

    pub fn is_direct(&self) -> bool {
        self.direct
    }

    pub fn decode(
        &mut self,
        reader: &mut impl Read,
        pool: &PacketPool,
        extra_headroom: usize,
    ) -> Result<DecodeOutcome> {
        loop {
            match &mut self.state {
                State::Header { buf, filled } => {
                    let before = *filled;
                    if !fill_nonblocking(reader, buf, filled)? {
                        return Ok(DecodeOutcome::Pending { progressed: *filled > before });
                    }
                    let header = *buf;
                    self.state = State::Header { buf: [0; HEADER_LEN], filled: 0 };

                    let type_byte = header[0];
                    let flags = header[1];
                    let low16 = (&header[2..4])
                        .read_u16::<BigEndian>()
                        .expect("exactly 2 bytes available");
                    let length = ((flags & 0x01) as usize) << 16 | low16 as usize;

                    if self.direct {
                        if type_byte != NETBIOS_MESSAGE {
                            return Err(Error::FramingError(format!(
                                "direct-tcp smb frame carried non-zero type byte {type_byte:#x}"
                            )));
                        }
                    } else if type_byte == NETBIOS_KEEPALIVE {
                        return Ok(DecodeOutcome::KeepAlive);
                    } else if type_byte != NETBIOS_MESSAGE {
                        return Err(Error::FramingError(format!(
                            "unrecognized netbios message type {type_byte:#x}"
                        )));
                    }

                    let total = HEADER_LEN + length;
                    if total + extra_headroom > pool.max_over_sized() {
                        return Err(Error::FragmentTooLarge { accumulated: total, max: pool.max_over_sized() });
                    }

                    let mut buffer = pool.allocate(total + extra_headroom)?;
                    buffer.set_len(total);
                    buffer.full_mut()[..HEADER_LEN].copy_from_slice(&header);
                    self.state = State::Payload { buffer, filled: HEADER_LEN, total };
                }
                State::Payload { buffer, filled, total } => {
                    let total = *total;
                    let before = *filled;
                    if !fill_nonblocking(reader, &mut buffer.full_mut()[..total], filled)? {
                        return Ok(DecodeOutcome::Pending { progressed: *filled > before });
                    }
                    let State::Payload { buffer, .. } =
                        std::mem::replace(&mut self.state, State::Header { buf: [0; HEADER_LEN], filled: 0 })
                    else {
                        unreachable!()
                    };
                    return Ok(DecodeOutcome::Message(FramedMessage { tag: self.tag(), buffer }));
                }
            }
        }
    }
}

/// Encodes `payload` as a NetBIOS/Direct-TCP MESSAGE frame into a
/// freshly-leased buffer (header followed by payload).
pub fn encode_message(pool: &PacketPool, payload: &[u8]) -> Result<crate::pool::Buffer> {
    if payload.len() > 0x1_ffff {
        return Err(Error::FramingError(format!(
            "payload of {} bytes exceeds the 17-bit netbios length field",
            payload.len()
        )));
    }
    let total = HEADER_LEN + payload.len();
    let mut buffer = pool.allocate(total)?;
    buffer.set_len(total);
    let len_bit16 = ((payload.len() >> 16) & 0x01) as u8;
    let out = buffer.full_mut();
    out[0] = NETBIOS_MESSAGE;
    out[1] = len_bit16;
    (&mut out[2..HEADER_LEN])
        .write_u16::<BigEndian>(payload.len() as u16)
        .expect("exactly 2 bytes available");
    out[HEADER_LEN..total].copy_from_slice(payload);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::io::Cursor;

    fn pool() -> PacketPool {
        PacketPool::new(&ServerConfig::default())
    }

    #[test]
    fn decodes_message_with_header_preserved_at_front() {
        let pool = pool();
        let mut wire = vec![0x00, 0x00, 0x00, 0x03];
        wire.extend_from_slice(b"abc");
        let mut cursor = Cursor::new(wire);

        let mut decoder = NetBiosDecoder::new(false);
        let outcome = decoder.decode(&mut cursor, &pool, 0).unwrap();
        let DecodeOutcome::Message(msg) = outcome else { panic!("expected message") };
        assert_eq!(msg.buffer.as_slice(), &[0x00, 0x00, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn keepalive_carries_no_payload() {
        let pool = pool();
        let mut cursor = Cursor::new(vec![0x85, 0x00, 0x00, 0x00]);
        let mut decoder = NetBiosDecoder::new(false);
        assert!(matches!(decoder.decode(&mut cursor, &pool, 0).unwrap(), DecodeOutcome::KeepAlive));
    }

    #[test]
    fn direct_tcp_rejects_nonzero_type_byte() {
        let pool = pool();
        let mut cursor = Cursor::new(vec![0x85, 0x00, 0x00, 0x00]);
        let mut decoder = NetBiosDecoder::new(true);
        assert!(decoder.decode(&mut cursor, &pool, 0).is_err());
    }

    #[test]
    fn seventeen_bit_length_extension_boundary() {
        // 0x1_0000 bytes needs the length-bit-16 flag set.
        let pool = pool();
        let payload = vec![7u8; 0x1_0000];
        let mut wire = vec![0x00, 0x01, 0x00, 0x00];
        wire.extend_from_slice(&payload);
        let mut cursor = Cursor::new(wire);

        let mut decoder = NetBiosDecoder::new(false);
        let outcome = decoder.decode(&mut cursor, &pool, 0).unwrap();
        let DecodeOutcome::Message(msg) = outcome else { panic!("expected message") };
        assert_eq!(msg.buffer.len(), 4 + 0x1_0000);
    }

    #[test]
    fn resumes_across_partial_reads() {
        let pool = pool();
        let mut wire = vec![0x00, 0x00, 0x00, 0x05];
        wire.extend_from_slice(b"hello");

        let mut decoder = NetBiosDecoder::new(false);
        // Feed the stream one byte at a time via a cursor that is re-sliced;
        // a real non-blocking socket behaves the same way.
        for split in 1..wire.len() {
            let (first, _) = wire.split_at(split);
            let mut cursor = Cursor::new(first.to_vec());
            let mut probe = NetBiosDecoder::new(false);
            let outcome = probe.decode(&mut cursor, &pool, 0).unwrap();
            assert!(matches!(outcome, DecodeOutcome::Pending { .. }));
        }

        let mut full = Cursor::new(wire);
        let outcome = decoder.decode(&mut full, &pool, 0).unwrap();
        assert!(matches!(outcome, DecodeOutcome::Message(_)));
    }

    #[test]
    fn oversize_frame_rejected_before_pool_allocation() {
        // S2: the length field alone must be enough to reject the frame;
        // the pool's exhaustion counter must stay untouched.
        let mut config = ServerConfig::default();
        config.max_over_sized = 16;
        let pool = PacketPool::new(&config);
        let before = pool.out_of_pooled_memory_count();

        let mut wire = vec![0x00, 0x00, 0x00, 0x20]; // length 32 > max_over_sized 16
        wire.extend_from_slice(&[0u8; 32]);
        let mut cursor = Cursor::new(wire);
        let mut decoder = NetBiosDecoder::new(false);

        let err = decoder.decode(&mut cursor, &pool, 0).unwrap_err();
        assert!(matches!(err, Error::FragmentTooLarge { .. }));
        assert_eq!(pool.out_of_pooled_memory_count(), before);
    }

    #[test]
    fn encode_then_decode_round_trip() {
        let pool = pool();
        let encoded = encode_message(&pool, b"round-trip").unwrap();
        let mut cursor = Cursor::new(encoded.as_slice().to_vec());
        let mut decoder = NetBiosDecoder::new(false);
        let outcome = decoder.decode(&mut cursor, &pool, 0).unwrap();
        let DecodeOutcome::Message(msg) = outcome else { panic!("expected message") };
        assert_eq!(&msg.buffer.as_slice()[4..], b"round-trip");
    }
}
