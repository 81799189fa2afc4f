use bytes::{Buf, BufMut, BytesMut};
use drifttrust::crypto::hash::{header_hash, HEADER_HASH_LEN};
use drifttrust::KeyStream;

use crate::error::{DriftStreamError, Result};
use crate::sequence::SeqTuple;

/// Version written into every header. Peers tolerate mismatches.
pub const PROTOCOL_VERSION: u8 = 1;

/// Cleartext `(A, seq, C)` prefix length.
pub const PREFIX_LEN: usize = 12;

/// Fixed header fields after the prefix: length(2) version(1) flags(1)
/// timer base(2) command(1).
pub const FIXED_FIELDS_LEN: usize = 7;

/// Smallest well-formed header: prefix, fixed fields and hash.
pub const MIN_HEADER: usize = PREFIX_LEN + FIXED_FIELDS_LEN + HEADER_HASH_LEN;

/// Largest header a sender may produce.
pub const MAX_HEADER: usize = 128;

/// Segment size floor.
pub const MIN_MSS: usize = 256;

/// Header size of a DATA frame: fixed header plus the connection id.
pub const DATA_HEADER_LEN: usize = MIN_HEADER + 4;

/// Random padding on non-DATA frames is `0..MAX_PADDING` bytes.
pub const MAX_PADDING: usize = 8;

/// At most this many sequence numbers are listed in one ACK.
pub const MAX_ACK_ENTRIES: usize = 3;

/// Terminates the sequence list of an ACK.
pub const ACK_TERMINATOR: u32 = u32::MAX;

/// Command carried in the encrypted header.
///
/// `Crypto` is never encoded in a header: crypto frames carry raw handshake
/// bytes. It keeps value 0 so the numbering matches the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Crypto = 0,
    Data = 1,
    Ack = 2,
    Close = 3,
    StatRequest = 4,
    StatReply = 5,
}

impl TryFrom<u8> for Command {
    type Error = DriftStreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Command::Crypto),
            1 => Ok(Command::Data),
            2 => Ok(Command::Ack),
            3 => Ok(Command::Close),
            4 => Ok(Command::StatRequest),
            5 => Ok(Command::StatReply),
            other => Err(DriftStreamError::UnknownCommand(other)),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Command::Crypto => "CRYPTO",
            Command::Data => "DATA",
            Command::Ack => "ACK",
            Command::Close => "CLOSE",
            Command::StatRequest => "STAT_REQUEST",
            Command::StatReply => "STAT_REPLY",
        };
        f.write_str(s)
    }
}

/// Header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    pub const NONE: Self = Self(0x00);
    pub const LAZY_ACK: Self = Self(0x01);

    pub fn contains(self, flag: HeaderFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }
}

/// Command-specific header fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    /// DATA: connection_id(4); payload follows the header.
    Data { connection_id: i32 },
    /// ACK: seq(4)* terminated by 0xffffffff.
    Ack { out_of_order: Vec<u32> },
    /// CLOSE: connection_id(4)
    Close { connection_id: i32 },
    StatRequest,
    StatReply,
}

impl CommandBody {
    pub fn command(&self) -> Command {
        match self {
            CommandBody::Data { .. } => Command::Data,
            CommandBody::Ack { .. } => Command::Ack,
            CommandBody::Close { .. } => Command::Close,
            CommandBody::StatRequest => Command::StatRequest,
            CommandBody::StatReply => Command::StatReply,
        }
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            CommandBody::Data { connection_id } | CommandBody::Close { connection_id } => {
                buf.put_i32(*connection_id);
            }
            CommandBody::Ack { out_of_order } => {
                for seq in out_of_order.iter().take(MAX_ACK_ENTRIES) {
                    buf.put_u32(*seq);
                }
                buf.put_u32(ACK_TERMINATOR);
            }
            CommandBody::StatRequest | CommandBody::StatReply => {}
        }
    }

    fn decode(command: Command, mut body: &[u8]) -> Result<Self> {
        match command {
            Command::Data | Command::Close => {
                ensure_len(body, 4)?;
                let connection_id = body.get_i32();
                Ok(if command == Command::Data {
                    CommandBody::Data { connection_id }
                } else {
                    CommandBody::Close { connection_id }
                })
            }
            Command::Ack => {
                let mut out_of_order = Vec::new();
                loop {
                    ensure_len(body, 4)?;
                    let seq = body.get_u32();
                    if seq == ACK_TERMINATOR {
                        break;
                    }
                    out_of_order.push(seq);
                }
                Ok(CommandBody::Ack { out_of_order })
            }
            Command::StatRequest => Ok(CommandBody::StatRequest),
            Command::StatReply => Ok(CommandBody::StatReply),
            Command::Crypto => Err(DriftStreamError::UnknownCommand(Command::Crypto as u8)),
        }
    }
}

fn ensure_len(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        Err(DriftStreamError::FrameTooShort {
            expected: need,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Plaintext header values written by the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub flags: HeaderFlags,
    /// Timer base in milliseconds; carried in centiseconds.
    pub timer_base: u32,
    pub body: CommandBody,
}

/// Build an encrypted header for `tuple`.
///
/// ```text
///  0      4      8      12   14  15  16    18  19           len-4   len
/// +------+------+------+----+---+---+-----+---+----+-------+------+------ -
/// |  A   | seq  |  C   |len |ver|flg|timer|cmd|body|padding| hash |payload
/// +------+------+------+----+---+---+-----+---+----+-------+------+------ -
///  cleartext            |<---------- encrypted --------------------->|
/// ```
///
/// The hash is a truncated SHA-1 over `seq` and the plaintext from byte 12
/// up to the hash. Bytes 0, 1, 8 and 9 are overwritten at send time by
/// [`splice_alternate`].
pub fn encode_header(
    tuple: &SeqTuple,
    header: &Header,
    padding: usize,
    cipher: &mut dyn KeyStream,
) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(MAX_HEADER);
    buf.put_u32(tuple.a);
    buf.put_u32(tuple.seq);
    buf.put_u32(tuple.c);
    buf.put_u16(0);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(header.flags.0);
    buf.put_u16((header.timer_base / 10).min(u16::MAX as u32) as u16);
    buf.put_u8(header.body.command() as u8);
    header.body.encode_into(&mut buf);
    buf.put_bytes(0, padding.min(MAX_PADDING - 1));

    let total = buf.len() + HEADER_HASH_LEN;
    if total > MAX_HEADER {
        return Err(DriftStreamError::HeaderTooLarge {
            size: total,
            max: MAX_HEADER,
        });
    }
    buf[PREFIX_LEN..PREFIX_LEN + 2].copy_from_slice(&(total as u16).to_be_bytes());

    let hash = header_hash(&buf[4..8], &buf[PREFIX_LEN..]);
    buf.put_slice(&hash);

    cipher.apply(&mut buf[PREFIX_LEN..]);
    Ok(buf)
}

/// A header decoded from a received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHeader {
    pub version: u8,
    pub flags: HeaderFlags,
    pub timer_base: u32,
    pub body: CommandBody,
    /// Offset of the payload within the frame.
    pub header_len: usize,
}

/// Decrypt and verify the header of `frame` in place.
///
/// Consumes exactly `header_len - 12` keystream bytes whenever the length
/// field fits the frame, so a single bad frame does not desynchronise the
/// stream.
pub fn decode_header(frame: &mut [u8], cipher: &mut dyn KeyStream) -> Result<DecodedHeader> {
    ensure_len(frame, PREFIX_LEN + 2)?;

    cipher.apply(&mut frame[PREFIX_LEN..PREFIX_LEN + 2]);
    let header_len = u16::from_be_bytes([frame[PREFIX_LEN], frame[PREFIX_LEN + 1]]) as usize;
    if header_len > frame.len() {
        return Err(DriftStreamError::FrameTooShort {
            expected: header_len,
            actual: frame.len(),
        });
    }
    if header_len < MIN_HEADER {
        cipher.apply(&mut frame[PREFIX_LEN + 2..header_len.max(PREFIX_LEN + 2)]);
        return Err(DriftStreamError::FrameTooShort {
            expected: MIN_HEADER,
            actual: header_len,
        });
    }

    cipher.apply(&mut frame[PREFIX_LEN + 2..header_len]);

    let hash_at = header_len - HEADER_HASH_LEN;
    let expected = header_hash(&frame[4..8], &frame[PREFIX_LEN..hash_at]);
    if expected[..] != frame[hash_at..header_len] {
        return Err(DriftStreamError::HashMismatch);
    }

    let mut fields = &frame[PREFIX_LEN + 2..hash_at];
    let version = fields.get_u8();
    let flags = HeaderFlags(fields.get_u8());
    let timer_base = fields.get_u16() as u32 * 10;
    let command = Command::try_from(fields.get_u8())?;
    let body = CommandBody::decode(command, fields)?;

    Ok(DecodedHeader {
        version,
        flags,
        timer_base,
        body,
        header_len,
    })
}

/// Overwrite bytes 0, 1, 8 and 9 with `alt` (big-endian).
pub fn splice_alternate(frame: &mut [u8], alt: u32) {
    let b = alt.to_be_bytes();
    frame[0] = b[0];
    frame[1] = b[1];
    frame[8] = b[2];
    frame[9] = b[3];
}

/// Read the alternate echoed in bytes 0, 1, 8 and 9.
pub fn read_alternate(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[0], frame[1], frame[8], frame[9]])
}

/// Read the real sequence number in bytes 4..8.
pub fn read_sequence(frame: &[u8]) -> u32 {
    u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]])
}

/// Whether the cleartext prefix carries the reserved bit pattern of a
/// framed datagram (as opposed to the legacy protocol sharing the port).
pub fn has_reserved_prefix(datagram: &[u8]) -> bool {
    use crate::sequence::RESERVED_MASK;
    if datagram.len() < PREFIX_LEN {
        return false;
    }
    let a = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
    let c = u32::from_be_bytes([datagram[8], datagram[9], datagram[10], datagram[11]]);
    a & RESERVED_MASK != 0 && c & RESERVED_MASK != 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use drifttrust::Rc4;

    fn tuple() -> SeqTuple {
        SeqTuple {
            a: 0xAAAA_0001,
            seq: 0x1234_5678,
            c: 0xCCCC_0002,
            alt: 0x0101_0202,
        }
    }

    fn ciphers() -> (Rc4, Rc4) {
        (Rc4::new(b"frame key for a test").unwrap(), Rc4::new(b"frame key for a test").unwrap())
    }

    #[test]
    fn command_try_from() {
        assert_eq!(Command::try_from(1).unwrap(), Command::Data);
        assert_eq!(Command::try_from(5).unwrap(), Command::StatReply);
        assert!(matches!(
            Command::try_from(9),
            Err(DriftStreamError::UnknownCommand(9))
        ));
    }

    #[test]
    fn data_header_size() {
        let (mut enc, _) = ciphers();
        let header = Header {
            flags: HeaderFlags::NONE,
            timer_base: 300,
            body: CommandBody::Data { connection_id: 7 },
        };
        let buf = encode_header(&tuple(), &header, 0, &mut enc).unwrap();
        assert_eq!(buf.len(), DATA_HEADER_LEN);
    }

    #[test]
    fn header_decodes_with_payload_attached() {
        let (mut enc, mut dec) = ciphers();
        let header = Header {
            flags: HeaderFlags::NONE,
            timer_base: 1230,
            body: CommandBody::Data { connection_id: 42 },
        };
        let mut frame = encode_header(&tuple(), &header, 0, &mut enc).unwrap();
        frame.put_slice(b"payload");

        let decoded = decode_header(&mut frame, &mut dec).unwrap();
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.timer_base, 1230);
        assert_eq!(decoded.body, CommandBody::Data { connection_id: 42 });
        assert_eq!(&frame[decoded.header_len..], b"payload");
    }

    #[test]
    fn ack_list_is_capped_and_terminated() {
        let (mut enc, mut dec) = ciphers();
        let header = Header {
            flags: HeaderFlags::LAZY_ACK,
            timer_base: 300,
            body: CommandBody::Ack {
                out_of_order: vec![1, 2, 3, 4],
            },
        };
        let mut frame = encode_header(&tuple(), &header, 5, &mut enc).unwrap();
        let decoded = decode_header(&mut frame, &mut dec).unwrap();
        assert!(decoded.flags.contains(HeaderFlags::LAZY_ACK));
        assert_eq!(
            decoded.body,
            CommandBody::Ack {
                out_of_order: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn tampered_header_fails_hash() {
        let (mut enc, mut dec) = ciphers();
        let header = Header {
            flags: HeaderFlags::NONE,
            timer_base: 300,
            body: CommandBody::Close { connection_id: 3 },
        };
        let mut frame = encode_header(&tuple(), &header, 2, &mut enc).unwrap();
        let last = frame.len() - 6;
        frame[last] ^= 0x40;
        assert!(matches!(
            decode_header(&mut frame, &mut dec),
            Err(DriftStreamError::HashMismatch)
        ));
    }

    #[test]
    fn keystreams_stay_aligned_after_hash_failure() {
        let (mut enc, mut dec) = ciphers();
        let header = Header {
            flags: HeaderFlags::NONE,
            timer_base: 300,
            body: CommandBody::StatRequest,
        };
        let mut bad = encode_header(&tuple(), &header, 3, &mut enc).unwrap();
        let mut good = encode_header(&tuple(), &header, 1, &mut enc).unwrap();
        let n = bad.len() - 1;
        bad[n] ^= 0xff;

        assert!(decode_header(&mut bad, &mut dec).is_err());
        assert_eq!(decode_header(&mut good, &mut dec).unwrap().body, CommandBody::StatRequest);
    }

    #[test]
    fn alternate_splice() {
        let mut frame = vec![0u8; 16];
        splice_alternate(&mut frame, 0xDEAD_BEEF);
        assert_eq!(read_alternate(&frame), 0xDEAD_BEEF);
        assert_eq!(&frame[2..8], &[0u8; 6]);
    }

    #[test]
    fn reserved_prefix_detection() {
        let mut frame = vec![0u8; 12];
        assert!(!has_reserved_prefix(&frame));
        frame[0] = 0x80;
        frame[8] = 0x01;
        assert!(has_reserved_prefix(&frame));
        assert!(!has_reserved_prefix(&frame[..8]));
    }

    #[test]
    fn largest_ack_header_fits() {
        let (mut enc, _) = ciphers();
        let header = Header {
            flags: HeaderFlags::NONE,
            timer_base: 300,
            body: CommandBody::Ack {
                out_of_order: vec![9; 3],
            },
        };
        // ACK bodies are capped, so the maximum header still fits.
        assert!(encode_header(&tuple(), &header, MAX_PADDING, &mut enc).unwrap().len() <= MAX_HEADER);
    }
}
