/*! Low-level packet access.

Only as much of the wire format as the driver needs: Ethernet addresses
for ARP manipulation, and the fixed TCP header for crafting segments and
classifying captures. Options and payload are carried opaquely.
*/

use core::{fmt, ops};

use bitflags::bitflags;
use byteorder::{ByteOrder, NetworkEndian};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2<sup>32</sup>.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub struct SeqNumber(pub u32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ops::Add<u32> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: u32) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs))
    }
}

impl ops::AddAssign<u32> for SeqNumber {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl SeqNumber {
    /// Whether `self` is at or after `other` in sequence space.
    pub fn covers(self, other: SeqNumber) -> bool {
        (self.0.wrapping_sub(other.0) as i32) >= 0
    }
}

/// A six-octet Ethernet II address.
#[derive(Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default)]
pub struct EthernetAddress(pub [u8; 6]);

impl EthernetAddress {
    /// Return an Ethernet address as a sequence of octets, in big-endian.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Query whether the "locally administered" bit is set.
    ///
    /// Alien addresses used to black-hole traffic are normally local.
    pub fn is_local(&self) -> bool {
        self.0[0] & 0x02 != 0
    }
}

impl fmt::Display for EthernetAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
        )
    }
}

bitflags! {
    /// The flags byte of a TCP header.
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(TcpFlags, &str); 8] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::CWR, "CWR"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "-")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Error returned when a buffer is too short for a TCP header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Truncated;

impl fmt::Display for Truncated {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "truncated TCP header")
    }
}

impl std::error::Error for Truncated {}

mod field {
    use core::ops::Range;

    pub const SRC_PORT: Range<usize> = 0..2;
    pub const DST_PORT: Range<usize> = 2..4;
    pub const SEQ_NUM: Range<usize> = 4..8;
    pub const ACK_NUM: Range<usize> = 8..12;
    pub const FLAGS: Range<usize> = 12..14;
    pub const WIN_SIZE: Range<usize> = 14..16;
    pub const URGENT: Range<usize> = 18..20;
}

/// Length of a TCP header without options.
pub const HEADER_LEN: usize = field::URGENT.end;

/// A read-only wrapper around a TCP header buffer.
#[derive(Debug)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    /// Wrap a buffer with a TCP packet. Returns an error if the buffer
    /// is too small to contain one.
    pub fn new_checked(buffer: T) -> Result<Packet<T>, Truncated> {
        if buffer.as_ref().len() < HEADER_LEN {
            Err(Truncated)
        } else {
            Ok(Packet { buffer })
        }
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    #[inline]
    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    #[inline]
    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_u32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    /// The low eight control bits. `NS` and the data offset are dropped.
    #[inline]
    pub fn flags(&self) -> TcpFlags {
        let raw = NetworkEndian::read_u16(&self.buffer.as_ref()[field::FLAGS]);
        TcpFlags::from_bits_truncate((raw & 0xff) as u8)
    }

    #[inline]
    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WIN_SIZE])
    }
}

/// A high-level representation of a TCP header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Segment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: SeqNumber,
    pub ack_number: SeqNumber,
    pub flags: TcpFlags,
    pub window_len: u16,
}

impl Segment {
    pub fn parse<T: AsRef<[u8]>>(packet: &Packet<T>) -> Segment {
        Segment {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            seq_number: packet.seq_number(),
            ack_number: packet.ack_number(),
            flags: packet.flags(),
            window_len: packet.window_len(),
        }
    }

    /// Emit a header with data offset 5, no options and a zero checksum.
    pub fn emit(&self) -> [u8; HEADER_LEN] {
        let mut buffer = [0u8; HEADER_LEN];
        NetworkEndian::write_u16(&mut buffer[field::SRC_PORT], self.src_port);
        NetworkEndian::write_u16(&mut buffer[field::DST_PORT], self.dst_port);
        NetworkEndian::write_u32(&mut buffer[field::SEQ_NUM], self.seq_number.0);
        NetworkEndian::write_u32(&mut buffer[field::ACK_NUM], self.ack_number.0);
        let raw = (5u16 << 12) | self.flags.bits() as u16;
        NetworkEndian::write_u16(&mut buffer[field::FLAGS], raw);
        NetworkEndian::write_u16(&mut buffer[field::WIN_SIZE], self.window_len);
        buffer
    }

    /// Sequence space consumed by this segment.
    pub fn segment_len(&self) -> u32 {
        let mut len = 0;
        if self.flags.contains(TcpFlags::SYN) {
            len += 1;
        }
        if self.flags.contains(TcpFlags::FIN) {
            len += 1;
        }
        len
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} {} seq={}",
            self.src_port, self.dst_port, self.flags, self.seq_number
        )?;
        if self.flags.contains(TcpFlags::ACK) {
            write!(f, " ack={}", self.ack_number)?;
        }
        write!(f, " win={}", self.window_len)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    static PACKET_BYTES: [u8; 20] = [
        0xbf, 0x00, 0x00, 0x50, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x50, 0x12, 0x01,
        0x23, 0x00, 0x00, 0x00, 0x00,
    ];

    #[test]
    fn test_deconstruct() {
        let packet = Packet::new_checked(&PACKET_BYTES[..]).unwrap();
        assert_eq!(packet.src_port(), 48896);
        assert_eq!(packet.dst_port(), 80);
        assert_eq!(packet.seq_number(), SeqNumber(0x01234567));
        assert_eq!(packet.ack_number(), SeqNumber(0x89abcdef));
        assert_eq!(packet.flags(), TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(packet.window_len(), 0x0123);
    }

    #[test]
    fn test_emit_matches_capture() {
        let repr = Segment {
            src_port: 48896,
            dst_port: 80,
            seq_number: SeqNumber(0x01234567),
            ack_number: SeqNumber(0x89abcdef),
            flags: TcpFlags::SYN | TcpFlags::ACK,
            window_len: 0x0123,
        };
        assert_eq!(repr.emit(), PACKET_BYTES);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(Packet::new_checked(&PACKET_BYTES[..19]).unwrap_err(), Truncated);
    }

    #[test]
    fn test_flags_display() {
        assert_eq!((TcpFlags::FIN | TcpFlags::ACK).to_string(), "FIN-ACK");
        assert_eq!(TcpFlags::empty().to_string(), "none");
    }

    #[test]
    fn test_seq_covers_wraps() {
        assert!(SeqNumber(5).covers(SeqNumber(u32::MAX)));
        assert!(!SeqNumber(u32::MAX).covers(SeqNumber(5)));
    }
}
