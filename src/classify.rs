/*! Captured segment classification.

Every segment falls into exactly one of nine flag sets, decided by the
flags byte of its TCP header alone. A [PacketTally] counts segments per
set; it uses atomic counters, so a capture callback can feed it while
the session runs on another thread.

[PacketTally]: struct.PacketTally.html
*/

use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::wire::{Packet, TcpFlags};

/// A class of TCP segments.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub enum FlagSet {
    Ack,
    Syn,
    SynAck,
    PshAck,
    FinAck,
    PshFinAck,
    RstAck,
    Rst,
    /// Any combination not listed above.
    Other,
}

impl FlagSet {
    /// Every set, in the order tallies are printed.
    pub const ALL: [FlagSet; 9] = [
        FlagSet::Ack,
        FlagSet::Syn,
        FlagSet::SynAck,
        FlagSet::PshAck,
        FlagSet::FinAck,
        FlagSet::PshFinAck,
        FlagSet::RstAck,
        FlagSet::Rst,
        FlagSet::Other,
    ];

    /// The set a segment with exactly `flags` belongs to.
    pub fn classify(flags: TcpFlags) -> FlagSet {
        const ACK: TcpFlags = TcpFlags::ACK;
        const PSH_ACK: TcpFlags = TcpFlags::from_bits_truncate(0x18);
        const FIN_ACK: TcpFlags = TcpFlags::from_bits_truncate(0x11);
        const PSH_FIN_ACK: TcpFlags = TcpFlags::from_bits_truncate(0x19);
        const SYN_ACK: TcpFlags = TcpFlags::from_bits_truncate(0x12);
        const RST_ACK: TcpFlags = TcpFlags::from_bits_truncate(0x14);

        match flags {
            ACK => FlagSet::Ack,
            TcpFlags::SYN => FlagSet::Syn,
            SYN_ACK => FlagSet::SynAck,
            PSH_ACK => FlagSet::PshAck,
            FIN_ACK => FlagSet::FinAck,
            PSH_FIN_ACK => FlagSet::PshFinAck,
            RST_ACK => FlagSet::RstAck,
            TcpFlags::RST => FlagSet::Rst,
            _ => FlagSet::Other,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlagSet::Ack => write!(f, "ACK"),
            FlagSet::Syn => write!(f, "SYN"),
            FlagSet::SynAck => write!(f, "SYN-ACK"),
            FlagSet::PshAck => write!(f, "PSH-ACK"),
            FlagSet::FinAck => write!(f, "FIN-ACK"),
            FlagSet::PshFinAck => write!(f, "PSH-FIN-ACK"),
            FlagSet::RstAck => write!(f, "RST-ACK"),
            FlagSet::Rst => write!(f, "RST"),
            FlagSet::Other => write!(f, "other"),
        }
    }
}

/// Per-set segment counters.
///
/// `Display` prints one `NAME count` line per set.
#[derive(Debug, Default)]
pub struct PacketTally {
    counts: [AtomicUsize; 9],
    total: AtomicUsize,
}

impl PacketTally {
    pub fn new() -> PacketTally {
        PacketTally::default()
    }

    /// Count one raw TCP header. A buffer too short to hold one is
    /// counted as `Other`.
    pub fn record(&self, segment: &[u8]) -> FlagSet {
        let set = match Packet::new_checked(segment) {
            Ok(packet) => FlagSet::classify(packet.flags()),
            Err(_) => FlagSet::Other,
        };
        self.bump(set);
        set
    }

    /// Count one segment with the given flags.
    pub fn record_flags(&self, flags: TcpFlags) -> FlagSet {
        let set = FlagSet::classify(flags);
        self.bump(set);
        set
    }

    fn bump(&self, set: FlagSet) {
        self.counts[set.index()].fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self, set: FlagSet) -> usize {
        self.counts[set.index()].load(Ordering::Relaxed)
    }

    /// Segments recorded, across all sets.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.total.store(0, Ordering::Relaxed);
    }
}

impl fmt::Display for PacketTally {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, set) in FlagSet::ALL.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{} {}", set, self.count(*set))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::wire::{Segment, SeqNumber};
    use rstest::rstest;

    #[rstest]
    #[case(TcpFlags::ACK, FlagSet::Ack)]
    #[case(TcpFlags::SYN, FlagSet::Syn)]
    #[case(TcpFlags::SYN | TcpFlags::ACK, FlagSet::SynAck)]
    #[case(TcpFlags::PSH | TcpFlags::ACK, FlagSet::PshAck)]
    #[case(TcpFlags::FIN | TcpFlags::ACK, FlagSet::FinAck)]
    #[case(TcpFlags::PSH | TcpFlags::FIN | TcpFlags::ACK, FlagSet::PshFinAck)]
    #[case(TcpFlags::RST | TcpFlags::ACK, FlagSet::RstAck)]
    #[case(TcpFlags::RST, FlagSet::Rst)]
    #[case(TcpFlags::FIN, FlagSet::Other)]
    #[case(TcpFlags::SYN | TcpFlags::ECE | TcpFlags::CWR, FlagSet::Other)]
    #[case(TcpFlags::ACK | TcpFlags::URG, FlagSet::Other)]
    #[case(TcpFlags::empty(), FlagSet::Other)]
    fn test_classify(#[case] flags: TcpFlags, #[case] expected: FlagSet) {
        assert_eq!(FlagSet::classify(flags), expected);
    }

    #[test]
    fn test_every_flag_byte_lands_in_one_set() {
        let tally = PacketTally::new();
        for bits in 0..=u8::MAX {
            tally.record_flags(TcpFlags::from_bits_truncate(bits));
        }
        let sum: usize = FlagSet::ALL.iter().map(|set| tally.count(*set)).sum();
        assert_eq!(sum, 256);
        assert_eq!(tally.total(), 256);
        assert_eq!(tally.count(FlagSet::Other), 248);
    }

    #[test]
    fn test_record_raw_header() {
        let tally = PacketTally::new();
        let header = Segment {
            src_port: 5000,
            dst_port: 6000,
            seq_number: SeqNumber(1),
            ack_number: SeqNumber(2),
            flags: TcpFlags::FIN | TcpFlags::ACK,
            window_len: 100,
        }
        .emit();
        assert_eq!(tally.record(&header), FlagSet::FinAck);
        assert_eq!(tally.record(&header[..10]), FlagSet::Other);
        assert_eq!(tally.total(), 2);

        tally.reset();
        assert_eq!(tally.total(), 0);
        assert_eq!(tally.count(FlagSet::FinAck), 0);
    }

    #[test]
    fn test_stats_text() {
        let tally = PacketTally::new();
        tally.record_flags(TcpFlags::SYN);
        tally.record_flags(TcpFlags::SYN | TcpFlags::ACK);
        tally.record_flags(TcpFlags::ACK);
        tally.record_flags(TcpFlags::ACK);
        tally.record_flags(TcpFlags::RST | TcpFlags::ACK);
        insta::assert_snapshot!(tally.to_string(), @r"
        ACK 2
        SYN 1
        SYN-ACK 1
        PSH-ACK 0
        FIN-ACK 0
        PSH-FIN-ACK 0
        RST-ACK 1
        RST 0
        other 0
        ");
    }
}
