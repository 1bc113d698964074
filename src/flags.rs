use bitflags::bitflags;

bitflags! {
    /// Options controlling how a session drives its endpoint.
    ///
    /// The numeric values are stable and may be stored by callers.
    #[derive(Default)]
    pub struct SessionFlags: u32 {
        /// Set `SO_REUSEADDR` on the peer-side socket.
        const TESTER_REUSE_ADDR = 0x1;
        /// Never touch ARP. Transient states become unobservable.
        const NO_CONNECTIVITY_CHANGE = 0x2;
        /// Pick the timer-driven edge when the table offers one.
        const PREFER_TIMEOUT_PATH = 0x4;
        /// Pick the RST-driven edge when the table offers one.
        const PREFER_RST_PATH = 0x8;
        /// Keep going when the observed state differs from the target.
        const IGNORE_TRANSITION_MISMATCH = 0x10;
        /// As above, for bootstrap edges only.
        const IGNORE_START_MISMATCH = 0x20;
        /// Bootstrap ESTABLISHED and later states through LISTEN.
        const ESTABLISH_PASSIVE = 0x40;
        /// Skip the settle delay after ARP changes.
        const SUPPRESS_CONFIG_WAIT = 0x80;
    }
}

impl SessionFlags {
    /// The flags that only steer a single edge.
    pub const EDGE_PREFERENCES: SessionFlags = SessionFlags::from_bits_truncate(
        SessionFlags::PREFER_TIMEOUT_PATH.bits() | SessionFlags::PREFER_RST_PATH.bits(),
    );

    /// Flags to use for bootstrap edges: a start mismatch tolerance turns
    /// into a plain mismatch tolerance.
    pub fn for_bootstrap(self) -> SessionFlags {
        let mut flags = self;
        if flags.contains(SessionFlags::IGNORE_START_MISMATCH) {
            flags.insert(SessionFlags::IGNORE_TRANSITION_MISMATCH);
        }
        flags
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_bits_are_stable() {
        assert_eq!(SessionFlags::TESTER_REUSE_ADDR.bits(), 0x1);
        assert_eq!(SessionFlags::ESTABLISH_PASSIVE.bits(), 0x40);
        assert_eq!(SessionFlags::all().bits(), 0xff);
    }

    #[test]
    fn test_for_bootstrap() {
        let flags = SessionFlags::IGNORE_START_MISMATCH.for_bootstrap();
        assert!(flags.contains(SessionFlags::IGNORE_TRANSITION_MISMATCH));
        assert_eq!(SessionFlags::empty().for_bootstrap(), SessionFlags::empty());
    }
}
