use core::fmt;
use core::str::FromStr;

/// The state of a TCP endpoint, according to [RFC 793][rfc793].
///
/// `Unknown` is not a protocol state. It terminates state lists and marks
/// values that were never observed.
///
/// [rfc793]: https://tools.ietf.org/html/rfc793
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Default)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
    #[default]
    Unknown,
}

impl TcpState {
    /// Every protocol state, `Unknown` excluded.
    pub const ALL: [TcpState; 11] = [
        TcpState::Closed,
        TcpState::Listen,
        TcpState::SynSent,
        TcpState::SynRecv,
        TcpState::Established,
        TcpState::FinWait1,
        TcpState::FinWait2,
        TcpState::CloseWait,
        TcpState::Closing,
        TcpState::LastAck,
        TcpState::TimeWait,
    ];

    /// Map the `tcpi_state` field of Linux `struct tcp_info`.
    pub fn from_tcpi_state(raw: u8) -> TcpState {
        match raw {
            1 => TcpState::Established,
            2 => TcpState::SynSent,
            3 => TcpState::SynRecv,
            4 => TcpState::FinWait1,
            5 => TcpState::FinWait2,
            6 => TcpState::TimeWait,
            7 => TcpState::Closed,
            8 => TcpState::CloseWait,
            9 => TcpState::LastAck,
            10 => TcpState::Listen,
            11 => TcpState::Closing,
            _ => TcpState::Unknown,
        }
    }

    /// The `tcpi_state` value Linux reports for this state.
    pub fn tcpi_state(&self) -> Option<u8> {
        let raw = match self {
            TcpState::Established => 1,
            TcpState::SynSent => 2,
            TcpState::SynRecv => 3,
            TcpState::FinWait1 => 4,
            TcpState::FinWait2 => 5,
            TcpState::TimeWait => 6,
            TcpState::Closed => 7,
            TcpState::CloseWait => 8,
            TcpState::LastAck => 9,
            TcpState::Listen => 10,
            TcpState::Closing => 11,
            TcpState::Unknown => return None,
        };
        Some(raw)
    }

    /// Whether both sides have exchanged sequence numbers, so a RST is
    /// the only way out besides an orderly close.
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self,
            TcpState::Established
                | TcpState::FinWait1
                | TcpState::FinWait2
                | TcpState::CloseWait
                | TcpState::Closing
                | TcpState::LastAck
                | TcpState::TimeWait
        )
    }

    pub fn is_unknown(&self) -> bool {
        *self == TcpState::Unknown
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TcpState::Closed => write!(f, "CLOSED"),
            TcpState::Listen => write!(f, "LISTEN"),
            TcpState::SynSent => write!(f, "SYN_SENT"),
            TcpState::SynRecv => write!(f, "SYN_RECV"),
            TcpState::Established => write!(f, "ESTABLISHED"),
            TcpState::FinWait1 => write!(f, "FIN_WAIT1"),
            TcpState::FinWait2 => write!(f, "FIN_WAIT2"),
            TcpState::CloseWait => write!(f, "CLOSE_WAIT"),
            TcpState::Closing => write!(f, "CLOSING"),
            TcpState::LastAck => write!(f, "LAST_ACK"),
            TcpState::TimeWait => write!(f, "TIME_WAIT"),
            TcpState::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Error returned when a word does not name a TCP state.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct UnknownState;

impl fmt::Display for UnknownState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "not a TCP state name")
    }
}

impl std::error::Error for UnknownState {}

impl FromStr for TcpState {
    type Err = UnknownState;

    /// Accepts the display names, the `TCP_`-prefixed kernel names and
    /// `CLOSE` for `CLOSED`, in any letter case.
    fn from_str(s: &str) -> Result<TcpState, UnknownState> {
        let upper = s.to_ascii_uppercase();
        let name = upper.strip_prefix("TCP_").unwrap_or(&upper);
        let state = match name {
            "CLOSE" | "CLOSED" => TcpState::Closed,
            "LISTEN" => TcpState::Listen,
            "SYN_SENT" => TcpState::SynSent,
            "SYN_RECV" | "SYN_RECEIVED" => TcpState::SynRecv,
            "ESTABLISHED" => TcpState::Established,
            "FIN_WAIT1" | "FIN_WAIT_1" => TcpState::FinWait1,
            "FIN_WAIT2" | "FIN_WAIT_2" => TcpState::FinWait2,
            "CLOSE_WAIT" => TcpState::CloseWait,
            "CLOSING" => TcpState::Closing,
            "LAST_ACK" => TcpState::LastAck,
            "TIME_WAIT" => TcpState::TimeWait,
            "UNKNOWN" => TcpState::Unknown,
            _ => return Err(UnknownState),
        };
        Ok(state)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("CLOSED", TcpState::Closed)]
    #[case("TCP_CLOSE", TcpState::Closed)]
    #[case("tcp_syn_sent", TcpState::SynSent)]
    #[case("SYN_RECV", TcpState::SynRecv)]
    #[case("TCP_FIN_WAIT1", TcpState::FinWait1)]
    #[case("time_wait", TcpState::TimeWait)]
    fn test_parse(#[case] word: &str, #[case] expected: TcpState) {
        assert_eq!(word.parse::<TcpState>(), Ok(expected));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!("TCP_OPEN".parse::<TcpState>(), Err(UnknownState));
        assert_eq!("".parse::<TcpState>(), Err(UnknownState));
    }

    #[test]
    fn test_display_parses_back() {
        for state in TcpState::ALL {
            assert_eq!(state.to_string().parse::<TcpState>(), Ok(state));
        }
    }

    #[test]
    fn test_tcpi_state_mapping() {
        for state in TcpState::ALL {
            let raw = state.tcpi_state().unwrap();
            assert_eq!(TcpState::from_tcpi_state(raw), state);
        }
        assert_eq!(TcpState::from_tcpi_state(0), TcpState::Unknown);
        assert_eq!(TcpState::from_tcpi_state(12), TcpState::Unknown);
    }
}
