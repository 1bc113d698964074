/*! Paths through the state machine.

A path is a list of states the IUT must pass through, each optionally
tagged with the edge preference to use when entering it. Paths are
written as text, for instance

```text
CLOSED -> SYN_SENT -> timeout -> CLOSED
```

where the words `timeout` and `reset` apply `PREFER_TIMEOUT_PATH` and
`PREFER_RST_PATH` to the next edge only. Space, tab, newline, comma,
semicolon, colon, `-` and `>` all separate words; letter case does not
matter.

A path does not have to start where the IUT is. If the first state can
be reached from CLOSED but not by a single edge, the executor walks a
canonical chain to it first; see [canonical_chain].

[canonical_chain]: fn.canonical_chain.html
*/

use core::fmt;
use core::str::FromStr;

use crate::error::{Error, ErrorKind, Outcome, Result};
use crate::flags::SessionFlags;
use crate::session::Session;
use crate::state::TcpState;
use crate::table;

const DELIMITERS: &[char] = &[' ', '\t', '\r', '\n', ',', ';', ':', '-', '>'];

/// The shortest way from CLOSED to a state.
pub type Chain = heapless::Vec<TcpState, 11>;

/// One step of a path.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Hop {
    pub state: TcpState,
    /// Edge preferences for the edge that enters `state`.
    pub prefer: SessionFlags,
}

impl Hop {
    pub fn new(state: TcpState) -> Hop {
        Hop {
            state,
            prefer: SessionFlags::empty(),
        }
    }
}

impl fmt::Display for Hop {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.prefer.contains(SessionFlags::PREFER_TIMEOUT_PATH) {
            write!(f, "timeout -> ")?;
        }
        if self.prefer.contains(SessionFlags::PREFER_RST_PATH) {
            write!(f, "reset -> ")?;
        }
        write!(f, "{}", self.state)
    }
}

/// A parsed path.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Path {
    hops: Vec<Hop>,
}

impl Path {
    /// A path through `states`, up to the first `UNKNOWN`.
    pub fn from_states(states: &[TcpState]) -> Path {
        let hops = states
            .iter()
            .take_while(|state| !state.is_unknown())
            .map(|&state| Hop::new(state))
            .collect();
        Path { hops }
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Render the hops from `index` on, in the syntax [from_str] reads.
    ///
    /// [from_str]: #method.from_str
    pub fn render_from(&self, index: usize) -> String {
        let mut text = String::new();
        for (i, hop) in self.hops.iter().skip(index).enumerate() {
            if i > 0 {
                text.push_str(" -> ");
            }
            text.push_str(&hop.to_string());
        }
        text
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.render_from(0))
    }
}

fn bad_path(message: String) -> Error {
    Error::new(ErrorKind::BadPath, message)
}

impl FromStr for Path {
    type Err = Error;

    fn from_str(s: &str) -> Result<Path> {
        let mut hops = Vec::new();
        let mut prefer = SessionFlags::empty();
        for word in s.split(DELIMITERS).filter(|word| !word.is_empty()) {
            if word.eq_ignore_ascii_case("timeout") {
                prefer |= SessionFlags::PREFER_TIMEOUT_PATH;
                continue;
            }
            if word.eq_ignore_ascii_case("reset") {
                prefer |= SessionFlags::PREFER_RST_PATH;
                continue;
            }
            let state = TcpState::from_str(word)
                .map_err(|_| bad_path(format!("'{}' is not a TCP state", word)))?;
            if state.is_unknown() {
                return Err(bad_path("UNKNOWN cannot be part of a path".into()));
            }
            hops.push(Hop { state, prefer });
            prefer = SessionFlags::empty();
        }
        if !prefer.is_empty() {
            return Err(bad_path("modifier after the last state".into()));
        }
        if hops.is_empty() {
            return Err(bad_path("no state in path".into()));
        }
        Ok(Path { hops })
    }
}

fn parent(state: TcpState, passive: bool) -> Option<TcpState> {
    use TcpState::*;
    match state {
        Closed | Unknown => None,
        Listen | SynSent => Some(Closed),
        SynRecv if passive => Some(Listen),
        SynRecv => Some(SynSent),
        Established if passive => Some(SynRecv),
        Established => Some(SynSent),
        FinWait1 | CloseWait => Some(Established),
        FinWait2 | Closing => Some(FinWait1),
        LastAck => Some(CloseWait),
        TimeWait => Some(FinWait2),
    }
}

/// The hard-coded chain of states from CLOSED to `target`.
///
/// Active chains open through SYN_SENT, passive ones through LISTEN and
/// SYN_RECV. States that are only reachable after the handshake extend
/// the ESTABLISHED chain of the same kind.
pub fn canonical_chain(target: TcpState, passive: bool) -> Option<Chain> {
    if target.is_unknown() {
        return None;
    }
    let mut chain = Chain::new();
    let mut state = Some(target);
    while let Some(current) = state {
        chain.push(current).ok()?;
        state = parent(current, passive);
    }
    chain.reverse();
    Some(chain)
}

impl Session {
    /// Walk the canonical chain to `start`, resuming from the state the
    /// IUT is in when that state is on the chain.
    ///
    /// The walk halts once it reaches `stop`; `UNKNOWN` disables stopping.
    /// Returns the state the walk ended in.
    pub fn set_bootstrap(
        &mut self,
        start: TcpState,
        stop: TcpState,
        flags: SessionFlags,
    ) -> Result<TcpState> {
        let flags = self.flags | flags;
        self.bootstrap(start, stop, flags)?;
        Ok(self.current)
    }

    /// Returns `true` if the walk halted at `stop` before `target`.
    fn bootstrap(
        &mut self,
        target: TcpState,
        stop: TcpState,
        flags: SessionFlags,
    ) -> Result<bool> {
        let passive = flags.contains(SessionFlags::ESTABLISH_PASSIVE);
        let chain = canonical_chain(target, passive)
            .ok_or_else(|| bad_path(format!("no chain leads to {}", target)))?;
        let current = self.current;
        let position = chain.iter().position(|&state| state == current).ok_or_else(|| {
            Error::new(
                ErrorKind::TableMiss,
                format!("{} is not on the way to {}", current, target),
            )
            .at(current, target)
        })?;
        net_debug!(
            "bootstrap to {} from {} ({})",
            target,
            current,
            if passive { "passive" } else { "active" }
        );

        let flags = flags.for_bootstrap() & !SessionFlags::EDGE_PREFERENCES;
        for pair in chain[position..].windows(2) {
            self.do_move(pair[0], pair[1], flags)?;
            if pair[1] != target && self.stopped_at(pair[1], stop) {
                net_debug!("bootstrap to {} stopped in {}", target, self.current);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Run `path`.
    ///
    /// `init` is the state the path is taken to start from; `UNKNOWN`
    /// means the state the IUT was last observed in. If the first state
    /// of the path is `init` itself it only anchors the path. Execution
    /// stops early, with [Outcome::Stopped], once the IUT is seen in
    /// `stop`; `UNKNOWN` disables stopping.
    ///
    /// [Outcome::Stopped]: ../enum.Outcome.html#variant.Stopped
    pub fn run_path(
        &mut self,
        init: TcpState,
        stop: TcpState,
        flags: SessionFlags,
        path: &Path,
    ) -> Outcome {
        self.remaining_path = None;
        self.elapsed = Default::default();
        self.timeout_used = false;

        let hops = path.hops();
        let Some(first) = hops.first() else {
            return self.fail(bad_path("no state in path".into()), String::new());
        };
        let flags = self.flags | flags;
        let start = if init.is_unknown() { self.current } else { init };
        net_debug!("path from {}: {}", start, path);

        if !stop.is_unknown() && self.current == stop {
            return self.stop(path.render_from(0));
        }

        let mut prev = start;
        let mut next = 0;
        if first.state == start {
            next = 1;
        } else if table::lookup(start, first.state, flags | first.prefer).is_none() {
            if start != TcpState::Closed {
                let error = Error::new(ErrorKind::TableMiss, "no edge to the first state")
                    .at(start, first.state);
                return self.fail(error, path.render_from(0));
            }
            match self.bootstrap(first.state, stop, flags) {
                Ok(true) => return self.stop(path.render_from(0)),
                Ok(false) => {}
                Err(error) => return self.fail(error, path.render_from(0)),
            }
            prev = first.state;
            next = 1;
            if self.stopped_at(first.state, stop) {
                return self.stop(path.render_from(next));
            }
        }

        for (index, hop) in hops.iter().enumerate().skip(next) {
            if let Err(error) = self.do_move(prev, hop.state, flags | hop.prefer) {
                return self.fail(error, path.render_from(index + 1));
            }
            prev = hop.state;
            if self.stopped_at(hop.state, stop) {
                return self.stop(path.render_from(index + 1));
            }
        }

        Outcome::Ok {
            final_state: self.current,
            elapsed: self.elapsed,
        }
    }

    /// Parse `text` and run it. An unparseable path is reported as
    /// `BadPath` with the whole text left unexecuted.
    pub fn run_str(
        &mut self,
        init: TcpState,
        stop: TcpState,
        flags: SessionFlags,
        text: &str,
    ) -> Outcome {
        match text.parse::<Path>() {
            Ok(path) => self.run_path(init, stop, flags, &path),
            Err(error) => self.fail(error, text.trim().to_owned()),
        }
    }

    /// Run the states in order, from the state the IUT was last observed
    /// in. An `UNKNOWN` element ends the list.
    pub fn run_states(
        &mut self,
        stop: TcpState,
        flags: SessionFlags,
        states: &[TcpState],
    ) -> Outcome {
        self.run_path(TcpState::Unknown, stop, flags, &Path::from_states(states))
    }

    fn stopped_at(&self, target: TcpState, stop: TcpState) -> bool {
        !stop.is_unknown() && (target == stop || self.current == stop)
    }

    fn stop(&mut self, remaining: String) -> Outcome {
        net_info!("stopped in {}, not executed: '{}'", self.current, remaining);
        self.remaining_path = Some(remaining);
        Outcome::Stopped {
            at_state: self.current,
        }
    }

    fn fail(&mut self, error: Error, remaining: String) -> Outcome {
        net_debug!("path failed: {}", error);
        self.remaining_path = Some(remaining.clone());
        Outcome::Err {
            error,
            remaining_path: remaining,
        }
    }
}
