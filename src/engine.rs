/*! The transition engine.

One edge at a time: look the edge up, run the peer action, run the IUT
action, then watch the IUT socket until it leaves the source state.

Watching is done by polling `TCP_INFO` with a truncated exponential
backoff. The first sleep is [Config::poll_initial], every following one
is [Config::poll_multiplier] times longer, and none runs past the budget
of the edge. Timer-driven edges get [Config::timeout_budget], all others
[Config::ordinary_budget].

[Config::poll_initial]: ../config/struct.Config.html#structfield.poll_initial
[Config::poll_multiplier]: ../config/struct.Config.html#structfield.poll_multiplier
[Config::timeout_budget]: ../config/struct.Config.html#structfield.timeout_budget
[Config::ordinary_budget]: ../config/struct.Config.html#structfield.ordinary_budget
*/

use crate::config::MIN_POLL;
use crate::error::{Error, ErrorKind, Result};
use crate::flags::SessionFlags;
use crate::session::Session;
use crate::state::TcpState;
use crate::table::{self, Action};
use crate::time::Duration;

/// A listener does not change state when a connection reaches SYN_RECV,
/// and a kernel may complete the handshake before it is observed.
fn passive_syn_recv(to: TcpState, observed: TcpState) -> bool {
    to == TcpState::SynRecv && matches!(observed, TcpState::Listen | TcpState::Established)
}

impl Session {
    /// Move the IUT from `from` to `to` along one table edge.
    ///
    /// `from` is taken from the caller's model of the connection; the
    /// observed state is only consulted after the actions ran. An edge
    /// from a state to itself does nothing.
    pub(crate) fn do_move(
        &mut self,
        from: TcpState,
        to: TcpState,
        flags: SessionFlags,
    ) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.state_from = from;
        self.state_to = to;

        let mv = table::lookup(from, to, flags).ok_or_else(|| {
            Error::new(ErrorKind::TableMiss, "no table entry for the edge").at(from, to)
        })?;
        let timed = flags.contains(SessionFlags::PREFER_TIMEOUT_PATH);
        self.timeout_used = timed;
        self.elapsed = Duration::ZERO;
        let started = self.clock.now();
        net_debug!("{} peer: {}", self.peer_kind, mv);

        if let Some(action) = mv.peer {
            self.run_peer_action(mv, action, flags)
                .map_err(|e| e.during(Action::Peer(action)).at(from, to))?;
        }
        if let Some(action) = mv.iut {
            self.run_iut_action(mv, action, flags)
                .map_err(|e| e.during(Action::Iut(action)).at(from, to))?;
        }

        let budget = if mv.is_timer_driven() {
            self.config.timeout_budget
        } else {
            self.config.ordinary_budget
        };
        let (observed, moved) = self
            .poll_until(budget, |state| {
                state != from || passive_syn_recv(to, state)
            })
            .map_err(|e| e.at(from, to))?;
        if timed {
            self.elapsed = self.clock.now() - started;
        }
        if !moved {
            return Err(Error::new(
                ErrorKind::Timeout,
                format!("IUT still in {} after {}", observed, budget),
            )
            .at(from, to));
        }

        if observed == to || passive_syn_recv(to, observed) {
            net_debug!("reached {} ({} observed)", to, observed);
            return Ok(());
        }
        if flags.contains(SessionFlags::IGNORE_TRANSITION_MISMATCH) {
            net_warn!("{} -> {}: observed {}, ignored", from, to, observed);
            return Ok(());
        }
        Err(Error::new(ErrorKind::Mismatch, format!("observed {}", observed)).at(from, to))
    }

    /// Wait until the IUT leaves the state it was last seen in, or reaches
    /// `to`. Running out of budget is not an error here; the caller
    /// judges the state that is returned.
    pub(crate) fn wait_change(
        &mut self,
        to: Option<TcpState>,
        budget: Duration,
    ) -> Result<TcpState> {
        let start = self.current;
        let (state, changed) =
            self.poll_until(budget, |state| state != start || Some(state) == to)?;
        if !changed {
            net_debug!("IUT stayed in {} for {}", state, budget);
        }
        Ok(state)
    }

    /// Poll the IUT state until `done` holds or `budget` runs out.
    /// Returns the last observed state and whether `done` held.
    fn poll_until<F>(&mut self, budget: Duration, done: F) -> Result<(TcpState, bool)>
    where
        F: Fn(TcpState) -> bool,
    {
        let deadline = self.clock.now() + budget;
        let mut step = self.config.poll_initial.max(MIN_POLL);
        loop {
            let state = self.update_state()?;
            if done(state) {
                return Ok((state, true));
            }
            let now = self.clock.now();
            if now >= deadline {
                return Ok((state, false));
            }
            let remaining = deadline - now;
            let nap = if step < remaining { step } else { remaining };
            net_trace!("IUT in {}, next poll in {}", state, nap);
            self.clock.sleep(nap);
            step *= self.config.poll_multiplier;
        }
    }
}
