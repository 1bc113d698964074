/*! A driver that walks a TCP endpoint through its state machine.

The endpoint under test (the IUT) is an ordinary kernel socket on some
host. A peer on another host talks to it, either through its own kernel
socket or by crafting segments one at a time, and the driver makes
both sides perform exactly the actions each edge of the TCP state
diagram requires. To stop the IUT in a transient state such as SYN_SENT
or FIN_WAIT1, traffic in one direction is black-holed by pointing an ARP
entry at a link address nobody owns.

A test opens a [Session], names the states to visit, and gets back an
[Outcome]:

```rust,ignore
let mut session = Session::builder(iut, iut_api, peer, backend, netconf).open()?;
let outcome = session.run_str(
    TcpState::Closed,
    TcpState::Unknown,
    SessionFlags::empty(),
    "CLOSED SYN_SENT ESTABLISHED FIN_WAIT1 FIN_WAIT2 TIME_WAIT",
);
assert!(outcome.is_ok());
session.close()?;
```

The hosts are reached through the services in [agent]. With the `sim`
feature, [sim] provides an in-memory network that implements all of
them on a virtual clock.

[Session]: session/struct.Session.html
[Outcome]: error/enum.Outcome.html
[agent]: agent/index.html
[sim]: sim/index.html
*/

#[macro_use]
mod macros;

pub mod agent;
pub mod classify;
pub mod config;
pub mod connectivity;
pub mod endpoint;
pub mod error;
pub mod flags;
pub mod iut;
pub mod path;
pub mod peer;
pub mod session;
pub mod state;
pub mod table;
pub mod time;
pub mod wire;

mod action;
mod engine;

#[cfg(feature = "sim")]
pub mod sim;

pub use self::classify::{FlagSet, PacketTally};
pub use self::config::Config;
pub use self::endpoint::{Direction, Endpoint, Gateway};
pub use self::error::{Error, ErrorKind, Outcome, Result};
pub use self::flags::SessionFlags;
pub use self::path::Path;
pub use self::peer::PeerKind;
pub use self::session::{PeerBackend, Session, SessionBuilder};
pub use self::state::TcpState;
