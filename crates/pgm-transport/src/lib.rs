/// PGM reliable multicast transport (RFC 3208): the reliability engine.
///
/// Provides the core of a NAK-based reliable multicast stack:
/// - Transmit window retaining sent packets for repair, with
///   Reed–Solomon parity per transmission group
/// - Per-peer receive window: gap detection, NAK back-off/repair state
///   machine, APDU reassembly, strictly in-order release
/// - SPM/NAK/NCF control flow with heartbeat and ambient announcements
/// - Token-bucket rate regulation over every transmitted byte
/// - Wire encode/parse with strict option validation and checksumming
///
/// The engine is host-driven: sockets, multicast membership, and the
/// event loop belong to the caller, which feeds received datagrams in,
/// drives timers via `next_deadline`/`drive`, and reads released APDUs
/// from the event channel. A `socket2`-based UDP sink/source pair is
/// included for the common case.

pub mod config;
pub mod error;
pub mod net;
pub mod packet;
pub mod peer;
pub mod rate;
pub mod rxw;
pub mod skb;
pub mod sn;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod tsi;
pub mod txw;
pub mod udp;

mod parity;

// Re-export key types for convenience.
pub use config::{
    FecConfig, GroupMembership, Mode, TransportConfig, UdpEncapsulation, WindowSize,
};
pub use error::{ConfigError, NetError, ParseError, PgmError, WindowError};
pub use net::{Datagram, DatagramSink, DatagramSource};
pub use rate::{RateCheck, RateRegulator};
pub use skb::{FragmentInfo, SockBuf};
pub use sn::Sqn;
pub use stats::{StatsSnapshot, TransportStats};
pub use timer::Timestamp;
pub use transport::{Transport, TransportEvent};
pub use tsi::{Gsi, Tsi};
pub use udp::{UdpSink, UdpSource};
