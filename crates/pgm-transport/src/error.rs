/// Error taxonomy surfaced at the API boundary.
///
/// Packet-level failures (parse, checksum) are absorbed inside the engine
/// and show up only in counters; window and APDU-level failures propagate
/// to the caller. Platform errno is mapped to `NetError` at the I/O edge
/// and nowhere else.

use thiserror::Error;

pub use pgm_fec::FecError;

/// Invalid parameters, rejected at create/bind before taking effect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tpdu_max {0} below the minimum {1} for this address family")]
    TpduTooSmall(u16, u16),
    #[error("transmit window needs txw_sqns or (txw_secs, txw_max_rte)")]
    NoTxwSize,
    #[error("receive window needs rxw_sqns or (rxw_secs, rxw_max_rte)")]
    NoRxwSize,
    #[error("source and data-destination port must differ")]
    PortClash,
    #[error("UDP encapsulation needs both unicast and multicast ports")]
    HalfUdpEncapsulation,
    #[error("hops must lie in 1..=255")]
    BadHops,
    #[error("heartbeat schedule must not be empty")]
    EmptyHeartbeat,
    #[error("unsupported FEC parameters n={n} k={k}")]
    BadFec { n: u8, k: u8 },
    #[error("proactive parity count {0} exceeds available parity {1}")]
    BadProactive(u8, u8),
    #[error("APDU of {0} bytes exceeds the window maximum {1}")]
    ApduTooLarge(usize, usize),
    #[error("membership table is full")]
    TooManyGroups,
    #[error("no matching group membership")]
    NoSuchGroup,
}

/// Per-packet parse failures. Dropped silently, counted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet truncated: {0} bytes")]
    BadLength(usize),
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("malformed option chain")]
    BadOpt,
    #[error("unknown packet type {0:#04x}")]
    BadType(u8),
}

/// Window lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WindowError {
    /// Sequence has been evicted past the trailing edge; the data is lost.
    #[error("sequence below the trailing edge")]
    Gone,
    /// Sequence lies beyond the leading edge.
    #[error("sequence beyond the leading edge")]
    Nxio,
    #[error("window is full")]
    Full,
}

/// Datagram sink/source failures, mapped from platform errors at the edge.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetError {
    #[error("operation would block")]
    WouldBlock,
    #[error("network down")]
    NetDown,
    #[error("no route to destination")]
    NoRoute,
}

/// Top-level result type of transport operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PgmError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Fec(#[from] FecError),
    #[error("operation would block")]
    WouldBlock,
    #[error("network down")]
    NetDown,
    #[error("no route to destination")]
    NoRoute,
    /// Irrecoverable peer data loss, surfaced once per event.
    #[error("peer reset: unrecoverable data loss")]
    Reset,
    #[error("transport is closed")]
    Closed,
    #[error("transport is not bound")]
    NotBound,
    #[error("transport is already bound")]
    AlreadyBound,
    #[error("allocation failed")]
    OutOfMemory,
}

impl From<NetError> for PgmError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::WouldBlock => PgmError::WouldBlock,
            NetError::NetDown => PgmError::NetDown,
            NetError::NoRoute => PgmError::NoRoute,
        }
    }
}

impl From<crate::skb::SkbError> for PgmError {
    fn from(_: crate::skb::SkbError) -> Self {
        // Cursor overflows never escape the builders, which size their
        // buffers; what remains is allocation failure.
        PgmError::OutOfMemory
    }
}
