/// Datagram sink/source seams and the locked, rate-regulated send path.
///
/// The engine never touches sockets directly: it writes through a
/// `DatagramSink` and reads from a `DatagramSource`, which keeps the core
/// testable against in-memory doubles and keeps platform errno mapping at
/// one edge.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::NetError;
use crate::rate::{RateCheck, RateRegulator};
use crate::timer::Timestamp;

/// Where outgoing datagrams go. Router-alert traffic (NAKs upstream, NCFs
/// downstream) uses a separate socket so the option never leaks onto
/// ordinary data.
pub trait DatagramSink: Send + Sync {
    fn send(
        &self,
        buf: &[u8],
        dst: SocketAddr,
        router_alert: bool,
    ) -> Result<usize, NetError>;
}

/// One received datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    pub source: SocketAddr,
    /// Destination address, when the host can report it.
    pub destination: Option<IpAddr>,
    pub interface_index: u32,
}

/// Where incoming datagrams come from. `Ok(None)` means nothing pending.
pub trait DatagramSource: Send {
    fn recv(&mut self) -> Result<Option<Datagram>, NetError>;
}

/// Locked and rate-regulated send.
///
/// One mutex per socket serialises transmission; the regulator is checked
/// before taking the lock (its token account is internally consistent)
/// and charged under the lock after a successful send, so token order
/// matches wire order.
pub(crate) struct RegulatedSender {
    sink: Arc<dyn DatagramSink>,
    rate: Option<Arc<RateRegulator>>,
    send_lock: Mutex<()>,
    alert_lock: Mutex<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SendOptions {
    pub use_rate_limit: bool,
    pub router_alert: bool,
    pub nonblocking: bool,
}

impl RegulatedSender {
    pub fn new(sink: Arc<dyn DatagramSink>, rate: Option<Arc<RateRegulator>>) -> Self {
        RegulatedSender {
            sink,
            rate,
            send_lock: Mutex::new(()),
            alert_lock: Mutex::new(()),
        }
    }

    /// Drop the token account at teardown; later sends go unregulated,
    /// but a destroyed transport refuses them before reaching here.
    pub fn release_rate(&mut self) {
        self.rate = None;
    }

    pub fn send(
        &self,
        buf: &[u8],
        dst: SocketAddr,
        opts: SendOptions,
        now: Timestamp,
    ) -> Result<usize, NetError> {
        if opts.use_rate_limit {
            if let Some(rate) = &self.rate {
                match rate.check(buf.len(), now, opts.nonblocking) {
                    RateCheck::Admit => {}
                    RateCheck::WouldBlock => return Err(NetError::WouldBlock),
                    RateCheck::Defer(wait) => std::thread::sleep(wait),
                }
            }
        }

        let _guard = if opts.router_alert {
            self.alert_lock.lock()
        } else {
            self.send_lock.lock()
        };
        let sent = self.sink.send(buf, dst, opts.router_alert)?;
        if opts.use_rate_limit {
            if let Some(rate) = &self.rate {
                rate.consume(buf.len(), now);
            }
        }
        Ok(sent)
    }
}
