/// PGM wire format (RFC 3208): encode and strictly-validated parse.
///
/// Every packet shares the 16-byte PGM header:
///
/// ```text
/// [0..2]    source port (u16 BE)
/// [2..4]    destination port (u16 BE)
/// [4]       packet type
/// [5]       option flags
/// [6..8]    checksum (one's-complement 16-bit sum, field zeroed)
/// [8..14]   GSI (6 bytes)
/// [14..16]  TSDU length (u16 BE)
/// ```
///
/// Variable OPT_* extensions follow the type-specific header; OPT_LENGTH
/// leads the chain and declares the total option length. Unknown options
/// are skipped; any length that escapes the packet fails the whole packet.
/// All multi-byte fields are network byte order.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::ParseError;
use crate::skb::{FragmentInfo, SkbError, SockBuf};
use crate::sn::Sqn;
use crate::tsi::{Gsi, Tsi};

pub const PGM_HEADER_LEN: usize = 16;

/// Headroom reserved in outgoing buffers for the IP/UDP encapsulation
/// prepended below this layer.
pub const IP_UDP_HEADROOM: usize = 28;

// Packet types.
const TYPE_SPM: u8 = 0x00;
const TYPE_POLL: u8 = 0x01;
const TYPE_POLR: u8 = 0x02;
const TYPE_ODATA: u8 = 0x04;
const TYPE_RDATA: u8 = 0x05;
const TYPE_NAK: u8 = 0x08;
const TYPE_NNAK: u8 = 0x09;
const TYPE_NCF: u8 = 0x0A;

// Header option-flag bits.
pub const FLAG_OPT_PRESENT: u8 = 0x01;
pub const FLAG_OPT_NETWORK: u8 = 0x02;
pub const FLAG_VAR_PKTLEN: u8 = 0x40;
pub const FLAG_PARITY: u8 = 0x80;

// Option types; the high bit marks the end of the chain.
const OPT_LENGTH: u8 = 0x00;
const OPT_FRAGMENT: u8 = 0x01;
const OPT_PARITY_GRP: u8 = 0x09;
const OPT_CURR_TGSIZE: u8 = 0x0A;
const OPT_END: u8 = 0x80;

const OPT_LENGTH_LEN: usize = 4;
const OPT_FRAGMENT_LEN: usize = 16;
const OPT_PARITY_GRP_LEN: usize = 8;
const OPT_CURR_TGSIZE_LEN: usize = 8;

// Network-layer address family indicators.
const AFI_IPV4: u16 = 1;
const AFI_IPV6: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Spm,
    Poll,
    Polr,
    Odata,
    Rdata,
    Nak,
    Nnak,
    Ncf,
}

impl PacketKind {
    pub fn wire_value(self) -> u8 {
        match self {
            PacketKind::Spm => TYPE_SPM,
            PacketKind::Poll => TYPE_POLL,
            PacketKind::Polr => TYPE_POLR,
            PacketKind::Odata => TYPE_ODATA,
            PacketKind::Rdata => TYPE_RDATA,
            PacketKind::Nak => TYPE_NAK,
            PacketKind::Nnak => TYPE_NNAK,
            PacketKind::Ncf => TYPE_NCF,
        }
    }

    fn from_wire(v: u8) -> Result<Self, ParseError> {
        match v {
            TYPE_SPM => Ok(PacketKind::Spm),
            TYPE_POLL => Ok(PacketKind::Poll),
            TYPE_POLR => Ok(PacketKind::Polr),
            TYPE_ODATA => Ok(PacketKind::Odata),
            TYPE_RDATA => Ok(PacketKind::Rdata),
            TYPE_NAK => Ok(PacketKind::Nak),
            TYPE_NNAK => Ok(PacketKind::Nnak),
            TYPE_NCF => Ok(PacketKind::Ncf),
            other => Err(ParseError::BadType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PgmHeader {
    pub sport: u16,
    pub dport: u16,
    pub kind: PacketKind,
    pub flags: u8,
    pub gsi: Gsi,
    pub tsdu_len: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct SpmInfo {
    pub spm_sqn: Sqn,
    pub trail: Sqn,
    pub lead: Sqn,
    pub nla: IpAddr,
}

#[derive(Debug, Clone, Copy)]
pub struct DataInfo {
    pub sqn: Sqn,
    pub trail: Sqn,
    pub fragment: Option<FragmentInfo>,
    /// Transmission group of a parity packet, from OPT_PARITY_GRP.
    pub parity_group: Option<Sqn>,
    /// Actual transmission group size, from OPT_CURR_TGSIZE.
    pub tg_size: Option<u32>,
    /// Offset of the payload within the parsed packet.
    pub payload_offset: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct NakInfo {
    pub sqn: Sqn,
    pub src_nla: IpAddr,
    pub grp_nla: IpAddr,
}

#[derive(Debug, Clone, Copy)]
pub enum PacketBody {
    Spm(SpmInfo),
    Data(DataInfo),
    Nak(NakInfo),
    /// POLL/POLR carry nothing the engine consumes.
    Poll,
}

#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket {
    pub header: PgmHeader,
    pub body: PacketBody,
}

impl ParsedPacket {
    /// Session identifier of the packet's originating source.
    pub fn tsi(&self) -> Tsi {
        Tsi::new(self.header.gsi, self.header.sport)
    }

    pub fn is_parity(&self) -> bool {
        self.header.flags & FLAG_PARITY != 0
    }

    pub fn is_var_pktlen(&self) -> bool {
        self.header.flags & FLAG_VAR_PKTLEN != 0
    }
}

// ─── checksum ──────────────────────────────────────────────────────────

/// One's-complement 16-bit sum over the packet, with the checksum field
/// itself treated as zero.
fn checksum_with_hole(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut i = 0;
    while i < buf.len() {
        let hi = if i == 6 { 0 } else { buf[i] };
        let lo = if i + 1 == 7 {
            0
        } else if i + 1 < buf.len() {
            buf[i + 1]
        } else {
            0
        };
        sum += u32::from(u16::from_be_bytes([hi, lo]));
        i += 2;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn fill_checksum(packet: &mut [u8]) {
    let sum = checksum_with_hole(packet);
    packet[6..8].copy_from_slice(&sum.to_be_bytes());
}

fn verify_checksum(packet: &[u8]) -> bool {
    let expect = checksum_with_hole(packet);
    let got = u16::from_be_bytes([packet[6], packet[7]]);
    got == expect
}

// ─── encoding ──────────────────────────────────────────────────────────

fn nla_len(addr: IpAddr) -> usize {
    // AFI + reserved + address bytes.
    match addr {
        IpAddr::V4(_) => 4 + 4,
        IpAddr::V6(_) => 4 + 16,
    }
}

fn put_u16(skb: &mut SockBuf, v: u16) -> Result<(), SkbError> {
    skb.put_slice(&v.to_be_bytes())
}

fn put_u32(skb: &mut SockBuf, v: u32) -> Result<(), SkbError> {
    skb.put_slice(&v.to_be_bytes())
}

fn put_nla(skb: &mut SockBuf, addr: IpAddr) -> Result<(), SkbError> {
    match addr {
        IpAddr::V4(v4) => {
            put_u16(skb, AFI_IPV4)?;
            put_u16(skb, 0)?;
            skb.put_slice(&v4.octets())
        }
        IpAddr::V6(v6) => {
            put_u16(skb, AFI_IPV6)?;
            put_u16(skb, 0)?;
            skb.put_slice(&v6.octets())
        }
    }
}

fn put_header(
    skb: &mut SockBuf,
    sport: u16,
    dport: u16,
    kind: PacketKind,
    flags: u8,
    gsi: Gsi,
    tsdu_len: u16,
) -> Result<(), SkbError> {
    put_u16(skb, sport)?;
    put_u16(skb, dport)?;
    skb.put_slice(&[kind.wire_value(), flags])?;
    put_u16(skb, 0)?; // checksum patched last
    skb.put_slice(gsi.as_bytes())?;
    put_u16(skb, tsdu_len)
}

/// Options a data packet may carry, in chain order.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataOptions {
    pub fragment: Option<FragmentInfo>,
    pub parity_group: Option<Sqn>,
    pub tg_size: Option<u32>,
}

impl DataOptions {
    fn wire_len(&self) -> usize {
        let mut n = 0;
        if self.fragment.is_some() {
            n += OPT_FRAGMENT_LEN;
        }
        if self.parity_group.is_some() {
            n += OPT_PARITY_GRP_LEN;
        }
        if self.tg_size.is_some() {
            n += OPT_CURR_TGSIZE_LEN;
        }
        if n > 0 {
            n += OPT_LENGTH_LEN;
        }
        n
    }

    fn encode(&self, skb: &mut SockBuf) -> Result<(), SkbError> {
        let total = self.wire_len();
        if total == 0 {
            return Ok(());
        }
        skb.put_slice(&[OPT_LENGTH, OPT_LENGTH_LEN as u8])?;
        put_u16(skb, total as u16)?;

        let mut remaining = [
            self.fragment.is_some(),
            self.parity_group.is_some(),
            self.tg_size.is_some(),
        ]
        .iter()
        .filter(|&&p| p)
        .count();

        let mut end_bit = |remaining: &mut usize| {
            *remaining -= 1;
            if *remaining == 0 {
                OPT_END
            } else {
                0
            }
        };

        if let Some(frag) = self.fragment {
            skb.put_slice(&[
                OPT_FRAGMENT | end_bit(&mut remaining),
                OPT_FRAGMENT_LEN as u8,
            ])?;
            put_u16(skb, 0)?;
            put_u32(skb, frag.first_sqn.get())?;
            put_u32(skb, frag.offset)?;
            put_u32(skb, frag.apdu_len)?;
        }
        if let Some(group) = self.parity_group {
            skb.put_slice(&[
                OPT_PARITY_GRP | end_bit(&mut remaining),
                OPT_PARITY_GRP_LEN as u8,
            ])?;
            put_u16(skb, 0)?;
            put_u32(skb, group.get())?;
        }
        if let Some(tg) = self.tg_size {
            skb.put_slice(&[
                OPT_CURR_TGSIZE | end_bit(&mut remaining),
                OPT_CURR_TGSIZE_LEN as u8,
            ])?;
            put_u16(skb, 0)?;
            put_u32(skb, tg)?;
        }
        Ok(())
    }
}

/// Build an SPM announcing the window edges.
pub fn encode_spm(
    tsi: Tsi,
    dport: u16,
    spm_sqn: Sqn,
    trail: Sqn,
    lead: Sqn,
    nla: IpAddr,
) -> Result<SockBuf, SkbError> {
    let body = 12 + nla_len(nla);
    let mut skb = SockBuf::alloc(IP_UDP_HEADROOM + PGM_HEADER_LEN + body)?;
    skb.reserve(IP_UDP_HEADROOM)?;
    put_header(&mut skb, tsi.sport, dport, PacketKind::Spm, 0, tsi.gsi, 0)?;
    put_u32(&mut skb, spm_sqn.get())?;
    put_u32(&mut skb, trail.get())?;
    put_u32(&mut skb, lead.get())?;
    put_nla(&mut skb, nla)?;
    fill_checksum(skb.as_mut_slice());
    Ok(skb)
}

/// Build an ODATA or RDATA packet.
#[allow(clippy::too_many_arguments)]
pub fn encode_data(
    kind: PacketKind,
    tsi: Tsi,
    dport: u16,
    sqn: Sqn,
    trail: Sqn,
    options: DataOptions,
    extra_flags: u8,
    payload: &[u8],
) -> Result<SockBuf, SkbError> {
    debug_assert!(matches!(kind, PacketKind::Odata | PacketKind::Rdata));
    let opt_len = options.wire_len();
    let mut flags = extra_flags;
    if opt_len > 0 {
        flags |= FLAG_OPT_PRESENT;
    }
    let total = PGM_HEADER_LEN + 8 + opt_len + payload.len();
    let mut skb = SockBuf::alloc(IP_UDP_HEADROOM + total)?;
    skb.reserve(IP_UDP_HEADROOM)?;
    put_header(
        &mut skb,
        tsi.sport,
        dport,
        kind,
        flags,
        tsi.gsi,
        payload.len() as u16,
    )?;
    put_u32(&mut skb, sqn.get())?;
    put_u32(&mut skb, trail.get())?;
    options.encode(&mut skb)?;
    skb.put_slice(payload)?;
    fill_checksum(skb.as_mut_slice());
    Ok(skb)
}

/// Build a NAK, NCF or NNAK. The header names the original source's
/// session: its GSI, and its source port in the destination-port field.
pub fn encode_nak_like(
    kind: PacketKind,
    source_tsi: Tsi,
    our_port: u16,
    sqn: Sqn,
    src_nla: IpAddr,
    grp_nla: IpAddr,
) -> Result<SockBuf, SkbError> {
    debug_assert!(matches!(
        kind,
        PacketKind::Nak | PacketKind::Nnak | PacketKind::Ncf
    ));
    let body = 4 + nla_len(src_nla) + nla_len(grp_nla);
    let mut skb = SockBuf::alloc(IP_UDP_HEADROOM + PGM_HEADER_LEN + body)?;
    skb.reserve(IP_UDP_HEADROOM)?;
    let (sport, dport) = match kind {
        // A receiver's NAK travels upstream: it stamps its own port as
        // the source and the session's source port as the destination.
        PacketKind::Nak => (our_port, source_tsi.sport),
        // NCFs travel back downstream from the source.
        _ => (source_tsi.sport, our_port),
    };
    put_header(&mut skb, sport, dport, kind, 0, source_tsi.gsi, 0)?;
    put_u32(&mut skb, sqn.get())?;
    put_nla(&mut skb, src_nla)?;
    put_nla(&mut skb, grp_nla)?;
    fill_checksum(skb.as_mut_slice());
    Ok(skb)
}

// ─── parsing ───────────────────────────────────────────────────────────

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        if self.remaining() < n {
            return Err(ParseError::BadLength(self.buf.len()));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn nla(&mut self) -> Result<IpAddr, ParseError> {
        let afi = self.u16()?;
        let _reserved = self.u16()?;
        match afi {
            AFI_IPV4 => {
                let b = self.take(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
            }
            AFI_IPV6 => {
                let b = self.take(16)?;
                let mut o = [0u8; 16];
                o.copy_from_slice(b);
                Ok(IpAddr::V6(Ipv6Addr::from(o)))
            }
            _ => Err(ParseError::BadLength(self.buf.len())),
        }
    }
}

#[derive(Default)]
struct ParsedOptions {
    fragment: Option<FragmentInfo>,
    parity_group: Option<Sqn>,
    tg_size: Option<u32>,
}

/// Walk the option chain. Strict: OPT_LENGTH first, every option's length
/// within bounds, zero lengths rejected; unknown options skipped.
fn parse_options(r: &mut Reader<'_>) -> Result<ParsedOptions, ParseError> {
    let start = r.pos;
    let header = r.take(2).map_err(|_| ParseError::BadOpt)?;
    if header[0] & !OPT_END != OPT_LENGTH || header[1] as usize != OPT_LENGTH_LEN {
        return Err(ParseError::BadOpt);
    }
    let total = r.u16().map_err(|_| ParseError::BadOpt)? as usize;
    if total < OPT_LENGTH_LEN || start + total > r.buf.len() {
        return Err(ParseError::BadOpt);
    }
    let opts_end = start + total;

    let mut out = ParsedOptions::default();
    let mut last_seen = header[0] & OPT_END != 0;
    while r.pos < opts_end {
        if last_seen {
            return Err(ParseError::BadOpt);
        }
        let hdr = r.take(2).map_err(|_| ParseError::BadOpt)?;
        let opt_type = hdr[0];
        let opt_len = hdr[1] as usize;
        if opt_len < 2 || r.pos - 2 + opt_len > opts_end {
            return Err(ParseError::BadOpt);
        }
        let value = r.take(opt_len - 2).map_err(|_| ParseError::BadOpt)?;
        last_seen = opt_type & OPT_END != 0;
        match opt_type & !OPT_END {
            OPT_FRAGMENT => {
                if opt_len != OPT_FRAGMENT_LEN {
                    return Err(ParseError::BadOpt);
                }
                out.fragment = Some(FragmentInfo {
                    first_sqn: Sqn(u32::from_be_bytes([
                        value[2], value[3], value[4], value[5],
                    ])),
                    offset: u32::from_be_bytes([value[6], value[7], value[8], value[9]]),
                    apdu_len: u32::from_be_bytes([
                        value[10], value[11], value[12], value[13],
                    ]),
                });
            }
            OPT_PARITY_GRP => {
                if opt_len != OPT_PARITY_GRP_LEN {
                    return Err(ParseError::BadOpt);
                }
                out.parity_group = Some(Sqn(u32::from_be_bytes([
                    value[2], value[3], value[4], value[5],
                ])));
            }
            OPT_CURR_TGSIZE => {
                if opt_len != OPT_CURR_TGSIZE_LEN {
                    return Err(ParseError::BadOpt);
                }
                out.tg_size = Some(u32::from_be_bytes([
                    value[2], value[3], value[4], value[5],
                ]));
            }
            // Unknown options MUST be skipped.
            _ => {}
        }
    }
    if r.pos != opts_end || !last_seen {
        return Err(ParseError::BadOpt);
    }
    Ok(out)
}

/// Parse and validate one PGM packet.
pub fn parse(buf: &[u8]) -> Result<ParsedPacket, ParseError> {
    if buf.len() < PGM_HEADER_LEN {
        return Err(ParseError::BadLength(buf.len()));
    }
    if !verify_checksum(buf) {
        return Err(ParseError::BadChecksum);
    }

    let mut r = Reader::new(buf);
    let sport = r.u16()?;
    let dport = r.u16()?;
    let type_flags = r.take(2)?;
    let kind = PacketKind::from_wire(type_flags[0])?;
    let flags = type_flags[1];
    let _checksum = r.u16()?;
    let gsi_bytes = r.take(6)?;
    let mut gsi = [0u8; 6];
    gsi.copy_from_slice(gsi_bytes);
    let tsdu_len = r.u16()?;

    let header = PgmHeader {
        sport,
        dport,
        kind,
        flags,
        gsi: Gsi::from_bytes(gsi),
        tsdu_len,
    };

    let body = match kind {
        PacketKind::Spm => {
            let spm_sqn = Sqn(r.u32()?);
            let trail = Sqn(r.u32()?);
            let lead = Sqn(r.u32()?);
            let nla = r.nla()?;
            PacketBody::Spm(SpmInfo {
                spm_sqn,
                trail,
                lead,
                nla,
            })
        }
        PacketKind::Odata | PacketKind::Rdata => {
            let sqn = Sqn(r.u32()?);
            let trail = Sqn(r.u32()?);
            let opts = if flags & FLAG_OPT_PRESENT != 0 {
                parse_options(&mut r)?
            } else {
                ParsedOptions::default()
            };
            let payload_offset = r.pos;
            if r.remaining() != tsdu_len as usize {
                return Err(ParseError::BadLength(buf.len()));
            }
            PacketBody::Data(DataInfo {
                sqn,
                trail,
                fragment: opts.fragment,
                parity_group: opts.parity_group,
                tg_size: opts.tg_size,
                payload_offset,
            })
        }
        PacketKind::Nak | PacketKind::Nnak | PacketKind::Ncf => {
            let sqn = Sqn(r.u32()?);
            let src_nla = r.nla()?;
            let grp_nla = r.nla()?;
            PacketBody::Nak(NakInfo {
                sqn,
                src_nla,
                grp_nla,
            })
        }
        PacketKind::Poll | PacketKind::Polr => PacketBody::Poll,
    };

    Ok(ParsedPacket { header, body })
}
