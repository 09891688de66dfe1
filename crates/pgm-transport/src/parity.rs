/// Parity symbol layout shared by the transmit and receive windows.
///
/// Reed–Solomon operates over fixed-size symbols, but the packets in a
/// transmission group differ in length and some carry an OPT_FRAGMENT
/// that lives in the header, outside the payload the code protects. Both
/// ends therefore build each data symbol the same way:
///
/// ```text
/// [payload, zero-padded to symbol_len - 15]
/// [fragment block: present(1) first_sqn(4) offset(4) apdu_len(4)]
/// [payload length, u16 BE]
/// ```
///
/// A parity packet's wire payload is one full symbol, so a reconstructed
/// symbol yields the original payload, its true length, and the fragment
/// option needed to re-enter APDU reassembly.

use crate::skb::FragmentInfo;
use crate::sn::Sqn;

/// Trailing metadata: 13-byte fragment block plus 2-byte length.
pub(crate) const SYMBOL_TAIL: usize = 15;

/// Assemble a data symbol of `symbol_len` bytes.
///
/// `symbol_len` must leave room for the payload and the tail.
pub(crate) fn build_symbol(
    payload: &[u8],
    fragment: Option<FragmentInfo>,
    symbol_len: usize,
) -> Vec<u8> {
    debug_assert!(payload.len() + SYMBOL_TAIL <= symbol_len);
    let mut sym = vec![0u8; symbol_len];
    sym[..payload.len()].copy_from_slice(payload);
    let tail = symbol_len - SYMBOL_TAIL;
    if let Some(frag) = fragment {
        sym[tail] = 1;
        sym[tail + 1..tail + 5].copy_from_slice(&frag.first_sqn.get().to_be_bytes());
        sym[tail + 5..tail + 9].copy_from_slice(&frag.offset.to_be_bytes());
        sym[tail + 9..tail + 13].copy_from_slice(&frag.apdu_len.to_be_bytes());
    }
    sym[symbol_len - 2..].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    sym
}

/// Split a reconstructed symbol back into payload and fragment option.
/// Returns `None` when the embedded length is inconsistent, which means
/// the erasure pattern fed to the decoder was wrong.
pub(crate) fn parse_symbol(sym: &[u8]) -> Option<(Vec<u8>, Option<FragmentInfo>)> {
    if sym.len() < SYMBOL_TAIL {
        return None;
    }
    let len = u16::from_be_bytes([sym[sym.len() - 2], sym[sym.len() - 1]]) as usize;
    if len > sym.len() - SYMBOL_TAIL {
        return None;
    }
    let tail = sym.len() - SYMBOL_TAIL;
    let fragment = match sym[tail] {
        0 => None,
        1 => Some(FragmentInfo {
            first_sqn: Sqn(u32::from_be_bytes([
                sym[tail + 1],
                sym[tail + 2],
                sym[tail + 3],
                sym[tail + 4],
            ])),
            offset: u32::from_be_bytes([
                sym[tail + 5],
                sym[tail + 6],
                sym[tail + 7],
                sym[tail + 8],
            ]),
            apdu_len: u32::from_be_bytes([
                sym[tail + 9],
                sym[tail + 10],
                sym[tail + 11],
                sym[tail + 12],
            ]),
        }),
        _ => return None,
    };
    Some((sym[..len].to_vec(), fragment))
}
