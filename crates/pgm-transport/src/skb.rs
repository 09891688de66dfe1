/// Cursor packet buffer.
///
/// One contiguous allocation addressed through cursors, `head <= data <=
/// tail <= end` with `head` fixed at zero: `reserve` claims headroom before
/// any payload lands, `put` appends at the tail, `push`/`pull` walk the
/// data cursor backwards/forwards over already-written headers. The
/// cursors are the only way content is located; callers must not hold
/// absolute offsets across mutations.
///
/// Buffers are singly owned and handed off between the sender lane, the
/// windows, and the parser. Copies are explicit via `Clone`; there is no
/// shared reference count.

use thiserror::Error;

use crate::sn::Sqn;
use crate::tsi::Tsi;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SkbError {
    #[error("allocation failed")]
    OutOfMemory,
    #[error("cursor overflow")]
    Capacity,
}

/// APDU fragmentation carried in OPT_FRAGMENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentInfo {
    /// Sequence of the first fragment of the APDU.
    pub first_sqn: Sqn,
    /// Byte offset of this fragment within the APDU.
    pub offset: u32,
    /// Total APDU length in bytes.
    pub apdu_len: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SockBuf {
    buf: Vec<u8>,
    data: usize,
    tail: usize,
    /// Session the packet belongs to, once known.
    pub tsi: Option<Tsi>,
    /// Sequence number, once assigned or parsed.
    pub sqn: Option<Sqn>,
    /// Fragment option, if the packet carries one.
    pub fragment: Option<FragmentInfo>,
}

impl SockBuf {
    /// Allocate a buffer of `capacity` bytes, cursors at zero.
    pub fn alloc(capacity: usize) -> Result<Self, SkbError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| SkbError::OutOfMemory)?;
        buf.resize(capacity, 0);
        Ok(SockBuf {
            buf,
            data: 0,
            tail: 0,
            tsi: None,
            sqn: None,
            fragment: None,
        })
    }

    /// Build a buffer holding `bytes` with no headroom.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SkbError> {
        let mut skb = Self::alloc(bytes.len())?;
        skb.put(bytes.len())?.copy_from_slice(bytes);
        Ok(skb)
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.tail - self.data
    }

    pub fn is_empty(&self) -> bool {
        self.tail == self.data
    }

    pub fn headroom(&self) -> usize {
        self.data
    }

    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.tail
    }

    /// Reserve `n` bytes of headroom. Only legal while the buffer is
    /// empty, before any payload is written.
    pub fn reserve(&mut self, n: usize) -> Result<(), SkbError> {
        if !self.is_empty() || self.data + n > self.buf.len() {
            return Err(SkbError::Capacity);
        }
        self.data += n;
        self.tail += n;
        Ok(())
    }

    /// Append `n` bytes, returning the newly claimed region.
    pub fn put(&mut self, n: usize) -> Result<&mut [u8], SkbError> {
        if self.tail + n > self.buf.len() {
            return Err(SkbError::Capacity);
        }
        let start = self.tail;
        self.tail += n;
        Ok(&mut self.buf[start..self.tail])
    }

    /// Append a byte slice.
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), SkbError> {
        self.put(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    /// Move the data cursor back by `n`, exposing reserved headroom.
    /// Returns the newly exposed region.
    pub fn push(&mut self, n: usize) -> Result<&mut [u8], SkbError> {
        if n > self.data {
            return Err(SkbError::Capacity);
        }
        self.data -= n;
        Ok(&mut self.buf[self.data..self.data + n])
    }

    /// Advance the data cursor by `n`, consuming from the front.
    /// Returns the consumed region.
    pub fn pull(&mut self, n: usize) -> Result<&[u8], SkbError> {
        if self.data + n > self.tail {
            return Err(SkbError::Capacity);
        }
        let start = self.data;
        self.data += n;
        Ok(&self.buf[start..self.data])
    }

    /// Valid region between the data and tail cursors.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.data..self.tail]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.data..self.tail]
    }
}
