/// Reed–Solomon erasure coding over GF(2^8) for PGM transmission groups.
///
/// A transmission group of `k` data packets may carry up to `h = n - k`
/// parity packets. Any `k` of the `n` coded packets recover the original
/// data byte-exact. The code is systematic: the first `k` rows of the
/// generator matrix are the identity, so data packets go on the wire
/// unmodified.
///
/// The generator is derived from an `n x k` Vandermonde matrix at points
/// α^0..α^(n-1), multiplied by the inverse of its top `k x k` block so the
/// systematic identity occupies rows 0..k-1.
///
/// The codec is pure and holds no mutable state; scratch buffers are
/// allocated per call, so one codec may be shared across threads.

use thiserror::Error;

pub mod gf;

use gf::{gf_div, gf_mul, GF_ELEMENTS};

/// Default block count for PGM FEC, one full GF(2^8) codeword.
pub const RS_DEFAULT_N: u8 = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FecError {
    /// n/k outside the supported range, or k not a power of two.
    #[error("unsupported code parameters n={n} k={k}")]
    InvalidParameters { n: u8, k: u8 },
    /// Fewer than k blocks available to decode from.
    #[error("insufficient blocks to decode: have {have}, need {need}")]
    Insufficient { have: usize, need: usize },
    /// Erasure map inconsistent with the block set (duplicate or
    /// out-of-range row index, or a singular decode matrix).
    #[error("inconsistent erasure map")]
    Arithmetic,
}

/// Multiply-accumulate one block: `dst[i] ^= coef * src[i]`.
///
/// Byte-wise and length-independent; trailing bytes of the longer slice
/// are untouched, which is what variable-length packets in one group need.
fn add_scaled(dst: &mut [u8], src: &[u8], coef: u8) {
    if coef == 0 {
        return;
    }
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d ^= gf_mul(coef, s);
    }
}

/// Invert a k x k matrix over GF(2^8) in place by Gauss–Jordan elimination.
///
/// Returns `FecError::Arithmetic` if the matrix is singular, which for a
/// well-formed Vandermonde submatrix means the caller's erasure map was
/// inconsistent.
fn invert_matrix(matrix: &mut [u8], k: usize) -> Result<(), FecError> {
    debug_assert_eq!(matrix.len(), k * k);
    let mut inverse = vec![0u8; k * k];
    for i in 0..k {
        inverse[i * k + i] = 1;
    }

    for col in 0..k {
        // Find a pivot row at or below the diagonal.
        let pivot = (col..k)
            .find(|&r| matrix[r * k + col] != 0)
            .ok_or(FecError::Arithmetic)?;
        if pivot != col {
            for j in 0..k {
                matrix.swap(pivot * k + j, col * k + j);
                inverse.swap(pivot * k + j, col * k + j);
            }
        }

        // Normalise the pivot row.
        let p = matrix[col * k + col];
        if p != 1 {
            for j in 0..k {
                matrix[col * k + j] = gf_div(matrix[col * k + j], p);
                inverse[col * k + j] = gf_div(inverse[col * k + j], p);
            }
        }

        // Eliminate the column from every other row.
        for row in 0..k {
            if row == col {
                continue;
            }
            let factor = matrix[row * k + col];
            if factor == 0 {
                continue;
            }
            for j in 0..k {
                let m = gf_mul(factor, matrix[col * k + j]);
                matrix[row * k + j] ^= m;
                let v = gf_mul(factor, inverse[col * k + j]);
                inverse[row * k + j] ^= v;
            }
        }
    }

    matrix.copy_from_slice(&inverse);
    Ok(())
}

/// A systematic RS(n,k) codec.
pub struct RsCodec {
    n: u8,
    k: u8,
    /// n x k generator, row-major. Rows 0..k are the identity.
    generator: Vec<u8>,
}

impl RsCodec {
    /// Build a codec. Constraints: `2 <= k <= 128`, k a power of two,
    /// `k + 1 <= n <= 255`.
    pub fn new(n: u8, k: u8) -> Result<Self, FecError> {
        if !(2..=128).contains(&k) || !k.is_power_of_two() || n <= k {
            return Err(FecError::InvalidParameters { n, k });
        }
        let (n_us, k_us) = (n as usize, k as usize);

        // Vandermonde at points α^0..α^(n-1): V[i][j] = (α^i)^j.
        let mut vandermonde = vec![0u8; n_us * k_us];
        for i in 0..n_us {
            for j in 0..k_us {
                vandermonde[i * k_us + j] = gf::gf_exp((i * j) % (GF_ELEMENTS - 1));
            }
        }

        // Invert the top k x k block and multiply through, so the top of
        // the generator becomes the identity.
        let mut top = vandermonde[..k_us * k_us].to_vec();
        invert_matrix(&mut top, k_us)?;

        let mut generator = vec![0u8; n_us * k_us];
        for (i, row) in generator[..k_us * k_us].chunks_mut(k_us).enumerate() {
            row[i] = 1;
        }
        for i in k_us..n_us {
            for j in 0..k_us {
                let mut acc = 0u8;
                for m in 0..k_us {
                    acc ^= gf_mul(vandermonde[i * k_us + m], top[m * k_us + j]);
                }
                generator[i * k_us + j] = acc;
            }
        }

        Ok(RsCodec { n, k, generator })
    }

    pub fn n(&self) -> u8 {
        self.n
    }

    pub fn k(&self) -> u8 {
        self.k
    }

    /// Maximum parity blocks per group.
    pub fn h(&self) -> u8 {
        self.n - self.k
    }

    /// Encode one parity block: apply generator row `k + parity_index` to
    /// the `k` source blocks, XORing the result into `dst`.
    ///
    /// `dst` must arrive zero-filled to receive a clean parity block.
    /// Source blocks may have unequal lengths; each contributes only its
    /// own bytes, shorter blocks behaving as if zero-padded.
    pub fn encode(
        &self,
        src: &[&[u8]],
        dst: &mut [u8],
        parity_index: u8,
    ) -> Result<(), FecError> {
        let k = self.k as usize;
        if src.len() != k || parity_index >= self.h() {
            return Err(FecError::InvalidParameters { n: self.n, k: self.k });
        }
        let row = (k + parity_index as usize) * k;
        for (i, block) in src.iter().enumerate() {
            add_scaled(dst, block, self.generator[row + i]);
        }
        Ok(())
    }

    /// Decode with parity blocks standing in-line for erased data blocks.
    ///
    /// `blocks` holds exactly `k` buffers. `rows[i]` names the generator
    /// row that produced `blocks[i]`: `i` for an intact data block, or
    /// `k + j` where a parity block with index `j` fills an erasure. On
    /// success every `blocks[i]` holds data block `i`.
    pub fn decode_parity_inline(
        &self,
        blocks: &mut [&mut [u8]],
        rows: &[u8],
    ) -> Result<(), FecError> {
        let k = self.k as usize;
        if blocks.len() != k || rows.len() != k {
            return Err(FecError::Insufficient {
                have: blocks.len().min(rows.len()),
                need: k,
            });
        }
        if rows.iter().enumerate().all(|(i, &r)| r as usize == i) {
            return Ok(()); // nothing erased
        }
        let mut seen = [false; 256];
        for &r in rows {
            if r >= self.n || seen[r as usize] {
                return Err(FecError::Arithmetic);
            }
            seen[r as usize] = true;
        }

        // Decode matrix: generator rows actually received, inverted.
        let mut decode = vec![0u8; k * k];
        for (i, &r) in rows.iter().enumerate() {
            let src = &self.generator[r as usize * k..(r as usize + 1) * k];
            decode[i * k..(i + 1) * k].copy_from_slice(src);
        }
        invert_matrix(&mut decode, k)?;

        // Longest block bounds the reconstruction length.
        let len = blocks.iter().map(|b| b.len()).max().unwrap_or(0);

        // Reconstruct each erased position from all received blocks, then
        // write the recovered bytes back over the stand-in parity.
        let mut recovered: Vec<(usize, Vec<u8>)> = Vec::new();
        for (i, &r) in rows.iter().enumerate() {
            if r as usize == i {
                continue;
            }
            let mut out = vec![0u8; len];
            for (m, block) in blocks.iter().enumerate() {
                add_scaled(&mut out, block, decode[i * k + m]);
            }
            recovered.push((i, out));
        }
        for (i, data) in recovered {
            let dst = &mut blocks[i];
            let n = dst.len().min(data.len());
            dst[..n].copy_from_slice(&data[..n]);
        }
        Ok(())
    }

    /// Decode with parity appended after the data group.
    ///
    /// `blocks` holds `k` data buffers followed by up to `h` parity
    /// buffers; `present[i]` marks which of them arrived. Missing data
    /// blocks are reconstructed in place from surviving data plus enough
    /// appended parity. Fails `Insufficient` when fewer than `k` blocks
    /// survive.
    pub fn decode_parity_appended(
        &self,
        blocks: &mut [&mut [u8]],
        present: &[bool],
    ) -> Result<(), FecError> {
        let k = self.k as usize;
        if blocks.len() != present.len() || blocks.len() < k || blocks.len() > self.n as usize {
            return Err(FecError::Arithmetic);
        }
        let have = present.iter().filter(|&&p| p).count();
        if have < k {
            return Err(FecError::Insufficient { have, need: k });
        }

        // Pair each erased data index with an unused surviving parity.
        let mut parity_pool = (k..blocks.len()).filter(|&i| present[i]);
        let mut rows = Vec::with_capacity(k);
        let mut sources: Vec<usize> = Vec::with_capacity(k);
        for i in 0..k {
            if present[i] {
                rows.push(i as u8);
                sources.push(i);
            } else {
                let p = parity_pool.next().ok_or(FecError::Insufficient {
                    have,
                    need: k,
                })?;
                rows.push(p as u8);
                sources.push(p);
            }
        }

        // Stage the k participating blocks, run the inline algorithm on
        // the staging copies, then write recovered data into its slot.
        let len = blocks.iter().map(|b| b.len()).max().unwrap_or(0);
        let mut staged: Vec<Vec<u8>> = sources
            .iter()
            .map(|&s| {
                let mut v = vec![0u8; len];
                v[..blocks[s].len()].copy_from_slice(&blocks[s]);
                v
            })
            .collect();
        let mut staged_refs: Vec<&mut [u8]> =
            staged.iter_mut().map(|v| v.as_mut_slice()).collect();
        self.decode_parity_inline(&mut staged_refs, &rows)?;

        for i in 0..k {
            if !present[i] {
                let dst = &mut blocks[i];
                let n = dst.len().min(staged[i].len());
                dst[..n].copy_from_slice(&staged[i][..n]);
            }
        }
        Ok(())
    }
}
