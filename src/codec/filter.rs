//! Byte-transform filters applied to a block before compression.
//!
//! All filters except [Filter::TruncPrec] are exactly reversible; the
//! pipeline runs forward in declaration order and backward in reverse.

use crate::config::Filter;

/// Trailing bytes that do not make up a whole item pass through untouched.
fn whole_items(data: &[u8], item_size: usize) -> usize {
    data.len() / item_size
}

fn shuffle(data: &[u8], item_size: usize) -> Vec<u8> {
    let n = whole_items(data, item_size);
    let body = n * item_size;
    let mut out = vec![0u8; data.len()];
    for i in 0..item_size {
        for j in 0..n {
            out[i * n + j] = data[j * item_size + i];
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

fn unshuffle(data: &[u8], item_size: usize) -> Vec<u8> {
    let n = whole_items(data, item_size);
    let body = n * item_size;
    let mut out = vec![0u8; data.len()];
    for i in 0..item_size {
        for j in 0..n {
            out[j * item_size + i] = data[i * n + j];
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

fn bitshuffle(data: &[u8], item_size: usize) -> Vec<u8> {
    let n = whole_items(data, item_size);
    let body = n * item_size;
    let nbits = item_size * 8;
    let mut out = vec![0u8; data.len()];
    for b in 0..nbits {
        for j in 0..n {
            let bit = (data[j * item_size + b / 8] >> (b % 8)) & 1;
            let pos = b * n + j;
            out[pos / 8] |= bit << (pos % 8);
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

fn bitunshuffle(data: &[u8], item_size: usize) -> Vec<u8> {
    let n = whole_items(data, item_size);
    let body = n * item_size;
    let nbits = item_size * 8;
    let mut out = vec![0u8; data.len()];
    for b in 0..nbits {
        for j in 0..n {
            let pos = b * n + j;
            let bit = (data[pos / 8] >> (pos % 8)) & 1;
            out[j * item_size + b / 8] |= bit << (b % 8);
        }
    }
    out[body..].copy_from_slice(&data[body..]);
    out
}

/// XOR every item against the first item; self-inverse given the first item
/// is stored raw.
fn delta(data: &[u8], item_size: usize) -> Vec<u8> {
    let n = whole_items(data, item_size);
    let mut out = data.to_vec();
    for j in 1..n {
        for i in 0..item_size {
            out[j * item_size + i] ^= data[i];
        }
    }
    out
}

/// Zero the low `52 - keep_bits` mantissa bits of each f64. Applies only to
/// 8-byte items; lossy and intentionally not undone on read.
fn trunc_prec(data: &[u8], item_size: usize, keep_bits: u8) -> Vec<u8> {
    if item_size != 8 || keep_bits == 0 || keep_bits >= 52 {
        return data.to_vec();
    }
    let zeroed = 52 - keep_bits as u32;
    let mask = !((1u64 << zeroed) - 1);
    let n = whole_items(data, item_size);
    let mut out = data.to_vec();
    for j in 0..n {
        let at = j * 8;
        let bits = u64::from_le_bytes(out[at..at + 8].try_into().expect("8-byte window"));
        out[at..at + 8].copy_from_slice(&(bits & mask).to_le_bytes());
    }
    out
}

pub(crate) fn forward(
    filters: &[Filter],
    mut data: Vec<u8>,
    item_size: usize,
    fp_mantissa_bits: u8,
) -> Vec<u8> {
    for f in filters {
        data = match f {
            Filter::Shuffle => shuffle(&data, item_size),
            Filter::BitShuffle => bitshuffle(&data, item_size),
            Filter::Delta => delta(&data, item_size),
            Filter::TruncPrec => trunc_prec(&data, item_size, fp_mantissa_bits),
        };
    }
    data
}

pub(crate) fn backward(filters: &[Filter], mut data: Vec<u8>, item_size: usize) -> Vec<u8> {
    for f in filters.iter().rev() {
        data = match f {
            Filter::Shuffle => unshuffle(&data, item_size),
            Filter::BitShuffle => bitunshuffle(&data, item_size),
            Filter::Delta => delta(&data, item_size),
            Filter::TruncPrec => data,
        };
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 89 + 17) as u8).collect()
    }

    #[test]
    fn shuffle_roundtrip() {
        for len in [0, 7, 8, 64, 67] {
            let data = sample(len);
            assert_eq!(unshuffle(&shuffle(&data, 8), 8), data);
        }
    }

    #[test]
    fn bitshuffle_roundtrip() {
        for len in [0, 8, 32, 35] {
            let data = sample(len);
            assert_eq!(bitunshuffle(&bitshuffle(&data, 4), 4), data);
        }
    }

    #[test]
    fn delta_roundtrip() {
        let data = sample(40);
        assert_eq!(delta(&delta(&data, 8), 8), data);
    }

    #[test]
    fn pipeline_roundtrip() {
        let filters = [Filter::Delta, Filter::Shuffle, Filter::BitShuffle];
        let data = sample(128);
        let enc = forward(&filters, data.clone(), 8, 0);
        assert_ne!(enc, data);
        assert_eq!(backward(&filters, enc, 8), data);
    }

    #[test]
    fn trunc_prec_zeroes_low_mantissa() {
        let x = std::f64::consts::PI;
        let out = trunc_prec(&x.to_le_bytes(), 8, 23);
        let y = f64::from_le_bytes(out.try_into().unwrap());
        assert_ne!(x, y);
        assert!((x - y).abs() / x < 1e-6);
        // idempotent
        let again = trunc_prec(&y.to_le_bytes(), 8, 23);
        assert_eq!(f64::from_le_bytes(again.try_into().unwrap()), y);
    }
}
