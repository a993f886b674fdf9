//! Coordinate arithmetic for the element/block/chunk hierarchy.
//!
//! Everything here is pure: row-major strides, flat/nd index conversion,
//! negative-index slice normalization and extended-shape rounding. The
//! per-element helpers are on hot paths and do not allocate.

use serde::{Deserialize, Serialize};

use crate::{CoordVec, Error, GridCoord, Ndim, Result, DIMENSION_MAX};

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
}

impl DType {
    pub fn item_size(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Shape record of a container: logical shape, chunk shape and block shape,
/// plus the data type.
///
/// Invariants, enforced at construction: rank in `1..=DIMENSION_MAX`, every
/// extent at least 1, `chunk_shape <= shape` and `block_shape <= chunk_shape`
/// per axis.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DtShape {
    dtype: DType,
    shape: GridCoord,
    chunk_shape: GridCoord,
    block_shape: GridCoord,
}

impl Ndim for DtShape {
    fn ndim(&self) -> usize {
        self.shape.len()
    }
}

impl DtShape {
    /// Single-chunk, single-block layout; refine with
    /// [DtShape::with_chunk_shape] and [DtShape::with_block_shape].
    pub fn new(dtype: DType, shape: &[u64]) -> Result<Self> {
        if shape.is_empty() || shape.len() > DIMENSION_MAX {
            return Err(Error::ExceededDim(shape.len()));
        }
        if shape.iter().any(|s| *s == 0) {
            return Err(Error::invalid_argument("shape extent of zero"));
        }
        let shape: GridCoord = shape.iter().copied().collect();
        Ok(Self {
            dtype,
            chunk_shape: shape.clone(),
            block_shape: shape.clone(),
            shape,
        })
    }

    /// Set the chunk shape. Resets the block shape to one block per chunk.
    pub fn with_chunk_shape(mut self, chunk_shape: &[u64]) -> Result<Self> {
        if chunk_shape.len() != self.ndim() {
            return Err(Error::invalid_argument("chunk shape has wrong rank"));
        }
        for (c, s) in chunk_shape.iter().zip(self.shape.iter()) {
            if *c == 0 || c > s {
                return Err(Error::invalid_argument(
                    "chunk extent must be in 1..=shape extent",
                ));
            }
        }
        self.chunk_shape = chunk_shape.iter().copied().collect();
        self.block_shape = self.chunk_shape.clone();
        Ok(self)
    }

    pub fn with_block_shape(mut self, block_shape: &[u64]) -> Result<Self> {
        if block_shape.len() != self.ndim() {
            return Err(Error::invalid_argument("block shape has wrong rank"));
        }
        for (b, c) in block_shape.iter().zip(self.chunk_shape.iter()) {
            if *b == 0 || b > c {
                return Err(Error::invalid_argument(
                    "block extent must be in 1..=chunk extent",
                ));
            }
        }
        self.block_shape = block_shape.iter().copied().collect();
        Ok(self)
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn item_size(&self) -> usize {
        self.dtype.item_size()
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn chunk_shape(&self) -> &[u64] {
        &self.chunk_shape
    }

    pub fn block_shape(&self) -> &[u64] {
        &self.block_shape
    }

    pub fn n_items(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }

    pub fn chunk_items(&self) -> usize {
        self.chunk_shape.iter().product::<u64>() as usize
    }

    pub fn block_items(&self) -> usize {
        self.block_shape.iter().product::<u64>() as usize
    }

    /// Logical shape rounded up to a whole number of chunks per axis.
    pub fn ext_shape(&self) -> GridCoord {
        ext_round_up(&self.shape, &self.chunk_shape)
    }

    /// Chunk shape rounded up to a whole number of blocks per axis.
    pub fn ext_chunk_shape(&self) -> GridCoord {
        ext_round_up(&self.chunk_shape, &self.block_shape)
    }

    /// Chunks per axis.
    pub fn chunk_grid(&self) -> GridCoord {
        self.shape
            .iter()
            .zip(self.chunk_shape.iter())
            .map(|(s, c)| div_ceil(*s, *c))
            .collect()
    }

    pub fn n_chunks(&self) -> usize {
        self.chunk_grid().iter().product::<u64>() as usize
    }

    /// Total item count of the extended (padded) space.
    pub fn ext_items(&self) -> usize {
        self.n_chunks() * self.chunk_items()
    }

    /// The chunk-grid coordinate of `nchunk` (row-major over the grid).
    pub fn chunk_coord(&self, nchunk: usize) -> GridCoord {
        let grid = self.chunk_grid();
        let mut out = GridCoord::from_slice(&grid);
        flat_to_nd(nchunk as u64, &grid, &mut out);
        out
    }

    /// Global coordinate of a chunk's first element.
    pub fn chunk_origin(&self, nchunk: usize) -> GridCoord {
        self.chunk_coord(nchunk)
            .iter()
            .zip(self.chunk_shape.iter())
            .map(|(g, c)| g * c)
            .collect()
    }

    /// Chunk extent clamped to the logical shape (truncated at array edges).
    pub fn chunk_clamped_shape(&self, nchunk: usize) -> GridCoord {
        self.chunk_origin(nchunk)
            .iter()
            .zip(self.chunk_shape.iter().zip(self.shape.iter()))
            .map(|(o, (c, s))| (o + c).min(*s) - o)
            .collect()
    }

    /// Stored item count of chunk `nchunk`.
    ///
    /// Rank-1 containers truncate their trailing chunk to the logical tail;
    /// all other chunks hold the full `chunk_items`.
    pub fn chunk_stored_items(&self, nchunk: usize) -> usize {
        let full = self.chunk_items();
        if self.ndim() == 1 {
            let start = nchunk * full;
            full.min(self.n_items().saturating_sub(start))
        } else {
            full
        }
    }

    /// Drop length-1 axes. A fully degenerate array keeps one axis.
    pub fn squeeze(&mut self) {
        let keep: CoordVec<usize> = (0..self.ndim()).filter(|i| self.shape[*i] != 1).collect();
        if keep.len() == self.ndim() {
            return;
        }
        let pick = |v: &GridCoord| -> GridCoord {
            if keep.is_empty() {
                GridCoord::from_slice(&[1])
            } else {
                keep.iter().map(|i| v[*i]).collect()
            }
        };
        self.shape = pick(&self.shape);
        self.chunk_shape = pick(&self.chunk_shape);
        self.block_shape = pick(&self.block_shape);
    }
}

#[inline]
pub fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// Round each extent of `shape` up to a multiple of `step`.
pub fn ext_round_up(shape: &[u64], step: &[u64]) -> GridCoord {
    shape
        .iter()
        .zip(step.iter())
        .map(|(s, p)| div_ceil(*s, *p) * p)
        .collect()
}

/// Row-major strides of `shape`, in items.
pub fn strides(shape: &[u64]) -> GridCoord {
    let mut out = GridCoord::from_slice(shape);
    let mut acc = 1u64;
    for i in (0..shape.len()).rev() {
        out[i] = acc;
        acc *= shape[i];
    }
    out
}

/// Row-major flat index of `coord` within `shape`.
#[inline]
pub fn nd_to_flat(coord: &[u64], shape: &[u64]) -> u64 {
    debug_assert_eq!(coord.len(), shape.len());
    let mut flat = 0u64;
    for (c, s) in coord.iter().zip(shape.iter()) {
        debug_assert!(c < s);
        flat = flat * s + c;
    }
    flat
}

/// Inverse of [nd_to_flat]; writes into `out`, which must have the rank of
/// `shape`.
#[inline]
pub fn flat_to_nd(flat: u64, shape: &[u64], out: &mut [u64]) {
    debug_assert_eq!(out.len(), shape.len());
    let mut rem = flat;
    for i in (0..shape.len()).rev() {
        out[i] = rem % shape[i];
        rem /= shape[i];
    }
    debug_assert_eq!(rem, 0);
}

/// Normalize slice bounds against `shape`.
///
/// Negative indices wrap once (`x + shape`); the start clamps into
/// `[0, shape]` and the stop into `[start, shape]` per axis.
pub fn normalize_slice(start: &[i64], stop: &[i64], shape: &[u64]) -> Result<(GridCoord, GridCoord)> {
    if start.len() != shape.len() || stop.len() != shape.len() {
        return Err(Error::invalid_argument("slice bounds have wrong rank"));
    }
    let mut s_out = GridCoord::with_capacity(shape.len());
    let mut e_out = GridCoord::with_capacity(shape.len());
    for ((s, e), sh) in start.iter().zip(stop.iter()).zip(shape.iter()) {
        let sh_i = *sh as i64;
        let mut s = *s;
        let mut e = *e;
        if s < 0 {
            s += sh_i;
        }
        if e < 0 {
            e += sh_i;
        }
        let s = s.clamp(0, sh_i) as u64;
        let e = e.clamp(s as i64, sh_i) as u64;
        s_out.push(s);
        e_out.push(e);
    }
    Ok((s_out, e_out))
}

pub fn box_items(start: &[u64], stop: &[u64]) -> usize {
    start
        .iter()
        .zip(stop.iter())
        .map(|(s, e)| (e - s) as usize)
        .product()
}

/// Iterator over the contiguous innermost-axis runs of a box inside a
/// row-major array.
///
/// For each run it yields `(outer_flat, box_flat, len)`: the flat item
/// offset of the run within the enclosing array, its flat offset within a
/// dense row-major copy of the box, and the run length. An empty box yields
/// nothing.
pub struct BoxSpans {
    outer_strides: GridCoord,
    start: GridCoord,
    extent: GridCoord,
    counter: GridCoord,
    row_len: usize,
    rows_left: usize,
    box_flat: usize,
}

impl BoxSpans {
    pub fn new(start: &[u64], stop: &[u64], outer_shape: &[u64]) -> Self {
        debug_assert_eq!(start.len(), outer_shape.len());
        let extent: GridCoord = start.iter().zip(stop.iter()).map(|(s, e)| e - s).collect();
        let row_len = *extent.last().unwrap_or(&0) as usize;
        let rows: usize = extent[..extent.len().saturating_sub(1)]
            .iter()
            .map(|e| *e as usize)
            .product();
        let rows_left = if row_len == 0 { 0 } else { rows };
        Self {
            outer_strides: strides(outer_shape),
            start: start.iter().copied().collect(),
            counter: GridCoord::from_elem(0, extent.len()),
            extent,
            row_len,
            rows_left,
            box_flat: 0,
        }
    }
}

impl Iterator for BoxSpans {
    type Item = (usize, usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rows_left == 0 {
            return None;
        }
        self.rows_left -= 1;
        let mut outer = 0u64;
        for i in 0..self.extent.len() {
            outer += (self.start[i] + self.counter[i]) * self.outer_strides[i];
        }
        let item = (outer as usize, self.box_flat, self.row_len);
        self.box_flat += self.row_len;
        // advance the leading axes; the innermost axis is the run itself
        for i in (0..self.extent.len().saturating_sub(1)).rev() {
            self.counter[i] += 1;
            if self.counter[i] < self.extent[i] {
                break;
            }
            self.counter[i] = 0;
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn flat_nd_roundtrip() {
        let shape = [3u64, 4, 5];
        let mut coord = [0u64; 3];
        for flat in 0..60u64 {
            flat_to_nd(flat, &shape, &mut coord);
            assert_eq!(nd_to_flat(&coord, &shape), flat);
        }
        flat_to_nd(37, &shape, &mut coord);
        assert_eq!(coord, [1, 3, 2]);
    }

    #[test]
    fn strides_row_major() {
        let s = strides(&[3, 4, 5]);
        assert_eq!(s.as_slice(), &[20, 5, 1]);
    }

    #[test]
    fn ext_rounding() {
        let ext = ext_round_up(&[10, 7], &[4, 7]);
        assert_eq!(ext.as_slice(), &[12, 7]);
    }

    #[test]
    fn slice_normalization() {
        let (s, e) = normalize_slice(&[3, 0, 3], &[-4, -3, 10], &[10, 10, 10]).unwrap();
        assert_eq!(s.as_slice(), &[3, 0, 3]);
        assert_eq!(e.as_slice(), &[6, 7, 10]);

        // clamping: starts above the shape collapse, stops clamp to start
        let (s, e) = normalize_slice(&[-20, 12], &[4, 2], &[10, 10]).unwrap();
        assert_eq!(s.as_slice(), &[0, 10]);
        assert_eq!(e.as_slice(), &[4, 10]);
    }

    #[test]
    fn dtshape_invariants() {
        assert!(DtShape::new(DType::F64, &[]).is_err());
        assert!(DtShape::new(DType::F64, &[1; 9]).is_err());
        assert!(DtShape::new(DType::F64, &[4, 0]).is_err());
        let d = DtShape::new(DType::F64, &[10, 10])
            .unwrap()
            .with_chunk_shape(&[4, 7])
            .unwrap()
            .with_block_shape(&[2, 7])
            .unwrap();
        assert_eq!(d.ext_shape().as_slice(), &[12, 14]);
        assert_eq!(d.ext_chunk_shape().as_slice(), &[4, 7]);
        assert_eq!(d.n_chunks(), 6);
        assert!(d.clone().with_block_shape(&[5, 7]).is_err());
        assert!(d.with_chunk_shape(&[11, 1]).is_err());
    }

    #[test]
    fn chunk_arithmetic() {
        let d = DtShape::new(DType::F32, &[10, 10])
            .unwrap()
            .with_chunk_shape(&[4, 7])
            .unwrap();
        // grid is 3x2, row-major
        assert_eq!(d.chunk_coord(3).as_slice(), &[1, 1]);
        assert_eq!(d.chunk_origin(3).as_slice(), &[4, 7]);
        assert_eq!(d.chunk_clamped_shape(3).as_slice(), &[4, 3]);
        assert_eq!(d.chunk_clamped_shape(5).as_slice(), &[2, 3]);
    }

    #[test]
    fn tail_truncation_is_rank_1_only() {
        let d = DtShape::new(DType::F64, &[7])
            .unwrap()
            .with_chunk_shape(&[4])
            .unwrap();
        assert_eq!(d.chunk_stored_items(0), 4);
        assert_eq!(d.chunk_stored_items(1), 3);

        let d2 = DtShape::new(DType::F64, &[7, 2])
            .unwrap()
            .with_chunk_shape(&[4, 2])
            .unwrap();
        assert_eq!(d2.chunk_stored_items(1), 8);
    }

    #[test]
    fn squeeze_drops_unit_axes() {
        let mut d = DtShape::new(DType::F64, &[1, 5, 1, 3])
            .unwrap()
            .with_chunk_shape(&[1, 2, 1, 3])
            .unwrap();
        d.squeeze();
        assert_eq!(d.shape(), &[5, 3]);
        assert_eq!(d.chunk_shape(), &[2, 3]);

        let mut all_ones = DtShape::new(DType::F64, &[1, 1]).unwrap();
        all_ones.squeeze();
        assert_eq!(all_ones.shape(), &[1]);
    }

    #[test]
    fn box_spans_cover_box_in_order() {
        // 2x2x3 box at (1,0,2) inside a 3x4x5 array
        let spans: Vec<_> = BoxSpans::new(&[1, 0, 2], &[3, 2, 5], &[3, 4, 5]).collect();
        assert_eq!(
            spans,
            vec![
                (22, 0, 3),
                (27, 3, 3),
                (42, 6, 3),
                (47, 9, 3),
            ]
        );
        let empty: GridCoord = smallvec![2, 2];
        let none: Vec<_> = BoxSpans::new(&empty, &[2, 4], &[4, 4]).collect();
        assert!(none.is_empty());
    }
}
