//! Forward-only traversals over containers.
//!
//! Four modes: element-wise write, chunk-wise (partition) write,
//! element-wise read and block-wise read. Write iterators buffer one chunk
//! at a time and append it to the super-chunk when full; both read modes
//! never expose padding.

use crate::container::{Element, NdRead};
use crate::shape::{self, BoxSpans};
use crate::{Container, Error, GridCoord, Ndim, Result};

/// Chunk-major ordinal over the extended space, with the derived nd state.
struct Cursor {
    chunk_items: u64,
    esize: u64,
    grid: GridCoord,
    chunk_shape: GridCoord,
    shape: GridCoord,
}

impl Cursor {
    fn new(c: &Container) -> Self {
        let d = c.dtshape();
        Self {
            chunk_items: d.chunk_items() as u64,
            esize: d.ext_items() as u64,
            grid: d.chunk_grid(),
            chunk_shape: d.chunk_shape().iter().copied().collect(),
            shape: d.shape().iter().copied().collect(),
        }
    }

    fn nchunk(&self, cont: u64) -> usize {
        (cont / self.chunk_items) as usize
    }

    fn within(&self, cont: u64) -> usize {
        (cont % self.chunk_items) as usize
    }

    /// Global coordinate of the ordinal; true if it is a padding cell.
    fn global(&self, cont: u64, out: &mut [u64]) -> bool {
        let ndim = self.shape.len();
        let mut chunk_coord = [0u64; crate::DIMENSION_MAX];
        let mut within = [0u64; crate::DIMENSION_MAX];
        shape::flat_to_nd(cont / self.chunk_items, &self.grid, &mut chunk_coord[..ndim]);
        shape::flat_to_nd(cont % self.chunk_items, &self.chunk_shape, &mut within[..ndim]);
        let mut pad = false;
        for i in 0..ndim {
            out[i] = chunk_coord[i] * self.chunk_shape[i] + within[i];
            pad |= out[i] >= self.shape[i];
        }
        pad
    }

    /// Smallest non-padding ordinal at or after `cont`.
    fn skip_padding(&self, mut cont: u64, scratch: &mut [u64]) -> u64 {
        while cont < self.esize && self.global(cont, scratch) {
            cont += 1;
        }
        cont
    }
}

pub struct WriteValue<'i, T> {
    pub index: &'i [u64],
    /// Flat index in the logical (row-major) order.
    pub nelem: u64,
    pub value: &'i mut T,
}

/// Element-wise fill of an empty container in logical row-major order.
pub struct WriteIter<'a, T: Element> {
    c: &'a mut Container,
    cursor: Cursor,
    buf: Vec<T>,
    cont: u64,
    cur_chunk: Option<usize>,
    index: GridCoord,
}

impl<'a, T: Element> WriteIter<'a, T> {
    pub fn new(c: &'a mut Container) -> Result<Self> {
        if T::DTYPE != c.dtype() {
            return Err(Error::InvalidDtype);
        }
        if c.sc().n_chunks() != 0 {
            return Err(Error::invalid_argument(
                "write iterator needs an empty container",
            ));
        }
        let cursor = Cursor::new(c);
        let buf = vec![T::zero(); cursor.chunk_items as usize];
        let index = GridCoord::from_elem(0, c.ndim());
        Ok(Self {
            c,
            cursor,
            buf,
            cont: 0,
            cur_chunk: None,
            index,
        })
    }

    pub fn has_next(&self) -> bool {
        self.cont < self.cursor.esize
    }

    pub fn next(&mut self) -> Result<WriteValue<'_, T>> {
        if !self.has_next() {
            return Err(Error::EndIter);
        }
        let nchunk = self.cursor.nchunk(self.cont);
        if self.cur_chunk != Some(nchunk) {
            if let Some(prev) = self.cur_chunk {
                self.c.append_chunk_items(prev, &self.buf)?;
                self.buf.fill(T::zero());
            }
            self.cur_chunk = Some(nchunk);
        }
        let slot = self.cursor.within(self.cont);
        self.cursor.global(self.cont, &mut self.index);
        let nelem = shape::nd_to_flat(&self.index, &self.cursor.shape);
        let mut scratch = [0u64; crate::DIMENSION_MAX];
        self.cont = self
            .cursor
            .skip_padding(self.cont + 1, &mut scratch[..self.index.len()]);
        Ok(WriteValue {
            index: &self.index,
            nelem,
            value: &mut self.buf[slot],
        })
    }

    /// Append the outstanding chunk, zero-fill anything unwritten and, for
    /// file-backed containers, persist the footer.
    pub fn finish(mut self) -> Result<()> {
        let n_chunks = self.c.dtshape().n_chunks();
        let resume = match self.cur_chunk {
            Some(cur) => {
                self.c.append_chunk_items(cur, &self.buf)?;
                cur + 1
            }
            None => 0,
        };
        self.buf.fill(T::zero());
        for nchunk in resume..n_chunks {
            self.c.append_chunk_items(nchunk, &self.buf)?;
        }
        self.c.flush()
    }
}

pub struct ChunkValue<'i, T> {
    /// Position of the partition within the chunk grid.
    pub part_index: &'i [u64],
    /// Global coordinate of the partition's first element.
    pub elem_index: &'i [u64],
    /// Partition shape, truncated at array edges.
    pub shape: &'i [u64],
    pub nelem: u64,
    /// Dense row-major buffer of `shape` to fill.
    pub data: &'i mut [T],
}

/// Partition-wise fill: the caller gets each chunk's truncated panel; on
/// advance the panel is copied into a padded full-size buffer and appended.
pub struct WriteChunkIter<'a, T: Element> {
    c: &'a mut Container,
    part: Vec<T>,
    full: Vec<T>,
    nchunk: usize,
    n_chunks: usize,
    outstanding: bool,
    part_index: GridCoord,
    elem_index: GridCoord,
    part_shape: GridCoord,
}

impl<'a, T: Element> WriteChunkIter<'a, T> {
    pub fn new(c: &'a mut Container) -> Result<Self> {
        if T::DTYPE != c.dtype() {
            return Err(Error::InvalidDtype);
        }
        if c.sc().n_chunks() != 0 {
            return Err(Error::invalid_argument(
                "write iterator needs an empty container",
            ));
        }
        let n_chunks = c.dtshape().n_chunks();
        let full = vec![T::zero(); c.dtshape().chunk_items()];
        let ndim = c.ndim();
        Ok(Self {
            c,
            part: Vec::default(),
            full,
            nchunk: 0,
            n_chunks,
            outstanding: false,
            part_index: GridCoord::from_elem(0, ndim),
            elem_index: GridCoord::from_elem(0, ndim),
            part_shape: GridCoord::from_elem(0, ndim),
        })
    }

    pub fn has_next(&self) -> bool {
        let consumed = self.nchunk + usize::from(self.outstanding);
        consumed < self.n_chunks
    }

    fn commit(&mut self) -> Result<()> {
        self.full.fill(T::zero());
        let zeros = GridCoord::from_elem(0, self.part_shape.len());
        for (dst, src, len) in
            BoxSpans::new(&zeros, &self.part_shape, self.c.dtshape().chunk_shape())
        {
            self.full[dst..dst + len].copy_from_slice(&self.part[src..src + len]);
        }
        self.c.append_chunk_items(self.nchunk, &self.full)?;
        self.nchunk += 1;
        self.outstanding = false;
        Ok(())
    }

    pub fn next(&mut self) -> Result<ChunkValue<'_, T>> {
        if self.outstanding {
            self.commit()?;
        }
        if self.nchunk >= self.n_chunks {
            return Err(Error::EndIter);
        }
        self.part_index = self.c.dtshape().chunk_coord(self.nchunk);
        self.elem_index = self.c.dtshape().chunk_origin(self.nchunk);
        self.part_shape = self.c.dtshape().chunk_clamped_shape(self.nchunk);
        let items: usize = self.part_shape.iter().product::<u64>() as usize;
        self.part.clear();
        self.part.resize(items, T::zero());
        self.outstanding = true;
        Ok(ChunkValue {
            part_index: &self.part_index,
            elem_index: &self.elem_index,
            shape: &self.part_shape,
            nelem: self.nchunk as u64,
            data: &mut self.part,
        })
    }

    pub fn finish(mut self) -> Result<()> {
        if self.outstanding {
            self.commit()?;
        }
        while self.nchunk < self.n_chunks {
            self.part_shape = self.c.dtshape().chunk_clamped_shape(self.nchunk);
            let items: usize = self.part_shape.iter().product::<u64>() as usize;
            self.part.clear();
            self.part.resize(items, T::zero());
            self.commit()?;
        }
        self.c.flush()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReadValue<T> {
    pub index: GridCoord,
    pub nelem: u64,
    pub value: T,
}

/// Element-wise read in logical row-major visiting order of each chunk;
/// one decompressed chunk is resident at a time.
pub struct ReadIter<'a, T: Element> {
    c: &'a Container,
    cursor: Cursor,
    buf: Vec<T>,
    cont: u64,
    cur_chunk: Option<usize>,
}

impl<'a, T: Element> ReadIter<'a, T> {
    pub fn new(c: &'a Container) -> Result<Self> {
        if T::DTYPE != c.dtype() {
            return Err(Error::InvalidDtype);
        }
        if !c.is_complete() {
            return Err(Error::invalid_argument("container is not fully written"));
        }
        let cursor = Cursor::new(c);
        let buf = vec![T::zero(); cursor.chunk_items as usize];
        Ok(Self {
            c,
            cursor,
            buf,
            cont: 0,
            cur_chunk: None,
        })
    }

    pub fn has_next(&self) -> bool {
        self.cont < self.cursor.esize
    }
}

impl<'a, T: Element> Iterator for ReadIter<'a, T> {
    type Item = Result<ReadValue<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.has_next() {
            return None;
        }
        let nchunk = self.cursor.nchunk(self.cont);
        if self.cur_chunk != Some(nchunk) {
            let res = self
                .c
                .sc()
                .decompress_chunk(nchunk, bytemuck::cast_slice_mut::<T, u8>(self.buf.as_mut_slice()));
            if let Err(e) = res {
                self.cont = self.cursor.esize;
                return Some(Err(e));
            }
            self.cur_chunk = Some(nchunk);
        }
        let mut index = GridCoord::from_elem(0, self.cursor.shape.len());
        self.cursor.global(self.cont, &mut index);
        let nelem = shape::nd_to_flat(&index, &self.cursor.shape);
        let value = self.buf[self.cursor.within(self.cont)];
        let mut scratch = [0u64; crate::DIMENSION_MAX];
        self.cont = self
            .cursor
            .skip_padding(self.cont + 1, &mut scratch[..index.len()]);
        Some(Ok(ReadValue {
            index,
            nelem,
            value,
        }))
    }
}

pub struct BlockValue<'i, T> {
    pub block_index: &'i [u64],
    pub elem_index: &'i [u64],
    /// Block shape, truncated at array edges.
    pub shape: &'i [u64],
    pub nelem: u64,
    /// Dense row-major panel of `shape`.
    pub data: &'i [T],
}

/// Block-wise read with a caller-chosen block shape; works on containers
/// and views alike.
pub struct ReadBlockIter<'a, R: NdRead, T: Element> {
    r: &'a R,
    block_shape: GridCoord,
    grid: GridCoord,
    nblock: usize,
    n_blocks: usize,
    buf: Vec<T>,
    block_index: GridCoord,
    elem_index: GridCoord,
    cur_shape: GridCoord,
}

impl<'a, R: NdRead, T: Element> ReadBlockIter<'a, R, T> {
    pub fn new(r: &'a R, block_shape: &[u64]) -> Result<Self> {
        let d = r.dtshape();
        if T::DTYPE != d.dtype() {
            return Err(Error::InvalidDtype);
        }
        if block_shape.len() != d.ndim() {
            return Err(Error::invalid_argument("block shape has wrong rank"));
        }
        if block_shape.iter().any(|b| *b == 0) {
            return Err(Error::invalid_argument("block extent of zero"));
        }
        let grid: GridCoord = d
            .shape()
            .iter()
            .zip(block_shape.iter())
            .map(|(s, b)| shape::div_ceil(*s, *b))
            .collect();
        let n_blocks = grid.iter().product::<u64>() as usize;
        let ndim = d.ndim();
        Ok(Self {
            r,
            block_shape: block_shape.iter().copied().collect(),
            grid,
            nblock: 0,
            n_blocks,
            buf: Vec::default(),
            block_index: GridCoord::from_elem(0, ndim),
            elem_index: GridCoord::from_elem(0, ndim),
            cur_shape: GridCoord::from_elem(0, ndim),
        })
    }

    pub fn has_next(&self) -> bool {
        self.nblock < self.n_blocks
    }

    pub fn next(&mut self) -> Result<BlockValue<'_, T>> {
        if !self.has_next() {
            return Err(Error::EndIter);
        }
        let d = self.r.dtshape();
        shape::flat_to_nd(self.nblock as u64, &self.grid, &mut self.block_index);
        for i in 0..d.ndim() {
            self.elem_index[i] = self.block_index[i] * self.block_shape[i];
            self.cur_shape[i] =
                (self.elem_index[i] + self.block_shape[i]).min(d.shape()[i]) - self.elem_index[i];
        }
        let stop: GridCoord = self
            .elem_index
            .iter()
            .zip(self.cur_shape.iter())
            .map(|(s, e)| s + e)
            .collect();
        let items: usize = self.cur_shape.iter().product::<u64>() as usize;
        self.buf.clear();
        self.buf.resize(items, T::zero());
        self.r.read_box(&self.elem_index, &stop, &mut self.buf)?;
        let nelem = self.nblock as u64;
        self.nblock += 1;
        Ok(BlockValue {
            block_index: &self.block_index,
            elem_index: &self.elem_index,
            shape: &self.cur_shape,
            nelem,
            data: &self.buf,
        })
    }
}
