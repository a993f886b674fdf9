//! The chunked array container: shape metadata plus an owned super-chunk.

use bytemuck::Pod;
use itertools::izip;
use num_traits::Float;

use crate::codec::{CodecParams, FooterMeta, Storage, SuperChunk};
use crate::shape::{self, BoxSpans, DType, DtShape};
use crate::{Context, Error, GridCoord, Ndim, Result, SliceCoord};

/// Scalar types a container can hold.
pub trait Element: Copy + Send + Sync + Pod + Float + PartialOrd + std::fmt::Debug + 'static {
    const DTYPE: DType;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;

    fn from_f64(v: f64) -> Self {
        v as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;

    fn from_f64(v: f64) -> Self {
        v
    }

    fn to_f64(self) -> f64 {
        self
    }
}

/// Read-side surface shared by containers and views.
pub trait NdRead {
    fn dtshape(&self) -> &DtShape;

    /// Copy the box `[start, stop)` (already normalized against the logical
    /// shape) into `out` as a dense row-major buffer.
    fn read_box<T: Element>(&self, start: &[u64], stop: &[u64], out: &mut [T]) -> Result<()>;

    /// Slice with signed bounds; negative indices wrap.
    fn slice_buffer<T: Element>(&self, start: &[i64], stop: &[i64], out: &mut [T]) -> Result<()> {
        let (s, e) = shape::normalize_slice(start, stop, self.dtshape().shape())?;
        self.read_box(&s, &e, out)
    }

    fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        let dtshape = self.dtshape();
        let mut out = vec![T::zero(); dtshape.n_items()];
        let start = GridCoord::from_elem(0, dtshape.ndim());
        let stop: GridCoord = dtshape.shape().iter().copied().collect();
        self.read_box(&start, &stop, &mut out)?;
        Ok(out)
    }
}

pub struct Container {
    meta: FooterMeta,
    sc: SuperChunk,
    storage: Storage,
}

impl Ndim for Container {
    fn ndim(&self) -> usize {
        self.meta.dtshape.ndim()
    }
}

fn check_dtype<T: Element>(dtshape: &DtShape) -> Result<()> {
    if T::DTYPE != dtshape.dtype() {
        return Err(Error::InvalidDtype);
    }
    Ok(())
}

fn superchunk_params(ctx: &Context, dtshape: &DtShape) -> Result<CodecParams> {
    let cfg = ctx.config();
    let item = dtshape.item_size();
    let chunk_nbytes = dtshape.chunk_items() * item;
    let mut block_nbytes = dtshape.block_items() * item;
    if dtshape.block_items() == dtshape.chunk_items() && cfg.block_size_hint > 0 {
        // no explicit block shape: take the advisory codec block size
        block_nbytes = (cfg.block_size_hint / item).max(1) * item;
    }
    CodecParams::new(cfg, item, chunk_nbytes, block_nbytes)
}

impl Container {
    /// Reserve a container without writing any chunk. Contents are
    /// undefined until a write iterator (or an evaluation) fills them.
    pub fn empty(ctx: &Context, dtshape: DtShape, storage: &Storage) -> Result<Self> {
        let params = superchunk_params(ctx, &dtshape)?;
        let sc = SuperChunk::create(params.clone(), storage)?;
        let cfg = ctx.config();
        let meta = FooterMeta {
            dtshape,
            codec: cfg.codec,
            level: cfg.level,
            filters: cfg.filters.clone(),
            fp_mantissa_bits: cfg.fp_mantissa_bits,
            block_nbytes: params.block_nbytes,
            contiguous: matches!(storage, Storage::File(_)),
        };
        Ok(Self {
            meta,
            sc,
            storage: storage.clone(),
        })
    }

    pub fn zeros(ctx: &Context, dtshape: DtShape, storage: &Storage) -> Result<Self> {
        Self::fill(ctx, dtshape, 0.0, storage)
    }

    pub fn ones(ctx: &Context, dtshape: DtShape, storage: &Storage) -> Result<Self> {
        Self::fill(ctx, dtshape, 1.0, storage)
    }

    pub fn fill(ctx: &Context, dtshape: DtShape, value: f64, storage: &Storage) -> Result<Self> {
        match dtshape.dtype() {
            DType::F64 => Self::build_with::<f64>(ctx, dtshape, storage, |_| value),
            DType::F32 => Self::build_with::<f32>(ctx, dtshape, storage, |_| value as f32),
        }
    }

    /// `start + i * step` for each flat index `i`. The number of steps in
    /// `[start, stop)` must match the shape's item count.
    pub fn arange(
        ctx: &Context,
        dtshape: DtShape,
        start: f64,
        stop: f64,
        step: f64,
        storage: &Storage,
    ) -> Result<Self> {
        if step == 0.0 || (stop - start) / step < 0.0 {
            return Err(Error::invalid_argument("empty arange"));
        }
        let count = ((stop - start) / step).ceil() as usize;
        if count != dtshape.n_items() {
            return Err(Error::invalid_argument(
                "arange does not produce the shape's item count",
            ));
        }
        match dtshape.dtype() {
            DType::F64 => {
                Self::build_with::<f64>(ctx, dtshape, storage, |i| start + i as f64 * step)
            }
            DType::F32 => {
                Self::build_with::<f32>(ctx, dtshape, storage, |i| (start + i as f64 * step) as f32)
            }
        }
    }

    /// Endpoint-inclusive: `x_i = a + i * (b - a) / (n - 1)`; `n == 1`
    /// yields `[a]`.
    pub fn linspace(
        ctx: &Context,
        dtshape: DtShape,
        start: f64,
        stop: f64,
        storage: &Storage,
    ) -> Result<Self> {
        let n = dtshape.n_items();
        let f = move |i: u64| {
            if n == 1 {
                start
            } else {
                start + i as f64 * (stop - start) / (n - 1) as f64
            }
        };
        match dtshape.dtype() {
            DType::F64 => Self::build_with::<f64>(ctx, dtshape, storage, f),
            DType::F32 => Self::build_with::<f32>(ctx, dtshape, storage, move |i| f(i) as f32),
        }
    }

    /// `base ^ linspace(a, b)`.
    pub fn logspace(
        ctx: &Context,
        dtshape: DtShape,
        start: f64,
        stop: f64,
        base: f64,
        storage: &Storage,
    ) -> Result<Self> {
        let n = dtshape.n_items();
        let f = move |i: u64| {
            let e = if n == 1 {
                start
            } else {
                start + i as f64 * (stop - start) / (n - 1) as f64
            };
            base.powf(e)
        };
        match dtshape.dtype() {
            DType::F64 => Self::build_with::<f64>(ctx, dtshape, storage, f),
            DType::F32 => Self::build_with::<f32>(ctx, dtshape, storage, move |i| f(i) as f32),
        }
    }

    /// Uniform draws in `[0, 1)` from a seeded bit-stream generator.
    pub fn random_uniform(
        ctx: &Context,
        dtshape: DtShape,
        seed: u64,
        storage: &Storage,
    ) -> Result<Self> {
        let f = move |i: u64| bits_to_unit(splitmix64(seed.wrapping_add(i)));
        match dtshape.dtype() {
            DType::F64 => Self::build_with::<f64>(ctx, dtshape, storage, f),
            DType::F32 => Self::build_with::<f32>(ctx, dtshape, storage, move |i| f(i) as f32),
        }
    }

    /// Standard normal draws (Box-Muller over the same bit stream).
    pub fn random_normal(
        ctx: &Context,
        dtshape: DtShape,
        seed: u64,
        storage: &Storage,
    ) -> Result<Self> {
        let f = move |i: u64| {
            let u1 = bits_to_unit(splitmix64(seed.wrapping_add(2 * i))).max(f64::MIN_POSITIVE);
            let u2 = bits_to_unit(splitmix64(seed.wrapping_add(2 * i + 1)));
            (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
        };
        match dtshape.dtype() {
            DType::F64 => Self::build_with::<f64>(ctx, dtshape, storage, f),
            DType::F32 => Self::build_with::<f32>(ctx, dtshape, storage, move |i| f(i) as f32),
        }
    }

    /// Split a dense row-major buffer into chunks; padding cells are
    /// written as zero.
    pub fn from_buffer<T: Element>(
        ctx: &Context,
        dtshape: DtShape,
        buf: &[T],
        storage: &Storage,
    ) -> Result<Self> {
        check_dtype::<T>(&dtshape)?;
        if buf.len() != dtshape.n_items() {
            return Err(Error::invalid_argument(
                "buffer length does not match the shape",
            ));
        }
        let mut c = Self::empty(ctx, dtshape, storage)?;
        let mut chunk: Vec<T> = vec![T::zero(); c.meta.dtshape.chunk_items()];
        for nchunk in 0..c.meta.dtshape.n_chunks() {
            chunk.fill(T::zero());
            for (src, dst, len) in chunk_spans(&c.meta.dtshape, nchunk) {
                chunk[dst..dst + len].copy_from_slice(&buf[src..src + len]);
            }
            c.append_chunk_items(nchunk, &chunk)?;
        }
        c.flush()?;
        Ok(c)
    }

    /// Reopen a persisted container from its metadata footer.
    pub fn from_file(_ctx: &Context, path: &std::path::Path) -> Result<Self> {
        let path_buf = path.to_path_buf();
        let (sc, meta) = SuperChunk::open(&path_buf)?;
        if sc.n_chunks() != meta.dtshape.n_chunks() {
            return Err(Error::codec("persisted chunk count mismatches its shape"));
        }
        Ok(Self {
            meta,
            sc,
            storage: Storage::File(path_buf),
        })
    }

    fn build_with<T: Element>(
        ctx: &Context,
        dtshape: DtShape,
        storage: &Storage,
        f: impl Fn(u64) -> T,
    ) -> Result<Self> {
        check_dtype::<T>(&dtshape)?;
        let mut c = Self::empty(ctx, dtshape, storage)?;
        let mut chunk: Vec<T> = vec![T::zero(); c.meta.dtshape.chunk_items()];
        for nchunk in 0..c.meta.dtshape.n_chunks() {
            chunk.fill(T::zero());
            for (src, dst, len) in chunk_spans(&c.meta.dtshape, nchunk) {
                for k in 0..len {
                    chunk[dst + k] = f((src + k) as u64);
                }
            }
            c.append_chunk_items(nchunk, &chunk)?;
        }
        c.flush()?;
        Ok(c)
    }

    pub fn dtype(&self) -> DType {
        self.meta.dtshape.dtype()
    }

    pub fn shape(&self) -> &[u64] {
        self.meta.dtshape.shape()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Uncompressed and compressed byte totals.
    pub fn info(&self) -> (u64, u64) {
        self.sc.info()
    }

    /// Whether every chunk of the logical shape has been written.
    pub fn is_complete(&self) -> bool {
        self.sc.n_chunks() >= self.meta.dtshape.n_chunks()
    }

    /// Drop length-1 axes in place.
    pub fn squeeze(&mut self) {
        self.meta.dtshape.squeeze();
    }

    /// Materialized copy of the box `[start, stop)` (signed bounds wrap).
    /// The copy keeps this container's chunking, clamped to the new shape.
    pub fn slice(
        &self,
        ctx: &Context,
        start: &[i64],
        stop: &[i64],
        storage: &Storage,
    ) -> Result<Container> {
        let dtshape = self.meta.dtshape.clone();
        let (s, e) = shape::normalize_slice(start, stop, dtshape.shape())?;
        let out_shape: GridCoord = s.iter().zip(e.iter()).map(|(a, b)| b - a).collect();
        if out_shape.iter().any(|d| *d == 0) {
            return Err(Error::invalid_argument("slice is empty"));
        }
        let chunk: GridCoord = dtshape
            .chunk_shape()
            .iter()
            .zip(out_shape.iter())
            .map(|(c, s)| (*c).min(*s))
            .collect();
        let block: GridCoord = dtshape
            .block_shape()
            .iter()
            .zip(chunk.iter())
            .map(|(b, c)| (*b).min(*c))
            .collect();
        let out_dtshape = DtShape::new(dtshape.dtype(), &out_shape)?
            .with_chunk_shape(&chunk)?
            .with_block_shape(&block)?;
        match dtshape.dtype() {
            DType::F64 => {
                let mut buf = vec![0f64; shape::box_items(&s, &e)];
                self.read_box(&s, &e, &mut buf)?;
                Self::from_buffer(ctx, out_dtshape, &buf, storage)
            }
            DType::F32 => {
                let mut buf = vec![0f32; shape::box_items(&s, &e)];
                self.read_box(&s, &e, &mut buf)?;
                Self::from_buffer(ctx, out_dtshape, &buf, storage)
            }
        }
    }

    /// Zero-copy view of the box `[start, stop)`; borrows this container.
    pub fn slice_view(&self, start: &[i64], stop: &[i64]) -> Result<ArrayView<'_>> {
        let (s, e) = shape::normalize_slice(start, stop, self.meta.dtshape.shape())?;
        let out_shape: GridCoord = s.iter().zip(e.iter()).map(|(a, b)| b - a).collect();
        if out_shape.iter().any(|d| *d == 0) {
            return Err(Error::invalid_argument("view is empty"));
        }
        let chunk: GridCoord = self
            .meta
            .dtshape
            .chunk_shape()
            .iter()
            .zip(out_shape.iter())
            .map(|(c, s)| (*c).min(*s))
            .collect();
        let dtshape = DtShape::new(self.dtype(), &out_shape)?.with_chunk_shape(&chunk)?;
        Ok(ArrayView {
            parent: self,
            offset: s,
            dtshape,
        })
    }

    /// Relative comparison; mirrors the tolerance rule of the original
    /// container checks.
    pub fn almost_equal(&self, other: &Container, tol: f64) -> Result<bool> {
        if self.dtype() != other.dtype() {
            return Err(Error::InvalidDtype);
        }
        if self.shape() != other.shape() {
            return Err(Error::invalid_argument("shape mismatch"));
        }
        match self.dtype() {
            DType::F64 => almost_equal_typed::<f64>(self, other, tol),
            DType::F32 => almost_equal_typed::<f32>(self, other, tol),
        }
    }

    /// Write the chunk index and metadata footer for file-backed storage.
    pub fn flush(&mut self) -> Result<()> {
        let meta = self.meta.clone();
        self.sc.flush(&meta)
    }

    /// Flush and release the container.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }

    pub(crate) fn sc(&self) -> &SuperChunk {
        &self.sc
    }

    pub(crate) fn sc_mut(&mut self) -> &mut SuperChunk {
        &mut self.sc
    }

    /// Append a full chunk buffer as chunk `nchunk`, truncating the stored
    /// item count at a rank-1 tail.
    pub(crate) fn append_chunk_items<T: Element>(&mut self, nchunk: usize, chunk: &[T]) -> Result<()> {
        let stored = self.meta.dtshape.chunk_stored_items(nchunk);
        let bytes = bytemuck::cast_slice::<T, u8>(&chunk[..stored]);
        self.sc.append_raw(bytes)?;
        Ok(())
    }
}

impl NdRead for Container {
    fn dtshape(&self) -> &DtShape {
        &self.meta.dtshape
    }

    fn read_box<T: Element>(&self, start: &[u64], stop: &[u64], out: &mut [T]) -> Result<()> {
        check_dtype::<T>(&self.meta.dtshape)?;
        if !self.is_complete() {
            return Err(Error::invalid_argument("container is not fully written"));
        }
        let n = shape::box_items(start, stop);
        if out.len() < n {
            return Err(Error::invalid_argument("output buffer too small for box"));
        }
        if n == 0 {
            return Ok(());
        }
        let dtshape = &self.meta.dtshape;
        let ndim = dtshape.ndim();
        let grid = dtshape.chunk_grid();
        let cshape = dtshape.chunk_shape();

        // chunk-grid sub-box covering the request
        let g_first: GridCoord = start.iter().zip(cshape.iter()).map(|(s, c)| s / c).collect();
        let g_last: GridCoord = stop
            .iter()
            .zip(cshape.iter())
            .map(|(e, c)| (e - 1) / c)
            .collect();

        let box_shape: GridCoord = start.iter().zip(stop.iter()).map(|(s, e)| e - s).collect();
        let mut scratch: Vec<T> = vec![T::zero(); dtshape.chunk_items()];

        let mut gc = g_first.clone();
        loop {
            let nchunk = shape::nd_to_flat(&gc, &grid) as usize;
            let origin: GridCoord = gc.iter().zip(cshape.iter()).map(|(g, c)| g * c).collect();

            let inter_start: GridCoord = origin
                .iter()
                .zip(start.iter())
                .map(|(o, s)| (*o).max(*s))
                .collect();
            let inter_stop: GridCoord = origin
                .iter()
                .zip(cshape.iter().zip(stop.iter()))
                .map(|(o, (c, e))| (o + c).min(*e))
                .collect();

            self.sc
                .decompress_chunk(nchunk, bytemuck::cast_slice_mut::<T, u8>(scratch.as_mut_slice()))?;

            let local_start: GridCoord = inter_start
                .iter()
                .zip(origin.iter())
                .map(|(a, o)| a - o)
                .collect();
            let local_stop: GridCoord = inter_stop
                .iter()
                .zip(origin.iter())
                .map(|(a, o)| a - o)
                .collect();
            let dst_start: GridCoord = inter_start
                .iter()
                .zip(start.iter())
                .map(|(a, s)| a - s)
                .collect();
            let dst_stop: GridCoord = inter_stop
                .iter()
                .zip(start.iter())
                .map(|(a, s)| a - s)
                .collect();

            let src_spans = BoxSpans::new(&local_start, &local_stop, cshape);
            let dst_spans = BoxSpans::new(&dst_start, &dst_stop, &box_shape);
            for ((src, _, len), (dst, _, _)) in izip!(src_spans, dst_spans) {
                out[dst..dst + len].copy_from_slice(&scratch[src..src + len]);
            }

            // advance over the chunk-grid sub-box
            let mut dim = ndim;
            loop {
                if dim == 0 {
                    return Ok(());
                }
                dim -= 1;
                gc[dim] += 1;
                if gc[dim] <= g_last[dim] {
                    break;
                }
                gc[dim] = g_first[dim];
            }
        }
    }
}

/// Read-only window into a parent container.
pub struct ArrayView<'a> {
    parent: &'a Container,
    offset: GridCoord,
    dtshape: DtShape,
}

impl<'a> Ndim for ArrayView<'a> {
    fn ndim(&self) -> usize {
        self.dtshape.ndim()
    }
}

impl<'a> NdRead for ArrayView<'a> {
    fn dtshape(&self) -> &DtShape {
        &self.dtshape
    }

    fn read_box<T: Element>(&self, start: &[u64], stop: &[u64], out: &mut [T]) -> Result<()> {
        let s: GridCoord = start
            .iter()
            .zip(self.offset.iter())
            .map(|(a, o)| a + o)
            .collect();
        let e: GridCoord = stop
            .iter()
            .zip(self.offset.iter())
            .map(|(a, o)| a + o)
            .collect();
        self.parent.read_box(&s, &e, out)
    }
}

impl<'a> ArrayView<'a> {
    /// Copy the view out into its own container.
    pub fn materialize(&self, ctx: &Context, storage: &Storage) -> Result<Container> {
        let stop: SliceCoord = self
            .offset
            .iter()
            .zip(self.dtshape.shape().iter())
            .map(|(o, s)| (o + s) as i64)
            .collect();
        let start: SliceCoord = self.offset.iter().map(|o| *o as i64).collect();
        self.parent.slice(ctx, &start, &stop, storage)
    }
}

fn almost_equal_typed<T: Element>(a: &Container, b: &Container, tol: f64) -> Result<bool> {
    let av = a.to_vec::<T>()?;
    let bv = b.to_vec::<T>()?;
    for (x, y) in av.iter().zip(bv.iter()) {
        let (x, y) = ((*x).to_f64(), (*y).to_f64());
        let rel = if x == 0.0 {
            y.abs()
        } else {
            ((x - y) / x).abs()
        };
        if rel > tol {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Spans aligning a chunk's logical region between the global flat layout
/// and the chunk's own row-major layout: yields `(global, chunk, len)` runs.
pub(crate) fn chunk_spans(
    dtshape: &DtShape,
    nchunk: usize,
) -> impl Iterator<Item = (usize, usize, usize)> {
    let origin = dtshape.chunk_origin(nchunk);
    let clamped = dtshape.chunk_clamped_shape(nchunk);
    let stop: GridCoord = origin.iter().zip(clamped.iter()).map(|(o, c)| o + c).collect();
    let zeros = GridCoord::from_elem(0, dtshape.ndim());
    let global = BoxSpans::new(&origin, &stop, dtshape.shape());
    let local = BoxSpans::new(&zeros, &clamped, dtshape.chunk_shape());
    global
        .zip(local)
        .map(|((g, _, len), (l, _, _))| (g, l, len))
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
    z ^ (z >> 31)
}

fn bits_to_unit(bits: u64) -> f64 {
    (bits >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::with_defaults().unwrap()
    }

    fn dts(shape: &[u64], chunks: &[u64]) -> DtShape {
        DtShape::new(DType::F64, shape)
            .unwrap()
            .with_chunk_shape(chunks)
            .unwrap()
    }

    #[test]
    fn buffer_roundtrip_padded() {
        let ctx = ctx();
        let buf: Vec<f64> = (0..10 * 10).map(|i| i as f64).collect();
        let c = Container::from_buffer(
            &ctx,
            dts(&[10, 10], &[4, 7]),
            &buf,
            &Storage::InMemory,
        )
        .unwrap();
        assert_eq!(c.to_vec::<f64>().unwrap(), buf);
    }

    #[test]
    fn rank1_tail_is_truncated() {
        let ctx = ctx();
        let buf: Vec<f64> = (0..7).map(|i| i as f64).collect();
        let c = Container::from_buffer(&ctx, dts(&[7], &[4]), &buf, &Storage::InMemory).unwrap();
        assert_eq!(c.sc().chunk_raw_len(1).unwrap(), 3 * 8);
        assert_eq!(c.to_vec::<f64>().unwrap(), buf);
    }

    #[test]
    fn constructor_fills() {
        let ctx = ctx();
        let z = Container::zeros(&ctx, dts(&[6, 5], &[4, 2]), &Storage::InMemory).unwrap();
        assert!(z.to_vec::<f64>().unwrap().iter().all(|v| *v == 0.0));
        let o = Container::ones(&ctx, dts(&[6, 5], &[4, 2]), &Storage::InMemory).unwrap();
        assert!(o.to_vec::<f64>().unwrap().iter().all(|v| *v == 1.0));

        let l =
            Container::linspace(&ctx, dts(&[11], &[4]), 2.0, 7.0, &Storage::InMemory).unwrap();
        let lv = l.to_vec::<f64>().unwrap();
        assert_eq!(lv[0], 2.0);
        assert_eq!(lv[10], 7.0);
        assert!((lv[1] - 2.5).abs() < 1e-12);

        let a = Container::arange(&ctx, dts(&[10], &[3]), 0.0, 20.0, 2.0, &Storage::InMemory)
            .unwrap();
        assert_eq!(a.to_vec::<f64>().unwrap()[9], 18.0);

        let g = Container::logspace(&ctx, dts(&[5], &[2]), 0.0, 4.0, 10.0, &Storage::InMemory)
            .unwrap();
        let gv = g.to_vec::<f64>().unwrap();
        assert!((gv[2] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn arange_count_must_match() {
        let ctx = ctx();
        assert!(
            Container::arange(&ctx, dts(&[9], &[3]), 0.0, 20.0, 2.0, &Storage::InMemory).is_err()
        );
    }

    #[test]
    fn dtype_checked_on_export() {
        let ctx = ctx();
        let c = Container::zeros(&ctx, dts(&[4], &[2]), &Storage::InMemory).unwrap();
        assert!(matches!(c.to_vec::<f32>(), Err(Error::InvalidDtype)));
    }

    #[test]
    fn read_box_subsets() {
        let ctx = ctx();
        let buf: Vec<f64> = (0..1000).map(|i| i as f64).collect();
        let c = Container::from_buffer(
            &ctx,
            dts(&[10, 10, 10], &[3, 4, 5]),
            &buf,
            &Storage::InMemory,
        )
        .unwrap();
        let mut out = vec![0f64; 3 * 7 * 7];
        c.read_box(&[3, 0, 3], &[6, 7, 10], &mut out).unwrap();
        let mut at = 0;
        for i in 3..6 {
            for j in 0..7 {
                for k in 3..10 {
                    assert_eq!(out[at], (100 * i + 10 * j + k) as f64);
                    at += 1;
                }
            }
        }
    }

    #[test]
    fn views_window_their_parent() {
        let ctx = ctx();
        let buf: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let c =
            Container::from_buffer(&ctx, dts(&[10, 10], &[4, 4]), &buf, &Storage::InMemory)
                .unwrap();
        let v = c.slice_view(&[2, 3], &[5, -2]).unwrap();
        assert_eq!(v.dtshape().shape(), &[3, 5]);
        let vv = v.to_vec::<f64>().unwrap();
        assert_eq!(vv[0], 23.0);
        assert_eq!(vv[4], 27.0);
        assert_eq!(vv[14], 47.0);

        let m = v.materialize(&ctx, &Storage::InMemory).unwrap();
        assert_eq!(m.to_vec::<f64>().unwrap(), vv);
    }

    #[test]
    fn squeeze_keeps_data() {
        let ctx = ctx();
        let buf: Vec<f64> = (0..12).map(|i| i as f64).collect();
        let mut c = Container::from_buffer(
            &ctx,
            dts(&[1, 4, 1, 3], &[1, 2, 1, 3]),
            &buf,
            &Storage::InMemory,
        )
        .unwrap();
        c.squeeze();
        assert_eq!(c.shape(), &[4, 3]);
        assert_eq!(c.to_vec::<f64>().unwrap(), buf);
    }

    #[test]
    fn almost_equal_tolerance() {
        let ctx = ctx();
        let a = Container::linspace(&ctx, dts(&[50], &[16]), 1.0, 2.0, &Storage::InMemory)
            .unwrap();
        let b = Container::linspace(
            &ctx,
            dts(&[50], &[16]),
            1.0 + 1e-9,
            2.0 + 1e-9,
            &Storage::InMemory,
        )
        .unwrap();
        assert!(a.almost_equal(&b, 1e-6).unwrap());
        assert!(!a.almost_equal(&b, 1e-12).unwrap());
    }

    #[test]
    fn random_constructors_are_deterministic() {
        let ctx = ctx();
        let a = Container::random_uniform(&ctx, dts(&[100], &[32]), 7, &Storage::InMemory)
            .unwrap();
        let b = Container::random_uniform(&ctx, dts(&[100], &[32]), 7, &Storage::InMemory)
            .unwrap();
        let av = a.to_vec::<f64>().unwrap();
        assert_eq!(av, b.to_vec::<f64>().unwrap());
        assert!(av.iter().all(|v| (0.0..1.0).contains(v)));

        let n = Container::random_normal(&ctx, dts(&[1000], &[128]), 3, &Storage::InMemory)
            .unwrap();
        let nv = n.to_vec::<f64>().unwrap();
        let mean: f64 = nv.iter().sum::<f64>() / nv.len() as f64;
        assert!(mean.abs() < 0.2);
    }
}
