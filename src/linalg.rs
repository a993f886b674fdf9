//! Matrix products over compressed operands.
//!
//! `C = A · B` runs as a compute-in-prefilter pipeline: `B` is decompressed
//! once into a dense cache; for each output row-slab chunk a row cache of
//! `A` is gathered, and while the output chunk is compressed the codec asks
//! a [BlockProducer] for each block, which answers with one GEMM straight
//! into the codec's block buffer. The full result matrix is never resident.
//!
//! Transpose flags are honoured by swapping strides in the kernel call;
//! compressed operands are never physically reordered.

use crate::codec::{self, BlockProducer, Storage};
use crate::container::{Element, NdRead};
use crate::shape::{DType, DtShape};
use crate::{Container, Context, Error, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct MatmulParams {
    pub transpose_a: bool,
    pub transpose_b: bool,
}

/// `A (M, K) · B (K, N) -> C (M, N)`.
pub fn matmul(ctx: &Context, a: &Container, b: &Container, params: MatmulParams) -> Result<Container> {
    if b.shape().len() != 2 {
        return Err(Error::invalid_argument("matmul needs a rank-2 right operand"));
    }
    dispatch(ctx, a, b, params)
}

/// `A (M, K) · x (K,) -> y (M,)`.
pub fn matvec(ctx: &Context, a: &Container, b: &Container, transpose_a: bool) -> Result<Container> {
    if b.shape().len() != 1 {
        return Err(Error::invalid_argument("matvec needs a rank-1 right operand"));
    }
    dispatch(
        ctx,
        a,
        b,
        MatmulParams {
            transpose_a,
            transpose_b: false,
        },
    )
}

fn dispatch(ctx: &Context, a: &Container, b: &Container, params: MatmulParams) -> Result<Container> {
    if a.dtype() != b.dtype() {
        return Err(Error::InvalidDtype);
    }
    if a.shape().len() != 2 {
        return Err(Error::invalid_argument("left operand must have rank 2"));
    }
    if !a.is_complete() || !b.is_complete() {
        return Err(Error::invalid_argument("operand container is not fully written"));
    }
    match a.dtype() {
        DType::F64 => pipeline::<f64>(ctx, a, b, params),
        DType::F32 => pipeline::<f32>(ctx, a, b, params),
    }
}

fn pipeline<T: Element + Gemm>(
    ctx: &Context,
    a: &Container,
    b: &Container,
    params: MatmulParams,
) -> Result<Container> {
    let (ta, tb) = (params.transpose_a, params.transpose_b);
    let vector_rhs = b.shape().len() == 1;

    // logical dimensions after transposition
    let (m, k) = if ta {
        (a.shape()[1], a.shape()[0])
    } else {
        (a.shape()[0], a.shape()[1])
    };
    let (kb, n) = if vector_rhs {
        (b.shape()[0], 1)
    } else if tb {
        (b.shape()[1], b.shape()[0])
    } else {
        (b.shape()[0], b.shape()[1])
    };
    if k != kb {
        return Err(Error::invalid_argument("inner dimensions do not agree"));
    }
    let (m, k, n) = (m as usize, k as usize, n as usize);

    // output row-slab chunking follows A's row partitioning
    let axis = usize::from(ta);
    let chunk_m = (a.dtshape().chunk_shape()[axis] as usize).min(m);
    let block_m = (a.dtshape().block_shape()[axis] as usize).min(chunk_m);
    let c_dtshape = if vector_rhs {
        DtShape::new(T::DTYPE, &[m as u64])?
            .with_chunk_shape(&[chunk_m as u64])?
            .with_block_shape(&[block_m as u64])?
    } else {
        DtShape::new(T::DTYPE, &[m as u64, n as u64])?
            .with_chunk_shape(&[chunk_m as u64, n as u64])?
            .with_block_shape(&[block_m as u64, n as u64])?
    };

    // the whole right operand, decompressed once
    let b_cache: Vec<T> = b.to_vec()?;
    let (rsb, csb) = if vector_rhs {
        (1isize, 1isize)
    } else if tb {
        (1isize, k as isize)
    } else {
        (n as isize, 1isize)
    };

    let mut c = Container::empty(ctx, c_dtshape.clone(), &Storage::InMemory)?;
    let out_params = c.sc().params().clone();
    let item_size = c_dtshape.item_size();

    let (rsa, csa) = if ta {
        (1isize, chunk_m as isize)
    } else {
        (k as isize, 1isize)
    };
    let mut a_cache: Vec<T> = vec![T::zero(); chunk_m * k];
    let mut a_panel: Vec<T> = if ta {
        vec![T::zero(); chunk_m * k]
    } else {
        Vec::default()
    };

    for nchunk in 0..c_dtshape.n_chunks() {
        let r0 = nchunk * chunk_m;
        let rows_here = chunk_m.min(m - r0);
        a_cache.fill(T::zero());
        if ta {
            // stored A is (K, M); gather columns and lay them out with a
            // row stride of one so only the kernel strides change
            let panel = &mut a_panel[..k * rows_here];
            a.read_box(
                &[0, r0 as u64],
                &[k as u64, (r0 + rows_here) as u64],
                panel,
            )?;
            for kk in 0..k {
                a_cache[kk * chunk_m..kk * chunk_m + rows_here]
                    .copy_from_slice(&panel[kk * rows_here..(kk + 1) * rows_here]);
            }
        } else {
            a.read_box(
                &[r0 as u64, 0],
                &[(r0 + rows_here) as u64, k as u64],
                &mut a_cache[..rows_here * k],
            )?;
        }

        let producer = GemmProducer::<T> {
            a_cache: &a_cache,
            b_cache: &b_cache,
            k,
            n,
            block_m,
            rsa,
            csa,
            rsb,
            csb,
        };
        let stored_bytes = c_dtshape.chunk_stored_items(nchunk) * item_size;
        let frame = ctx.install(|| {
            codec::compress_frame(&out_params, stored_bytes, &producer, ctx.parallel())
        })?;
        c.sc_mut().update_chunk(nchunk, frame)?;
    }
    c.flush()?;
    Ok(c)
}

/// Answers the codec's prefilter with one GEMM per output block.
struct GemmProducer<'p, T> {
    a_cache: &'p [T],
    b_cache: &'p [T],
    k: usize,
    n: usize,
    block_m: usize,
    rsa: isize,
    csa: isize,
    rsb: isize,
    csb: isize,
}

impl<'p, T: Element + Gemm> BlockProducer for GemmProducer<'p, T> {
    fn fill(&self, nblock: usize, out: &mut [u8]) {
        let out_t: &mut [T] = bytemuck::cast_slice_mut(out);
        let rows = out_t.len() / self.n;
        let a_offset = nblock * self.block_m * self.rsa as usize;
        unsafe {
            T::gemm(
                rows,
                self.k,
                self.n,
                T::one(),
                self.a_cache.as_ptr().add(a_offset),
                self.rsa,
                self.csa,
                self.b_cache.as_ptr(),
                self.rsb,
                self.csb,
                T::zero(),
                out_t.as_mut_ptr(),
                self.n as isize,
                1,
            );
        }
    }
}

/// Strided GEMM kernel; backed by `matrixmultiply`.
pub trait Gemm: Copy {
    #[allow(clippy::too_many_arguments)]
    unsafe fn gemm(
        m: usize,
        k: usize,
        n: usize,
        alpha: Self,
        a: *const Self,
        rsa: isize,
        csa: isize,
        b: *const Self,
        rsb: isize,
        csb: isize,
        beta: Self,
        c: *mut Self,
        rsc: isize,
        csc: isize,
    );
}

impl Gemm for f32 {
    unsafe fn gemm(
        m: usize,
        k: usize,
        n: usize,
        alpha: Self,
        a: *const Self,
        rsa: isize,
        csa: isize,
        b: *const Self,
        rsb: isize,
        csb: isize,
        beta: Self,
        c: *mut Self,
        rsc: isize,
        csc: isize,
    ) {
        matrixmultiply::sgemm(m, k, n, alpha, a, rsa, csa, b, rsb, csb, beta, c, rsc, csc)
    }
}

impl Gemm for f64 {
    unsafe fn gemm(
        m: usize,
        k: usize,
        n: usize,
        alpha: Self,
        a: *const Self,
        rsa: isize,
        csa: isize,
        b: *const Self,
        rsb: isize,
        csb: isize,
        beta: Self,
        c: *mut Self,
        rsc: isize,
        csc: isize,
    ) {
        matrixmultiply::dgemm(m, k, n, alpha, a, rsa, csa, b, rsb, csb, beta, c, rsc, csc)
    }
}

/// Portable reference kernels. These are the ground truth the pipeline is
/// checked against, and a fallback wherever the strided kernel is
/// unavailable.
pub mod reference {
    use crate::container::Element;

    /// Row-major `C (m, n) = A (m, k) · B (k, n)` triple loop.
    pub fn gemm<T: Element>(m: usize, k: usize, n: usize, a: &[T], b: &[T], c: &mut [T]) {
        for i in 0..m {
            for j in 0..n {
                let mut acc = T::zero();
                for l in 0..k {
                    acc = acc + a[i * k + l] * b[l * n + j];
                }
                c[i * n + j] = acc;
            }
        }
    }

    /// `y (m,) = A (m, k) · x (k,)`.
    pub fn gemv<T: Element>(m: usize, k: usize, a: &[T], x: &[T], y: &mut [T]) {
        for i in 0..m {
            let mut acc = T::zero();
            for l in 0..k {
                acc = acc + a[i * k + l] * x[l];
            }
            y[i] = acc;
        }
    }
}
