//! Matmul pipeline against the reference kernels, at the awkward sizes
//! where chunk and block edges land mid-matrix.

use tessera::codec::Storage;
use tessera::linalg::{self, MatmulParams};
use tessera::{CodecId, Config, Container, Context, DType, DtShape, NdRead};

fn dts(shape: &[u64], chunks: &[u64], blocks: &[u64]) -> DtShape {
    DtShape::new(DType::F64, shape)
        .unwrap()
        .with_chunk_shape(chunks)
        .unwrap()
        .with_block_shape(blocks)
        .unwrap()
}

#[test]
fn gemm_163x135x94() {
    const M: u64 = 163;
    const K: u64 = 135;
    const N: u64 = 94;

    let ctx = Context::new(Config {
        codec: CodecId::Zstd,
        level: 3,
        max_num_threads: 2,
        ..Config::default()
    })
    .unwrap();

    let a = Container::linspace(
        &ctx,
        dts(&[M, K], &[24, K], &[8, K]),
        0.0,
        10.0,
        &Storage::InMemory,
    )
    .unwrap();
    let b = Container::linspace(
        &ctx,
        dts(&[K, N], &[16, N], &[16, N]),
        0.0,
        10.0,
        &Storage::InMemory,
    )
    .unwrap();

    let c = linalg::matmul(&ctx, &a, &b, MatmulParams::default()).unwrap();
    assert_eq!(c.shape(), &[M, N]);

    let mut want = vec![0f64; (M * N) as usize];
    linalg::reference::gemm(
        M as usize,
        K as usize,
        N as usize,
        &a.to_vec::<f64>().unwrap(),
        &b.to_vec::<f64>().unwrap(),
        &mut want,
    );
    let got = c.to_vec::<f64>().unwrap();
    for (g, w) in got.iter().zip(want.iter()) {
        assert!(
            (g - w).abs() <= 1e-10 * w.abs().max(1.0),
            "{g} vs {w}"
        );
    }
}

#[test]
fn gemv_with_ragged_tail_chunk() {
    const M: u64 = 163;
    const K: u64 = 135;

    let ctx = Context::with_defaults().unwrap();
    let a = Container::linspace(
        &ctx,
        dts(&[M, K], &[40, K], &[10, K]),
        -1.0,
        1.0,
        &Storage::InMemory,
    )
    .unwrap();
    let x = Container::linspace(&ctx, dts(&[K], &[64], &[32]), 0.5, 2.5, &Storage::InMemory)
        .unwrap();

    let y = linalg::matvec(&ctx, &a, &x, false).unwrap();
    assert_eq!(y.shape(), &[M]);
    // 163 rows over 40-row chunks leaves a 3-row tail
    let mut want = vec![0f64; M as usize];
    linalg::reference::gemv(
        M as usize,
        K as usize,
        &a.to_vec::<f64>().unwrap(),
        &x.to_vec::<f64>().unwrap(),
        &mut want,
    );
    let got = y.to_vec::<f64>().unwrap();
    for (g, w) in got.iter().zip(want.iter()) {
        assert!((g - w).abs() <= 1e-12 * w.abs().max(1.0));
    }
}

#[test]
fn transposed_gemv() {
    const M: u64 = 57;
    const K: u64 = 33;

    let ctx = Context::with_defaults().unwrap();
    // stored as Aᵀ (K, M); logical A is (M, K)
    let at = Container::linspace(
        &ctx,
        dts(&[K, M], &[K, 16], &[K, 4]),
        0.0,
        5.0,
        &Storage::InMemory,
    )
    .unwrap();
    let x = Container::linspace(&ctx, dts(&[K], &[K], &[K]), 1.0, 2.0, &Storage::InMemory)
        .unwrap();

    let y = linalg::matvec(&ctx, &at, &x, true).unwrap();
    assert_eq!(y.shape(), &[M]);

    let atv = at.to_vec::<f64>().unwrap();
    let mut a_dense = vec![0f64; (M * K) as usize];
    for i in 0..M as usize {
        for l in 0..K as usize {
            a_dense[i * K as usize + l] = atv[l * M as usize + i];
        }
    }
    let mut want = vec![0f64; M as usize];
    linalg::reference::gemv(
        M as usize,
        K as usize,
        &a_dense,
        &x.to_vec::<f64>().unwrap(),
        &mut want,
    );
    let got = y.to_vec::<f64>().unwrap();
    for (g, w) in got.iter().zip(want.iter()) {
        assert!((g - w).abs() <= 1e-12 * w.abs().max(1.0));
    }
}
