//! End-to-end scenarios: expression evaluation over large vectors, slicing
//! with negative bounds, padding behaviour and parse diagnostics.

use tessera::codec::Storage;
use tessera::iter::{ReadIter, WriteChunkIter};
use tessera::{
    CodecId, Config, Container, Context, DType, DtShape, Error, EvalStrategy, Expression, Filter,
    NdRead,
};

fn dts(dtype: DType, shape: &[u64], chunks: &[u64], blocks: &[u64]) -> DtShape {
    DtShape::new(dtype, shape)
        .unwrap()
        .with_chunk_shape(chunks)
        .unwrap()
        .with_block_shape(blocks)
        .unwrap()
}

fn poly(x: f64) -> f64 {
    (x - 1.35) * (x - 4.45) * (x - 8.5)
}

/// Two million elements, both strategies, against the element-wise
/// reference.
#[test]
fn polynomial_over_two_million_elements() {
    const N: usize = 2_000_000;
    const CHUNK: u64 = 20_000;
    const BLOCK: u64 = 2_000; // 16 KB blocks

    for strategy in [EvalStrategy::Chunk, EvalStrategy::Block] {
        let ctx = Context::new(Config {
            codec: CodecId::Zstd,
            level: 1,
            filters: vec![Filter::Shuffle],
            eval_strategy: strategy,
            ..Config::default()
        })
        .unwrap();

        let shape = dts(DType::F64, &[N as u64], &[CHUNK], &[BLOCK]);
        let step = 10.0 / N as f64;
        let x = Container::arange(&ctx, shape, 0.0, 10.0, step, &Storage::InMemory).unwrap();

        let mut e = Expression::new(&ctx);
        e.bind("x", &x).unwrap();
        e.compile("(x - 1.35) * (x - 4.45) * (x - 8.5)").unwrap();
        let out = e.eval().unwrap();

        let got = out.to_vec::<f64>().unwrap();
        assert_eq!(got.len(), N);
        let mut max_rel = 0f64;
        for (i, g) in got.iter().enumerate() {
            let want = poly(step * i as f64);
            let rel = (g - want).abs() / want.abs().max(1e-30);
            if rel > max_rel {
                max_rel = rel;
            }
        }
        assert!(max_rel <= 1e-6, "max relative error {max_rel}");
    }
}

/// Blocked evaluation with a worker pool agrees bit-for-bit with the
/// sequential chunk strategy.
#[test]
fn parallel_block_eval_agrees() {
    let run = |cfg: Config| {
        let ctx = Context::new(cfg).unwrap();
        let shape = dts(DType::F64, &[40_000], &[8_192], &[512]);
        let x = Container::linspace(&ctx, shape.clone(), -3.0, 3.0, &Storage::InMemory).unwrap();
        let y = Container::linspace(&ctx, shape, 1.0, 2.0, &Storage::InMemory).unwrap();
        let mut e = Expression::new(&ctx);
        e.bind("x", &x).unwrap();
        e.bind("y", &y).unwrap();
        e.compile("exp(-(x ^ 2)) / y + min(x, y) * atan2(x, y)")
            .unwrap();
        e.eval().unwrap().to_vec::<f64>().unwrap()
    };
    let chunked = run(Config {
        level: 0,
        ..Config::default()
    });
    let blocked_parallel = run(Config {
        level: 0,
        eval_strategy: EvalStrategy::Block,
        max_num_threads: 4,
        ..Config::default()
    });
    assert_eq!(
        chunked.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
        blocked_parallel.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
    );
}

/// Slice with negative indices over `x[i,j,k] = 100i + 10j + k`.
#[test]
fn slice_with_negative_bounds() {
    let ctx = Context::with_defaults().unwrap();
    let buf: Vec<f64> = (0..1000).map(|i| i as f64).collect();
    let x = Container::from_buffer(
        &ctx,
        dts(DType::F64, &[10, 10, 10], &[3, 5, 2], &[3, 5, 2]),
        &buf,
        &Storage::InMemory,
    )
    .unwrap();

    let s = x
        .slice(&ctx, &[3, 0, 3], &[-4, -3, 10], &Storage::InMemory)
        .unwrap();
    assert_eq!(s.shape(), &[3, 7, 7]);
    let got = s.to_vec::<f64>().unwrap();
    let mut at = 0;
    for i in 3..6u64 {
        for j in 0..7u64 {
            for k in 3..10u64 {
                assert_eq!(got[at], (100 * i + 10 * j + k) as f64);
                at += 1;
            }
        }
    }
}

/// Concatenating a disjoint tiling of slices reproduces the whole buffer.
#[test]
fn slice_decompose() {
    let ctx = Context::with_defaults().unwrap();
    let buf: Vec<f64> = (0..24 * 15).map(|i| (i * 7 % 100) as f64).collect();
    let x = Container::from_buffer(
        &ctx,
        dts(DType::F64, &[24, 15], &[7, 4], &[7, 4]),
        &buf,
        &Storage::InMemory,
    )
    .unwrap();

    let row_cuts = [0i64, 5, 16, 24];
    let col_cuts = [0i64, 4, 15];
    let mut rebuilt = vec![0f64; 24 * 15];
    for r in row_cuts.windows(2) {
        for c in col_cuts.windows(2) {
            let s = x
                .slice(&ctx, &[r[0], c[0]], &[r[1], c[1]], &Storage::InMemory)
                .unwrap();
            let tile = s.to_vec::<f64>().unwrap();
            let (h, w) = ((r[1] - r[0]) as usize, (c[1] - c[0]) as usize);
            for i in 0..h {
                for j in 0..w {
                    rebuilt[(r[0] as usize + i) * 15 + c[0] as usize + j] = tile[i * w + j];
                }
            }
        }
    }
    assert_eq!(rebuilt, buf);
}

/// Writing `[0..7)` through the partition iterator with 4-wide chunks must
/// never surface the padding cell.
#[test]
fn write_block_padding_roundtrip() {
    let ctx = Context::with_defaults().unwrap();
    let mut c = Container::empty(
        &ctx,
        dts(DType::F64, &[7], &[4], &[4]),
        &Storage::InMemory,
    )
    .unwrap();
    let mut it = WriteChunkIter::<f64>::new(&mut c).unwrap();
    let mut next = 0f64;
    while it.has_next() {
        let part = it.next().unwrap();
        for v in part.data.iter_mut() {
            *v = next;
            next += 1.0;
        }
    }
    it.finish().unwrap();

    let values: Vec<f64> = ReadIter::<f64>::new(&c)
        .unwrap()
        .map(|v| v.unwrap().value)
        .collect();
    assert_eq!(values, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

/// Buffer round-trip across dtypes, shapes and codecs.
#[test]
fn buffer_roundtrip_matrix() {
    for codec in [CodecId::Zlib, CodecId::Zstd] {
        for level in [0u8, 5] {
            let ctx = Context::new(Config {
                codec,
                level,
                filters: vec![Filter::Shuffle, Filter::Delta],
                ..Config::default()
            })
            .unwrap();
            let buf64: Vec<f64> = (0..11 * 5 * 3).map(|i| (i as f64).sin()).collect();
            let c = Container::from_buffer(
                &ctx,
                dts(DType::F64, &[11, 5, 3], &[4, 5, 2], &[2, 5, 2]),
                &buf64,
                &Storage::InMemory,
            )
            .unwrap();
            assert_eq!(c.to_vec::<f64>().unwrap(), buf64);

            let buf32: Vec<f32> = (0..64).map(|i| i as f32 * 0.25).collect();
            let c = Container::from_buffer(
                &ctx,
                dts(DType::F32, &[64], &[10], &[5]),
                &buf32,
                &Storage::InMemory,
            )
            .unwrap();
            assert_eq!(c.to_vec::<f32>().unwrap(), buf32);
        }
    }
}

/// Parse failures report 1-based byte offsets and never return a tree.
#[test]
fn parse_error_offsets() {
    let ctx = Context::with_defaults().unwrap();
    let x = Container::zeros(
        &ctx,
        dts(DType::F64, &[4], &[2], &[2]),
        &Storage::InMemory,
    )
    .unwrap();
    let mut e = Expression::new(&ctx);
    e.bind("x", &x).unwrap();

    match e.compile("(x-1") {
        Err(Error::Parse { offset, .. }) => assert_eq!(offset, 4),
        other => panic!("expected parse error, got {other:?}"),
    }
    assert!(matches!(e.compile("x + + )"), Err(Error::Parse { .. })));
    match e.compile("foo(x)") {
        Err(Error::Parse { offset, reason }) => {
            assert_eq!(offset, 3);
            assert!(reason.contains("foo"));
        }
        other => panic!("expected parse error, got {other:?}"),
    }
    // the handle stays usable after a failed compile
    e.compile("x + 1").unwrap();
    assert_eq!(e.eval().unwrap().to_vec::<f64>().unwrap(), vec![1.0; 4]);
}

/// TruncPrec trades mantissa bits for ratio but keeps the configured
/// precision.
#[test]
fn trunc_prec_filter_bounds_error() {
    let exact_ctx = Context::with_defaults().unwrap();
    let lossy_ctx = Context::new(Config {
        filters: vec![Filter::TruncPrec, Filter::Shuffle],
        fp_mantissa_bits: 23,
        ..Config::default()
    })
    .unwrap();
    let shape = dts(DType::F64, &[5000], &[1024], &[256]);
    let exact =
        Container::linspace(&exact_ctx, shape.clone(), 1.0, 9.0, &Storage::InMemory).unwrap();
    let lossy = Container::linspace(&lossy_ctx, shape, 1.0, 9.0, &Storage::InMemory).unwrap();
    assert!(exact.almost_equal(&lossy, 1e-6).unwrap());
    assert!(!exact.almost_equal(&lossy, 1e-15).unwrap());
}
