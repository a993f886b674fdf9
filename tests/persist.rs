//! File-backed containers: write, close, reopen, read.

use tessera::codec::Storage;
use tessera::iter::WriteIter;
use tessera::{CodecId, Config, Container, Context, DType, DtShape, Filter, NdRead};

fn dts(shape: &[u64], chunks: &[u64], blocks: &[u64]) -> DtShape {
    DtShape::new(DType::F64, shape)
        .unwrap()
        .with_chunk_shape(chunks)
        .unwrap()
        .with_block_shape(blocks)
        .unwrap()
}

#[test]
fn write_close_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.tsra");
    let storage = Storage::File(path.clone());

    let ctx = Context::new(Config {
        codec: CodecId::Zlib,
        level: 6,
        filters: vec![Filter::BitShuffle],
        ..Config::default()
    })
    .unwrap();

    {
        let mut c = Container::empty(&ctx, dts(&[13, 9], &[5, 4], &[5, 2]), &storage).unwrap();
        let mut it = WriteIter::<f64>::new(&mut c).unwrap();
        while it.has_next() {
            let cell = it.next().unwrap();
            *cell.value = (cell.nelem * 3) as f64;
        }
        it.finish().unwrap();
        c.close().unwrap();
    }

    let reopened = Container::from_file(&ctx, &path).unwrap();
    assert_eq!(reopened.shape(), &[13, 9]);
    assert_eq!(reopened.dtype(), DType::F64);
    let values = reopened.to_vec::<f64>().unwrap();
    assert_eq!(values.len(), 13 * 9);
    for (i, v) in values.iter().enumerate() {
        assert_eq!(*v, (i * 3) as f64);
    }
    // 3x3 chunk grid of 5x4 chunks, f64 items
    let (nbytes, cbytes) = reopened.info();
    assert_eq!(nbytes, 9 * 20 * 8);
    assert!(cbytes > 0);
    drop(reopened);

    // removal is idempotent
    storage.remove().unwrap();
    storage.remove().unwrap();
    assert!(Container::from_file(&ctx, &path).is_err());
}

#[test]
fn constructors_persist_directly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lin.tsra");
    let ctx = Context::with_defaults().unwrap();

    let c = Container::linspace(
        &ctx,
        dts(&[1000], &[128], &[32]),
        -2.0,
        2.0,
        &Storage::File(path.clone()),
    )
    .unwrap();
    let want = c.to_vec::<f64>().unwrap();
    c.close().unwrap();

    let reopened = Container::from_file(&ctx, &path).unwrap();
    assert_eq!(reopened.to_vec::<f64>().unwrap(), want);
    // codec settings travel in the footer, not the reopening context
    let strict = Context::new(Config {
        codec: CodecId::Zstd,
        level: 9,
        ..Config::default()
    })
    .unwrap();
    let reopened2 = Container::from_file(&strict, &path).unwrap();
    assert_eq!(reopened2.to_vec::<f64>().unwrap(), want);
}

#[test]
fn view_of_persisted_container() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("view.tsra");
    let ctx = Context::with_defaults().unwrap();

    let buf: Vec<f64> = (0..100).map(|i| i as f64).collect();
    let c = Container::from_buffer(
        &ctx,
        dts(&[10, 10], &[4, 4], &[2, 4]),
        &buf,
        &Storage::File(path.clone()),
    )
    .unwrap();
    c.close().unwrap();

    let reopened = Container::from_file(&ctx, &path).unwrap();
    let v = reopened.slice_view(&[-3, -3], &[10, 10]).unwrap();
    assert_eq!(v.dtshape().shape(), &[3, 3]);
    let got = v.to_vec::<f64>().unwrap();
    assert_eq!(got, vec![77.0, 78.0, 79.0, 87.0, 88.0, 89.0, 97.0, 98.0, 99.0]);
}
