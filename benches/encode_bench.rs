use std::io::Cursor;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use hw_jpeg::driver::{self, EncodeOptions};
use hw_jpeg::{
    Bitstream, CpuEncoderAdapter, EncodeParams, EncodeSession, Nv12Frame, SubmitStatus,
    SurfacePool, SyncStatus, VideoEncoder, encode_nv12_to_jpeg, nv12_test_pattern,
};

const SIZES: [(u16, u16); 3] = [(320, 240), (640, 480), (1280, 720)];

fn jpeg_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("nv12_to_jpeg");
    group.sample_size(30);
    group.measurement_time(Duration::from_secs(5));

    for (width, height) in SIZES {
        let frame = Nv12Frame {
            width: usize::from(width),
            height: usize::from(height),
            pitch: usize::from(width),
            data: nv12_test_pattern(usize::from(width), usize::from(height), 7),
        };
        group.throughput(Throughput::Elements(1));
        for quality in [50_u8, 90] {
            group.bench_with_input(
                BenchmarkId::new(format!("{width}x{height}"), format!("q{quality}")),
                &quality,
                |b, &quality| {
                    b.iter(|| encode_nv12_to_jpeg(&frame, quality).expect("encode should succeed"));
                },
            );
        }
    }
    group.finish();
}

fn runtime_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_runtime");
    group.sample_size(20);

    for (width, height) in SIZES {
        let mut params = EncodeParams::jpeg(width, height, 25, 90);
        let mut encoder = CpuEncoderAdapter::new();
        encoder.query(&mut params).expect("query should succeed");
        encoder.init(&params).expect("init should succeed");
        let request = encoder.query_io_surf(&params).expect("io surf should succeed");
        let mut pool = SurfacePool::allocate(params.frame_info, request.num_frame_suggested);
        let raw = nv12_test_pattern(usize::from(width), usize::from(height), 3);
        let mut bitstream = Bitstream::with_capacity(hw_jpeg::DEFAULT_BITSTREAM_CAPACITY);

        group.bench_function(BenchmarkId::new("submit_sync", format!("{width}x{height}")), |b| {
            b.iter(|| {
                let index = pool.find_free().expect("free surface");
                let mut surface = pool.surface_mut(index).expect("surface");
                surface
                    .read_raw_frame(&mut Cursor::new(&raw))
                    .expect("read frame");
                let SubmitStatus::Queued(Some(sync)) =
                    encoder.encode_frame_async(Some(&surface)).expect("submit")
                else {
                    panic!("frame should be queued");
                };
                drop(surface);
                while encoder
                    .sync_operation(sync, &mut bitstream, Duration::from_millis(100))
                    .expect("sync")
                    == SyncStatus::InExecution
                {}
                bitstream.clear();
            });
        });
        encoder.close().expect("close should succeed");
    }
    group.finish();
}

fn driver_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let (width, height) = (320_u16, 240_u16);
    let raw = (0..3)
        .flat_map(|i| nv12_test_pattern(usize::from(width), usize::from(height), i))
        .collect::<Vec<_>>();
    let mut options = EncodeOptions::new(dir.path().join("unused.nv12"), width, height);
    options.output_dir = dir.path().to_path_buf();

    c.bench_function("driver/three_frames_320x240", |b| {
        b.iter(|| {
            let session =
                EncodeSession::new(hw_jpeg::BackendKind::Software, hw_jpeg::Codec::Jpeg)
                    .expect("session");
            driver::run_with_session(session, Box::new(Cursor::new(raw.clone())), &options)
                .expect("encode should succeed")
        });
    });
}

criterion_group!(benches, jpeg_benchmark, runtime_benchmark, driver_benchmark);
criterion_main!(benches);
