use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sevenzip_bridge::detect::FormatDetector;
use sevenzip_bridge::SignatureCatalog;
use std::io::Cursor;

fn bench_detect(c: &mut Criterion) {
    let catalog = SignatureCatalog::builtin();
    let detector = FormatDetector::new(&catalog);

    let mut seven_zip = b"7z\xBC\xAF\x27\x1C\x00\x04".to_vec();
    seven_zip.resize(1024 * 1024, 0x5A);
    let noise: Vec<u8> = (0..1024 * 1024u32).map(|i| (i.wrapping_mul(2654435761) >> 24) as u8).collect();

    c.bench_function("detect_7z_1mb", |b| {
        b.iter(|| {
            let mut cur = Cursor::new(black_box(&seven_zip));
            detector.detect(&mut cur, Some("bench.7z")).unwrap()
        })
    });

    c.bench_function("detect_noise_1mb", |b| {
        b.iter(|| {
            let mut cur = Cursor::new(black_box(&noise));
            detector.detect(&mut cur, None).unwrap()
        })
    });
}

fn bench_detect_prefix(c: &mut Criterion) {
    let catalog = SignatureCatalog::builtin();
    let detector = FormatDetector::new(&catalog);
    let mut tar = vec![0u8; 4096];
    tar[257..262].copy_from_slice(b"ustar");

    c.bench_function("detect_prefix_tar_4k", |b| {
        b.iter(|| detector.detect_prefix(black_box(&tar), true, Some("x.tar")))
    });
}

criterion_group!(benches, bench_detect, bench_detect_prefix);
criterion_main!(benches);
