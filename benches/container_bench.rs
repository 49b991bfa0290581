use criterion::{black_box, criterion_group, criterion_main, Criterion};
use clusterpack::container::{AccessMode, Container, CreateOptions};
use std::io::Cursor;

fn new_pack() -> Container<Cursor<Vec<u8>>> {
    let opts = CreateOptions { max_file_count: 1024, max_block_count: 4096 };
    Container::create("bench", AccessMode::ReadWrite, Cursor::new(Vec::new()), opts).unwrap()
}

fn bench_write(c: &mut Criterion) {
    let data = vec![42u8; 64 * 1024];

    c.bench_function("write_256_files_64k", |b| {
        b.iter(|| {
            let mut pack = new_pack();
            for i in 0..256 {
                pack.write_file(&format!("file_{i}.bin"), black_box(&data)).unwrap();
            }
        })
    });
}

fn bench_churn(c: &mut Criterion) {
    let small = vec![1u8; 3000];
    let large = vec![2u8; 20_000];

    c.bench_function("delete_rewrite_churn", |b| {
        let mut pack = new_pack();
        for i in 0..512 {
            pack.write_file(&format!("f{i}"), &small).unwrap();
        }
        let mut round = 0usize;
        b.iter(|| {
            let victim = format!("f{}", round % 512);
            pack.delete_file(&victim).unwrap();
            let payload = if round % 2 == 0 { &large } else { &small };
            pack.write_file(&victim, black_box(payload)).unwrap();
            round += 1;
        })
    });
}

fn bench_read(c: &mut Criterion) {
    let mut pack = new_pack();
    let data = vec![7u8; 256 * 1024];
    pack.write_file("blob", &data).unwrap();

    c.bench_function("read_256k", |b| b.iter(|| pack.read_file(black_box("blob")).unwrap()));
    c.bench_function("read_segment_4k", |b| {
        b.iter(|| pack.read_file_segment(black_box("blob"), 100_000, 4096).unwrap())
    });
}

criterion_group!(benches, bench_write, bench_churn, bench_read);
criterion_main!(benches);
