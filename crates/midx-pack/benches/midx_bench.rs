use criterion::{criterion_group, criterion_main, Criterion};
use midx_hash::hasher::Hasher;
use midx_hash::ObjectId;
use midx_pack::midx::MultiPackIndex;
use midx_pack::mwindow::MwindowOptions;
use midx_pack::writer::MidxWriter;
use midx_pack::{runtime, IDX_SIGNATURE, IDX_VERSION, MIDX_FILE_NAME};

fn oid(seed: u32) -> ObjectId {
    Hasher::digest(&seed.to_be_bytes()).unwrap()
}

fn build_idx(entries: &[(ObjectId, u64)]) -> Vec<u8> {
    let mut sorted: Vec<_> = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut buf = Vec::new();
    buf.extend_from_slice(&IDX_SIGNATURE);
    buf.extend_from_slice(&IDX_VERSION.to_be_bytes());

    let mut fanout = [0u32; 256];
    for (oid, _) in &sorted {
        fanout[oid.first_byte() as usize] += 1;
    }
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }
    for count in fanout {
        buf.extend_from_slice(&count.to_be_bytes());
    }
    for (oid, _) in &sorted {
        buf.extend_from_slice(oid.as_bytes());
    }
    for _ in &sorted {
        buf.extend_from_slice(&0u32.to_be_bytes());
    }
    for (_, offset) in &sorted {
        buf.extend_from_slice(&(*offset as u32).to_be_bytes());
    }
    buf.extend_from_slice(&[0u8; 20]);
    let checksum = Hasher::digest(&buf).unwrap();
    buf.extend_from_slice(checksum.as_bytes());
    buf
}

/// A two-pack index over 4096 synthetic objects.
fn fixture_midx() -> (tempfile::TempDir, MultiPackIndex) {
    let _ = runtime::init(MwindowOptions::default());
    let dir = tempfile::tempdir().unwrap();

    for pack in 0..2u32 {
        let entries: Vec<_> = (0..2048u32)
            .map(|i| (oid(pack * 10_000 + i), u64::from(i) * 64))
            .collect();
        std::fs::write(
            dir.path().join(format!("pack-{pack}.idx")),
            build_idx(&entries),
        )
        .unwrap();
    }

    let mut writer = MidxWriter::new(dir.path()).unwrap();
    writer.add("pack-0.idx").unwrap();
    writer.add("pack-1.idx").unwrap();
    writer.commit().unwrap();
    drop(writer);

    let midx = MultiPackIndex::open(dir.path().join(MIDX_FILE_NAME)).unwrap();
    (dir, midx)
}

fn bench_find_full_hash(c: &mut Criterion) {
    let (_dir, midx) = fixture_midx();
    let target = oid(1234);

    c.bench_function("find_full_hash", |b| {
        b.iter(|| {
            midx.find(&target, ObjectId::HEX_SIZE).unwrap();
        });
    });
}

fn bench_find_short_prefix(c: &mut Criterion) {
    let (_dir, midx) = fixture_midx();
    let hex = oid(1234).to_hex();
    let (prefix, len) = ObjectId::from_hex_prefix(&hex[..12]).unwrap();

    c.bench_function("find_short_prefix", |b| {
        b.iter(|| {
            midx.find(&prefix, len).unwrap();
        });
    });
}

fn bench_iterate_all(c: &mut Criterion) {
    let (_dir, midx) = fixture_midx();

    c.bench_function("iterate_all_4096", |b| {
        b.iter(|| {
            for entry in midx.iter() {
                entry.unwrap();
            }
        });
    });
}

fn bench_writer_dump(c: &mut Criterion) {
    let (dir, _midx) = fixture_midx();
    let mut writer = MidxWriter::new(dir.path()).unwrap();
    writer.add("pack-0.idx").unwrap();
    writer.add("pack-1.idx").unwrap();

    c.bench_function("writer_dump_4096", |b| {
        b.iter(|| {
            writer.dump().unwrap();
        });
    });
}

criterion_group!(
    benches,
    bench_find_full_hash,
    bench_find_short_prefix,
    bench_iterate_all,
    bench_writer_dump,
);
criterion_main!(benches);
