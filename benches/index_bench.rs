use std::collections::HashSet;
use std::path::PathBuf;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use ssproto::config::{IndexConfig, IndexRule};
use ssproto::core::packet::{DeltaPacket, HashListEntry};
use ssproto::index::{ContentEntry, ContentIndex, IndexSnapshot, ReplacePolicy};
use ssproto::utils::crypto::Signer;
use ssproto::utils::hash::ContentHash;

fn snapshot_of(files: usize) -> IndexSnapshot {
    let mut snapshot = IndexSnapshot::new();
    for i in 0..files {
        snapshot.insert(ContentEntry {
            server_path: PathBuf::from(format!("/srv/bundle/mods/mod-{i}.jar")),
            client_path: format!("mods/mod-{i}.jar"),
            hash: ContentHash::of(&i.to_le_bytes()),
            policy: ReplacePolicy::Overwrite,
        });
    }
    snapshot
}

#[allow(clippy::unwrap_used)]
fn bench_index_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("index_build");
    group.sample_size(20);

    for &files in &[100usize, 1000] {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..files {
            let sub = dir.path().join(format!("d{}", i % 16));
            std::fs::create_dir_all(&sub).unwrap();
            std::fs::write(sub.join(format!("f{i}.cfg")), vec![i as u8; 4096]).unwrap();
        }
        let index = ContentIndex::new(IndexConfig {
            rules: vec![IndexRule::new(dir.path(), "config").recursive(true)],
            ..IndexConfig::default()
        });

        group.throughput(Throughput::Elements(files as u64));
        group.bench_function(format!("build_{files}_files"), |b| {
            b.iter(|| index.build().unwrap())
        });
    }

    group.finish();
}

fn bench_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("delta");

    for &files in &[1000usize, 10_000] {
        let snapshot = snapshot_of(files);
        let advertised: HashSet<ContentHash> = (0..files / 2)
            .map(|i| ContentHash::of(&i.to_le_bytes()))
            .collect();
        let reported = HashSet::new();

        group.throughput(Throughput::Elements(files as u64));
        group.bench_function(format!("half_known_{files}"), |b| {
            b.iter(|| black_box(snapshot.delta(&advertised, &reported).len()))
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_frames(c: &mut Criterion) {
    let mut group = c.benchmark_group("frames");
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let signer = Signer::generate();

    group.bench_function("hash_list_entry", |b| {
        let entry = HashListEntry::new(ContentHash::of(b"entry"), "config/some/file.cfg");
        b.iter_batched(
            || Vec::with_capacity(128),
            |mut wire| runtime.block_on(entry.write_to(&mut wire)).unwrap(),
            BatchSize::SmallInput,
        )
    });

    for &size in &[4096usize, 1024 * 1024] {
        let blob = vec![7u8; size];
        let hash = ContentHash::of(&blob);
        let packet = DeltaPacket {
            hash,
            signature: signer.sign(hash.as_bytes()).unwrap(),
            path: "mods/big.jar".into(),
            blob,
        };
        let mut wire = Vec::new();
        runtime.block_on(packet.write_to(&mut wire)).unwrap();
        let verifier = signer.verifier();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("delta_read_verify_{size}b"), |b| {
            b.iter(|| {
                let packet = runtime
                    .block_on(DeltaPacket::read_from(&mut wire.as_slice(), u64::MAX))
                    .unwrap()
                    .unwrap();
                assert!(packet.verify(&verifier));
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_index_build, bench_delta, bench_frames);
criterion_main!(benches);
