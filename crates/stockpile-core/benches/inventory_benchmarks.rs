use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use stockpile_core::{merge_repository, ItemView};
use stockpile_schema::{ContentHash, ItemId, ManualClock, Repository, RepositoryItem, SourceUri};
use stockpile_store::{verify_file, InstalledRecord};
use std::collections::BTreeMap;
use std::fs;
use uuid::Uuid;

fn repository(items: usize, version: u64) -> Repository {
    Repository {
        id: Uuid::nil(),
        title: "bench".to_owned(),
        updated: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
        self_uri: SourceUri::new("http://bench.test/repository.json"),
        items: (0..items)
            .map(|i| RepositoryItem {
                id: ItemId::new(format!("org.bench.item{i:05}")),
                version_code: version + (i % 2) as u64,
                version_name: format!("{version}.0"),
                name: format!("Item {i}"),
                source: SourceUri::new(format!("item{i}.pkg")),
                hash: ContentHash::of_bytes(format!("{i}").as_bytes()),
            })
            .collect(),
    }
}

fn bench_merge_fresh(c: &mut Criterion) {
    let snapshot = repository(5000, 1);
    let installed: BTreeMap<ItemId, InstalledRecord> = BTreeMap::new();
    c.bench_function("merge_fresh_5000_items", |b| {
        b.iter(|| merge_repository(&ItemView::new(), Uuid::nil(), &snapshot, &installed));
    });
}

fn bench_merge_upgrade(c: &mut Criterion) {
    let old = repository(5000, 1);
    let new = repository(5000, 2);
    let installed: BTreeMap<ItemId, InstalledRecord> = BTreeMap::new();
    let (view, _) = merge_repository(&ItemView::new(), Uuid::nil(), &old, &installed);
    c.bench_function("merge_upgrade_5000_items", |b| {
        b.iter(|| merge_repository(&view, Uuid::nil(), &new, &installed));
    });
}

fn bench_verify(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let data = vec![0xA5u8; 4 * 1024 * 1024];
    let path = dir.path().join("bench.pkg");
    fs::write(&path, &data).unwrap();
    let expected = ContentHash::of_bytes(&data);
    let clock = ManualClock::new(0);
    c.bench_function("verify_4mib", |b| {
        b.iter_batched(
            || (),
            |()| verify_file(&path, &expected, None, &clock, &|| false, &mut |_, _| {}).unwrap(),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_merge_fresh, bench_merge_upgrade, bench_verify);
criterion_main!(benches);
