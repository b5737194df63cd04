//! Performance benchmarks for the project store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use proj_store::{
    ArrayData, DType, HandlerKind, ItemRecord, ItemType, Project, ProjectConfig, Region,
};
use tempfile::TempDir;

fn create_project(dir: &TempDir) -> Project {
    Project::open(ProjectConfig {
        path: dir.path().join("project"),
        ..Default::default()
    })
    .unwrap()
}

fn f64_array(shape: Vec<u64>) -> ArrayData {
    ArrayData::zeros(DType::F64, shape)
}

/// Benchmark full payload writes through each handler.
fn bench_payload_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("payload_write");

    for (name, kind, side) in [
        ("archive_64x64", HandlerKind::Archive, 64u64),
        ("dataset_64x64", HandlerKind::Dataset, 64u64),
        ("dataset_512x512", HandlerKind::Dataset, 512u64),
    ] {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            let dir = TempDir::new().unwrap();
            let project = create_project(&dir);

            let mut item = ItemRecord::new(ItemType::DataItem);
            let array = f64_array(vec![side, side]);
            project.write_item(&mut item, Some(&array)).unwrap();
            if item.handler_ref.as_ref().unwrap().kind != kind {
                project.migrate_handler(item.id, kind).unwrap();
            }

            b.iter(|| {
                let mut record = project.read_item(item.id).unwrap();
                project.write_item(&mut record, Some(black_box(&array))).unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark per-frame partial writes against rewriting the whole array.
fn bench_partial_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("partial_write");

    let dir = TempDir::new().unwrap();
    let project = create_project(&dir);

    let mut item = ItemRecord::new(ItemType::DataItem).live();
    project
        .write_item(&mut item, Some(&f64_array(vec![512, 512])))
        .unwrap();

    let row = vec![0u8; 512 * 8];
    group.bench_function("row_of_512x512", |b| {
        b.iter(|| {
            project
                .write_partial(
                    item.id,
                    &Region::new(vec![256, 0], vec![1, 512]),
                    black_box(&row),
                )
                .unwrap();
        });
    });

    group.finish();
}

/// Benchmark transaction coalescing of repeated property sets.
fn bench_transaction_coalescing(c: &mut Criterion) {
    let mut group = c.benchmark_group("transactions");

    for sets_per_flush in [1usize, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("sets_per_flush", sets_per_flush),
            &sets_per_flush,
            |b, &sets| {
                let dir = TempDir::new().unwrap();
                let project = create_project(&dir);

                let mut item = ItemRecord::new(ItemType::DataItem);
                project.write_item(&mut item, None).unwrap();

                b.iter(|| {
                    let scope = project.begin_transaction();
                    for i in 0..sets {
                        project
                            .set_property(item.id, "title", format!("rev {}", i))
                            .unwrap();
                    }
                    scope.end();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_payload_write,
    bench_partial_write,
    bench_transaction_coalescing
);
criterion_main!(benches);
