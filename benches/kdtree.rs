use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use imsearch_bow::config::IndexOptions;
use imsearch_bow::kdtree::KdForest;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_data(n: usize, seed: u64) -> Array2<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array2::from_shape_fn((n, 64), |_| rng.random::<f32>())
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("kd 森林构建");
    group.sample_size(10);
    for n in [10_000, 50_000] {
        let data = random_data(n, 1);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_function(format!("build_{n}"), |b| {
            b.iter(|| KdForest::build(black_box(data.clone()), &IndexOptions::default()))
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let forest = KdForest::build(random_data(50_000, 1), &IndexOptions::default());
    let queries = random_data(500, 2);

    let mut group = c.benchmark_group("kd 森林搜索");
    group.throughput(Throughput::Elements(queries.nrows() as u64));
    for checks in [32, 128, 512] {
        let mut forest = forest.clone();
        forest.set_checks(checks);
        group.bench_function(format!("knn2_checks_{checks}"), |b| {
            b.iter(|| forest.knn_batch(black_box(queries.view()), 2).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_build, bench_search);
criterion_main!(benches);
