use criterion::*;
use fast_graphcut_rust::arrays::Volume;
use fast_graphcut_rust::common::Config;
use fast_graphcut_rust::energy::VoxelBoundary;
use fast_graphcut_rust::grid::{build_voxel_graph, graphcut_voxels};
use fast_graphcut_rust::maxflow::maxflow;
use fast_graphcut_rust::region::{graphcut_regions, SummedBoundary};
use fast_graphcut_rust::tiled::graphcut_voxels_tiled;
use std::time::Duration;

/// Noisy sphere in a cube of edge `size`, markers in the center and in the corners.
fn sphere(size: usize) -> (Volume<f64>, Volume<bool>, Volume<bool>) {
    let shape = [size, size, size];
    let center = size as f64 / 2.0;
    let radius = size as f64 / 3.0;
    let coords = |i: usize| {
        let z = (i / (size * size)) as f64;
        let y = ((i / size) % size) as f64;
        let x = (i % size) as f64;
        ((z - center).powi(2) + (y - center).powi(2) + (x - center).powi(2)).sqrt()
    };
    let image = Volume::from_fn(&shape, |i| {
        let noise = ((i * 7919) % 13) as f64;
        if coords(i) < radius {
            200.0 + noise
        } else {
            50.0 + noise
        }
    })
    .unwrap();
    let fg = Volume::from_fn(&shape, |i| coords(i) < radius / 4.0).unwrap();
    let bg = Volume::from_fn(&shape, |i| coords(i) > radius * 1.4).unwrap();
    (image, fg, bg)
}

fn bench_build_voxel_graph(c: &mut Criterion) {
    sas::init();
    let mut group = c.benchmark_group("build voxel graph");
    for size in [32, 64, 96] {
        let (image, fg, bg) = sphere(size);
        let term = VoxelBoundary::difference_exponential(30.0);
        group.bench_with_input(BenchmarkId::new("exponential", size), &size, |b, _| {
            b.iter(|| {
                let _ = black_box(build_voxel_graph(&fg, &bg, &image, &term).unwrap());
            });
        });
    }
}

fn bench_maxflow(c: &mut Criterion) {
    sas::init();
    let mut group = c.benchmark_group("maxflow");
    for size in [32, 64, 96] {
        let (image, fg, bg) = sphere(size);
        let term = VoxelBoundary::difference_linear(&image);
        let graph = build_voxel_graph(&fg, &bg, &image, &term).unwrap();
        group.bench_with_input(BenchmarkId::new("sphere", size), &size, |b, _| {
            b.iter_batched(
                || graph.clone(),
                |graph| {
                    let _ = black_box(maxflow(graph).unwrap());
                },
                BatchSize::LargeInput,
            );
        });
    }
}

fn bench_graphcut_voxels(c: &mut Criterion) {
    sas::init();
    let (image, fg, bg) = sphere(64);
    let term = VoxelBoundary::difference_linear(&image);
    c.bench_function("graphcut_voxels_64", |b| {
        b.iter(|| {
            let _ = black_box(graphcut_voxels(&fg, &bg, &image, &term).unwrap());
        });
    });
}

fn bench_graphcut_regions(c: &mut Criterion) {
    sas::init();
    let (image, fg, bg) = sphere(64);
    // 4x4x4 blocks as regions
    let blocks = 16;
    let labels = Volume::from_fn(&[64, 64, 64], |i| {
        let (z, y, x) = (i / 4096 / 4, (i / 64) % 64 / 4, i % 64 / 4);
        (z * blocks * blocks + y * blocks + x) as u32 + 1
    })
    .unwrap();
    let term = SummedBoundary::stawiaski(&image);
    c.bench_function("graphcut_regions_64", |b| {
        b.iter(|| {
            let _ = black_box(graphcut_regions(&labels, &fg, &bg, &term).unwrap());
        });
    });
}

fn bench_tiled(c: &mut Criterion) {
    sas::init();
    let (image, fg, bg) = sphere(96);
    let term = VoxelBoundary::difference_linear(&image);
    let mut group = c.benchmark_group("tiled 96");
    for min_edge_length in [24, 48, 96] {
        let config = Config {
            min_edge_length,
            overlap: 4,
            ..Config::default()
        };
        group.bench_with_input(
            BenchmarkId::new("graphcut_voxels_tiled", min_edge_length),
            &config,
            |b, config| {
                b.iter(|| {
                    let _ = black_box(graphcut_voxels_tiled(&fg, &bg, &image, term, config).unwrap());
                });
            },
        );
    }
}

criterion_group!(name = benches;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_build_voxel_graph, bench_maxflow);
criterion_group!(name = benches1;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_graphcut_voxels, bench_graphcut_regions);
criterion_group!(name = benches2;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_tiled);
criterion_main!(benches, benches1, benches2);
