//! Performance benchmarks for labelops-fusion
//!
//! This benchmark suite measures the fusion presets and the individual stages
//! on synthetic segmentations of growing size.

use std::sync::Arc;

use criterion::*;
use itertools::iproduct;
use labelops_fusion::{
    BoxIndexSet, ComponentScratch, FusionPipeline, KeepLargestComponent, LabelPostprocessor,
    LabelVolume, ReusableMemory, SimpleParams,
};
use ndarray::Array3;
use std::hint::black_box;

const CELL: usize = 8;

/// Helper function to create a marker image with one small seed per cell
fn create_markers(depth: usize, size: usize) -> LabelVolume<u16> {
    let mut markers = Array3::zeros((depth, size, size));
    let cells = size / CELL;
    iproduct!(0..depth, 0..cells, 0..cells).for_each(|(z, cy, cx)| {
        let id = (cy * cells + cx + 1) as u16;
        let (y, x) = (cy * CELL + CELL / 2, cx * CELL + CELL / 2);
        markers[[z, y, x]] = id;
        markers[[z, y, x - 1]] = id;
        markers[[z, y - 1, x]] = id;
    });
    markers
}

/// Helper function to create a segmentation whose cells are shifted by `shift`
///
/// Shifted inputs overlap neighbouring cells and cause realistic collisions.
fn create_segmentation(depth: usize, size: usize, shift: usize) -> LabelVolume<u16> {
    let cells = size / CELL;
    Array3::from_shape_fn((depth, size, size), |(_, y, x)| {
        let (cy, cx) = ((y + shift) / CELL, (x + shift) / CELL);
        if cy >= cells || cx >= cells || (y + shift) % CELL == 0 {
            0
        } else {
            (cy * cells + cx + 11) as u16
        }
    })
}

/// Benchmark the fusion presets on planar images
fn bench_fusion_presets(c: &mut Criterion) {
    let sizes = [64, 128, 256];
    let mut group = c.benchmark_group("fusion_presets");
    group.sample_size(10);

    for size in sizes {
        let markers = create_markers(1, size);
        let inputs: Vec<LabelVolume<u16>> =
            (0..4).map(|i| create_segmentation(1, size, i % 2)).collect();
        let refs: Vec<Option<&LabelVolume<u16>>> = inputs.iter().map(Some).collect();
        let weights = vec![1.0; refs.len()];
        group.throughput(Throughput::Elements((size * size) as u64));

        let presets = [
            ("threshold_weighted", FusionPipeline::<u16, u16>::threshold_weighted(2.0)),
            ("majority_flat", FusionPipeline::<u16, u16>::majority_flat()),
            ("bic_weighted", FusionPipeline::<u16, u16>::bic_weighted(2.0)),
            ("simple", FusionPipeline::<u16, u16>::simple(SimpleParams::default())),
        ];
        for (name, pipeline) in &presets {
            group.bench_with_input(
                BenchmarkId::new(*name, format!("{}x{}", size, size)),
                &markers,
                |b, markers| {
                    b.iter(|| {
                        pipeline
                            .fuse(black_box(&refs), black_box(&weights), black_box(markers))
                            .expect("Fusion should succeed")
                    })
                },
            );
        }
    }
    group.finish();
}

/// Benchmark pooled against freshly allocated working buffers
fn bench_memory_reuse(c: &mut Criterion) {
    let size = 192;
    let markers = create_markers(1, size);
    let inputs: Vec<LabelVolume<u16>> = (0..3).map(|i| create_segmentation(1, size, i)).collect();
    let refs: Vec<Option<&LabelVolume<u16>>> = inputs.iter().map(Some).collect();
    let weights = vec![1.0; refs.len()];

    let mut group = c.benchmark_group("memory_reuse");
    group.sample_size(10);
    group.throughput(Throughput::Elements((size * size) as u64));

    let fresh = FusionPipeline::<u16, u16>::bic_weighted(2.0);
    let pooled = FusionPipeline::<u16, u16>::bic_weighted(2.0)
        .with_memory(Arc::new(ReusableMemory::new([1, size, size])));
    for (name, pipeline) in [("fresh", &fresh), ("pooled", &pooled)] {
        group.bench_function(name, |b| {
            b.iter(|| {
                pipeline
                    .fuse(black_box(&refs), black_box(&weights), black_box(&markers))
                    .expect("Fusion should succeed")
            })
        });
    }
    group.finish();
}

/// Benchmark the bounding box index and component filtering on volumes
fn bench_stages(c: &mut Criterion) {
    let depths = [4, 16];
    let mut group = c.benchmark_group("stages");
    group.sample_size(10);

    for depth in depths {
        let size = 96;
        let markers = create_markers(depth, size);
        let input = create_segmentation(depth, size, 1);
        let inputs = [Some(&input), Some(&input)];
        let voxels = depth * size * size;
        group.throughput(Throughput::Elements(voxels as u64));

        group.bench_with_input(
            BenchmarkId::new("bounding_boxes", format!("{}x{}x{}", depth, size, size)),
            &markers,
            |b, markers| b.iter(|| BoxIndexSet::compute(black_box(&inputs), black_box(markers))),
        );

        let mut scratch = ComponentScratch::new([depth, size, size]);
        group.bench_with_input(
            BenchmarkId::new("keep_largest_component", format!("{}x{}x{}", depth, size, size)),
            &input,
            |b, input| {
                b.iter(|| {
                    let mut output = input.clone();
                    KeepLargestComponent.process_label(&mut output, 11, None, &mut scratch);
                    black_box(output)
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_fusion_presets, bench_memory_reuse, bench_stages);
criterion_main!(benches);
