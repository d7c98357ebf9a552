//! Comprehensive edge case and error condition tests
//!
//! This test suite focuses on invalid arguments, degenerate images and the
//! per-marker outcomes that are reported rather than raised.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use image::{ImageBuffer, Luma};
use labelops_fusion::{
    CollisionsAwareInsertor, FusionConfig, FusionError, FusionPipeline, Interval,
    LabelExtractor, LabelImageConvert, LabelVolume, MajorityOverlapExtractor, ReusableMemory,
    SimpleParams, VoidPostprocessor, WeightedVotingFuser,
};
use ndarray::{s, Array3};

/// Helper to create a planar label image of the given size
fn planar(height: usize, width: usize) -> LabelVolume<u16> {
    Array3::zeros((1, height, width))
}

/// Helper to create a marker image with one 2x2 marker at `(y, x)`
fn single_marker(height: usize, width: usize, y: usize, x: usize, id: u16) -> LabelVolume<u16> {
    let mut markers = planar(height, width);
    markers.slice_mut(s![0, y..y + 2, x..x + 2]).fill(id);
    markers
}

#[test]
fn weights_and_inputs_must_have_equal_length() {
    let markers = single_marker(6, 6, 2, 2, 1);
    let result = FusionPipeline::<u16, u16>::threshold_weighted(1.0).fuse(
        &[Some(&markers), None],
        &[1.0],
        &markers,
    );
    assert_eq!(
        result.err(),
        Some(FusionError::LengthMismatch {
            images: 2,
            weights: 1
        })
    );
}

#[test]
fn inputs_must_match_marker_shape() {
    let markers = single_marker(6, 6, 2, 2, 1);
    let wrong = planar(6, 7);
    let result =
        FusionPipeline::<u16, u16>::threshold_weighted(1.0).fuse(&[Some(&wrong)], &[1.0], &markers);
    assert_eq!(
        result.err(),
        Some(FusionError::DimensionMismatch {
            expected: [1, 6, 6],
            actual: [1, 6, 7]
        })
    );
}

#[test]
fn absent_inputs_skip_shape_check() {
    let markers = single_marker(6, 6, 2, 2, 1);
    let outcome = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .fuse(&[None, None], &[1.0, 1.0], &markers)
        .expect("Absent inputs are allowed");

    assert!(outcome.output.iter().all(|&v| v == 0));
    assert_eq!(outcome.report.total_markers, 1);
    assert_eq!(outcome.report.no_match.iter().copied().collect::<Vec<_>>(), vec![1]);
    assert_eq!(outcome.report.secured(), 0);
}

#[test]
fn builder_names_each_missing_stage() {
    let no_extractor = FusionPipeline::<u16, u16>::builder()
        .fuser(WeightedVotingFuser)
        .insertor(CollisionsAwareInsertor)
        .postprocessor(VoidPostprocessor)
        .build();
    assert_eq!(no_extractor.err(), Some(FusionError::MissingStage("extractor")));

    let no_fuser = FusionPipeline::<u16, u16>::builder()
        .extractor(MajorityOverlapExtractor::default())
        .insertor(CollisionsAwareInsertor)
        .postprocessor(VoidPostprocessor)
        .build();
    assert_eq!(no_fuser.err(), Some(FusionError::MissingStage("fuser")));

    let no_postprocessor = FusionPipeline::<u16, u16>::builder()
        .extractor(MajorityOverlapExtractor::default())
        .fuser(WeightedVotingFuser)
        .insertor(CollisionsAwareInsertor)
        .build();
    assert_eq!(
        no_postprocessor.err(),
        Some(FusionError::MissingStage("postprocessor"))
    );
}

#[test]
fn invalid_configuration_is_rejected() {
    let too_high = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .with_config(FusionConfig::default().with_collision_threshold(1.5));
    assert!(matches!(too_high.err(), Some(FusionError::InvalidParameter(_))));

    let negative = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .with_config(FusionConfig::default().with_threshold(-0.5));
    assert!(matches!(negative.err(), Some(FusionError::InvalidParameter(_))));

    let params = SimpleParams {
        initial_quality_threshold: 0.2,
        minimal_quality_threshold: 0.4,
        ..SimpleParams::default()
    };
    assert!(matches!(params.validate(), Err(FusionError::InvalidParameter(_))));
}

#[test]
fn inverted_interval_is_rejected() {
    assert!(matches!(
        Interval::new([0, 3, 1], [0, 2, 4]),
        Err(FusionError::InvalidParameter(_))
    ));
    assert!(Interval::new([0, 2, 1], [0, 2, 4]).is_ok());
}

#[test]
fn pool_of_other_shape_is_rejected() {
    let markers = single_marker(6, 6, 2, 2, 1);
    let pool = Arc::new(ReusableMemory::<u16>::new([1, 4, 4]));
    let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0).with_memory(pool);
    let result = pipeline.fuse(&[Some(&markers)], &[1.0], &markers);
    assert_eq!(
        result.err(),
        Some(FusionError::ShapeMismatch {
            expected: [1, 4, 4],
            actual: [1, 6, 6]
        })
    );
}

#[test]
fn cancelled_fusion_returns_error_and_releases_pool() {
    let markers = single_marker(6, 6, 2, 2, 1);
    let pool = Arc::new(ReusableMemory::<u16>::new([1, 6, 6]));
    let pipeline =
        FusionPipeline::<u16, u16>::threshold_weighted(1.0).with_memory(Arc::clone(&pool));

    let cancel = AtomicBool::new(true);
    let result = pipeline.fuse_with_cancel(&[Some(&markers)], &[1.0], &markers, &cancel);
    assert_eq!(result.err(), Some(FusionError::Cancelled));

    // the slot must be usable again after the cancelled run
    let outcome = pipeline
        .fuse(&[Some(&markers)], &[1.0], &markers)
        .expect("Fusion should succeed");
    assert_eq!(outcome.output, markers);
}

#[test]
fn empty_marker_image_yields_empty_report() {
    let markers = planar(5, 5);
    let mut input = planar(5, 5);
    input.slice_mut(s![0, 1..4, 1..4]).fill(3);

    let outcome = FusionPipeline::<u16, u16>::majority_flat()
        .fuse(&[Some(&input)], &[1.0], &markers)
        .expect("Fusion should succeed");
    assert!(outcome.output.iter().all(|&v| v == 0));
    assert_eq!(outcome.report.total_markers, 0);
    assert_eq!(outcome.report.histogram.total(), 0);
}

#[test]
fn single_voxel_image_has_no_border() {
    let markers = Array3::from_elem((1, 1, 1), 4u16);
    let input = Array3::from_elem((1, 1, 1), 9u16);
    let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .with_config(FusionConfig::default().with_border_removal(true))
        .expect("Configuration should be valid");

    let outcome = pipeline
        .fuse(&[Some(&input)], &[1.0], &markers)
        .expect("Fusion should succeed");
    assert_eq!(outcome.output, markers);
    assert!(outcome.report.at_border.is_empty());
}

#[test]
fn ignored_markers_are_left_out() {
    let mut markers = single_marker(8, 8, 1, 1, 1);
    markers.slice_mut(s![0, 5..7, 5..7]).fill(2);
    let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .with_config(FusionConfig::default().ignoring([2]))
        .expect("Configuration should be valid");

    let outcome = pipeline
        .fuse(&[Some(&markers)], &[1.0], &markers)
        .expect("Fusion should succeed");
    assert_eq!(outcome.report.total_markers, 1);
    assert!(outcome.output.iter().all(|&v| v != 2));
}

#[test]
fn unmatched_marker_footprint_is_stamped_when_enabled() {
    let mut markers = single_marker(8, 8, 1, 1, 1);
    markers.slice_mut(s![0, 5..7, 5..7]).fill(2);
    let mut input = planar(8, 8);
    input.slice_mut(s![0, 1..3, 1..3]).fill(6);

    let plain = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .fuse(&[Some(&input)], &[1.0], &markers)
        .expect("Fusion should succeed");
    assert_eq!(plain.output.iter().filter(|&&v| v == 2).count(), 0);

    let stamping = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .with_config(FusionConfig::default().with_marker_insertion(true))
        .expect("Configuration should be valid");
    let outcome = stamping
        .fuse(&[Some(&input)], &[1.0], &markers)
        .expect("Fusion should succeed");
    assert_eq!(outcome.output, markers);
    // the marker is still reported as unmatched
    assert!(outcome.report.no_match.contains(&2));
}

#[test]
fn removed_colliding_marker_footprint_is_stamped_when_enabled() {
    let mut markers = planar(5, 12);
    markers.slice_mut(s![0, 2, 2..=3]).fill(1);
    markers.slice_mut(s![0, 2, 7..=8]).fill(2);
    let mut first = planar(5, 12);
    first.slice_mut(s![0, 2, 1..=6]).fill(1);
    first.slice_mut(s![0, 2, 7..=10]).fill(2);
    let mut second = planar(5, 12);
    second.slice_mut(s![0, 2, 1..=3]).fill(5);
    second.slice_mut(s![0, 2, 4..=10]).fill(6);

    let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
        .with_config(
            FusionConfig::default()
                .with_collision_threshold(0.45)
                .with_marker_insertion(true),
        )
        .expect("Configuration should be valid");
    let outcome = pipeline
        .fuse(&[Some(&first), Some(&second)], &[1.0, 1.0], &markers)
        .expect("Fusion should succeed");

    let row: Vec<u16> = outcome.output.slice(s![0, 2, ..]).to_vec();
    assert_eq!(row, vec![0, 0, 1, 1, 0, 0, 0, 2, 2, 2, 2, 0]);
}

#[test]
fn zero_weights_never_reach_positive_threshold() {
    let markers = single_marker(6, 6, 2, 2, 1);
    let outcome = FusionPipeline::<u16, u16>::threshold_weighted(0.5)
        .fuse(&[Some(&markers), Some(&markers)], &[0.0, 0.0], &markers)
        .expect("Fusion should succeed");
    assert!(outcome.output.iter().all(|&v| v == 0));
    assert!(outcome.report.no_match.contains(&1));
}

#[test]
fn extraction_threshold_is_inclusive() {
    let markers = single_marker(4, 4, 1, 1, 1);
    let mut half = planar(4, 4);
    half.slice_mut(s![0, 1, 1..3]).fill(8);
    let mut quarter = planar(4, 4);
    quarter[[0, 1, 1]] = 8;

    let extractor = MajorityOverlapExtractor::default();
    assert_eq!(
        extractor.find_matching_label(half.view(), markers.view(), 1),
        Some(8)
    );
    assert_eq!(
        extractor.find_matching_label(quarter.view(), markers.view(), 1),
        None
    );
    // background is never a match even when it covers the whole marker
    let background = planar(4, 4);
    assert_eq!(
        MajorityOverlapExtractor::new(0.0).find_matching_label(
            background.view(),
            markers.view(),
            1
        ),
        None
    );
}

#[test]
fn extraction_tie_goes_to_first_label_seen() {
    let markers = single_marker(4, 4, 1, 1, 1);
    let mut split = planar(4, 4);
    split.slice_mut(s![0, 1, 1..3]).fill(5);
    split.slice_mut(s![0, 2, 1..3]).fill(3);

    let extractor = MajorityOverlapExtractor::new(0.5);
    assert_eq!(
        extractor.find_matching_label(split.view(), markers.view(), 1),
        Some(5)
    );
}

#[test]
fn slice_stack_conversion_errors() {
    let empty: Vec<ImageBuffer<Luma<u16>, Vec<u16>>> = Vec::new();
    assert_eq!(
        LabelVolume::<u16>::from_label_slices(&empty).err(),
        Some(FusionError::EmptyStack)
    );

    let slices = vec![
        ImageBuffer::<Luma<u16>, Vec<u16>>::new(4, 3),
        ImageBuffer::<Luma<u16>, Vec<u16>>::new(4, 2),
    ];
    assert_eq!(
        LabelVolume::<u16>::from_label_slices(&slices).err(),
        Some(FusionError::DimensionMismatch {
            expected: [2, 3, 4],
            actual: [2, 2, 4]
        })
    );

    let stack = vec![ImageBuffer::from_pixel(3, 2, Luma([7u16])); 4];
    let volume = LabelVolume::<u16>::from_label_slices(&stack).expect("Equal slices stack");
    assert_eq!(volume.dim(), (4, 2, 3));
    assert_eq!(volume.to_label_slices(), stack);
}

#[test]
fn error_messages_are_descriptive() {
    let error = FusionError::LengthMismatch {
        images: 3,
        weights: 2,
    };
    assert!(error.to_string().contains("3 images, 2 weights"));
    assert_eq!(
        FusionError::MissingStage("fuser").to_string(),
        "Pipeline is not fully initialized: missing fuser"
    );
}
