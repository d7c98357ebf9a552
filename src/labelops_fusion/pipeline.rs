//! The fusion driver: per-marker extraction, fusion and insertion, followed
//! by finalization and postprocessing.

use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::bounding_box::BoxIndexSet;
use super::config::{FusionConfig, SimpleParams};
use super::extract::{LabelExtractor, MajorityOverlapExtractor};
use super::fuse::{
    FailSafe, FlatVotingFuser, FuseContext, LabelFuser, MatchedLabel, SimpleFuser,
    WeightedVotingFuser,
};
use super::insert::{
    CollisionsAwareInsertor, CollisionsManagingInsertor, InsertionStatus, LabelInsertor,
};
use super::memory::{BorrowerId, PoolLease, ReusableMemory, SlotBuffers};
use super::postprocess::{KeepLargestComponent, LabelPostprocessor};
use super::resolve::insert_marker_footprints;
use super::run::{FusionOutcome, FusionRun};
use super::volume::{shape_of, LabelValue, LabelVolume};
use crate::error::FusionError;
use crate::utils::validate_matching_shapes;

/// Collision threshold of the flat BIC preset.
pub const BIC_COLLISION_THRESHOLD: f32 = 0.2;

/// Working buffers of one run: leased from a pool or owned outright.
enum Scratch<L: LabelValue> {
    Leased(PoolLease<L>),
    Owned(Box<SlotBuffers<L>>),
}

impl<L: LabelValue> Deref for Scratch<L> {
    type Target = SlotBuffers<L>;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Leased(lease) => lease,
            Self::Owned(buffers) => buffers,
        }
    }
}

impl<L: LabelValue> DerefMut for Scratch<L> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Leased(lease) => lease,
            Self::Owned(buffers) => buffers,
        }
    }
}

/// A configured label fusion algorithm.
///
/// `I` is the voxel type of the input segmentations, `L` the voxel type of
/// the marker and output images. The pipeline is immutable once built and
/// may be shared between threads; each call to [`FusionPipeline::fuse`]
/// works on its own buffers.
pub struct FusionPipeline<I, L> {
    extractor: Box<dyn LabelExtractor<I, L>>,
    fuser: Box<dyn LabelFuser<I>>,
    insertor: Box<dyn LabelInsertor<L>>,
    postprocessor: Box<dyn LabelPostprocessor<L>>,
    config: FusionConfig,
    memory: Option<Arc<ReusableMemory<L>>>,
}

impl<I, L> std::fmt::Debug for FusionPipeline<I, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FusionPipeline")
            .field("config", &self.config)
            .field("pooled", &self.memory.is_some())
            .finish_non_exhaustive()
    }
}

/// Assembles a [`FusionPipeline`] stage by stage.
pub struct FusionPipelineBuilder<I, L> {
    extractor: Option<Box<dyn LabelExtractor<I, L>>>,
    fuser: Option<Box<dyn LabelFuser<I>>>,
    insertor: Option<Box<dyn LabelInsertor<L>>>,
    postprocessor: Option<Box<dyn LabelPostprocessor<L>>>,
    config: FusionConfig,
    memory: Option<Arc<ReusableMemory<L>>>,
}

impl<I: LabelValue, L: LabelValue> Default for FusionPipelineBuilder<I, L> {
    fn default() -> Self {
        Self {
            extractor: None,
            fuser: None,
            insertor: None,
            postprocessor: None,
            config: FusionConfig::default(),
            memory: None,
        }
    }
}

impl<I: LabelValue, L: LabelValue> FusionPipelineBuilder<I, L> {
    pub fn extractor(mut self, extractor: impl LabelExtractor<I, L> + 'static) -> Self {
        self.extractor = Some(Box::new(extractor));
        self
    }

    pub fn fuser(mut self, fuser: impl LabelFuser<I> + 'static) -> Self {
        self.fuser = Some(Box::new(fuser));
        self
    }

    pub fn insertor(mut self, insertor: impl LabelInsertor<L> + 'static) -> Self {
        self.insertor = Some(Box::new(insertor));
        self
    }

    pub fn postprocessor(mut self, postprocessor: impl LabelPostprocessor<L> + 'static) -> Self {
        self.postprocessor = Some(Box::new(postprocessor));
        self
    }

    pub fn config(mut self, config: FusionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn memory(mut self, memory: Arc<ReusableMemory<L>>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// # Errors
    ///
    /// Returns `MissingStage` naming the first stage that was not set, or
    /// `InvalidParameter` when the configuration does not validate.
    pub fn build(self) -> Result<FusionPipeline<I, L>, FusionError> {
        self.config.validate()?;
        Ok(FusionPipeline {
            extractor: self.extractor.ok_or(FusionError::MissingStage("extractor"))?,
            fuser: self.fuser.ok_or(FusionError::MissingStage("fuser"))?,
            insertor: self.insertor.ok_or(FusionError::MissingStage("insertor"))?,
            postprocessor: self
                .postprocessor
                .ok_or(FusionError::MissingStage("postprocessor"))?,
            config: self.config,
            memory: self.memory,
        })
    }
}

impl<I: LabelValue, L: LabelValue> FusionPipeline<I, L> {
    pub fn builder() -> FusionPipelineBuilder<I, L> {
        FusionPipelineBuilder::default()
    }

    fn preset(
        fuser: impl LabelFuser<I> + 'static,
        insertor: impl LabelInsertor<L> + 'static,
        config: FusionConfig,
    ) -> Self {
        Self {
            extractor: Box::new(MajorityOverlapExtractor::new(config.min_overlap_fraction)),
            fuser: Box::new(fuser),
            insertor: Box::new(insertor),
            postprocessor: Box::new(KeepLargestComponent),
            config,
            memory: None,
        }
    }

    /// Flat voting against `threshold` votes, colliding markers removed.
    pub fn threshold_flat(threshold: f64) -> Self {
        Self::preset(
            FlatVotingFuser::default(),
            CollisionsAwareInsertor,
            FusionConfig::default().with_threshold(threshold),
        )
    }

    /// Weighted voting against `threshold`, colliding markers removed.
    pub fn threshold_weighted(threshold: f64) -> Self {
        Self::preset(
            WeightedVotingFuser,
            CollisionsAwareInsertor,
            FusionConfig::default().with_threshold(threshold),
        )
    }

    /// Strict majority of the matched inputs, colliding markers removed.
    pub fn majority_flat() -> Self {
        Self::preset(
            FlatVotingFuser::majority(),
            CollisionsAwareInsertor,
            FusionConfig::default(),
        )
    }

    /// Iterative SIMPLE refinement, colliding markers removed.
    pub fn simple(params: SimpleParams) -> Self {
        Self::preset(
            SimpleFuser::new(params),
            CollisionsAwareInsertor,
            FusionConfig::default(),
        )
    }

    /// Fail-safe weighted voting with collision resolution by erosion.
    pub fn bic_weighted(threshold: f64) -> Self {
        Self::preset(
            FailSafe::new(WeightedVotingFuser),
            CollisionsManagingInsertor,
            FusionConfig::default().with_threshold(threshold),
        )
    }

    /// Fail-safe flat voting with collision resolution by erosion.
    pub fn bic_flat(threshold: f64) -> Self {
        Self::preset(
            FailSafe::new(FlatVotingFuser::default()),
            CollisionsManagingInsertor,
            FusionConfig::default()
                .with_threshold(threshold)
                .with_collision_threshold(BIC_COLLISION_THRESHOLD),
        )
    }

    /// Replaces the configuration of a preset.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` when the configuration does not validate.
    pub fn with_config(mut self, config: FusionConfig) -> Result<Self, FusionError> {
        config.validate()?;
        self.extractor = Box::new(MajorityOverlapExtractor::new(config.min_overlap_fraction));
        self.config = config;
        Ok(self)
    }

    /// Runs on buffers leased from `memory` instead of fresh allocations.
    pub fn with_memory(mut self, memory: Arc<ReusableMemory<L>>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fuses `inputs` guided by `markers`.
    ///
    /// `inputs[i]` is weighted by `weights[i]`; absent inputs take part in
    /// nothing but keep their slot.
    ///
    /// # Errors
    ///
    /// Fails before touching any image with `LengthMismatch`,
    /// `DimensionMismatch`, or `InvalidParameter` when a marker uses the
    /// reserved collision id `L::max_value()`. Fails with `ShapeMismatch` or
    /// `SlotInUse` when the configured memory pool cannot serve the call.
    pub fn fuse(
        &self,
        inputs: &[Option<&LabelVolume<I>>],
        weights: &[f64],
        markers: &LabelVolume<L>,
    ) -> Result<FusionOutcome<L>, FusionError> {
        self.validate_inputs(inputs, weights, markers)?;
        let boxes = BoxIndexSet::compute(inputs, markers);
        self.run(inputs, weights, markers, &boxes, None)
    }

    /// [`FusionPipeline::fuse`] that stops between markers once `cancel` is
    /// set.
    ///
    /// # Errors
    ///
    /// As [`FusionPipeline::fuse`], plus `Cancelled`.
    pub fn fuse_with_cancel(
        &self,
        inputs: &[Option<&LabelVolume<I>>],
        weights: &[f64],
        markers: &LabelVolume<L>,
        cancel: &AtomicBool,
    ) -> Result<FusionOutcome<L>, FusionError> {
        self.validate_inputs(inputs, weights, markers)?;
        let boxes = BoxIndexSet::compute(inputs, markers);
        self.run(inputs, weights, markers, &boxes, Some(cancel))
    }

    /// [`FusionPipeline::fuse`] with bounding boxes computed on `pool`.
    ///
    /// # Errors
    ///
    /// As [`FusionPipeline::fuse`].
    #[cfg(feature = "rayon")]
    pub fn fuse_in(
        &self,
        pool: &rayon::ThreadPool,
        inputs: &[Option<&LabelVolume<I>>],
        weights: &[f64],
        markers: &LabelVolume<L>,
    ) -> Result<FusionOutcome<L>, FusionError> {
        self.validate_inputs(inputs, weights, markers)?;
        let boxes = BoxIndexSet::compute_in(pool, inputs, markers);
        self.run(inputs, weights, markers, &boxes, None)
    }

    fn validate_inputs(
        &self,
        inputs: &[Option<&LabelVolume<I>>],
        weights: &[f64],
        markers: &LabelVolume<L>,
    ) -> Result<(), FusionError> {
        if inputs.len() != weights.len() {
            return Err(FusionError::LengthMismatch {
                images: inputs.len(),
                weights: weights.len(),
            });
        }
        let shape = shape_of(markers);
        for input in inputs.iter().flatten() {
            validate_matching_shapes(shape, shape_of(*input))?;
        }
        if markers.iter().any(|&m| m == L::max_value()) {
            return Err(FusionError::InvalidParameter(format!(
                "marker id {:?} is reserved for collision voxels",
                L::max_value()
            )));
        }
        Ok(())
    }

    fn scratch(&self, shape: [usize; 3]) -> Result<Scratch<L>, FusionError> {
        match &self.memory {
            Some(memory) => memory
                .acquire_for(BorrowerId::current_thread(), shape)
                .map(Scratch::Leased),
            None => Ok(Scratch::Owned(Box::new(SlotBuffers::new(shape)))),
        }
    }

    fn run(
        &self,
        inputs: &[Option<&LabelVolume<I>>],
        weights: &[f64],
        markers: &LabelVolume<L>,
        boxes: &BoxIndexSet<I, L>,
        cancel: Option<&AtomicBool>,
    ) -> Result<FusionOutcome<L>, FusionError> {
        let shape = shape_of(markers);
        let mut scratch = self.scratch(shape)?;
        let buffers: &mut SlotBuffers<L> = &mut scratch;
        buffers.output.fill(L::zero());

        let mut run = FusionRun::with_scratch(
            std::mem::take(&mut buffers.registry),
            std::mem::take(&mut buffers.pending),
            std::mem::take(&mut buffers.hidden),
        );

        let mut matches: Vec<Option<MatchedLabel<'_, I>>> = Vec::with_capacity(inputs.len());
        for marker in boxes.sorted_markers() {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                log::info!("fusion cancelled after {} markers", run.discovered);
                restore_scratch(buffers, run);
                return Err(FusionError::Cancelled);
            }
            let marker_id = marker.to_u64().unwrap_or_default();
            if self.config.is_ignored(marker_id) {
                log::debug!("marker {marker_id} ignored");
                continue;
            }
            run.discovered += 1;

            let marker_box = boxes.markers[&marker];
            let marker_view = marker_box.view(markers);
            let mut fuse_roi = marker_box;
            matches.clear();
            for (i, input) in inputs.iter().enumerate() {
                let matched = input.and_then(|image| {
                    self.extractor
                        .find_matching_label(marker_box.view(image), marker_view.view(), marker)
                        .map(|label| MatchedLabel::new(image, label))
                });
                if let Some(m) = &matched {
                    log::trace!("marker {marker_id}: input {i} matched label {:?}", m.label);
                    if let Some(label_box) = boxes.input_box(i, m.label) {
                        fuse_roi = fuse_roi.union(label_box);
                    }
                }
                matches.push(matched);
            }

            let matched_count = matches.iter().flatten().count();
            let status = if matched_count > 0 {
                run.fused_rois.insert(marker, fuse_roi);
                let ctx = FuseContext {
                    marker: marker_id,
                    roi: fuse_roi,
                    threshold: self.config.threshold,
                };
                self.fuser
                    .fuse_matching_labels(&matches, weights, &mut buffers.candidate, &ctx);
                self.insertor.insert_label(
                    &buffers.candidate,
                    &mut buffers.output,
                    &fuse_roi,
                    marker,
                    &mut run,
                )
            } else {
                InsertionStatus::default()
            };
            self.classify(marker, marker_id, matched_count, &status, &mut run);
        }

        let histogram =
            self.insertor
                .finalize(&mut buffers.output, markers, &mut run, &self.config);
        self.postprocess(buffers, &run);

        if self.config.insert_markers_for_unresolved {
            let stamped = insert_marker_footprints(&mut buffers.output, markers, &run);
            log::info!("inserted {stamped} marker voxels for unmatched or colliding markers");
        }

        let report = run.report(histogram);
        report.log_summary();
        let output = buffers.output.clone();

        restore_scratch(buffers, run);

        Ok(FusionOutcome { output, report })
    }

    fn classify(
        &self,
        marker: L,
        marker_id: u64,
        matched_count: usize,
        status: &InsertionStatus<L>,
        run: &mut FusionRun<L>,
    ) {
        if !status.found_at_all {
            run.no_match.insert(marker);
            log::info!(
                "marker {marker_id}, images matching: {matched_count}, not found"
            );
            return;
        }
        if status.at_border && self.config.remove_markers_at_border {
            run.at_border.insert(marker);
            log::info!(
                "marker {marker_id}, images matching: {matched_count}, at border, removed"
            );
            return;
        }
        if status.in_collision {
            log::info!(
                "marker {marker_id}, images matching: {matched_count}, collides with {:?}",
                status.local_colliders
            );
        } else {
            log::info!("marker {marker_id}, images matching: {matched_count}, secured for now");
        }
    }

    /// Clears leftover collision voxels, then postprocesses every marker
    /// still present in the output.
    fn postprocess(&self, buffers: &mut SlotBuffers<L>, run: &FusionRun<L>) {
        let collision = self.insertor.collision_value();
        let mut present = BTreeSet::new();
        buffers.output.mapv_inplace(|v| {
            if Some(v) == collision {
                return L::zero();
            }
            if v != L::zero() {
                present.insert(v);
            }
            v
        });

        for marker in present {
            self.postprocessor.process_label(
                &mut buffers.output,
                marker,
                run.fused_roi(marker),
                &mut buffers.components,
            );
        }
    }
}

/// Hands the run's recycled containers back to the slot.
fn restore_scratch<L: LabelValue>(buffers: &mut SlotBuffers<L>, run: FusionRun<L>) {
    let (registry, pending, hidden) = run.into_scratch();
    buffers.registry = registry;
    buffers.pending = pending;
    buffers.hidden = hidden;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labelops_fusion::postprocess::VoidPostprocessor;
    use crate::test_utils::{count_label, paint, volume_from_rows};
    use ndarray::Array3;

    fn planar(rows: usize, cols: usize) -> Array3<u16> {
        Array3::zeros((1, rows, cols))
    }

    #[test]
    fn test_builder_reports_missing_stage() {
        let result = FusionPipeline::<u16, u16>::builder()
            .extractor(MajorityOverlapExtractor::default())
            .fuser(WeightedVotingFuser)
            .postprocessor(VoidPostprocessor)
            .build();
        assert_eq!(result.err(), Some(FusionError::MissingStage("insertor")));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = FusionPipeline::<u16, u16>::builder()
            .extractor(MajorityOverlapExtractor::default())
            .fuser(WeightedVotingFuser)
            .insertor(CollisionsAwareInsertor)
            .postprocessor(VoidPostprocessor)
            .config(FusionConfig::default().with_threshold(-2.0))
            .build();
        assert!(matches!(result, Err(FusionError::InvalidParameter(_))));
    }

    #[test]
    fn test_length_mismatch_fails_fast() {
        let markers = planar(4, 4);
        let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0);
        let result = pipeline.fuse(&[Some(&markers)], &[1.0, 1.0], &markers);
        assert_eq!(
            result.err(),
            Some(FusionError::LengthMismatch {
                images: 1,
                weights: 2
            })
        );
    }

    #[test]
    fn test_single_input_is_copied_under_marker_ids() {
        let mut markers = planar(6, 6);
        paint(&mut markers, [0, 2, 2], [0, 3, 3], 4);
        let mut input = planar(6, 6);
        paint(&mut input, [0, 1, 1], [0, 4, 4], 9);

        let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0);
        let outcome = pipeline.fuse(&[Some(&input)], &[1.0], &markers).unwrap();
        assert_eq!(outcome.output, input.mapv(|v| if v == 9 { 4 } else { 0 }));
        assert_eq!(count_label(&outcome.output, 4), 16);
        assert_eq!(outcome.report.total_markers, 1);
        assert_eq!(outcome.report.secured(), 1);
    }

    #[test]
    fn test_ignored_marker_is_skipped() {
        let mut markers = planar(6, 6);
        markers[[0, 1, 1]] = 1;
        markers[[0, 4, 4]] = 2;
        let input = markers.clone();

        let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
            .with_config(FusionConfig::default().ignoring([2]))
            .unwrap();
        let outcome = pipeline.fuse(&[Some(&input)], &[1.0], &markers).unwrap();
        assert_eq!(outcome.report.total_markers, 1);
        assert_eq!(outcome.output[[0, 4, 4]], 0);
        assert_eq!(outcome.output[[0, 1, 1]], 1);
    }

    #[test]
    fn test_unmatched_marker_gets_footprint_when_enabled() {
        let markers = volume_from_rows::<u16>(&[
            &[0, 0, 0, 0, 0],
            &[0, 1, 0, 2, 0],
            &[0, 0, 0, 0, 0],
        ]);
        let input = volume_from_rows::<u16>(&[
            &[0, 0, 0, 0, 0],
            &[0, 5, 0, 0, 0],
            &[0, 0, 0, 0, 0],
        ]);

        let plain = FusionPipeline::<u16, u16>::threshold_weighted(1.0);
        let outcome = plain.fuse(&[Some(&input)], &[1.0], &markers).unwrap();
        assert_eq!(outcome.report.no_match.iter().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(outcome.output[[0, 1, 3]], 0);

        let stamping = FusionPipeline::<u16, u16>::threshold_weighted(1.0)
            .with_config(FusionConfig::default().with_marker_insertion(true))
            .unwrap();
        let outcome = stamping.fuse(&[Some(&input)], &[1.0], &markers).unwrap();
        assert_eq!(outcome.output[[0, 1, 3]], 2);
        assert_eq!(outcome.output[[0, 1, 1]], 1);
    }

    #[test]
    fn test_cancel_flag_stops_fusion() {
        let mut markers = planar(4, 4);
        markers[[0, 1, 1]] = 1;
        let pipeline = FusionPipeline::<u16, u16>::threshold_weighted(1.0);
        let cancel = AtomicBool::new(true);
        let result = pipeline.fuse_with_cancel(&[Some(&markers)], &[1.0], &markers, &cancel);
        assert_eq!(result.err(), Some(FusionError::Cancelled));
    }

    #[test]
    fn test_bic_presets_collision_thresholds() {
        let weighted = FusionPipeline::<u16, u16>::bic_weighted(1.0);
        let flat = FusionPipeline::<u16, u16>::bic_flat(1.0);
        assert_eq!(weighted.config().remove_markers_collision_threshold, 0.1);
        assert_eq!(flat.config().remove_markers_collision_threshold, BIC_COLLISION_THRESHOLD);
        assert_eq!(flat.config().threshold, 1.0);
    }

    #[test]
    fn test_reserved_marker_id_is_rejected() {
        let mut markers = Array3::<u8>::zeros((1, 6, 6));
        paint(&mut markers, [0, 1, 1], [0, 4, 4], u8::MAX);
        let input = markers.mapv(|v| if v == u8::MAX { 3 } else { 0 });

        let pipeline = FusionPipeline::<u8, u8>::threshold_weighted(1.0);
        let result = pipeline.fuse(&[Some(&input)], &[1.0], &markers);
        assert!(matches!(result, Err(FusionError::InvalidParameter(_))));

        markers.mapv_inplace(|v| if v == u8::MAX { 254 } else { v });
        let outcome = pipeline.fuse(&[Some(&input)], &[1.0], &markers).unwrap();
        assert_eq!(count_label(&outcome.output, 254), 16);
    }

    #[test]
    fn test_cancel_returns_scratch_to_pool() {
        let markers = volume_from_rows::<u16>(&[&[0, 0, 1, 1, 0, 0, 0, 2, 2, 0, 0, 0]]);
        let first = volume_from_rows::<u16>(&[&[0, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 0]]);
        let second = volume_from_rows::<u16>(&[&[0, 5, 5, 5, 6, 6, 6, 6, 6, 6, 6, 0]]);
        let inputs = [Some(&first), Some(&second)];

        let pool = Arc::new(ReusableMemory::<u16>::new([1, 1, 12]));
        let pipeline = FusionPipeline::<u16, u16>::bic_weighted(1.0)
            .with_config(FusionConfig::default().with_collision_threshold(0.6))
            .unwrap()
            .with_memory(Arc::clone(&pool));
        pipeline.fuse(&inputs, &[1.0, 1.0], &markers).unwrap();

        let cancel = AtomicBool::new(true);
        let result = pipeline.fuse_with_cancel(&inputs, &[1.0, 1.0], &markers, &cancel);
        assert_eq!(result.err(), Some(FusionError::Cancelled));

        let lease = pool.acquire(BorrowerId::current_thread()).unwrap();
        assert!(lease.pending.capacity() >= 3);
        assert!(lease.pending.is_empty());
    }
}
