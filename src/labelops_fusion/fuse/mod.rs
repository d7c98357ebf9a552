//! Strategies that turn the matched input labels of one marker into a
//! binary candidate mask.

mod fail_safe;
mod picker;
mod simple;
mod voting;

pub use fail_safe::{best_weight_index, FailSafe};
pub use picker::{
    CombinationPicker, CombinationScore, LabelPicker, LabelledReference, ReferenceMask,
    ReferenceSource,
};
pub use simple::{SimpleFuser, SimpleTrace};
pub use voting::{FlatThreshold, FlatVotingFuser, WeightedVotingFuser};

use ndarray::{Array3, ArrayView3};

use super::extract::add_given_label;
use super::volume::{Interval, LabelValue, LabelVolume};

/// Value written into the candidate for voxels that belong to the fused label.
pub const FUSION_LABEL: f64 = 1.0;

/// Added to majority thresholds so that an exact half never wins.
pub const MAJORITY_EPSILON: f64 = 0.0001;

/// One input's label that matched the current marker.
#[derive(Debug, Clone, Copy)]
pub struct MatchedLabel<'a, I> {
    pub image: &'a LabelVolume<I>,
    pub label: I,
}

impl<'a, I> MatchedLabel<'a, I> {
    pub const fn new(image: &'a LabelVolume<I>, label: I) -> Self {
        Self { image, label }
    }

    /// The input image restricted to `roi`.
    pub fn view(&self, roi: &Interval) -> ArrayView3<'a, I> {
        roi.view(self.image)
    }
}

/// Per-marker information handed to a fuser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuseContext {
    /// Id of the marker being fused.
    pub marker: u64,
    /// Region all matched labels and the marker lie in.
    pub roi: Interval,
    /// Configured acceptance threshold for the accumulated vote.
    pub threshold: f64,
}

/// Combines the matched labels of one marker into the candidate mask.
///
/// Implementations write [`FUSION_LABEL`] or `0` into every voxel of
/// `ctx.roi` inside `candidate`. Voxels outside the region must stay as they
/// are. `inputs` and `weights` have the same length; absent inputs are `None`.
pub trait LabelFuser<I>: Send + Sync {
    fn fuse_matching_labels(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        weights: &[f64],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    );
}

/// Accumulates weighted votes over `roi` and binarizes against `threshold`.
///
/// Inputs with a `false` entry in `active` are skipped.
pub(crate) fn vote<I: LabelValue>(
    inputs: &[Option<MatchedLabel<'_, I>>],
    weights: impl Fn(usize) -> f64,
    active: impl Fn(usize) -> bool,
    candidate: &mut Array3<f64>,
    roi: &Interval,
    threshold: f64,
) {
    let mut out = roi.view_mut(candidate);
    out.fill(0.0);
    for (i, input) in inputs.iter().enumerate() {
        let Some(matched) = input else { continue };
        if active(i) {
            add_given_label(matched.view(roi), matched.label, out.view_mut(), weights(i));
        }
    }
    out.mapv_inplace(|v| {
        if v >= threshold {
            FUSION_LABEL
        } else {
            0.0
        }
    });
}

/// Whether the candidate holds no fused voxel inside `roi`.
pub fn is_candidate_empty(candidate: &Array3<f64>, roi: &Interval) -> bool {
    roi.view(candidate).iter().all(|&v| v <= 0.0)
}
