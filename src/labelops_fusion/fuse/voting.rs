use ndarray::Array3;

use super::{vote, FuseContext, LabelFuser, MatchedLabel, MAJORITY_EPSILON};
use crate::labelops_fusion::volume::LabelValue;

/// Classic weighted voting.
///
/// A voxel is accepted when the weights of the inputs labelling it add up to
/// at least the configured threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeightedVotingFuser;

impl<I: LabelValue> LabelFuser<I> for WeightedVotingFuser {
    fn fuse_matching_labels(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        weights: &[f64],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    ) {
        vote(inputs, |i| weights[i], |_| true, candidate, &ctx.roi, ctx.threshold);
    }
}

/// How [`FlatVotingFuser`] derives its acceptance threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum FlatThreshold {
    /// Use the pipeline threshold as a vote count.
    #[default]
    Configured,
    /// Strict majority of the inputs that matched this marker.
    Majority,
}

/// Voting where every input counts once regardless of its weight.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlatVotingFuser {
    pub threshold: FlatThreshold,
}

impl FlatVotingFuser {
    pub const fn majority() -> Self {
        Self {
            threshold: FlatThreshold::Majority,
        }
    }
}

impl<I: LabelValue> LabelFuser<I> for FlatVotingFuser {
    fn fuse_matching_labels(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        _weights: &[f64],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    ) {
        let threshold = match self.threshold {
            FlatThreshold::Configured => ctx.threshold,
            FlatThreshold::Majority => {
                let matched = inputs.iter().flatten().count();
                0.5 * matched as f64 + MAJORITY_EPSILON
            }
        };
        vote(inputs, |_| 1.0, |_| true, candidate, &ctx.roi, threshold);
    }
}
