use ndarray::Array3;

use super::{is_candidate_empty, FuseContext, LabelFuser, MatchedLabel, FUSION_LABEL};
use crate::labelops_fusion::extract::isolate_given_label;
use crate::labelops_fusion::volume::LabelValue;

/// Falls back to the most trusted input when the wrapped fuser produces an
/// empty candidate.
///
/// The fallback copies the matched label of the present input with the
/// highest weight (first one on ties) into the candidate as [`FUSION_LABEL`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FailSafe<F> {
    inner: F,
}

impl<F> FailSafe<F> {
    pub const fn new(inner: F) -> Self {
        Self { inner }
    }

    pub const fn inner(&self) -> &F {
        &self.inner
    }
}

/// Index of the present input with the largest weight, first one on ties.
pub fn best_weight_index<I>(inputs: &[Option<MatchedLabel<'_, I>>], weights: &[f64]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, (input, &weight)) in inputs.iter().zip(weights).enumerate() {
        if input.is_some() && best.map_or(true, |(_, w)| weight > w) {
            best = Some((i, weight));
        }
    }
    best.map(|(i, _)| i)
}

impl<I: LabelValue, F: LabelFuser<I>> LabelFuser<I> for FailSafe<F> {
    fn fuse_matching_labels(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        weights: &[f64],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    ) {
        self.inner.fuse_matching_labels(inputs, weights, candidate, ctx);
        if !is_candidate_empty(candidate, &ctx.roi) {
            return;
        }

        let fallback = best_weight_index(inputs, weights)
            .and_then(|i| inputs[i].map(|matched| (i, matched)));
        match fallback {
            Some((index, matched)) => {
                isolate_given_label(
                    matched.view(&ctx.roi),
                    matched.label,
                    ctx.roi.view_mut(candidate),
                    FUSION_LABEL,
                );
                log::info!(
                    "marker {}: empty fusion replaced by label {:?} of input {}",
                    ctx.marker,
                    matched.label,
                    index
                );
            }
            None => log::info!(
                "marker {}: empty fusion and no input to fall back to",
                ctx.marker
            ),
        }
    }
}
