use ndarray::Array3;

use super::{vote, FuseContext, LabelFuser, MatchedLabel, FUSION_LABEL, MAJORITY_EPSILON};
use crate::labelops_fusion::config::SimpleParams;
use crate::labelops_fusion::volume::LabelValue;
use crate::utils::jaccard_with_candidate;

/// Iterative consensus refinement.
///
/// Starts from a flat majority vote, then repeatedly re-weights each input by
/// its Jaccard similarity to the current candidate, drops inputs that fall
/// below the quality threshold once the warm-up rounds are over, and votes
/// again with the surviving inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimpleFuser {
    pub params: SimpleParams,
}

/// What happened to the inputs during one [`SimpleFuser`] run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleTrace {
    /// Last similarity computed for every input (`0` for absent inputs).
    pub weights: Vec<f64>,
    /// Inputs that took part in the final vote.
    pub active: Vec<bool>,
    /// Round in which an input was dropped.
    pub dropped_at: Vec<Option<usize>>,
    /// Number of candidates created, including the initial one.
    pub iterations: usize,
}

impl SimpleFuser {
    pub const fn new(params: SimpleParams) -> Self {
        Self { params }
    }

    /// Quality threshold in effect during round `iteration`.
    pub fn quality_threshold(&self, iteration: usize) -> f64 {
        let p = &self.params;
        if iteration <= p.no_of_no_update_iters {
            return p.initial_quality_threshold;
        }
        let steps = (iteration - p.no_of_no_update_iters) as f64;
        (p.initial_quality_threshold - p.step_down_in_quality_threshold * steps)
            .max(p.minimal_quality_threshold)
    }

    /// Runs the refinement and reports how the inputs were treated.
    pub fn fuse_with_trace<I: LabelValue>(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    ) -> SimpleTrace {
        let roi = &ctx.roi;
        let mut active: Vec<bool> = inputs.iter().map(Option::is_some).collect();
        let mut weights = vec![1.0; inputs.len()];
        let mut dropped_at = vec![None; inputs.len()];

        let threshold = majority_threshold(&weights, &active);
        vote(inputs, |i| weights[i], |i| active[i], candidate, roi, threshold);
        log::trace!("marker {}: round 0, voting threshold {threshold:.4}", ctx.marker);

        let mut quality = self.params.initial_quality_threshold;
        let mut iteration = 1;
        while iteration < self.params.max_iters {
            let fused = roi.view(candidate);
            for (i, input) in inputs.iter().enumerate() {
                weights[i] = match input {
                    Some(matched) if active[i] => {
                        jaccard_with_candidate(matched.view(roi), matched.label, fused, FUSION_LABEL)
                    }
                    _ => 0.0,
                };
            }
            log::debug!(
                "marker {}: round {iteration}, weights {}",
                ctx.marker,
                format_weights(&weights, &active)
            );

            if iteration >= self.params.no_of_no_update_iters {
                let doomed: Vec<usize> = (0..inputs.len())
                    .filter(|&i| active[i] && weights[i] < quality)
                    .collect();
                let survivors = active.iter().filter(|&&a| a).count() - doomed.len();
                if survivors == 0 {
                    log::debug!(
                        "marker {}: round {iteration} would drop every input, pruning skipped",
                        ctx.marker
                    );
                } else {
                    for i in doomed {
                        active[i] = false;
                        dropped_at[i] = Some(iteration);
                        log::trace!(
                            "marker {}: input {i} dropped in round {iteration} (quality {:.3} < {quality:.3})",
                            ctx.marker,
                            weights[i]
                        );
                    }
                }
            }

            let threshold = majority_threshold(&weights, &active);
            vote(inputs, |i| weights[i], |i| active[i], candidate, roi, threshold);
            log::trace!("marker {}: round {iteration}, voting threshold {threshold:.4}", ctx.marker);

            iteration += 1;
            quality = self.quality_threshold(iteration);
        }

        SimpleTrace {
            weights,
            active,
            dropped_at,
            iterations: iteration,
        }
    }
}

impl<I: LabelValue> LabelFuser<I> for SimpleFuser {
    fn fuse_matching_labels(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        _weights: &[f64],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    ) {
        self.fuse_with_trace(inputs, candidate, ctx);
    }
}

/// Strict weighted majority of the active inputs.
fn majority_threshold(weights: &[f64], active: &[bool]) -> f64 {
    let sum: f64 = weights
        .iter()
        .zip(active)
        .filter(|(_, &a)| a)
        .map(|(w, _)| w)
        .sum();
    0.5 * sum + MAJORITY_EPSILON
}

fn format_weights(weights: &[f64], active: &[bool]) -> String {
    weights
        .iter()
        .zip(active)
        .map(|(w, &a)| if a { format!("{w:+.3}") } else { "dropped".to_owned() })
        .collect::<Vec<_>>()
        .join(" ")
}
