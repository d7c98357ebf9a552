use std::collections::HashMap;

use itertools::Itertools;
use ndarray::Array3;

use super::{vote, FuseContext, LabelFuser, MatchedLabel, FUSION_LABEL};
use crate::labelops_fusion::bounding_box::{BoundingBoxes, BoxIndex};
use crate::labelops_fusion::extract::isolate_given_label;
use crate::labelops_fusion::volume::{shape_of, Coord, Interval, LabelValue, LabelVolume};
use crate::utils::jaccard_from_pairs;

/// Binary mask of one reference object, stored over its bounding box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceMask {
    pub bbox: Interval,
    pub mask: Array3<bool>,
}

impl ReferenceMask {
    /// Whether the image voxel `p` belongs to the reference object.
    pub fn contains(&self, p: Coord) -> bool {
        self.bbox.contains(p) && self.mask[self.bbox.to_local(p)]
    }
}

/// Supplies the reference object a marker should be compared against.
pub trait ReferenceSource: Send + Sync {
    fn reference_mask(&self, marker: u64) -> Option<ReferenceMask>;
}

/// Reference objects taken from a label image through an explicit
/// marker-to-label mapping.
///
/// The reference image must share the shape of the fused images.
#[derive(Debug, Clone)]
pub struct LabelledReference<R> {
    image: LabelVolume<R>,
    boxes: BoxIndex<R>,
    labels: HashMap<u64, R>,
}

impl<R: LabelValue> LabelledReference<R> {
    pub fn new(image: LabelVolume<R>, labels: HashMap<u64, R>) -> Self {
        let boxes = image.bounding_boxes();
        Self {
            image,
            boxes,
            labels,
        }
    }
}

impl<R: LabelValue> ReferenceSource for LabelledReference<R> {
    fn reference_mask(&self, marker: u64) -> Option<ReferenceMask> {
        let label = *self.labels.get(&marker)?;
        let bbox = *self.boxes.get(&label)?;
        Some(ReferenceMask {
            bbox,
            mask: bbox.view(&self.image).mapv(|v| v == label),
        })
    }
}

/// Region over which an input is compared with the reference.
fn scoring_region<I>(matched: &MatchedLabel<'_, I>, reference: &ReferenceMask, roi: &Interval) -> Interval {
    let region = roi.union(&reference.bbox);
    if region.fits(shape_of(matched.image)) {
        region
    } else {
        *roi
    }
}

fn score_input<I: LabelValue>(matched: &MatchedLabel<'_, I>, reference: &ReferenceMask, roi: &Interval) -> f64 {
    let region = scoring_region(matched, reference, roi);
    jaccard_from_pairs(
        matched
            .view(&region)
            .indexed_iter()
            .map(|((z, y, x), &v)| (v == matched.label, reference.contains(region.to_global([z, y, x])))),
    )
}

/// Selects the single input whose matched label agrees best with the
/// reference object and copies it into the candidate.
///
/// Markers without a reference object produce an empty candidate.
#[derive(Debug, Clone)]
pub struct LabelPicker<R> {
    reference: R,
}

impl<R: ReferenceSource> LabelPicker<R> {
    pub const fn new(reference: R) -> Self {
        Self { reference }
    }

    /// Jaccard score of every input, `None` for absent inputs.
    pub fn score_inputs<I: LabelValue>(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        ctx: &FuseContext,
    ) -> Option<Vec<Option<f64>>> {
        let reference = self.reference.reference_mask(ctx.marker)?;
        Some(
            inputs
                .iter()
                .map(|input| input.as_ref().map(|m| score_input(m, &reference, &ctx.roi)))
                .collect(),
        )
    }
}

impl<I: LabelValue, R: ReferenceSource> LabelFuser<I> for LabelPicker<R> {
    fn fuse_matching_labels(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        _weights: &[f64],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    ) {
        ctx.roi.view_mut(candidate).fill(0.0);
        let Some(scores) = self.score_inputs(inputs, ctx) else {
            log::error!("marker {}: no reference object, nothing picked", ctx.marker);
            return;
        };

        let best = scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, s)))
            .fold(None, |best: Option<(usize, f64)>, (i, s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((i, s)),
            });

        if let Some((index, score)) = best {
            if let Some(matched) = &inputs[index] {
                isolate_given_label(
                    matched.view(&ctx.roi),
                    matched.label,
                    ctx.roi.view_mut(candidate),
                    FUSION_LABEL,
                );
                log::debug!(
                    "marker {}: picked input {index} with Jaccard {score:.3}",
                    ctx.marker
                );
            }
        }
    }
}

/// Score of one subset of inputs voted together.
#[derive(Debug, Clone, PartialEq)]
pub struct CombinationScore {
    /// Indices of the inputs in the subset, ascending.
    pub members: Vec<usize>,
    pub score: f64,
}

impl CombinationScore {
    /// `Y`/`-` signature over all input slots, e.g. `Y-Y-`.
    pub fn signature(&self, slots: usize) -> String {
        (0..slots)
            .map(|i| if self.members.contains(&i) { 'Y' } else { '-' })
            .collect()
    }
}

/// Majority vote of a subset: more than half of its members.
fn subset_threshold(members: usize) -> f64 {
    (members / 2 + 1) as f64
}

/// Scores every non-empty subset of the available inputs against the
/// reference object and fuses the best subset by majority vote.
#[derive(Debug, Clone)]
pub struct CombinationPicker<R> {
    reference: R,
}

impl<R: ReferenceSource> CombinationPicker<R> {
    pub const fn new(reference: R) -> Self {
        Self { reference }
    }

    /// Scores of all non-empty subsets of present inputs, smaller subsets
    /// first. `None` when the marker has no reference object.
    pub fn score_combinations<I: LabelValue>(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        ctx: &FuseContext,
    ) -> Option<Vec<CombinationScore>> {
        let reference = self.reference.reference_mask(ctx.marker)?;
        let present: Vec<usize> = (0..inputs.len()).filter(|&i| inputs[i].is_some()).collect();
        let Some(first) = present.first().and_then(|&i| inputs[i].as_ref()) else {
            return Some(Vec::new());
        };
        let region = scoring_region(first, &reference, &ctx.roi);

        let scores = present
            .into_iter()
            .powerset()
            .filter(|members| !members.is_empty())
            .map(|members| {
                let mut votes = Array3::<u16>::zeros(region.shape());
                for matched in members.iter().filter_map(|&i| inputs[i].as_ref()) {
                    let view = matched.view(&region);
                    ndarray::Zip::from(&mut votes).and(&view).for_each(|count, &v| {
                        if v == matched.label {
                            *count += 1;
                        }
                    });
                }
                let needed = subset_threshold(members.len());
                let score = jaccard_from_pairs(votes.indexed_iter().map(|((z, y, x), &count)| {
                    (
                        f64::from(count) >= needed,
                        reference.contains(region.to_global([z, y, x])),
                    )
                }));
                CombinationScore { members, score }
            })
            .collect();
        Some(scores)
    }
}

impl<I: LabelValue, R: ReferenceSource> LabelFuser<I> for CombinationPicker<R> {
    fn fuse_matching_labels(
        &self,
        inputs: &[Option<MatchedLabel<'_, I>>],
        _weights: &[f64],
        candidate: &mut Array3<f64>,
        ctx: &FuseContext,
    ) {
        ctx.roi.view_mut(candidate).fill(0.0);
        let Some(scores) = self.score_combinations(inputs, ctx) else {
            log::error!("marker {}: no reference object, nothing picked", ctx.marker);
            return;
        };

        for combination in &scores {
            log::trace!(
                "marker {}: combination {} Jaccard {:.3}",
                ctx.marker,
                combination.signature(inputs.len()),
                combination.score
            );
        }

        let best = scores.iter().fold(None, |best: Option<&CombinationScore>, c| match best {
            Some(b) if b.score >= c.score => best,
            _ => Some(c),
        });
        if let Some(best) = best {
            let members = &best.members;
            vote(
                inputs,
                |_| 1.0,
                |i| members.contains(&i),
                candidate,
                &ctx.roi,
                subset_threshold(members.len()),
            );
            log::debug!(
                "marker {}: picked combination {} with Jaccard {:.3}",
                ctx.marker,
                best.signature(inputs.len()),
                best.score
            );
        }
    }
}
