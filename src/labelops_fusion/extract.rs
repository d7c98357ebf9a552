//! Finding the input label that corresponds to a marker, and copying labels
//! into vote accumulators.

use std::collections::HashMap;

use ndarray::{ArrayView3, ArrayViewMut3, Zip};

use super::volume::LabelValue;

/// Chooses which label of an input image represents a given marker.
pub trait LabelExtractor<I, L>: Send + Sync {
    /// Returns the matching input label, or `None` when nothing qualifies.
    ///
    /// Both views must cover the same region (typically the marker's
    /// bounding box).
    fn find_matching_label(&self, input: ArrayView3<'_, I>, markers: ArrayView3<'_, L>, marker: L)
        -> Option<I>;
}

/// Picks the input label that covers the largest part of the marker.
///
/// The winner must cover at least `min_fraction_of_marker` of the marker's
/// voxels. Ties keep the label seen first in scan order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MajorityOverlapExtractor {
    pub min_fraction_of_marker: f32,
}

impl Default for MajorityOverlapExtractor {
    fn default() -> Self {
        Self {
            min_fraction_of_marker: 0.5,
        }
    }
}

impl MajorityOverlapExtractor {
    pub const fn new(min_fraction_of_marker: f32) -> Self {
        Self {
            min_fraction_of_marker,
        }
    }
}

impl<I: LabelValue, L: LabelValue> LabelExtractor<I, L> for MajorityOverlapExtractor {
    fn find_matching_label(
        &self,
        input: ArrayView3<'_, I>,
        markers: ArrayView3<'_, L>,
        marker: L,
    ) -> Option<I> {
        let tally = overlap_histogram(input, markers, marker);
        let marker_size: usize = tally.iter().map(|&(_, count)| count).sum();

        let mut best: Option<(I, usize)> = None;
        for &(label, count) in &tally {
            if label > I::zero() && best.map_or(true, |(_, best_count)| count > best_count) {
                best = Some((label, count));
            }
        }

        let (label, count) = best?;
        let required = self.min_fraction_of_marker * marker_size as f32;
        (count as f32 >= required).then_some(label)
    }
}

/// Counts input labels under the marker, in order of first appearance.
///
/// Background is included so that the counts add up to the marker size.
fn overlap_histogram<I: LabelValue, L: LabelValue>(
    input: ArrayView3<'_, I>,
    markers: ArrayView3<'_, L>,
    marker: L,
) -> Vec<(I, usize)> {
    let mut order: Vec<(I, usize)> = Vec::new();
    let mut slots: HashMap<I, usize> = HashMap::new();

    Zip::from(&input).and(&markers).for_each(|&label, &m| {
        if m == marker {
            let slot = *slots.entry(label).or_insert_with(|| {
                order.push((label, 0));
                order.len() - 1
            });
            order[slot].1 += 1;
        }
    });
    order
}

/// Every positive input label overlapping the marker together with the
/// fraction of the marker it covers, in order of first appearance.
///
/// Fractions of labels that cover the whole marker are `1.0`; an empty marker
/// yields an empty list.
pub fn find_all_matching_labels<I: LabelValue, L: LabelValue>(
    input: ArrayView3<'_, I>,
    markers: ArrayView3<'_, L>,
    marker: L,
) -> Vec<(I, f32)> {
    let tally = overlap_histogram(input, markers, marker);
    let marker_size: usize = tally.iter().map(|&(_, count)| count).sum();
    if marker_size == 0 {
        return Vec::new();
    }

    tally
        .into_iter()
        .filter(|&(label, _)| label > I::zero())
        .map(|(label, count)| (label, count as f32 / marker_size as f32))
        .collect()
}

/// Writes `value` where `source == wanted` and `0` everywhere else.
pub fn isolate_given_label<I: PartialEq + Copy>(
    source: ArrayView3<'_, I>,
    wanted: I,
    mut output: ArrayViewMut3<'_, f64>,
    value: f64,
) {
    Zip::from(&mut output).and(&source).for_each(|out, &label| {
        *out = if label == wanted { value } else { 0.0 };
    });
}

/// Adds `value` where `source == wanted`, leaves the rest untouched.
pub fn add_given_label<I: PartialEq + Copy>(
    source: ArrayView3<'_, I>,
    wanted: I,
    mut output: ArrayViewMut3<'_, f64>,
    value: f64,
) {
    Zip::from(&mut output).and(&source).for_each(|out, &label| {
        if label == wanted {
            *out += value;
        }
    });
}
