use std::collections::HashMap;

use ndarray::{ArrayBase, Data, Ix3};

use super::volume::{Interval, LabelValue, LabelVolume};

/// Bounding box of every positive label of one image.
pub type BoxIndex<T> = HashMap<T, Interval>;

/// Computes per-label bounding boxes of a label image.
pub trait BoundingBoxes<T> {
    /// One sweep over the image; background (`0`) is skipped.
    fn bounding_boxes(&self) -> BoxIndex<T>;
}

impl<S, T> BoundingBoxes<T> for ArrayBase<S, Ix3>
where
    S: Data<Elem = T>,
    T: LabelValue,
{
    fn bounding_boxes(&self) -> BoxIndex<T> {
        let mut boxes = BoxIndex::new();
        for ((z, y, x), &value) in self.indexed_iter() {
            if value > T::zero() {
                let p = [z, y, x];
                boxes
                    .entry(value)
                    .and_modify(|b: &mut Interval| b.include(p))
                    .or_insert_with(|| Interval::from_point(p));
            }
        }
        boxes
    }
}

/// Bounding boxes of the marker image and of every present input image.
///
/// Input boxes keep the slot order of the inputs; absent inputs stay `None`.
#[derive(Debug, Clone, Default)]
pub struct BoxIndexSet<I, L> {
    pub inputs: Vec<Option<BoxIndex<I>>>,
    pub markers: BoxIndex<L>,
}

impl<I: LabelValue, L: LabelValue> BoxIndexSet<I, L> {
    /// Sequential precomputation.
    pub fn compute(inputs: &[Option<&LabelVolume<I>>], markers: &LabelVolume<L>) -> Self {
        Self {
            inputs: inputs
                .iter()
                .map(|input| input.map(|volume| volume.bounding_boxes()))
                .collect(),
            markers: markers.bounding_boxes(),
        }
    }

    /// Parallel precomputation on a caller-provided thread pool.
    ///
    /// Each image is indexed by one task; results land in their input slot,
    /// so the outcome equals [`BoxIndexSet::compute`].
    #[cfg(feature = "rayon")]
    pub fn compute_in(
        pool: &rayon::ThreadPool,
        inputs: &[Option<&LabelVolume<I>>],
        markers: &LabelVolume<L>,
    ) -> Self {
        use rayon::prelude::*;

        pool.install(|| {
            let (inputs, markers) = rayon::join(
                || {
                    inputs
                        .par_iter()
                        .map(|input| input.map(|volume| volume.bounding_boxes()))
                        .collect()
                },
                || markers.bounding_boxes(),
            );
            Self { inputs, markers }
        })
    }

    /// Box of `label` inside input `index`, if both exist.
    pub fn input_box(&self, index: usize, label: I) -> Option<&Interval> {
        self.inputs.get(index)?.as_ref()?.get(&label)
    }

    /// Marker ids in ascending order.
    pub fn sorted_markers(&self) -> Vec<L> {
        let mut ids: Vec<L> = self.markers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
