//! Writing fused candidates into the shared output image.

use std::collections::BTreeSet;

use ndarray::Array3;

use super::config::FusionConfig;
use super::resolve::{classify_colliding_markers, resolve_collisions};
use super::run::{CollisionHistogram, FusionRun};
use super::volume::{linear_index, shape_of, touches_border, Interval, LabelValue};

/// Outcome of inserting one marker's candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionStatus<L> {
    /// The candidate held at least one voxel.
    pub found_at_all: bool,
    /// Some written voxel lies on the image boundary.
    pub at_border: bool,
    /// Some written voxel overlapped another marker.
    pub in_collision: bool,
    /// Markers this candidate overlapped.
    pub local_colliders: BTreeSet<L>,
    pub colliding_volume: u64,
    pub not_colliding_volume: u64,
}

impl<L> Default for InsertionStatus<L> {
    fn default() -> Self {
        Self {
            found_at_all: false,
            at_border: false,
            in_collision: false,
            local_colliders: BTreeSet::new(),
            colliding_volume: 0,
            not_colliding_volume: 0,
        }
    }
}

/// Inserts candidates into the output and settles the image once all markers
/// are in.
pub trait LabelInsertor<L: LabelValue>: Send + Sync {
    /// Writes the fused voxels of `candidate` inside `roi` as `marker`.
    fn insert_label(
        &self,
        candidate: &Array3<f64>,
        output: &mut Array3<L>,
        roi: &Interval,
        marker: L,
        run: &mut FusionRun<L>,
    ) -> InsertionStatus<L>;

    /// Applies the removal policy after the last insertion.
    fn finalize(
        &self,
        output: &mut Array3<L>,
        markers: &Array3<L>,
        run: &mut FusionRun<L>,
        config: &FusionConfig,
    ) -> CollisionHistogram;

    /// Voxel value that marks a collision still present after finalizing.
    fn collision_value(&self) -> Option<L> {
        None
    }
}

/// Last writer wins; nothing is tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverwriteInsertor;

impl<L: LabelValue> LabelInsertor<L> for OverwriteInsertor {
    fn insert_label(
        &self,
        candidate: &Array3<f64>,
        output: &mut Array3<L>,
        roi: &Interval,
        marker: L,
        _run: &mut FusionRun<L>,
    ) -> InsertionStatus<L> {
        let shape = shape_of(output);
        let mut status = InsertionStatus::default();
        for ((z, y, x), &vote) in roi.view(candidate).indexed_iter() {
            if vote > 0.0 {
                let p = roi.to_global([z, y, x]);
                output[p] = marker;
                status.found_at_all = true;
                status.not_colliding_volume += 1;
                status.at_border |= touches_border(p, shape);
            }
        }
        status
    }

    fn finalize(
        &self,
        output: &mut Array3<L>,
        _markers: &Array3<L>,
        run: &mut FusionRun<L>,
        config: &FusionConfig,
    ) -> CollisionHistogram {
        if config.remove_markers_at_border && !run.at_border.is_empty() {
            output.mapv_inplace(|v| if run.at_border.contains(&v) { L::zero() } else { v });
        }
        CollisionHistogram::default()
    }
}

/// Writes `candidate` and tracks overlaps with earlier markers.
///
/// Overlapping voxels become `L::max_value()`. With `register` set, every
/// such voxel remembers its claimants for later erosion.
pub(crate) fn insert_tracking_collisions<L: LabelValue>(
    candidate: &Array3<f64>,
    output: &mut Array3<L>,
    roi: &Interval,
    marker: L,
    run: &mut FusionRun<L>,
    register: bool,
) -> InsertionStatus<L> {
    let intersection = L::max_value();
    let shape = shape_of(output);
    let mut status = InsertionStatus::default();

    for ((z, y, x), &vote) in roi.view(candidate).indexed_iter() {
        if vote <= 0.0 {
            continue;
        }
        let p = roi.to_global([z, y, x]);
        status.found_at_all = true;
        status.at_border |= touches_border(p, shape);

        let other = output[p];
        if other == L::zero() {
            output[p] = marker;
            status.not_colliding_volume += 1;
            continue;
        }

        output[p] = intersection;
        status.in_collision = true;
        status.colliding_volume += 1;
        let index = linear_index(p, shape);
        if register {
            run.registry.claim(index, marker);
        }
        if other != intersection {
            // first collision at this voxel: the previous owner loses it too
            status.local_colliders.insert(other);
            run.volumes.entry(other).or_default().convert_one_to_colliding();
            if register {
                run.registry.claim(index, other);
            }
        }
    }

    run.record_volumes(marker, status.colliding_volume, status.not_colliding_volume);
    status
}

/// Tracks collisions and removes heavily colliding markers together with
/// every disputed voxel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollisionsAwareInsertor;

impl<L: LabelValue> LabelInsertor<L> for CollisionsAwareInsertor {
    fn insert_label(
        &self,
        candidate: &Array3<f64>,
        output: &mut Array3<L>,
        roi: &Interval,
        marker: L,
        run: &mut FusionRun<L>,
    ) -> InsertionStatus<L> {
        insert_tracking_collisions(candidate, output, roi, marker, run, false)
    }

    fn finalize(
        &self,
        output: &mut Array3<L>,
        _markers: &Array3<L>,
        run: &mut FusionRun<L>,
        config: &FusionConfig,
    ) -> CollisionHistogram {
        let histogram = classify_colliding_markers(run, config.remove_markers_collision_threshold);
        let intersection = L::max_value();
        let drop_border = config.remove_markers_at_border;

        output.mapv_inplace(|v| {
            if v == L::zero() {
                v
            } else if v == intersection
                || run.colliding.contains(&v)
                || (drop_border && run.at_border.contains(&v))
            {
                L::zero()
            } else {
                v
            }
        });
        histogram
    }

    fn collision_value(&self) -> Option<L> {
        Some(L::max_value())
    }
}

/// Tracks collisions and resolves disputed voxels by erosion from the
/// undisputed parts of the claimants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollisionsManagingInsertor;

impl<L: LabelValue> LabelInsertor<L> for CollisionsManagingInsertor {
    fn insert_label(
        &self,
        candidate: &Array3<f64>,
        output: &mut Array3<L>,
        roi: &Interval,
        marker: L,
        run: &mut FusionRun<L>,
    ) -> InsertionStatus<L> {
        insert_tracking_collisions(candidate, output, roi, marker, run, true)
    }

    fn finalize(
        &self,
        output: &mut Array3<L>,
        markers: &Array3<L>,
        run: &mut FusionRun<L>,
        config: &FusionConfig,
    ) -> CollisionHistogram {
        resolve_collisions(output, markers, run, config)
    }

    fn collision_value(&self) -> Option<L> {
        Some(L::max_value())
    }
}
