//! Settling collisions once every marker has been inserted.
//!
//! Markers whose segments are mostly disputed are withdrawn; the remaining
//! disputed voxels are handed out by growing the undisputed parts of their
//! claimants into them.

use itertools::iproduct;
use ndarray::{Array3, Zip};

use super::config::FusionConfig;
use super::run::{CollisionHistogram, CollisionRegistry, FusionRun};
use super::volume::{coord_of, linear_index, shape_of, Coord, LabelValue};

/// Upper bound on erosion rounds per phase.
pub const EROSION_SAFETY_CAP: usize = 100;

/// Moves every marker whose collision ratio exceeds `threshold` (and that is
/// not already withdrawn for touching the border) into the colliding set.
///
/// Returns the ratio histogram over all markers with a non-empty segment.
pub fn classify_colliding_markers<L: LabelValue>(
    run: &mut FusionRun<L>,
    threshold: f32,
) -> CollisionHistogram {
    let mut histogram = CollisionHistogram::default();
    for (&marker, volume) in &run.volumes {
        let Some(ratio) = volume.collision_ratio() else {
            continue;
        };
        histogram.record(ratio);
        if ratio > threshold && !run.at_border.contains(&marker) {
            run.colliding.insert(marker);
            log::debug!("marker {marker:?} collides on {:.1} % of its volume", ratio * 100.0);
        }
    }
    histogram
}

/// The 26 neighbour offsets in a fixed scan order.
fn neighbour_offsets() -> impl Iterator<Item = [isize; 3]> {
    iproduct!(-1isize..=1, -1isize..=1, -1isize..=1)
        .filter(|&offset| offset != (0, 0, 0))
        .map(|(dz, dy, dx)| [dz, dy, dx])
}

/// Neighbour of `p`, clamped to the image.
#[inline]
fn clamped_neighbour(p: Coord, offset: [isize; 3], shape: Coord) -> Coord {
    let mut q = p;
    for d in 0..3 {
        let max = shape[d] as isize - 1;
        q[d] = (p[d] as isize + offset[d]).clamp(0, max) as usize;
    }
    q
}

/// One erosion round with a two-phase commit.
///
/// Every pending voxel looks for the first neighbour, in scan order, whose
/// label is one of its claimants. Decisions see only the state from the start
/// of the round. Returns the number of voxels that got resolved.
fn erode_once<L: LabelValue>(
    output: &mut Array3<L>,
    pending: &mut Vec<usize>,
    registry: &CollisionRegistry<L>,
) -> usize {
    let shape = shape_of(output);
    let decisions: Vec<Option<L>> = pending
        .iter()
        .map(|&index| {
            let p = coord_of(index, shape);
            let claimants = registry.claimants(index);
            neighbour_offsets()
                .map(|offset| output[clamped_neighbour(p, offset, shape)])
                .find(|label| *label != L::zero() && claimants.contains(label))
        })
        .collect();

    let mut resolved = 0;
    for (&index, decision) in pending.iter().zip(&decisions) {
        if let Some(label) = decision {
            output[coord_of(index, shape)] = *label;
            resolved += 1;
        }
    }

    let mut verdicts = decisions.iter();
    pending.retain(|_| verdicts.next().is_some_and(Option::is_none));
    resolved
}

/// Erodes until nothing is pending, nothing changes, or the cap is reached.
/// Returns the number of rounds run.
pub(crate) fn erode_pending<L: LabelValue>(
    output: &mut Array3<L>,
    pending: &mut Vec<usize>,
    registry: &CollisionRegistry<L>,
    cap: usize,
) -> usize {
    let mut rounds = 0;
    while !pending.is_empty() && rounds < cap {
        rounds += 1;
        if erode_once(output, pending, registry) == 0 {
            break;
        }
    }
    rounds
}

/// Finalize step of the collision-managing insertion.
///
/// 1. Classifies colliding markers (see [`classify_colliding_markers`]).
/// 2. In one sweep: withdraws border markers when configured, stamps the
///    marker footprint of colliding markers into disputed voxels, queues the
///    other disputed voxels, and hides the remaining voxels of colliding
///    markers.
/// 3. Erodes the queue, restores the hidden voxels and erodes again.
///
/// Voxels still disputed afterwards stay background and are counted in the
/// run's unresolved total.
pub fn resolve_collisions<L: LabelValue>(
    output: &mut Array3<L>,
    markers: &Array3<L>,
    run: &mut FusionRun<L>,
    config: &FusionConfig,
) -> CollisionHistogram {
    let histogram = classify_colliding_markers(run, config.remove_markers_collision_threshold);
    let intersection = L::max_value();
    let shape = shape_of(output);
    let drop_border = config.remove_markers_at_border;

    let FusionRun {
        at_border,
        colliding,
        registry,
        pending,
        hidden,
        ..
    } = run;
    pending.clear();
    hidden.clear();

    for ((z, y, x), voxel) in output.indexed_iter_mut() {
        let label = *voxel;
        if label == L::zero() {
            continue;
        }
        let index = linear_index([z, y, x], shape);
        if label == intersection {
            let footprint = markers[[z, y, x]];
            if footprint != L::zero() && colliding.contains(&footprint) {
                *voxel = footprint;
            } else {
                *voxel = L::zero();
                pending.push(index);
            }
        } else if drop_border && at_border.contains(&label) {
            *voxel = L::zero();
        } else if colliding.contains(&label) {
            hidden.push((index, label));
            *voxel = L::zero();
        }
    }

    let queued = pending.len();
    let first = erode_pending(output, pending, registry, EROSION_SAFETY_CAP);
    log::debug!(
        "collision erosion: {queued} voxels queued, {} left after {first} rounds",
        pending.len()
    );

    for &(index, label) in hidden.iter() {
        output[coord_of(index, shape)] = label;
    }
    hidden.clear();

    if !pending.is_empty() {
        let second = erode_pending(output, pending, registry, EROSION_SAFETY_CAP);
        log::debug!(
            "collision erosion with restored markers: {} left after {second} rounds",
            pending.len()
        );
    }

    run.unresolved = run.pending.len();
    if run.unresolved > 0 {
        log::warn!(
            "collision resolution left {} voxels unassigned",
            run.unresolved
        );
    }
    histogram
}

/// Stamps the marker footprint of every unmatched or colliding marker into
/// background voxels of the output.
pub fn insert_marker_footprints<L: LabelValue>(
    output: &mut Array3<L>,
    markers: &Array3<L>,
    run: &FusionRun<L>,
) -> usize {
    let mut stamped = 0;
    Zip::from(output).and(markers).for_each(|out, &m| {
        if *out == L::zero()
            && m != L::zero()
            && (run.no_match.contains(&m) || run.colliding.contains(&m))
        {
            *out = m;
            stamped += 1;
        }
    });
    stamped
}
