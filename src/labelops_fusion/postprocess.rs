use std::collections::VecDeque;

use image::{ImageBuffer, Luma};
use imageproc::definitions::Image;
use imageproc::region_labelling::{connected_components, Connectivity};
use itertools::iproduct;
use ndarray::Array3;

use super::volume::{shape_of, Coord, Interval, LabelValue};

/// Scratch space for connected-component labelling, sized like the output.
#[derive(Debug, Clone)]
pub struct ComponentScratch {
    labels: Array3<u32>,
    queue: VecDeque<Coord>,
}

impl ComponentScratch {
    pub fn new(shape: Coord) -> Self {
        Self {
            labels: Array3::zeros(shape),
            queue: VecDeque::new(),
        }
    }

    pub fn shape(&self) -> Coord {
        shape_of(&self.labels)
    }
}

/// Cleans up a single finalized marker in the output image.
pub trait LabelPostprocessor<L: LabelValue>: Send + Sync {
    /// `roi`, when given, must contain every voxel of `marker`.
    fn process_label(
        &self,
        output: &mut Array3<L>,
        marker: L,
        roi: Option<&Interval>,
        scratch: &mut ComponentScratch,
    );
}

/// Leaves the output untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VoidPostprocessor;

impl<L: LabelValue> LabelPostprocessor<L> for VoidPostprocessor {
    fn process_label(
        &self,
        _output: &mut Array3<L>,
        _marker: L,
        _roi: Option<&Interval>,
        _scratch: &mut ComponentScratch,
    ) {
    }
}

/// Keeps only the largest connected component of a marker.
///
/// Connectivity is full: 26 neighbours in 3-D, 8 in 2-D. Ties keep the
/// component discovered first in scan order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeepLargestComponent;

impl<L: LabelValue> LabelPostprocessor<L> for KeepLargestComponent {
    fn process_label(
        &self,
        output: &mut Array3<L>,
        marker: L,
        roi: Option<&Interval>,
        scratch: &mut ComponentScratch,
    ) {
        let Some(roi) = roi.copied().or_else(|| marker_extent(output, marker)) else {
            return;
        };

        let sizes = if roi.shape()[0] == 1 {
            label_planar(output, marker, &roi, scratch)
        } else {
            label_volumetric(output, marker, &roi, scratch)
        };
        if sizes.len() <= 1 {
            return;
        }

        let mut keep = 0;
        for (i, &size) in sizes.iter().enumerate() {
            if size > sizes[keep] {
                keep = i;
            }
        }
        let keep = keep as u32 + 1;
        log::info!(
            "marker {marker:?}: {} components, keeping one of {} voxels",
            sizes.len(),
            sizes[keep as usize - 1]
        );

        let labels = roi.view(&scratch.labels);
        let mut region = roi.view_mut(output);
        ndarray::Zip::from(&mut region).and(&labels).for_each(|v, &component| {
            if *v == marker && component != keep {
                *v = L::zero();
            }
        });
    }
}

/// Bounding box of `marker` in `output`.
fn marker_extent<L: LabelValue>(output: &Array3<L>, marker: L) -> Option<Interval> {
    let mut extent: Option<Interval> = None;
    for ((z, y, x), &v) in output.indexed_iter() {
        if v == marker {
            match extent.as_mut() {
                Some(b) => b.include([z, y, x]),
                None => extent = Some(Interval::from_point([z, y, x])),
            }
        }
    }
    extent
}

/// Labels the components of a single-plane region with 8-connectivity.
///
/// Writes component ids (`1..`) into the scratch labels and returns the
/// component sizes.
fn label_planar<L: LabelValue>(
    output: &Array3<L>,
    marker: L,
    roi: &Interval,
    scratch: &mut ComponentScratch,
) -> Vec<usize> {
    let [_, height, width] = roi.shape();
    let view = roi.view(output);
    let mask: Image<Luma<u8>> = ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
        Luma([u8::from(view[[0, y as usize, x as usize]] == marker)])
    });
    let components = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

    let mut sizes: Vec<usize> = Vec::new();
    let mut labels = roi.view_mut(&mut scratch.labels);
    for (x, y, pixel) in components.enumerate_pixels() {
        let id = pixel[0];
        labels[[0, y as usize, x as usize]] = id;
        if id > 0 {
            let slot = id as usize - 1;
            if sizes.len() <= slot {
                sizes.resize(slot + 1, 0);
            }
            sizes[slot] += 1;
        }
    }
    sizes
}

/// Labels the components of a region with 26-connectivity by flood filling.
fn label_volumetric<L: LabelValue>(
    output: &Array3<L>,
    marker: L,
    roi: &Interval,
    scratch: &mut ComponentScratch,
) -> Vec<usize> {
    let region = roi.view(output);
    let local = roi.shape();
    let ComponentScratch { labels, queue } = scratch;
    let mut labels = roi.view_mut(labels);
    labels.fill(0);

    let mut sizes: Vec<usize> = Vec::new();
    for (start, &v) in region.indexed_iter() {
        let start = [start.0, start.1, start.2];
        if v != marker || labels[start] != 0 {
            continue;
        }

        sizes.push(0);
        let id = sizes.len() as u32;
        labels[start] = id;
        queue.clear();
        queue.push_back(start);
        while let Some(p) = queue.pop_front() {
            sizes[id as usize - 1] += 1;
            for (dz, dy, dx) in iproduct!(-1isize..=1, -1isize..=1, -1isize..=1) {
                let q = [
                    p[0] as isize + dz,
                    p[1] as isize + dy,
                    p[2] as isize + dx,
                ];
                if (0..3).any(|d| q[d] < 0 || q[d] >= local[d] as isize) {
                    continue;
                }
                let q = [q[0] as usize, q[1] as usize, q[2] as usize];
                if region[q] == marker && labels[q] == 0 {
                    labels[q] = id;
                    queue.push_back(q);
                }
            }
        }
    }
    sizes
}
