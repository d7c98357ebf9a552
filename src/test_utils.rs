//! Test utilities for labelops-fusion
//!
//! This module provides small builders for label volumes used across the
//! unit tests. It is only compiled when running tests.

use ndarray::Array3;

use crate::labelops_fusion::volume::{Coord, Interval, LabelValue, LabelVolume};

/// Builds a depth-1 volume from rows of labels.
///
/// # Panics
/// Panics if the rows differ in length.
pub fn volume_from_rows<T: LabelValue>(rows: &[&[T]]) -> LabelVolume<T> {
    let width = rows.first().map_or(0, |row| row.len());
    assert!(rows.iter().all(|row| row.len() == width), "ragged rows");
    Array3::from_shape_fn((1, rows.len(), width), |(_, y, x)| rows[y][x])
}

/// Fills the inclusive box `min..=max` of `volume` with `value`.
pub fn paint<T: Copy>(volume: &mut Array3<T>, min: Coord, max: Coord, value: T) {
    Interval { min, max }.view_mut(volume).fill(value);
}

/// Number of voxels equal to `label`.
pub fn count_label<T: PartialEq>(volume: &Array3<T>, label: T) -> usize {
    volume.iter().filter(|&v| *v == label).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_from_rows() {
        let volume = volume_from_rows::<u8>(&[&[0, 1, 2], &[3, 4, 5]]);
        assert_eq!(volume.dim(), (1, 2, 3));
        assert_eq!(volume[[0, 1, 2]], 5);
    }

    #[test]
    fn test_paint_and_count() {
        let mut volume = Array3::<u16>::zeros((2, 4, 4));
        paint(&mut volume, [0, 1, 1], [1, 2, 2], 6);
        assert_eq!(count_label(&volume, 6), 8);
        assert_eq!(count_label(&volume, 0), 24);
    }
}
