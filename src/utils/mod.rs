//! Internal utility functions for labelops-fusion.
//!
//! This module contains the validation and overlap helpers shared by the
//! fusion stages.

use ndarray::{ArrayView3, Zip};

use crate::error::FusionError;
use crate::labelops_fusion::volume::Coord;

/// Validates that a fraction lies in `[0, 1]`.
///
/// # Arguments
///
/// * `name` - Parameter name used in the error message
/// * `value` - The value to check
///
/// # Returns
///
/// `Ok(())` if the value is a finite fraction, otherwise `InvalidParameter`
pub fn validate_fraction(name: &str, value: f64) -> Result<(), FusionError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(FusionError::InvalidParameter(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

/// Validates that a value is finite and not negative.
pub fn validate_non_negative(name: &str, value: f64) -> Result<(), FusionError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(FusionError::InvalidParameter(format!(
            "{name} must be a non-negative number, got {value}"
        )))
    }
}

/// Validates that an image has the shape of the marker image.
///
/// # Arguments
///
/// * `expected` - Shape of the marker image
/// * `actual` - Shape of the image being checked
///
/// # Returns
///
/// `Ok(())` if the shapes match, otherwise `DimensionMismatch`
pub fn validate_matching_shapes(expected: Coord, actual: Coord) -> Result<(), FusionError> {
    if expected == actual {
        Ok(())
    } else {
        Err(FusionError::DimensionMismatch { expected, actual })
    }
}

/// Jaccard index from (in first set, in second set) membership pairs.
///
/// Two empty sets yield `0`.
pub fn jaccard_from_pairs(pairs: impl IntoIterator<Item = (bool, bool)>) -> f64 {
    let (mut intersection, mut union) = (0usize, 0usize);
    for (a, b) in pairs {
        if a && b {
            intersection += 1;
        }
        if a || b {
            union += 1;
        }
    }
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Jaccard index between `label` in `input` and `fused` voxels of `candidate`.
///
/// Both views must cover the same region.
pub fn jaccard_with_candidate<I: PartialEq + Copy>(
    input: ArrayView3<'_, I>,
    label: I,
    candidate: ArrayView3<'_, f64>,
    fused: f64,
) -> f64 {
    let (mut intersection, mut union) = (0usize, 0usize);
    Zip::from(&input).and(&candidate).for_each(|&i, &c| {
        let a = i == label;
        let b = c == fused;
        intersection += usize::from(a && b);
        union += usize::from(a || b);
    });
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}
