use std::collections::BTreeSet;

use crate::error::FusionError;
use crate::utils::{validate_fraction, validate_non_negative};

/// Parameters of one fusion run.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FusionConfig {
    /// Acceptance threshold of the voting fusers.
    pub threshold: f64,
    /// Fraction of a marker an input label must cover to match it.
    pub min_overlap_fraction: f32,
    /// Markers whose colliding share of volume exceeds this are dropped.
    pub remove_markers_collision_threshold: f32,
    /// Drop every marker whose fused segment touches the image boundary.
    pub remove_markers_at_border: bool,
    /// After postprocessing, stamp the marker footprints of unmatched and
    /// colliding markers into the background of the output.
    pub insert_markers_for_unresolved: bool,
    /// Marker ids skipped entirely.
    pub ignored_markers: BTreeSet<u64>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            threshold: 1.0,
            min_overlap_fraction: 0.5,
            remove_markers_collision_threshold: 0.1,
            remove_markers_at_border: false,
            insert_markers_for_unresolved: false,
            ignored_markers: BTreeSet::new(),
        }
    }
}

impl FusionConfig {
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_collision_threshold(mut self, ratio: f32) -> Self {
        self.remove_markers_collision_threshold = ratio;
        self
    }

    pub fn with_border_removal(mut self, enabled: bool) -> Self {
        self.remove_markers_at_border = enabled;
        self
    }

    pub fn with_marker_insertion(mut self, enabled: bool) -> Self {
        self.insert_markers_for_unresolved = enabled;
        self
    }

    pub fn ignoring(mut self, markers: impl IntoIterator<Item = u64>) -> Self {
        self.ignored_markers.extend(markers);
        self
    }

    pub fn is_ignored(&self, marker: u64) -> bool {
        self.ignored_markers.contains(&marker)
    }

    /// # Errors
    ///
    /// Returns `InvalidParameter` for a negative threshold or a fraction
    /// outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), FusionError> {
        validate_non_negative("threshold", self.threshold)?;
        validate_fraction("min_overlap_fraction", f64::from(self.min_overlap_fraction))?;
        validate_fraction(
            "remove_markers_collision_threshold",
            f64::from(self.remove_markers_collision_threshold),
        )
    }
}

/// Iteration schedule of the SIMPLE fuser.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SimpleParams {
    /// Number of candidates created, the initial majority vote included.
    pub max_iters: usize,
    /// Rounds before pruning may start.
    pub no_of_no_update_iters: usize,
    pub initial_quality_threshold: f64,
    pub step_down_in_quality_threshold: f64,
    pub minimal_quality_threshold: f64,
}

impl Default for SimpleParams {
    fn default() -> Self {
        Self {
            max_iters: 4,
            no_of_no_update_iters: 2,
            initial_quality_threshold: 0.7,
            step_down_in_quality_threshold: 0.1,
            minimal_quality_threshold: 0.3,
        }
    }
}

impl SimpleParams {
    /// # Errors
    ///
    /// Returns `InvalidParameter` when a quality threshold is not a fraction,
    /// the step is negative, or the floor lies above the initial threshold.
    pub fn validate(&self) -> Result<(), FusionError> {
        validate_fraction("initial_quality_threshold", self.initial_quality_threshold)?;
        validate_fraction("minimal_quality_threshold", self.minimal_quality_threshold)?;
        validate_non_negative(
            "step_down_in_quality_threshold",
            self.step_down_in_quality_threshold,
        )?;
        if self.minimal_quality_threshold > self.initial_quality_threshold {
            return Err(FusionError::InvalidParameter(format!(
                "minimal_quality_threshold {} exceeds initial_quality_threshold {}",
                self.minimal_quality_threshold, self.initial_quality_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FusionConfig::default();
        assert_eq!(config.threshold, 1.0);
        assert_eq!(config.min_overlap_fraction, 0.5);
        assert_eq!(config.remove_markers_collision_threshold, 0.1);
        assert!(!config.remove_markers_at_border);
        assert!(config.validate().is_ok());
        assert!(SimpleParams::default().validate().is_ok());
    }

    #[test]
    fn test_builder_style_setters() {
        let config = FusionConfig::default()
            .with_threshold(2.5)
            .with_collision_threshold(0.3)
            .with_border_removal(true)
            .ignoring([7, 9]);
        assert_eq!(config.threshold, 2.5);
        assert!(config.remove_markers_at_border);
        assert!(config.is_ignored(9));
        assert!(!config.is_ignored(8));
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        assert!(FusionConfig::default().with_threshold(-1.0).validate().is_err());
        assert!(FusionConfig::default()
            .with_collision_threshold(1.5)
            .validate()
            .is_err());

        let params = SimpleParams {
            minimal_quality_threshold: 0.9,
            ..SimpleParams::default()
        };
        assert!(params.validate().is_err());
    }
}
