use thiserror::Error;

/// Error type for label fusion operations
///
/// Only configuration and resource problems are reported through this type.
/// Per-marker outcomes such as "no matching label" or "removed due to
/// collision" are not errors; they are collected in the fusion report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FusionError {
    /// The number of input images differs from the number of weights
    ///
    /// Every input slot (present or absent) must come with exactly one weight.
    #[error("Arrays with input images and weights are of different lengths: {images} images, {weights} weights")]
    LengthMismatch {
        /// Number of input image slots
        images: usize,
        /// Number of weights
        weights: usize,
    },

    /// An input image does not have the shape of the marker image
    ///
    /// Shapes are reported as `[depth, height, width]`.
    #[error("Image dimensions mismatch: expected {expected:?}, actual {actual:?}")]
    DimensionMismatch {
        /// Shape of the marker image
        expected: [usize; 3],
        /// Shape of the offending image
        actual: [usize; 3],
    },

    /// A pipeline stage was not configured before the pipeline was built
    #[error("Pipeline is not fully initialized: missing {0}")]
    MissingStage(&'static str),

    /// A parameter is outside of its valid domain
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// A memory pool was requested for a shape it was not created for
    #[error("Reusable memory shape mismatch: pool holds {expected:?}, requested {actual:?}")]
    ShapeMismatch {
        /// Shape the pool buffers were allocated for
        expected: [usize; 3],
        /// Shape requested by the caller
        actual: [usize; 3],
    },

    /// A memory pool was requested for a voxel type it was not created for
    #[error("Reusable memory type mismatch: pool holds {expected}, requested {actual}")]
    TypeMismatch {
        /// Voxel type the pool was created for
        expected: &'static str,
        /// Voxel type requested by the caller
        actual: &'static str,
    },

    /// The borrower already holds its slot through another lease
    #[error("Borrower {borrower} already holds its memory slot")]
    SlotInUse {
        /// Id of the borrower
        borrower: u64,
    },

    /// Fusion was cancelled before all markers were processed
    #[error("Fusion was cancelled")]
    Cancelled,

    /// A volume was requested from an empty list of slices
    #[error("Cannot build a volume from an empty list of slices")]
    EmptyStack,
}
