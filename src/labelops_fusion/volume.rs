use std::fmt;
use std::hash::Hash;

use image::{ImageBuffer, Luma, Primitive};
use imageproc::definitions::Image;
use ndarray::{s, Array3, ArrayBase, ArrayView3, ArrayViewMut3, Data, DataMut, Ix3};
use num_traits::PrimInt;

use crate::error::FusionError;

/// Voxel coordinate in `[z, y, x]` order.
pub type Coord = [usize; 3];

/// A label image: `0` is background, positive values are object ids.
///
/// Two-dimensional images are volumes with a depth of one.
pub type LabelVolume<T> = Array3<T>;

/// Integer voxel types usable as labels.
///
/// `T::max_value()` is reserved as the collision marker and never used as an
/// object id.
pub trait LabelValue: PrimInt + Primitive + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> LabelValue for T where T: PrimInt + Primitive + Hash + fmt::Debug + Send + Sync + 'static {}

/// Returns the shape of a volume as `[depth, height, width]`.
#[inline]
pub fn shape_of<S: Data>(volume: &ArrayBase<S, Ix3>) -> Coord {
    let (d, h, w) = volume.dim();
    [d, h, w]
}

/// Row-major linear offset of `p` inside `shape`.
#[inline]
pub const fn linear_index(p: Coord, shape: Coord) -> usize {
    (p[0] * shape[1] + p[1]) * shape[2] + p[2]
}

/// Inverse of [`linear_index`].
#[inline]
pub const fn coord_of(index: usize, shape: Coord) -> Coord {
    let plane = shape[1] * shape[2];
    [
        index / plane,
        (index % plane) / shape[2],
        index % shape[2],
    ]
}

/// Whether `p` lies on the outer boundary of an image of `shape`.
///
/// Axes of extent one are flat and never count as a boundary, so a depth-1
/// volume behaves like a plain 2-D image.
#[inline]
pub fn touches_border(p: Coord, shape: Coord) -> bool {
    (0..3).any(|d| shape[d] > 1 && (p[d] == 0 || p[d] + 1 == shape[d]))
}

/// Inclusive axis-aligned box in voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Interval {
    pub min: Coord,
    pub max: Coord,
}

impl Interval {
    /// Creates a box spanning `min..=max`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if `min` exceeds `max` along any axis.
    pub fn new(min: Coord, max: Coord) -> Result<Self, FusionError> {
        if (0..3).any(|d| min[d] > max[d]) {
            return Err(FusionError::InvalidParameter(format!(
                "interval minimum {min:?} exceeds maximum {max:?}"
            )));
        }
        Ok(Self { min, max })
    }

    /// The single-voxel box at `p`.
    pub const fn from_point(p: Coord) -> Self {
        Self { min: p, max: p }
    }

    /// The box covering a whole image, or `None` for an empty image.
    pub fn whole(shape: Coord) -> Option<Self> {
        if shape.contains(&0) {
            return None;
        }
        Some(Self {
            min: [0, 0, 0],
            max: [shape[0] - 1, shape[1] - 1, shape[2] - 1],
        })
    }

    /// Grows the box so that it contains `p`.
    pub fn include(&mut self, p: Coord) {
        for d in 0..3 {
            self.min[d] = self.min[d].min(p[d]);
            self.max[d] = self.max[d].max(p[d]);
        }
    }

    /// Smallest box containing both boxes.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let mut out = *self;
        out.include(other.min);
        out.include(other.max);
        out
    }

    pub fn contains(&self, p: Coord) -> bool {
        (0..3).all(|d| self.min[d] <= p[d] && p[d] <= self.max[d])
    }

    /// Whether the box reaches the boundary of an image of `shape`.
    pub fn touches_border(&self, shape: Coord) -> bool {
        touches_border(self.min, shape) || touches_border(self.max, shape)
    }

    /// Extent of the box as `[depth, height, width]`.
    pub const fn shape(&self) -> Coord {
        [
            self.max[0] - self.min[0] + 1,
            self.max[1] - self.min[1] + 1,
            self.max[2] - self.min[2] + 1,
        ]
    }

    pub const fn voxel_count(&self) -> usize {
        let [d, h, w] = self.shape();
        d * h * w
    }

    /// Whether the box lies inside an image of `shape`.
    pub fn fits(&self, shape: Coord) -> bool {
        (0..3).all(|d| self.max[d] < shape[d])
    }

    /// Converts a box-local coordinate into an image coordinate.
    #[inline]
    pub const fn to_global(&self, local: Coord) -> Coord {
        [
            local[0] + self.min[0],
            local[1] + self.min[1],
            local[2] + self.min[2],
        ]
    }

    /// Converts an image coordinate inside the box into a box-local one.
    #[inline]
    pub const fn to_local(&self, global: Coord) -> Coord {
        [
            global[0] - self.min[0],
            global[1] - self.min[1],
            global[2] - self.min[2],
        ]
    }

    /// Read-only view of `volume` restricted to this box.
    ///
    /// # Panics
    ///
    /// Panics if the box does not fit into `volume`.
    pub fn view<'a, S, T>(&self, volume: &'a ArrayBase<S, Ix3>) -> ArrayView3<'a, T>
    where
        S: Data<Elem = T>,
    {
        volume.slice(s![
            self.min[0]..=self.max[0],
            self.min[1]..=self.max[1],
            self.min[2]..=self.max[2]
        ])
    }

    /// Mutable view of `volume` restricted to this box.
    ///
    /// # Panics
    ///
    /// Panics if the box does not fit into `volume`.
    pub fn view_mut<'a, S, T>(&self, volume: &'a mut ArrayBase<S, Ix3>) -> ArrayViewMut3<'a, T>
    where
        S: DataMut<Elem = T>,
    {
        volume.slice_mut(s![
            self.min[0]..=self.max[0],
            self.min[1]..=self.max[1],
            self.min[2]..=self.max[2]
        ])
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{}] -> [{},{},{}]",
            self.min[0], self.min[1], self.min[2], self.max[0], self.max[1], self.max[2]
        )
    }
}

/// Conversion between label volumes and `image` label slices.
pub trait LabelImageConvert<T: LabelValue>: Sized {
    /// Wraps a single 2-D label image into a depth-1 volume.
    fn from_label_image(image: &Image<Luma<T>>) -> Self;

    /// Stacks equally sized 2-D label images along the z axis.
    ///
    /// # Errors
    ///
    /// Returns `EmptyStack` for an empty slice list and `DimensionMismatch`
    /// when the slices differ in size.
    fn from_label_slices(slices: &[Image<Luma<T>>]) -> Result<Self, FusionError>;

    /// Splits the volume into one 2-D label image per z plane.
    fn to_label_slices(&self) -> Vec<Image<Luma<T>>>;
}

impl<T: LabelValue> LabelImageConvert<T> for LabelVolume<T> {
    fn from_label_image(image: &Image<Luma<T>>) -> Self {
        let (width, height) = image.dimensions();
        Array3::from_shape_fn((1, height as usize, width as usize), |(_, y, x)| {
            image.get_pixel(x as u32, y as u32)[0]
        })
    }

    fn from_label_slices(slices: &[Image<Luma<T>>]) -> Result<Self, FusionError> {
        let first = slices.first().ok_or(FusionError::EmptyStack)?;
        let (width, height) = first.dimensions();
        let expected = [slices.len(), height as usize, width as usize];
        for slice in slices {
            let (w, h) = slice.dimensions();
            if (w, h) != (width, height) {
                return Err(FusionError::DimensionMismatch {
                    expected,
                    actual: [slices.len(), h as usize, w as usize],
                });
            }
        }

        Ok(Array3::from_shape_fn(
            (slices.len(), height as usize, width as usize),
            |(z, y, x)| slices[z].get_pixel(x as u32, y as u32)[0],
        ))
    }

    fn to_label_slices(&self) -> Vec<Image<Luma<T>>> {
        let [depth, height, width] = shape_of(self);
        (0..depth)
            .map(|z| {
                ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                    Luma([self[[z, y as usize, x as usize]]])
                })
            })
            .collect()
    }
}
