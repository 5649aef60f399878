//! Observed image data and random pixel subsets.

use crate::errors::{FitError, FitResult};
use ndarray::{Array1, Array2};
use rand::seq::index;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Observed pixel values together with their position in the full frame.
///
/// A freshly loaded frame holds every pixel; a random subset keeps only the
/// selected pixels but remembers where they came from, so a forward model can
/// evaluate just those positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    /// `(row, col)` of each retained pixel, shape `(n_pixels, 2)`
    coords: Array2<usize>,
    values: Array1<f64>,
    /// Shape of the full frame
    shape: (usize, usize),
}

impl Image {
    /// Wrap a complete frame.
    pub fn from_array(frame: &Array2<f64>) -> Self {
        let shape = frame.dim();
        let n = shape.0 * shape.1;
        let coords = Array2::from_shape_fn((n, 2), |(i, axis)| {
            if axis == 0 {
                i / shape.1
            } else {
                i % shape.1
            }
        });
        let values = frame.iter().copied().collect();
        Self {
            coords,
            values,
            shape,
        }
    }

    /// Build an image from explicit pixel positions and values.
    pub fn from_pixels(
        coords: Array2<usize>,
        values: Array1<f64>,
        shape: (usize, usize),
    ) -> FitResult<Self> {
        if coords.ncols() != 2 || coords.nrows() != values.len() {
            return Err(FitError::InvalidParameter(format!(
                "Pixel coordinates of shape {:?} do not match {} values",
                coords.dim(),
                values.len()
            )));
        }
        if coords
            .outer_iter()
            .any(|c| c[0] >= shape.0 || c[1] >= shape.1)
        {
            return Err(FitError::InvalidParameter(format!(
                "Pixel coordinates fall outside a frame of shape {:?}",
                shape
            )));
        }
        Ok(Self {
            coords,
            values,
            shape,
        })
    }

    /// Number of retained pixels.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn coords(&self) -> &Array2<usize> {
        &self.coords
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Keep only the pixels at `indices` (positions into this image's pixel list).
    pub fn select(&self, indices: &[usize]) -> Self {
        let coords = self.coords.select(ndarray::Axis(0), indices);
        let values = indices.iter().map(|&i| self.values[i]).collect();
        Self {
            coords,
            values,
            shape: self.shape,
        }
    }

    /// Apply `f` to every pixel value.
    pub fn map_values<F: Fn(f64) -> f64>(&self, f: F) -> Self {
        Self {
            coords: self.coords.clone(),
            values: self.values.mapv(f),
            shape: self.shape,
        }
    }
}

/// The data a model is fitted against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FitData {
    SingleFrame(Image),
    FrameSequence(Vec<Image>),
}

impl FitData {
    pub fn frames(&self) -> &[Image] {
        match self {
            FitData::SingleFrame(image) => std::slice::from_ref(image),
            FitData::FrameSequence(images) => images,
        }
    }

    pub fn n_frames(&self) -> usize {
        self.frames().len()
    }

    /// Pixel count of the first frame; every frame of a sequence is assumed to share it.
    pub fn n_pixels(&self) -> usize {
        self.frames().first().map_or(0, Image::len)
    }

    /// Apply a fallible per-frame transformation, preserving the variant.
    pub fn try_map<F>(&self, mut f: F) -> FitResult<FitData>
    where
        F: FnMut(&Image) -> FitResult<Image>,
    {
        Ok(match self {
            FitData::SingleFrame(image) => FitData::SingleFrame(f(image)?),
            FitData::FrameSequence(images) => {
                FitData::FrameSequence(images.iter().map(f).collect::<FitResult<_>>()?)
            }
        })
    }
}

impl From<Image> for FitData {
    fn from(image: Image) -> Self {
        FitData::SingleFrame(image)
    }
}

impl From<Vec<Image>> for FitData {
    fn from(images: Vec<Image>) -> Self {
        FitData::FrameSequence(images)
    }
}

/// Reduces an image to a fraction of its pixels.
pub trait SubsetSelector {
    /// Select `fraction` of the pixels of `image`.
    ///
    /// `fraction` must lie in `(0, 1]`; `fraction == 1` returns the full image.
    fn select(&self, image: &Image, fraction: f64, rng: &mut dyn RngCore) -> FitResult<Image>;

    fn select_data(
        &self,
        data: &FitData,
        fraction: f64,
        rng: &mut dyn RngCore,
    ) -> FitResult<FitData> {
        data.try_map(|image| self.select(image, fraction, rng))
    }
}

/// Uniform random pixel subset without replacement.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSubset;

impl RandomSubset {
    /// Number of pixels kept for a given fraction of `n` pixels.
    pub fn n_selected(n: usize, fraction: f64) -> usize {
        ((n as f64 * fraction).ceil() as usize).clamp(1, n.max(1))
    }
}

impl SubsetSelector for RandomSubset {
    fn select(&self, image: &Image, fraction: f64, rng: &mut dyn RngCore) -> FitResult<Image> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(FitError::InvalidSchedule(format!(
                "Subset fraction must be in (0, 1], got {}",
                fraction
            )));
        }
        let n = image.len();
        let n_selected = Self::n_selected(n, fraction);
        if n_selected >= n {
            return Ok(image.clone());
        }

        let mut indices = index::sample(rng, n, n_selected).into_vec();
        indices.sort_unstable();
        Ok(image.select(&indices))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn frame() -> Array2<f64> {
        Array2::from_shape_fn((10, 12), |(r, c)| (r * 12 + c) as f64)
    }

    #[test]
    fn test_from_array_keeps_coordinates() {
        let image = Image::from_array(&array![[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(image.len(), 4);
        assert_eq!(image.shape(), (2, 2));
        assert_eq!(image.coords().row(2), array![1, 0]);
        assert_eq!(image.values()[2], 3.0);
    }

    #[test]
    fn test_from_pixels_validation() {
        let coords = array![[0, 0], [5, 1]];
        assert!(Image::from_pixels(coords.clone(), array![1.0, 2.0], (4, 4)).is_err());
        assert!(Image::from_pixels(coords, array![1.0], (8, 8)).is_err());
    }

    #[test]
    fn test_full_fraction_is_identity() {
        let image = Image::from_array(&frame());
        let mut rng = StdRng::seed_from_u64(0);
        let selected = RandomSubset.select(&image, 1.0, &mut rng).unwrap();
        assert_eq!(selected, image);
    }

    #[test]
    fn test_subset_size_and_uniqueness() {
        let image = Image::from_array(&frame());
        let mut rng = StdRng::seed_from_u64(11);
        let selected = RandomSubset.select(&image, 0.1, &mut rng).unwrap();

        assert_eq!(selected.len(), 12);
        assert_eq!(selected.shape(), (10, 12));
        let unique: HashSet<_> = selected
            .coords()
            .outer_iter()
            .map(|c| (c[0], c[1]))
            .collect();
        assert_eq!(unique.len(), 12);

        // values still line up with their coordinates
        for (c, &v) in selected.coords().outer_iter().zip(selected.values()) {
            assert_eq!(v, (c[0] * 12 + c[1]) as f64);
        }
    }

    #[test]
    fn test_fraction_rounds_up() {
        assert_eq!(RandomSubset::n_selected(1000, 0.0101), 11);
        assert_eq!(RandomSubset::n_selected(10, 1e-6), 1);
    }

    #[test]
    fn test_invalid_fraction() {
        let image = Image::from_array(&frame());
        let mut rng = StdRng::seed_from_u64(0);
        assert!(RandomSubset.select(&image, 0.0, &mut rng).is_err());
        assert!(RandomSubset.select(&image, 1.5, &mut rng).is_err());
    }

    #[test]
    fn test_frame_sequence_subsets_every_frame() {
        let data = FitData::from(vec![Image::from_array(&frame()), Image::from_array(&frame())]);
        let mut rng = StdRng::seed_from_u64(5);
        let subset = RandomSubset.select_data(&data, 0.5, &mut rng).unwrap();

        assert_eq!(subset.n_frames(), 2);
        assert!(subset.frames().iter().all(|f| f.len() == 60));
        assert_eq!(data.n_pixels(), 120);
    }
}
