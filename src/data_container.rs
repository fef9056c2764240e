//! Spectrum image storage and the reshaping between cubes and fit-ready matrices.
//!
//! Point, line and map acquisitions all live in one `(x, y, channel)` cube; a point is a 1×1 map
//! and a line is a `positions × 1` map. Every operator addresses the data through the same pixel
//! enumeration `p = y·width + x`, so there is exactly one place where index order is decided.

use crate::error::AnalysisError;
use crate::request::ChannelWindow;
use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};

/// Dimensionality of the spatial part of a spectrum image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubeRank {
    /// A single spectrum.
    Point,
    /// A line scan, one spectrum per position.
    Line,
    /// A two dimensional map.
    Map,
}

/// A spectrum image: one spectrum per spatial pixel.
///
/// # Fields
/// - `rank`: spatial dimensionality of the acquisition.
/// - `data`: intensities indexed as `(x, y, channel)`.
#[derive(Clone, Debug)]
pub struct SpectrumImage {
    pub rank: CubeRank,
    pub data: Array3<f32>,
}

impl Default for SpectrumImage {
    fn default() -> Self {
        SpectrumImage {
            rank: CubeRank::Point,
            data: Array3::zeros((1, 1, 0)),
        }
    }
}

impl SpectrumImage {
    pub fn from_point(spectrum: Array1<f32>) -> Self {
        let channels = spectrum.len();
        let data = spectrum
            .into_shape_with_order((1, 1, channels))
            .unwrap_or_else(|_| Array3::zeros((1, 1, channels)));
        SpectrumImage {
            rank: CubeRank::Point,
            data,
        }
    }

    /// Builds a line scan from an array shaped `(positions, channels)`.
    pub fn from_line(line: Array2<f32>) -> Self {
        let data = line.insert_axis(Axis(1));
        SpectrumImage {
            rank: CubeRank::Line,
            data,
        }
    }

    /// Builds a map from a cube shaped `(width, height, channels)`.
    pub fn from_map(data: Array3<f32>) -> Self {
        SpectrumImage {
            rank: CubeRank::Map,
            data,
        }
    }

    pub fn width(&self) -> usize {
        self.data.dim().0
    }

    pub fn height(&self) -> usize {
        self.data.dim().1
    }

    pub fn channel_count(&self) -> usize {
        self.data.dim().2
    }

    pub fn pixel_count(&self) -> usize {
        self.width() * self.height()
    }

    /// Spatial coordinates `(x, y)` of a pixel index.
    pub fn pixel_coordinates(&self, pixel: usize) -> (usize, usize) {
        let width = self.width().max(1);
        (pixel % width, pixel / width)
    }

    pub fn channel_at(&self, pixel: usize, channel: usize) -> f32 {
        let (x, y) = self.pixel_coordinates(pixel);
        self.data[(x, y, channel)]
    }

    pub fn spectrum(&self, pixel: usize) -> ArrayView1<'_, f32> {
        let (x, y) = self.pixel_coordinates(pixel);
        self.data.slice(s![x, y, ..])
    }

    /// Reshapes the channels of `window` into a `(window channels × pixels)` matrix.
    pub fn to_matrix(&self, window: ChannelWindow) -> Array2<f64> {
        let pixels = self.pixel_count();
        Array2::from_shape_fn((window.len(), pixels), |(row, pixel)| {
            self.channel_at(pixel, window.start + row) as f64
        })
    }

    /// Rebuilds a cube with this image's geometry from a `(channels × pixels)` matrix.
    pub fn cube_from_matrix(&self, matrix: &Array2<f64>) -> Result<Array3<f32>, AnalysisError> {
        let (channels, pixels) = matrix.dim();
        if pixels != self.pixel_count() {
            return Err(AnalysisError::ShapeMismatch {
                expected: format!("{} pixels", self.pixel_count()),
                actual: format!("{pixels} pixels"),
            });
        }
        let width = self.width().max(1);
        Ok(Array3::from_shape_fn(
            (self.width(), self.height(), channels),
            |(x, y, channel)| matrix[(channel, y * width + x)] as f32,
        ))
    }

    /// Arranges one value per pixel into a `(width, height)` map.
    pub fn map_from_pixels(&self, values: &Array1<f64>) -> Result<Array2<f64>, AnalysisError> {
        if values.len() != self.pixel_count() {
            return Err(AnalysisError::ShapeMismatch {
                expected: format!("{} pixels", self.pixel_count()),
                actual: format!("{} values", values.len()),
            });
        }
        let width = self.width().max(1);
        Ok(Array2::from_shape_fn(
            (self.width(), self.height()),
            |(x, y)| values[y * width + x],
        ))
    }

    /// Spatially summed spectrum of the whole image.
    pub fn sum_spectrum(&self) -> Array1<f64> {
        self.data
            .mapv(|v| v as f64)
            .sum_axis(Axis(0))
            .sum_axis(Axis(0))
    }

    pub fn with_data(&self, data: Array3<f32>) -> SpectrumImage {
        SpectrumImage {
            rank: self.rank,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn numbered_map() -> SpectrumImage {
        // value encodes (x, y, channel) as x*100 + y*10 + channel
        SpectrumImage::from_map(Array3::from_shape_fn((3, 2, 4), |(x, y, c)| {
            (x * 100 + y * 10 + c) as f32
        }))
    }

    #[test]
    fn test_pixels_enumerate_row_major() {
        let image = numbered_map();
        assert_eq!(image.pixel_count(), 6);
        assert_eq!(image.pixel_coordinates(0), (0, 0));
        assert_eq!(image.pixel_coordinates(2), (2, 0));
        assert_eq!(image.pixel_coordinates(4), (1, 1));
        assert_eq!(image.channel_at(4, 3), 113.0);
    }

    #[test]
    fn test_matrix_round_trip_keeps_geometry() {
        let image = numbered_map();
        let matrix = image.to_matrix(ChannelWindow::new(0, image.channel_count()));
        assert_eq!(matrix.dim(), (4, 6));
        assert_eq!(matrix[(2, 5)], 212.0);
        let cube = image.cube_from_matrix(&matrix).unwrap();
        assert_eq!(cube, image.data);
    }

    #[test]
    fn test_window_matrix_starts_at_window() {
        let image = numbered_map();
        let matrix = image.to_matrix(ChannelWindow::new(1, 3));
        assert_eq!(matrix.dim(), (2, 6));
        assert_eq!(matrix[(0, 1)], 101.0);
        assert_eq!(matrix[(1, 1)], 102.0);
    }

    #[test]
    fn test_point_and_line_adapters() {
        let point = SpectrumImage::from_point(array![1.0, 2.0, 3.0]);
        assert_eq!(point.rank, CubeRank::Point);
        assert_eq!(point.pixel_count(), 1);
        assert_eq!(point.channel_count(), 3);
        assert_eq!(point.channel_at(0, 2), 3.0);

        let line = SpectrumImage::from_line(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
        assert_eq!(line.rank, CubeRank::Line);
        assert_eq!((line.width(), line.height()), (3, 1));
        assert_eq!(line.channel_at(2, 0), 5.0);
        assert_eq!(line.sum_spectrum(), array![9.0, 12.0]);
    }

    #[test]
    fn test_map_from_pixels_rejects_wrong_length() {
        let image = numbered_map();
        assert!(image.map_from_pixels(&Array1::zeros(5)).is_err());
        let map = image
            .map_from_pixels(&Array1::from_iter((0..6).map(|p| p as f64)))
            .unwrap();
        assert_eq!(map[(1, 1)], 4.0);
    }
}
