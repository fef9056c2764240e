//! Ordinary and noise-weighted principal component analysis of a `(channels × pixels)` matrix.
//!
//! The weighted variant rescales rows and columns by the inverse square root of their mean
//! absolute count before the SVD, which approximately equalizes Poisson noise across channels
//! and pixels. The singular vectors are un-weighted afterwards, so spectra and maps are reported
//! in physical units.

use crate::error::AnalysisError;
use crate::fit::least_squares::SVD_EPSILON;
use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use std::sync::atomic::{AtomicBool, Ordering};

/// The constant `c` of the scree transform `ln(1 + c·σ/σmax)`.
pub const SCREE_CONSTANT: f64 = 1e4;

/// Options of one decomposition.
///
/// # Fields
/// - `mean_centering`: subtract the mean of every row (channel) across pixels before the SVD.
/// - `weighted`: apply the row/column noise weighting.
/// - `scree_constant`: the constant `c` of the scree transform.
/// - `svd_max_iterations`: iteration cap handed to the SVD, 0 derives one from the matrix size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcaOptions {
    pub mean_centering: bool,
    pub weighted: bool,
    pub scree_constant: f64,
    pub svd_max_iterations: usize,
}

impl Default for PcaOptions {
    fn default() -> Self {
        PcaOptions {
            mean_centering: false,
            weighted: false,
            scree_constant: SCREE_CONSTANT,
            svd_max_iterations: 0,
        }
    }
}

/// Result of a principal component analysis.
///
/// Components are sorted by decreasing singular value.
///
/// # Fields
/// - `width`, `height`: spatial geometry of the analysed image.
/// - `singular_values`: `σ` in decreasing order.
/// - `spectra`: `(channels × components)`, column `i` is the spectrum of component `i`.
/// - `maps`: `(components × pixels)`, row `i` is the spatial map of component `i`.
/// - `scree`: `ln(1 + c·σ/σmax)` per component.
/// - `row_means`: per-channel means removed by mean-centering (zero otherwise).
/// - `scree_constant`: the `c` used for `scree`.
#[derive(Debug, Clone)]
pub struct PcaResult {
    pub width: usize,
    pub height: usize,
    pub singular_values: Array1<f64>,
    pub spectra: Array2<f64>,
    pub maps: Array2<f64>,
    pub scree: Array1<f64>,
    pub row_means: Array1<f64>,
    pub scree_constant: f64,
}

impl PcaResult {
    pub fn component_count(&self) -> usize {
        self.singular_values.len()
    }

    /// `[component number, scree]` pairs, numbered from 1.
    pub fn scree_series(&self) -> Vec<[f64; 2]> {
        self.scree
            .iter()
            .enumerate()
            .map(|(i, value)| [(i + 1) as f64, *value])
            .collect()
    }

    /// Spatial map of `component`, shaped `(width, height)`.
    pub fn component_map(&self, component: usize) -> Result<Array2<f64>, AnalysisError> {
        self.check_component(component)?;
        let row = self.maps.row(component);
        Ok(Array2::from_shape_fn((self.width, self.height), |(x, y)| {
            row[y * self.width + x]
        }))
    }

    /// Spectrum of `component` over the PCA window.
    pub fn component_spectrum(&self, component: usize) -> Result<ArrayView1<'_, f64>, AnalysisError> {
        self.check_component(component)?;
        Ok(self.spectra.column(component))
    }

    /// Fraction of the total `Σσ²` carried by each component.
    pub fn explained_variance(&self) -> Array1<f64> {
        let squares = self.singular_values.mapv(|sigma| sigma * sigma);
        let total = squares.sum();
        if total > 0.0 {
            squares / total
        } else {
            squares
        }
    }

    /// Rebuilds the window matrix `(channels × pixels)` from the first `components` components.
    ///
    /// Singular values are recovered from the scree transform, and the row means removed by
    /// mean-centering are added back.
    pub fn reconstruct(&self, components: usize) -> Result<Array2<f64>, AnalysisError> {
        if components > self.component_count() {
            return Err(AnalysisError::InvalidComponentCount {
                requested: components,
                available: self.component_count(),
            });
        }
        let sigma_max = self.singular_values.first().copied().unwrap_or(0.0);
        let sigma = self
            .scree
            .slice(s![..components])
            .mapv(|scree| scree.exp_m1() * sigma_max / self.scree_constant);

        let spectra = &self.spectra.slice(s![.., ..components]) * &sigma;
        let mut matrix = spectra.dot(&self.maps.slice(s![..components, ..]));
        matrix += &self.row_means.view().insert_axis(Axis(1));
        Ok(matrix)
    }

    fn check_component(&self, component: usize) -> Result<(), AnalysisError> {
        if component < self.component_count() {
            Ok(())
        } else {
            Err(AnalysisError::InvalidComponentCount {
                requested: component + 1,
                available: self.component_count(),
            })
        }
    }
}

/// Normalizes `(mean |value|)^(-1/2)` to sum 1; a zero mean counts as weight 1.
fn normalized_weights(mean_abs: Array1<f64>) -> Array1<f64> {
    let raw = mean_abs.mapv(|mean| if mean > 0.0 { mean.powf(-0.5) } else { 1.0 });
    let total = raw.sum();
    raw / total
}

/// Row (channel) and column (pixel) noise weights of `y`, each summing to 1.
pub fn noise_weights(y: &Array2<f64>) -> (Array1<f64>, Array1<f64>) {
    let magnitude = y.mapv(f64::abs);
    let rows = magnitude
        .mean_axis(Axis(1))
        .unwrap_or_else(|| Array1::zeros(y.nrows()));
    let columns = magnitude
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(y.ncols()));
    (normalized_weights(rows), normalized_weights(columns))
}

fn check_abort(abort_flag: &AtomicBool) -> Result<(), AnalysisError> {
    if abort_flag.load(Ordering::Relaxed) {
        Err(AnalysisError::Cancelled)
    } else {
        Ok(())
    }
}

/// Decomposes the background-removed window matrix `y` `(channels × pixels)`.
///
/// # Arguments
/// - `y`: The matrix to decompose.
/// - `width`, `height`: Image geometry, `width · height` must equal the number of columns.
/// - `options`: Centering, weighting and SVD options.
/// - `abort_flag`: Checked before and after the SVD.
pub fn principal_components(
    y: &Array2<f64>,
    width: usize,
    height: usize,
    options: PcaOptions,
    abort_flag: &AtomicBool,
) -> Result<PcaResult, AnalysisError> {
    let (channels, pixels) = y.dim();
    if channels == 0 || pixels == 0 {
        return Err(AnalysisError::EmptyPcaWindow);
    }
    if width * height != pixels {
        return Err(AnalysisError::ShapeMismatch {
            expected: format!("{} pixels", width * height),
            actual: format!("{pixels} pixels"),
        });
    }

    let row_means = if options.mean_centering {
        y.mean_axis(Axis(1))
            .unwrap_or_else(|| Array1::zeros(channels))
    } else {
        Array1::zeros(channels)
    };
    let centered = y - &row_means.view().insert_axis(Axis(1));

    let (row_weights, column_weights) = if options.weighted {
        noise_weights(&centered)
    } else {
        (Array1::ones(channels), Array1::ones(pixels))
    };
    let weighted = &centered
        * &row_weights.view().insert_axis(Axis(1))
        * &column_weights.view().insert_axis(Axis(0));

    check_abort(abort_flag)?;

    let max_iterations = if options.svd_max_iterations == 0 {
        (100 * channels.min(pixels)).max(1000)
    } else {
        options.svd_max_iterations
    };
    let matrix = nalgebra::DMatrix::from_fn(channels, pixels, |i, j| weighted[(i, j)]);
    let svd = matrix
        .try_svd(true, true, SVD_EPSILON, max_iterations)
        .ok_or(AnalysisError::SvdNotConverged)?;
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(AnalysisError::SvdNotConverged);
    };

    check_abort(abort_flag)?;

    let count = svd.singular_values.len();
    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by(|a, b| svd.singular_values[*b].total_cmp(&svd.singular_values[*a]));

    let singular_values = Array1::from_shape_fn(count, |c| svd.singular_values[order[c]]);
    let spectra = Array2::from_shape_fn((channels, count), |(i, c)| {
        u[(i, order[c])] / row_weights[i]
    });
    let maps = Array2::from_shape_fn((count, pixels), |(c, j)| {
        v_t[(order[c], j)] / column_weights[j]
    });

    let sigma_max = singular_values.first().copied().unwrap_or(0.0);
    let scree = if sigma_max > 0.0 {
        singular_values.mapv(|sigma| (options.scree_constant * sigma / sigma_max).ln_1p())
    } else {
        Array1::zeros(count)
    };

    log::debug!(
        "PCA of {channels} channels x {pixels} pixels: {count} components, sigma_max = {sigma_max:.4e}"
    );

    Ok(PcaResult {
        width,
        height,
        singular_values,
        spectra,
        maps,
        scree,
        row_means,
        scree_constant: options.scree_constant,
    })
}
